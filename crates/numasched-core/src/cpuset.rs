//! # CPU Sets
//!
//! An ordered set of logical CPU ids with the set algebra the allocator
//! leans on (union, intersection, difference) and the kernel cpulist
//! syntax (`"0-3,8-11"`) for parsing and display. Iteration is always in
//! ascending CPU id order, which keeps every selection path reproducible.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Failed to parse a cpulist string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseCpuSetError {
    /// A comma-separated element was neither a CPU id nor a range.
    #[error("invalid cpulist element {element:?}")]
    InvalidElement {
        /// The offending element.
        element: String,
    },

    /// A range ran backwards, e.g. `"7-3"`.
    #[error("invalid cpulist range {start}-{end}")]
    InvalidRange {
        /// Range start.
        start: usize,
        /// Range end.
        end: usize,
    },
}

/// An immutable-style set of logical CPU ids.
///
/// All set operations return a new `CpuSet`; the allocator never mutates
/// a set it handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set from the given CPU ids.
    #[must_use]
    pub fn from_cpus(cpus: impl IntoIterator<Item = usize>) -> Self {
        Self {
            cpus: cpus.into_iter().collect(),
        }
    }

    /// Returns true if `cpu` is in the set.
    #[must_use]
    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    /// Number of CPUs in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Iterates the CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    /// The CPU ids as an ascending vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<usize> {
        self.cpus.iter().copied().collect()
    }

    /// Set union.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.union(&other.cpus).copied().collect(),
        }
    }

    /// Set intersection.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.intersection(&other.cpus).copied().collect(),
        }
    }

    /// CPUs in `self` that are not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self {
            cpus: self.cpus.difference(&other.cpus).copied().collect(),
        }
    }

    /// Returns true if every CPU of `self` is in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.cpus.is_subset(&other.cpus)
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self::from_cpus(iter)
    }
}

impl Extend<usize> for CpuSet {
    fn extend<T: IntoIterator<Item = usize>>(&mut self, iter: T) {
        self.cpus.extend(iter);
    }
}

impl fmt::Display for CpuSet {
    /// Formats as a kernel cpulist: consecutive runs collapse to ranges,
    /// e.g. `{0,1,2,3,8}` renders as `"0-3,8"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut run: Option<(usize, usize)> = None;

        let flush = |f: &mut fmt::Formatter<'_>, (start, end): (usize, usize), first: &mut bool| {
            if !*first {
                write!(f, ",")?;
            }
            *first = false;
            if start == end {
                write!(f, "{start}")
            } else {
                write!(f, "{start}-{end}")
            }
        };

        for cpu in self.iter() {
            run = match run {
                Some((start, end)) if cpu == end + 1 => Some((start, cpu)),
                Some(done) => {
                    flush(f, done, &mut first)?;
                    Some((cpu, cpu))
                }
                None => Some((cpu, cpu)),
            };
        }
        if let Some(done) = run {
            flush(f, done, &mut first)?;
        }
        Ok(())
    }
}

impl FromStr for CpuSet {
    type Err = ParseCpuSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cpus = BTreeSet::new();
        for element in s.split(',') {
            let element = element.trim();
            if element.is_empty() {
                continue;
            }
            if let Some((start, end)) = element.split_once('-') {
                let (start, end) = (
                    start
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| ParseCpuSetError::InvalidElement {
                            element: element.to_string(),
                        })?,
                    end.trim()
                        .parse::<usize>()
                        .map_err(|_| ParseCpuSetError::InvalidElement {
                            element: element.to_string(),
                        })?,
                );
                if start > end {
                    return Err(ParseCpuSetError::InvalidRange { start, end });
                }
                cpus.extend(start..=end);
            } else {
                let cpu = element
                    .parse::<usize>()
                    .map_err(|_| ParseCpuSetError::InvalidElement {
                        element: element.to_string(),
                    })?;
                cpus.insert(cpu);
            }
        }
        Ok(Self { cpus })
    }
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
