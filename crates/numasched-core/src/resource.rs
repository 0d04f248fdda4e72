//! # Resource Quantities
//!
//! The resource vocabulary of the allocator: resource names, integer
//! milli-unit quantities, and resource lists with the arithmetic the
//! ledgers need. CPU is accounted in CPU-millis, memory in bytes, and
//! extended resources in whatever unit their producer advertises; the
//! arithmetic never cares which.
//!
//! Resource lists are `BTreeMap`-backed so every iteration is in a
//! stable name order, which keeps hint generation and allocation
//! reproducible across runs.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Name of a schedulable resource.
///
/// `Cpu` and `Memory` are first-class; anything else (device plugins,
/// vendor resources) travels as `Extended`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceName {
    /// CPU, accounted in CPU-millis.
    Cpu,
    /// Memory, accounted in bytes.
    Memory,
    /// An extended resource, e.g. `"vendor.com/gpu"`.
    Extended(String),
}

impl ResourceName {
    fn as_str(&self) -> Cow<'_, str> {
        match self {
            Self::Cpu => Cow::Borrowed("cpu"),
            Self::Memory => Cow::Borrowed("memory"),
            Self::Extended(name) => Cow::Borrowed(name),
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cpu" => Self::Cpu,
            "memory" => Self::Memory,
            other => Self::Extended(other.to_string()),
        })
    }
}

impl Serialize for ResourceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or(Self::Extended(s)))
    }
}

/// An integer quantity in milli-units.
///
/// One whole unit is 1000 milli-units, mirroring how CPU requests are
/// expressed in CPU-millis. Quantities never go negative: subtraction
/// clamps at zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(i64);

impl Quantity {
    /// A zero quantity.
    pub const ZERO: Self = Self(0);

    /// Quantity from milli-units.
    #[must_use]
    pub fn from_milli(milli: i64) -> Self {
        Self(milli)
    }

    /// Quantity from whole units (`n * 1000` milli-units).
    #[must_use]
    pub fn from_units(units: i64) -> Self {
        Self(units * 1000)
    }

    /// The milli-unit value.
    #[must_use]
    pub fn milli_value(self) -> i64 {
        self.0
    }

    /// Whole units, rounding toward zero. `1500m` is 1 whole unit.
    #[must_use]
    pub fn whole_units(self) -> i64 {
        self.0 / 1000
    }

    /// Returns true if the quantity is zero.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `self + other`.
    #[must_use]
    pub fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }

    /// `max(0, self - other)`.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self((self.0 - other.0).max(0))
    }

    /// The smaller of the two quantities.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Scales by an amplification ratio, rounding up. Ratios at or
    /// below 1.0 leave the quantity untouched.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn amplified(self, ratio: Ratio) -> Self {
        if ratio.0 <= 1.0 {
            return self;
        }
        Self((self.0 as f64 * ratio.0).ceil() as i64)
    }
}

impl fmt::Display for Quantity {
    /// Whole units render bare (`"4"`), anything else in milli form
    /// (`"1500m"`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

/// A per-resource amplification ratio. Meaningful values are >= 1.0.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ratio(pub f64);

/// Per-resource amplification ratios, as carried by a node annotation.
pub type AmplificationRatios = BTreeMap<ResourceName, Ratio>;

/// A set of named resource quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList {
    resources: BTreeMap<ResourceName, Quantity>,
}

impl ResourceList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the quantity for `name`, replacing any previous value.
    pub fn insert(&mut self, name: ResourceName, quantity: Quantity) {
        self.resources.insert(name, quantity);
    }

    /// The quantity for `name`, if present.
    #[must_use]
    pub fn get(&self, name: &ResourceName) -> Option<Quantity> {
        self.resources.get(name).copied()
    }

    /// The CPU quantity, defaulting to zero.
    #[must_use]
    pub fn cpu(&self) -> Quantity {
        self.get(&ResourceName::Cpu).unwrap_or(Quantity::ZERO)
    }

    /// Iterates entries in resource-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceName, Quantity)> + '_ {
        self.resources.iter().map(|(name, q)| (name, *q))
    }

    /// Number of named resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources are named.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns true if every named quantity is zero (an empty list is
    /// zero).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.resources.values().all(|q| q.is_zero())
    }

    /// Adds every quantity of `other` into `self`.
    pub fn add(&mut self, other: &Self) {
        for (name, quantity) in other.iter() {
            let entry = self.resources.entry(name.clone()).or_insert(Quantity::ZERO);
            *entry = entry.add(quantity);
        }
    }

    /// `max(0, self - other)` per resource, over the union of names.
    #[must_use]
    pub fn sub_clamped(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for (name, quantity) in other.iter() {
            let entry = result.resources.entry(name.clone()).or_insert(Quantity::ZERO);
            *entry = entry.saturating_sub(quantity);
        }
        result
    }

    /// Returns true if `self` can cover `request`.
    ///
    /// Resources named by the request but absent from `self` are
    /// ignored: they are accounted elsewhere (or nowhere), and it is the
    /// hint generator's and allocator's job to skip them. This mirrors
    /// the quota-style fit check the scheduler uses.
    #[must_use]
    pub fn covers(&self, request: &Self) -> bool {
        request.iter().all(|(name, wanted)| match self.get(name) {
            Some(available) => available >= wanted,
            None => true,
        })
    }

    /// Applies amplification ratios in place: each named resource with
    /// a ratio above 1.0 is scaled by `ceil(raw * ratio)`.
    pub fn amplify(&mut self, ratios: &AmplificationRatios) {
        for (name, ratio) in ratios {
            if let Some(quantity) = self.resources.get_mut(name) {
                *quantity = quantity.amplified(*ratio);
            }
        }
    }
}

impl FromIterator<(ResourceName, Quantity)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (ResourceName, Quantity)>>(iter: T) -> Self {
        Self {
            resources: iter.into_iter().collect(),
        }
    }
}

/// Resource capacity or consumption attributed to one NUMA cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumaNodeResource {
    /// The NUMA cell id.
    pub node: usize,
    /// Quantities attributed to the cell.
    pub resources: ResourceList,
}
