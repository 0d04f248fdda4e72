//! # Topology Hint Generation
//!
//! Enumerates the NUMA-cell subsets that can satisfy a request and
//! marks the minimum-cardinality subsets as preferred. A higher-level
//! topology manager merges the per-resource hint lists across resource
//! providers and picks the affinity the allocation then commits to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bitmask::{iterate_bit_masks, BitMask};
use crate::resource::{ResourceList, ResourceName};

/// A candidate NUMA placement for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaTopologyHint {
    /// The NUMA cells the placement would be confined to.
    pub affinity: BitMask,
    /// True if the affinity is among the narrowest that satisfy the
    /// request.
    pub preferred: bool,
}

/// Hint lists keyed by resource name.
pub type ResourceHints = BTreeMap<ResourceName, Vec<NumaTopologyHint>>;

/// Enumerates every non-empty subset of `cells` in ascending
/// cardinality and emits, for each resource the request names, the
/// subsets whose summed availability covers the request.
///
/// Resources named by the request but absent from every cell are
/// skipped entirely; a request made only of such resources yields an
/// empty map, which callers read as "no feasible placement". Hints
/// whose subset cardinality equals the smallest satisfying cardinality
/// are marked preferred.
#[must_use]
pub fn generate_resource_hints(
    cells: &[usize],
    requests: &ResourceList,
    total_available: &BTreeMap<usize, ResourceList>,
) -> ResourceHints {
    // Start from the widest cardinality so the full-set mask counts as
    // minimal when nothing narrower satisfies the request.
    let mut min_affinity_size = cells.len();

    let mut hints = ResourceHints::new();
    iterate_bit_masks(cells, |mask| {
        let mut available = ResourceList::new();
        for cell in mask.bits() {
            if let Some(cell_available) = total_available.get(&cell) {
                available.add(cell_available);
            }
        }
        if !available.covers(requests) {
            return;
        }

        if mask.count() < min_affinity_size {
            min_affinity_size = mask.count();
        }

        for (resource, _) in requests.iter() {
            if available.get(resource).is_none() {
                continue;
            }
            hints
                .entry(resource.clone())
                .or_default()
                .push(NumaTopologyHint {
                    affinity: mask,
                    preferred: false,
                });
        }
    });

    for resource_hints in hints.values_mut() {
        for hint in resource_hints.iter_mut() {
            hint.preferred = hint.affinity.count() == min_affinity_size;
        }
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Quantity;

    fn cpu_list(units: i64) -> ResourceList {
        [(ResourceName::Cpu, Quantity::from_units(units))]
            .into_iter()
            .collect()
    }

    fn availability(cells: &[(usize, i64)]) -> BTreeMap<usize, ResourceList> {
        cells
            .iter()
            .map(|(cell, units)| (*cell, cpu_list(*units)))
            .collect()
    }

    #[test]
    fn test_single_cell_hints_preferred() {
        // Both empty cells satisfy alone; the pair satisfies too but is
        // wider than necessary.
        let hints = generate_resource_hints(
            &[0, 1],
            &cpu_list(4),
            &availability(&[(0, 52), (1, 52)]),
        );
        let cpu_hints = &hints[&ResourceName::Cpu];
        assert_eq!(cpu_hints.len(), 3);
        assert_eq!(
            (cpu_hints[0].affinity.bits().to_vec(), cpu_hints[0].preferred),
            (vec![0], true)
        );
        assert_eq!(
            (cpu_hints[1].affinity.bits().to_vec(), cpu_hints[1].preferred),
            (vec![1], true)
        );
        assert_eq!(
            (cpu_hints[2].affinity.bits().to_vec(), cpu_hints[2].preferred),
            (vec![0, 1], false)
        );
    }

    #[test]
    fn test_spanning_hint_when_one_cell_consumed() {
        // Cell 0 is fully consumed; neither cell alone fits, the union
        // does, so the spanning mask is the narrowest satisfying one.
        let hints = generate_resource_hints(
            &[0, 1],
            &cpu_list(60),
            &availability(&[(0, 0), (1, 52)]),
        );
        assert!(hints.is_empty());

        let hints = generate_resource_hints(
            &[0, 1],
            &cpu_list(60),
            &availability(&[(0, 20), (1, 52)]),
        );
        let cpu_hints = &hints[&ResourceName::Cpu];
        assert_eq!(cpu_hints.len(), 1);
        assert_eq!(cpu_hints[0].affinity.bits().to_vec(), vec![0, 1]);
        assert!(cpu_hints[0].preferred);
    }

    #[test]
    fn test_request_equal_to_total_capacity() {
        // request == total available: only the full mask satisfies, and
        // it must be preferred.
        let hints = generate_resource_hints(
            &[0, 1],
            &cpu_list(104),
            &availability(&[(0, 52), (1, 52)]),
        );
        let cpu_hints = &hints[&ResourceName::Cpu];
        assert_eq!(cpu_hints.len(), 1);
        assert_eq!(cpu_hints[0].affinity.bits().to_vec(), vec![0, 1]);
        assert!(cpu_hints[0].preferred);
    }

    #[test]
    fn test_resource_absent_from_all_cells_is_skipped() {
        let gpu = ResourceName::Extended("vendor.com/gpu".to_string());
        let mut requests = cpu_list(4);
        requests.insert(gpu.clone(), Quantity::from_units(1));

        let hints =
            generate_resource_hints(&[0, 1], &requests, &availability(&[(0, 52), (1, 52)]));
        assert!(hints.contains_key(&ResourceName::Cpu));
        assert!(!hints.contains_key(&gpu));
    }

    #[test]
    fn test_request_made_only_of_absent_resources() {
        let gpu = ResourceName::Extended("vendor.com/gpu".to_string());
        let requests: ResourceList =
            [(gpu, Quantity::from_units(1))].into_iter().collect();
        let hints =
            generate_resource_hints(&[0, 1], &requests, &availability(&[(0, 52), (1, 52)]));
        // Satisfiable in the cover sense, but no cell accounts the
        // resource, so nothing is emitted.
        assert!(hints.is_empty());
    }

    #[test]
    fn test_deterministic_across_invocations() {
        let requests = cpu_list(30);
        let available = availability(&[(0, 26), (1, 26), (2, 26), (3, 26)]);
        let first = generate_resource_hints(&[0, 1, 2, 3], &requests, &available);
        let second = generate_resource_hints(&[0, 1, 2, 3], &requests, &available);
        assert_eq!(first, second);
    }
}
