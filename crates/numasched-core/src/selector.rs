//! # CPU Selection
//!
//! Chooses logical CPUs from a candidate pool so that a workload's
//! binding shape and exclusivity policy hold, while packing or
//! spreading across NUMA cells per the node's allocate strategy.
//!
//! Selection works through an accumulator over the candidate pool.
//! Decision order: preferred reuse first, then the binding shape over
//! cores ranked by the allocate strategy (NUMA cell, then socket, then
//! core, ties broken by ascending id), with ascending CPU id as the
//! final tie-break. Everything iterates over sorted keys, so a given
//! input always yields the same set.

use std::collections::{BTreeMap, BTreeSet};

use crate::cpuset::CpuSet;
use crate::error::{Error, Result};
use crate::policy::{CpuBindPolicy, CpuExclusivePolicy, NumaAllocateStrategy};
use crate::topology::{CpuDetails, CpuTopology};

/// Selects exactly `num_cpus_needed` CPUs from `available`.
///
/// `preferred` CPUs (a workload's prior holdings) are taken first.
/// `allocated` is the node's current allocation view: it drives the
/// exclusivity filter and the strategy ranking. `max_ref_count` bounds
/// sharing, so the pool stays correct even when the caller passes a raw
/// topology set.
///
/// # Errors
///
/// Returns [`Error::InsufficientCpus`] when the pool cannot supply the
/// requested count under the binding shape.
#[allow(clippy::too_many_arguments)]
pub fn take_preferred_cpus(
    topology: &CpuTopology,
    max_ref_count: u32,
    available: &CpuSet,
    preferred: &CpuSet,
    allocated: &CpuDetails,
    num_cpus_needed: usize,
    bind_policy: CpuBindPolicy,
    exclusive_policy: CpuExclusivePolicy,
    numa_strategy: NumaAllocateStrategy,
) -> Result<CpuSet> {
    let mut accumulator = CpuAccumulator::new(
        topology,
        available,
        allocated,
        max_ref_count,
        exclusive_policy,
        numa_strategy,
        num_cpus_needed,
    );

    accumulator.take_preferred(preferred);

    if !accumulator.satisfied() {
        match bind_policy {
            CpuBindPolicy::SpreadByPcpus => accumulator.take_spread(),
            CpuBindPolicy::FullPcpus | CpuBindPolicy::Default => {
                accumulator.take_full_cores();
                accumulator.take_remaining();
            }
        }
    }

    if !accumulator.satisfied() {
        return Err(Error::InsufficientCpus {
            needed: accumulator.needed,
            available: accumulator.candidates.len(),
        });
    }
    Ok(accumulator.result)
}

/// Prunes a candidate pool down to CPUs that could form a valid set
/// under a required bind policy.
///
/// For `FullPCPUs` the pool shrinks to CPUs of wholly-available cores;
/// if that pruned set does not divide evenly into cores (irregular SMT
/// shapes), the pool is returned unchanged so the post-selection
/// validation can report the precise failure. Other policies pass
/// through.
#[must_use]
pub fn filter_available_cpus_by_required_cpu_bind_policy(
    policy: CpuBindPolicy,
    available_cpus: &CpuSet,
    cpu_details: &CpuDetails,
    cpus_per_core: usize,
) -> CpuSet {
    if policy != CpuBindPolicy::FullPcpus || cpus_per_core == 0 {
        return available_cpus.clone();
    }

    let mut per_core: BTreeMap<usize, usize> = BTreeMap::new();
    for info in cpu_details.iter() {
        *per_core.entry(info.core).or_default() += 1;
    }
    let whole_cores: BTreeSet<usize> = per_core
        .into_iter()
        .filter(|(_, count)| *count == cpus_per_core)
        .map(|(core, _)| core)
        .collect();
    let kept = cpu_details.cpus_in_cores(whole_cores);

    if kept.len() % cpus_per_core != 0 {
        return available_cpus.clone();
    }
    kept
}

/// Validates a selected set against a required bind policy.
///
/// # Errors
///
/// Returns [`Error::PolicyUnsatisfiable`] when the set violates the
/// policy's shape.
pub fn satisfied_required_cpu_bind_policy(
    policy: CpuBindPolicy,
    cpus: &CpuSet,
    topology: &CpuTopology,
) -> Result<()> {
    let satisfied = match policy {
        CpuBindPolicy::FullPcpus => {
            determine_full_pcpus(cpus, topology.details(), topology.cpus_per_core())
        }
        CpuBindPolicy::SpreadByPcpus => determine_spread_by_pcpus(cpus, topology.details()),
        CpuBindPolicy::Default => true,
    };
    if satisfied {
        Ok(())
    } else {
        Err(Error::PolicyUnsatisfiable { policy })
    }
}

fn determine_full_pcpus(cpus: &CpuSet, details: &CpuDetails, cpus_per_core: usize) -> bool {
    details.keep_only(cpus).cores().len() * cpus_per_core == cpus.len()
}

fn determine_spread_by_pcpus(cpus: &CpuSet, details: &CpuDetails) -> bool {
    details.keep_only(cpus).cores().len() == cpus.len()
}

/// Accumulates a CPU selection over a shrinking candidate pool.
struct CpuAccumulator<'a> {
    topology: &'a CpuTopology,
    strategy: NumaAllocateStrategy,
    /// Remaining selectable CPUs.
    candidates: CpuDetails,
    /// Full topology membership per core, ascending CPU ids.
    core_cpus: BTreeMap<usize, Vec<usize>>,
    /// (NUMA cell, socket) of each core.
    core_location: BTreeMap<usize, (usize, usize)>,
    /// Existing allocation counts per NUMA cell / socket / core.
    node_alloc: BTreeMap<usize, usize>,
    socket_alloc: BTreeMap<usize, usize>,
    core_alloc: BTreeMap<usize, usize>,
    /// Cores already contributing to the result.
    used_cores: BTreeSet<usize>,
    needed: usize,
    result: CpuSet,
}

impl<'a> CpuAccumulator<'a> {
    fn new(
        topology: &'a CpuTopology,
        available: &CpuSet,
        allocated: &'a CpuDetails,
        max_ref_count: u32,
        exclusive_policy: CpuExclusivePolicy,
        strategy: NumaAllocateStrategy,
        needed: usize,
    ) -> Self {
        // Cores/sockets closed by existing exclusivity claims.
        let mut exclusive_cores = BTreeSet::new();
        let mut exclusive_sockets = BTreeSet::new();
        for info in allocated.iter() {
            match info.exclusive_policy {
                CpuExclusivePolicy::PcpuLevel => {
                    exclusive_cores.insert(info.core);
                }
                CpuExclusivePolicy::SocketLevel => {
                    exclusive_sockets.insert(info.socket);
                }
                CpuExclusivePolicy::None => {}
            }
        }

        let mut candidates = CpuDetails::new();
        for cpu in available.iter() {
            let Some(info) = topology.details().get(cpu) else {
                continue;
            };
            if allocated
                .get(cpu)
                .is_some_and(|entry| entry.ref_count >= max_ref_count)
            {
                continue;
            }
            let conflict = match exclusive_policy {
                CpuExclusivePolicy::PcpuLevel => exclusive_cores.contains(&info.core),
                CpuExclusivePolicy::SocketLevel => exclusive_sockets.contains(&info.socket),
                CpuExclusivePolicy::None => false,
            };
            if conflict {
                continue;
            }
            candidates.insert(*info);
        }

        let mut core_cpus: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut core_location = BTreeMap::new();
        for info in topology.details().iter() {
            core_cpus.entry(info.core).or_default().push(info.cpu);
            core_location.insert(info.core, (info.node, info.socket));
        }

        let mut node_alloc: BTreeMap<usize, usize> = BTreeMap::new();
        let mut socket_alloc: BTreeMap<usize, usize> = BTreeMap::new();
        let mut core_alloc: BTreeMap<usize, usize> = BTreeMap::new();
        for info in allocated.iter() {
            *node_alloc.entry(info.node).or_default() += 1;
            *socket_alloc.entry(info.socket).or_default() += 1;
            *core_alloc.entry(info.core).or_default() += 1;
        }

        Self {
            topology,
            strategy,
            candidates,
            core_cpus,
            core_location,
            node_alloc,
            socket_alloc,
            core_alloc,
            used_cores: BTreeSet::new(),
            needed,
            result: CpuSet::new(),
        }
    }

    fn satisfied(&self) -> bool {
        self.needed == 0
    }

    /// Maps an allocation count to a sort component with the strategy's
    /// polarity: packing ranks higher counts first, spreading lower.
    #[allow(clippy::cast_possible_wrap)]
    fn polarity(&self, count: usize) -> i64 {
        match self.strategy {
            NumaAllocateStrategy::MostAllocated => -(count as i64),
            NumaAllocateStrategy::LeastAllocated => count as i64,
        }
    }

    /// Candidate cores ranked NUMA cell first, socket second, core
    /// last, each with the strategy's polarity and ascending-id
    /// tie-breaks.
    fn sorted_cores(&self) -> Vec<usize> {
        let mut cores: Vec<usize> = self.candidates.cores().into_iter().collect();
        cores.sort_by_key(|core| {
            let (node, socket) = self.core_location.get(core).copied().unwrap_or_default();
            (
                self.polarity(self.node_alloc.get(&node).copied().unwrap_or_default()),
                node,
                self.polarity(self.socket_alloc.get(&socket).copied().unwrap_or_default()),
                socket,
                self.polarity(self.core_alloc.get(core).copied().unwrap_or_default()),
                *core,
            )
        });
        cores
    }

    fn take(&mut self, cpu: usize) {
        if self.needed == 0 {
            return;
        }
        let Some(info) = self.candidates.get(cpu).copied() else {
            return;
        };
        self.candidates.remove(cpu);
        self.used_cores.insert(info.core);
        self.result.extend([cpu]);
        self.needed -= 1;
    }

    /// Takes reusable CPUs first, in ascending id order.
    fn take_preferred(&mut self, preferred: &CpuSet) {
        for cpu in preferred.iter() {
            if self.satisfied() {
                return;
            }
            if self.candidates.contains(cpu) {
                self.take(cpu);
            }
        }
    }

    /// Takes wholly-free physical cores while a full core still fits.
    fn take_full_cores(&mut self) {
        let cpus_per_core = self.topology.cpus_per_core();
        if cpus_per_core == 0 {
            return;
        }
        for core in self.sorted_cores() {
            if self.needed < cpus_per_core {
                return;
            }
            let cpus = &self.core_cpus[&core];
            if !cpus.iter().all(|cpu| self.candidates.contains(*cpu)) {
                continue;
            }
            for cpu in cpus.clone() {
                self.take(cpu);
            }
        }
    }

    /// Takes at most one CPU per core, skipping cores the result
    /// already touches.
    fn take_spread(&mut self) {
        for core in self.sorted_cores() {
            if self.satisfied() {
                return;
            }
            if self.used_cores.contains(&core) {
                continue;
            }
            let first_free = self.core_cpus[&core]
                .iter()
                .copied()
                .find(|cpu| self.candidates.contains(*cpu));
            if let Some(cpu) = first_free {
                self.take(cpu);
            }
        }
    }

    /// Takes individual CPUs in ranked-core then ascending-id order.
    fn take_remaining(&mut self) {
        for core in self.sorted_cores() {
            for cpu in self.core_cpus[&core].clone() {
                if self.satisfied() {
                    return;
                }
                if self.candidates.contains(cpu) {
                    self.take(cpu);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::NodeAllocation;
    use crate::policy::CpuExclusivePolicy;

    fn topology() -> CpuTopology {
        // 2 sockets x 1 NUMA cell x 26 cores x 2 threads, CPUs 0-103
        CpuTopology::uniform(2, 1, 26, 2)
    }

    fn take(
        topology: &CpuTopology,
        available: &CpuSet,
        allocated: &CpuDetails,
        needed: usize,
        bind_policy: CpuBindPolicy,
        strategy: NumaAllocateStrategy,
    ) -> Result<CpuSet> {
        take_preferred_cpus(
            topology,
            1,
            available,
            &CpuSet::new(),
            allocated,
            needed,
            bind_policy,
            CpuExclusivePolicy::None,
            strategy,
        )
    }

    #[test]
    fn test_full_pcpus_takes_whole_cores_ascending() {
        let topo = topology();
        let cpus = take(
            &topo,
            &topo.cpus(),
            &CpuDetails::new(),
            4,
            CpuBindPolicy::FullPcpus,
            NumaAllocateStrategy::MostAllocated,
        )
        .unwrap();
        assert_eq!(cpus.to_string(), "0-3");
    }

    #[test]
    fn test_full_pcpus_on_mostly_allocated_node() {
        let topo = topology();
        let mut node = NodeAllocation::new("node-1");
        node.add_cpus(
            &topo,
            "existing".into(),
            "4-103".parse().unwrap(),
            CpuExclusivePolicy::None,
        );
        let (available, allocated) =
            node.get_available_cpus(&topo, 1, &CpuSet::new(), &CpuSet::new());

        let cpus = take(
            &topo,
            &available,
            &allocated,
            4,
            CpuBindPolicy::FullPcpus,
            NumaAllocateStrategy::MostAllocated,
        )
        .unwrap();
        assert_eq!(cpus.to_string(), "0-3");
    }

    #[test]
    fn test_spread_takes_one_thread_per_core() {
        let topo = topology();
        let cpus = take(
            &topo,
            &topo.cpus(),
            &CpuDetails::new(),
            4,
            CpuBindPolicy::SpreadByPcpus,
            NumaAllocateStrategy::MostAllocated,
        )
        .unwrap();
        assert_eq!(cpus.to_string(), "0,2,4,6");
    }

    #[test]
    fn test_spread_fails_when_cores_run_out() {
        let topo = topology();
        let mut node = NodeAllocation::new("node-1");
        node.add_cpus(
            &topo,
            "existing".into(),
            "4-103".parse().unwrap(),
            CpuExclusivePolicy::None,
        );
        let (available, allocated) =
            node.get_available_cpus(&topo, 1, &CpuSet::new(), &CpuSet::new());
        assert_eq!(available.to_string(), "0-3");

        let err = take(
            &topo,
            &available,
            &allocated,
            4,
            CpuBindPolicy::SpreadByPcpus,
            NumaAllocateStrategy::MostAllocated,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InsufficientCpus { needed: 2, .. }));
    }

    #[test]
    fn test_preferred_cpus_taken_first() {
        let topo = topology();
        let preferred: CpuSet = "10-11".parse().unwrap();
        let cpus = take_preferred_cpus(
            &topo,
            1,
            &topo.cpus(),
            &preferred,
            &CpuDetails::new(),
            4,
            CpuBindPolicy::FullPcpus,
            CpuExclusivePolicy::None,
            NumaAllocateStrategy::MostAllocated,
        )
        .unwrap();
        assert_eq!(cpus.to_string(), "0-1,10-11");
    }

    #[test]
    fn test_most_allocated_packs_onto_busy_cell() {
        let topo = topology();
        let mut node = NodeAllocation::new("node-1");
        // NUMA cell 1 already hosts a workload
        node.add_cpus(
            &topo,
            "existing".into(),
            "52-55".parse().unwrap(),
            CpuExclusivePolicy::None,
        );
        let (available, allocated) =
            node.get_available_cpus(&topo, 1, &CpuSet::new(), &CpuSet::new());

        let cpus = take(
            &topo,
            &available,
            &allocated,
            2,
            CpuBindPolicy::FullPcpus,
            NumaAllocateStrategy::MostAllocated,
        )
        .unwrap();
        // packs next to the existing allocation on cell 1
        assert_eq!(cpus.to_string(), "56-57");

        let cpus = take(
            &topo,
            &available,
            &allocated,
            2,
            CpuBindPolicy::FullPcpus,
            NumaAllocateStrategy::LeastAllocated,
        )
        .unwrap();
        // spreads to the empty cell 0
        assert_eq!(cpus.to_string(), "0-1");
    }

    #[test]
    fn test_exclusive_core_is_skipped() {
        let topo = topology();
        let mut node = NodeAllocation::new("node-1");
        // core 0 is exclusively claimed; max_ref_count 2 keeps its
        // threads nominally shareable
        node.add_cpus(
            &topo,
            "exclusive".into(),
            "0-1".parse().unwrap(),
            CpuExclusivePolicy::PcpuLevel,
        );
        let (available, allocated) =
            node.get_available_cpus(&topo, 2, &CpuSet::new(), &CpuSet::new());
        assert!(available.contains(0));

        let cpus = take_preferred_cpus(
            &topo,
            2,
            &available,
            &CpuSet::new(),
            &allocated,
            2,
            CpuBindPolicy::FullPcpus,
            CpuExclusivePolicy::PcpuLevel,
            NumaAllocateStrategy::MostAllocated,
        )
        .unwrap();
        assert_eq!(cpus.to_string(), "2-3");
    }

    #[test]
    fn test_socket_exclusive_claim_closes_socket() {
        let topo = topology();
        let mut node = NodeAllocation::new("node-1");
        node.add_cpus(
            &topo,
            "exclusive".into(),
            "0-1".parse().unwrap(),
            CpuExclusivePolicy::SocketLevel,
        );
        let (available, allocated) =
            node.get_available_cpus(&topo, 1, &CpuSet::new(), &CpuSet::new());

        let cpus = take_preferred_cpus(
            &topo,
            1,
            &available,
            &CpuSet::new(),
            &allocated,
            2,
            CpuBindPolicy::FullPcpus,
            CpuExclusivePolicy::SocketLevel,
            NumaAllocateStrategy::LeastAllocated,
        )
        .unwrap();
        // the whole of socket 0 is off-limits
        assert_eq!(cpus.to_string(), "52-53");
    }

    #[test]
    fn test_filter_keeps_only_whole_cores() {
        let topo = topology();
        let available: CpuSet = "0-4".parse().unwrap(); // core 2 only half-free
        let details = topo.details().keep_only(&available);
        let filtered = filter_available_cpus_by_required_cpu_bind_policy(
            CpuBindPolicy::FullPcpus,
            &available,
            &details,
            topo.cpus_per_core(),
        );
        assert_eq!(filtered.to_string(), "0-3");

        // non-FullPCPUs policies pass through untouched
        let filtered = filter_available_cpus_by_required_cpu_bind_policy(
            CpuBindPolicy::SpreadByPcpus,
            &available,
            &details,
            topo.cpus_per_core(),
        );
        assert_eq!(filtered, available);
    }

    #[test]
    fn test_filter_with_no_whole_cores() {
        let topo = topology();
        let available: CpuSet = "1,3,5,7".parse().unwrap();
        let details = topo.details().keep_only(&available);
        let filtered = filter_available_cpus_by_required_cpu_bind_policy(
            CpuBindPolicy::FullPcpus,
            &available,
            &details,
            topo.cpus_per_core(),
        );
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_required_policy_validation() {
        let topo = topology();
        let whole: CpuSet = "0-3".parse().unwrap();
        let ragged: CpuSet = "0-2".parse().unwrap();
        let spread: CpuSet = "0,2,4".parse().unwrap();

        assert!(satisfied_required_cpu_bind_policy(CpuBindPolicy::FullPcpus, &whole, &topo).is_ok());
        assert!(matches!(
            satisfied_required_cpu_bind_policy(CpuBindPolicy::FullPcpus, &ragged, &topo),
            Err(Error::PolicyUnsatisfiable {
                policy: CpuBindPolicy::FullPcpus
            })
        ));
        assert!(
            satisfied_required_cpu_bind_policy(CpuBindPolicy::SpreadByPcpus, &spread, &topo)
                .is_ok()
        );
        assert!(matches!(
            satisfied_required_cpu_bind_policy(CpuBindPolicy::SpreadByPcpus, &whole, &topo),
            Err(Error::PolicyUnsatisfiable {
                policy: CpuBindPolicy::SpreadByPcpus
            })
        ));
        assert!(
            satisfied_required_cpu_bind_policy(CpuBindPolicy::Default, &ragged, &topo).is_ok()
        );
    }

    #[test]
    fn test_selection_is_deterministic() {
        let topo = topology();
        let first = take(
            &topo,
            &topo.cpus(),
            &CpuDetails::new(),
            12,
            CpuBindPolicy::FullPcpus,
            NumaAllocateStrategy::LeastAllocated,
        )
        .unwrap();
        let second = take(
            &topo,
            &topo.cpus(),
            &CpuDetails::new(),
            12,
            CpuBindPolicy::FullPcpus,
            NumaAllocateStrategy::LeastAllocated,
        )
        .unwrap();
        assert_eq!(first, second);
    }
}
