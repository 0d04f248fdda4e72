//! # CPU Topology
//!
//! The immutable description of a node's logical CPUs (which physical
//! core, socket, NUMA cell, and L3 cache each one belongs to) and the
//! mutable per-CPU ledger layered on top of it.
//!
//! [`CpuTopology`] is built once from topology discovery and shared
//! read-only behind an `Arc`; [`CpuDetails`] doubles as the allocation
//! ledger, where each entry carries a reference count and the
//! exclusivity policy of the workloads holding it. A CPU with a zero
//! reference count is simply absent from a ledger.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;
use crate::policy::CpuExclusivePolicy;

/// Topology membership and allocation state of one logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Logical CPU id.
    pub cpu: usize,
    /// Physical core id.
    pub core: usize,
    /// Socket id.
    pub socket: usize,
    /// NUMA cell id.
    pub node: usize,
    /// L3 cache id.
    pub l3: usize,
    /// How many workloads currently hold this CPU.
    pub ref_count: u32,
    /// Exclusivity policy recorded by the most recent holder.
    pub exclusive_policy: CpuExclusivePolicy,
}

/// A map of logical CPU id to [`CpuInfo`].
///
/// Iteration is always in ascending CPU id order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuDetails {
    cpus: BTreeMap<usize, CpuInfo>,
}

impl CpuDetails {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up one CPU.
    #[must_use]
    pub fn get(&self, cpu: usize) -> Option<&CpuInfo> {
        self.cpus.get(&cpu)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, cpu: usize) -> Option<&mut CpuInfo> {
        self.cpus.get_mut(&cpu)
    }

    /// Inserts or replaces the entry for `info.cpu`.
    pub fn insert(&mut self, info: CpuInfo) {
        self.cpus.insert(info.cpu, info);
    }

    /// Removes the entry for `cpu`.
    pub fn remove(&mut self, cpu: usize) {
        self.cpus.remove(&cpu);
    }

    /// Returns true if `cpu` has an entry.
    #[must_use]
    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains_key(&cpu)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Returns true if the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Iterates entries in ascending CPU id order.
    pub fn iter(&self) -> impl Iterator<Item = &CpuInfo> + '_ {
        self.cpus.values()
    }

    /// All CPU ids as a set.
    #[must_use]
    pub fn cpus(&self) -> CpuSet {
        self.cpus.keys().copied().collect()
    }

    /// The distinct physical core ids present.
    #[must_use]
    pub fn cores(&self) -> BTreeSet<usize> {
        self.cpus.values().map(|info| info.core).collect()
    }

    /// The distinct socket ids present.
    #[must_use]
    pub fn sockets(&self) -> BTreeSet<usize> {
        self.cpus.values().map(|info| info.socket).collect()
    }

    /// The distinct NUMA cell ids present.
    #[must_use]
    pub fn numa_nodes(&self) -> BTreeSet<usize> {
        self.cpus.values().map(|info| info.node).collect()
    }

    /// CPUs belonging to any of the given physical cores.
    #[must_use]
    pub fn cpus_in_cores(&self, cores: impl IntoIterator<Item = usize>) -> CpuSet {
        let cores: BTreeSet<usize> = cores.into_iter().collect();
        self.cpus
            .values()
            .filter(|info| cores.contains(&info.core))
            .map(|info| info.cpu)
            .collect()
    }

    /// CPUs belonging to any of the given NUMA cells.
    #[must_use]
    pub fn cpus_in_numa_nodes(&self, nodes: impl IntoIterator<Item = usize>) -> CpuSet {
        let nodes: BTreeSet<usize> = nodes.into_iter().collect();
        self.cpus
            .values()
            .filter(|info| nodes.contains(&info.node))
            .map(|info| info.cpu)
            .collect()
    }

    /// CPUs belonging to any of the given sockets.
    #[must_use]
    pub fn cpus_in_sockets(&self, sockets: impl IntoIterator<Item = usize>) -> CpuSet {
        let sockets: BTreeSet<usize> = sockets.into_iter().collect();
        self.cpus
            .values()
            .filter(|info| sockets.contains(&info.socket))
            .map(|info| info.cpu)
            .collect()
    }

    /// A copy containing only the entries whose CPU is in `cpus`.
    #[must_use]
    pub fn keep_only(&self, cpus: &CpuSet) -> Self {
        Self {
            cpus: self
                .cpus
                .iter()
                .filter(|(cpu, _)| cpus.contains(**cpu))
                .map(|(cpu, info)| (*cpu, *info))
                .collect(),
        }
    }
}

/// Immutable CPU topology of one node.
///
/// Constructed from discovery output and never mutated; topology
/// refreshes replace the whole value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    num_cpus: usize,
    num_cores: usize,
    num_sockets: usize,
    num_nodes: usize,
    details: CpuDetails,
}

impl CpuTopology {
    /// Builds a topology from per-CPU records.
    ///
    /// Allocation state on the inputs is discarded: the topology's own
    /// ledger always starts with zero reference counts.
    #[must_use]
    pub fn new(cpu_infos: impl IntoIterator<Item = CpuInfo>) -> Self {
        let mut details = CpuDetails::new();
        for info in cpu_infos {
            details.insert(CpuInfo {
                ref_count: 0,
                exclusive_policy: CpuExclusivePolicy::None,
                ..info
            });
        }
        let num_cpus = details.len();
        let num_cores = details.cores().len();
        let num_sockets = details.sockets().len();
        let num_nodes = details.numa_nodes().len();
        Self {
            num_cpus,
            num_cores,
            num_sockets,
            num_nodes,
            details,
        }
    }

    /// Builds a synthetic SMT topology with consecutive CPU numbering:
    /// CPU ids walk thread-by-thread through cores, cores through NUMA
    /// cells, cells through sockets. Each NUMA cell shares one L3.
    ///
    /// Intended for tests and capacity simulation.
    #[must_use]
    pub fn uniform(
        num_sockets: usize,
        nodes_per_socket: usize,
        cores_per_node: usize,
        threads_per_core: usize,
    ) -> Self {
        let mut infos = Vec::new();
        for socket in 0..num_sockets {
            for node_in_socket in 0..nodes_per_socket {
                let node = socket * nodes_per_socket + node_in_socket;
                for core_in_node in 0..cores_per_node {
                    let core = node * cores_per_node + core_in_node;
                    for thread in 0..threads_per_core {
                        infos.push(CpuInfo {
                            cpu: core * threads_per_core + thread,
                            core,
                            socket,
                            node,
                            l3: node,
                            ref_count: 0,
                            exclusive_policy: CpuExclusivePolicy::None,
                        });
                    }
                }
            }
        }
        Self::new(infos)
    }

    /// Number of logical CPUs.
    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Number of physical cores.
    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// Number of sockets.
    #[must_use]
    pub fn num_sockets(&self) -> usize {
        self.num_sockets
    }

    /// Number of NUMA cells.
    #[must_use]
    pub fn num_numa_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Logical CPUs per physical core (1 without SMT).
    #[must_use]
    pub fn cpus_per_core(&self) -> usize {
        if self.num_cores == 0 {
            return 0;
        }
        self.num_cpus / self.num_cores
    }

    /// The per-CPU membership map.
    #[must_use]
    pub fn details(&self) -> &CpuDetails {
        &self.details
    }

    /// All CPU ids.
    #[must_use]
    pub fn cpus(&self) -> CpuSet {
        self.details.cpus()
    }

    /// A topology is usable once it has CPUs and a sane thread-per-core
    /// shape.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.num_cpus > 0
            && self.num_cores > 0
            && self.num_sockets > 0
            && self.num_nodes > 0
            && self.cpus_per_core() >= 1
    }
}
