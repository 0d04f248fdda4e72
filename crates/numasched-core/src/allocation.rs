//! # Per-Node Allocation Ledgers
//!
//! [`NodeAllocation`] aggregates every workload placed on one node: the
//! pod records themselves, a reference-counted CPU ledger, and a
//! per-NUMA-cell resource ledger. The ledgers are pure state — locking
//! lives with the [`ResourceManager`](crate::manager::ResourceManager),
//! which wraps each `NodeAllocation` in its own reader-writer lock.
//!
//! `update` is release-then-add keyed by pod UID, so replaying the same
//! allocation is idempotent and a newer allocation for the same UID
//! supersedes the old one atomically (under the caller's write lock).

use std::collections::BTreeMap;
use std::fmt;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;
use crate::options::TopologyOptions;
use crate::policy::CpuExclusivePolicy;
use crate::resource::{NumaNodeResource, ResourceList};
use crate::topology::{CpuDetails, CpuTopology};

/// Unique identifier of a workload.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PodUid(pub String);

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PodUid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The committed placement of one workload on one node.
///
/// Values are copied into the ledger on entry; the allocator never
/// retains references to caller-owned data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodAllocation {
    /// Workload UID.
    pub uid: PodUid,
    /// Workload namespace.
    pub namespace: String,
    /// Workload name.
    pub name: String,
    /// Bound logical CPUs (empty for CPU-share workloads).
    pub cpuset: CpuSet,
    /// Exclusivity the workload claimed for its CPUs.
    pub cpu_exclusive_policy: CpuExclusivePolicy,
    /// Per-NUMA-cell resource consumption.
    pub numa_node_resources: Vec<NumaNodeResource>,
}

/// Aggregate allocation state of one node.
#[derive(Debug)]
pub struct NodeAllocation {
    node_name: String,
    allocated_pods: FxHashMap<PodUid, PodAllocation>,
    allocated_cpus: CpuDetails,
    allocated_resources: BTreeMap<usize, NumaNodeResource>,
}

impl NodeAllocation {
    /// Creates an empty ledger for `node_name`.
    #[must_use]
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            allocated_pods: FxHashMap::default(),
            allocated_cpus: CpuDetails::new(),
            allocated_resources: BTreeMap::new(),
        }
    }

    /// The node this ledger belongs to.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Number of workloads currently recorded.
    #[must_use]
    pub fn num_pods(&self) -> usize {
        self.allocated_pods.len()
    }

    /// The CPU ledger (reference counts across all recorded workloads).
    #[must_use]
    pub fn allocated_cpus(&self) -> &CpuDetails {
        &self.allocated_cpus
    }

    /// Records `allocation`, superseding any previous record with the
    /// same UID. Replaying the same allocation is a no-op.
    pub fn update(&mut self, allocation: &PodAllocation, cpu_topology: &CpuTopology) {
        self.release(&allocation.uid);
        self.add_pod_allocation(allocation.clone(), cpu_topology);
    }

    /// The CPUs bound to `pod_uid`, if it is recorded.
    #[must_use]
    pub fn get_cpus(&self, pod_uid: &PodUid) -> Option<CpuSet> {
        self.allocated_pods
            .get(pod_uid)
            .map(|allocation| allocation.cpuset.clone())
    }

    /// Records a CPU-only allocation for `pod_uid`. Used when syncing
    /// workloads whose per-NUMA consumption is unknown.
    pub fn add_cpus(
        &mut self,
        cpu_topology: &CpuTopology,
        pod_uid: PodUid,
        cpuset: CpuSet,
        exclusive_policy: CpuExclusivePolicy,
    ) {
        self.add_pod_allocation(
            PodAllocation {
                uid: pod_uid,
                cpuset,
                cpu_exclusive_policy: exclusive_policy,
                ..PodAllocation::default()
            },
            cpu_topology,
        );
    }

    fn add_pod_allocation(&mut self, allocation: PodAllocation, cpu_topology: &CpuTopology) {
        if self.allocated_pods.contains_key(&allocation.uid) {
            return;
        }

        for cpu in allocation.cpuset.iter() {
            if let Some(info) = self.allocated_cpus.get_mut(cpu) {
                info.exclusive_policy = allocation.cpu_exclusive_policy;
                info.ref_count += 1;
                continue;
            }
            // CPUs unknown to the topology are not accounted.
            if let Some(info) = cpu_topology.details().get(cpu) {
                let mut info = *info;
                info.exclusive_policy = allocation.cpu_exclusive_policy;
                info.ref_count = 1;
                self.allocated_cpus.insert(info);
            }
        }

        for numa_resource in &allocation.numa_node_resources {
            let entry = self
                .allocated_resources
                .entry(numa_resource.node)
                .or_insert_with(|| NumaNodeResource {
                    node: numa_resource.node,
                    resources: ResourceList::new(),
                });
            entry.resources.add(&numa_resource.resources);
        }

        self.allocated_pods.insert(allocation.uid.clone(), allocation);

        tracing::debug!(
            node = %self.node_name,
            pods = self.allocated_pods.len(),
            "recorded pod allocation"
        );
    }

    /// Removes the record for `pod_uid` and returns its CPUs and NUMA
    /// consumption to the ledgers. No-op when absent.
    pub fn release(&mut self, pod_uid: &PodUid) {
        let Some(allocation) = self.allocated_pods.remove(pod_uid) else {
            return;
        };

        for cpu in allocation.cpuset.iter() {
            let drop_entry = match self.allocated_cpus.get_mut(cpu) {
                Some(info) => {
                    info.ref_count = info.ref_count.saturating_sub(1);
                    info.ref_count == 0
                }
                None => false,
            };
            if drop_entry {
                self.allocated_cpus.remove(cpu);
            }
        }

        for numa_resource in &allocation.numa_node_resources {
            if let Some(entry) = self.allocated_resources.get_mut(&numa_resource.node) {
                entry.resources = entry.resources.sub_clamped(&numa_resource.resources);
            }
        }
    }

    /// Computes the CPUs still selectable for a new workload, and the
    /// allocation view the selection should reason about.
    ///
    /// CPUs in `preferred_cpus` get one reference discounted so a
    /// workload may reuse CPUs it already holds. A CPU is unavailable
    /// once its (discounted) reference count reaches `max_ref_count`,
    /// or when it is reserved.
    #[must_use]
    pub fn get_available_cpus(
        &self,
        cpu_topology: &CpuTopology,
        max_ref_count: u32,
        reserved_cpus: &CpuSet,
        preferred_cpus: &CpuSet,
    ) -> (CpuSet, CpuDetails) {
        let mut allocate_info = self.allocated_cpus.clone();
        for cpu in preferred_cpus.iter() {
            let drop_entry = match allocate_info.get_mut(cpu) {
                Some(info) => {
                    info.ref_count = info.ref_count.saturating_sub(1);
                    info.ref_count == 0
                }
                None => false,
            };
            if drop_entry {
                allocate_info.remove(cpu);
            }
        }

        let saturated: CpuSet = allocate_info
            .iter()
            .filter(|info| info.ref_count >= max_ref_count)
            .map(|info| info.cpu)
            .collect();
        let available = cpu_topology
            .cpus()
            .difference(&saturated)
            .difference(reserved_cpus);
        (available, allocate_info)
    }

    /// Per-cell availability and consumption under the given topology
    /// options.
    ///
    /// `reusable_resources` credits quantities the requesting workload
    /// may reclaim (typically its own prior allocation):
    /// `available[cell] = capacity[cell] - allocated[cell] + reusable[cell]`,
    /// clamped non-negative.
    #[must_use]
    pub fn get_available_numa_resources(
        &self,
        topology_options: &TopologyOptions,
        reusable_resources: &BTreeMap<usize, ResourceList>,
    ) -> (BTreeMap<usize, ResourceList>, BTreeMap<usize, ResourceList>) {
        let mut total_available = BTreeMap::new();
        let mut total_allocated = BTreeMap::new();

        for numa_resource in &topology_options.numa_node_resources {
            let cell = numa_resource.node;
            let mut available = match self.allocated_resources.get(&cell) {
                Some(allocated) => {
                    total_allocated.insert(cell, allocated.resources.clone());
                    numa_resource.resources.sub_clamped(&allocated.resources)
                }
                None => numa_resource.resources.clone(),
            };
            if let Some(reusable) = reusable_resources.get(&cell) {
                available.add(reusable);
            }
            total_available.insert(cell, available);
        }

        (total_available, total_allocated)
    }
}
