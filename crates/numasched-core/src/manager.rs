//! # Resource Manager
//!
//! The public surface of the allocator. A `ResourceManager` keeps one
//! [`NodeAllocation`] ledger per node (created lazily, dropped on node
//! deletion) and orchestrates a scheduling decision end to end:
//! availability queries, hint generation, per-NUMA resource
//! allocation, CPU selection, and the commit/release write-through.
//!
//! `allocate` is a pure function of the ledgers — it never mutates
//! them. Only `update` and `release` write, each under the node's
//! write lock, so a failed allocation can simply be dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use crate::allocation::{NodeAllocation, PodAllocation, PodUid};
use crate::cpuset::CpuSet;
use crate::error::{Error, Result};
use crate::hint::{generate_resource_hints, NumaTopologyHint, ResourceHints};
use crate::options::{TopologyOptions, TopologyOptionsManager};
use crate::policy::{
    self, CpuBindPolicy, CpuExclusivePolicy, NumaAllocateStrategy, PriorityClass, QosClass,
};
use crate::resource::{NumaNodeResource, Quantity, ResourceList, ResourceName};
use crate::selector::{
    filter_available_cpus_by_required_cpu_bind_policy, satisfied_required_cpu_bind_policy,
    take_preferred_cpus,
};
use crate::topology::CpuDetails;

/// Node metadata the allocator consumes from the orchestration layer.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    /// Node name.
    pub name: String,
    /// Node labels (per-node policy overrides).
    pub labels: BTreeMap<String, String>,
    /// Node annotations (amplification ratios).
    pub annotations: BTreeMap<String, String>,
}

impl NodeInfo {
    /// A node with the given name and no labels or annotations.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Workload metadata the allocator consumes from the orchestration
/// layer.
#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    /// Workload UID.
    pub uid: PodUid,
    /// Workload namespace.
    pub namespace: String,
    /// Workload name.
    pub name: String,
    /// Quality-of-service class.
    pub qos_class: QosClass,
    /// Priority class.
    pub priority_class: PriorityClass,
    /// Workload labels.
    pub labels: BTreeMap<String, String>,
    /// Workload annotations (binding/exclusivity policies).
    pub annotations: BTreeMap<String, String>,
}

impl PodInfo {
    /// Returns true if this workload is eligible for CPU binding.
    #[must_use]
    pub fn allow_use_cpu_set(&self) -> bool {
        policy::allow_use_cpu_set(self.qos_class, self.priority_class)
    }
}

/// The request envelope for one scheduling decision. Built by the
/// embedding scheduler per call and not retained.
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    /// Whole CPUs to bind (zero for CPU-share workloads).
    pub num_cpus_needed: usize,
    /// True if the workload binds CPUs rather than sharing them.
    pub request_cpu_bind: bool,
    /// The request, amplified by the outer layer where ratios apply.
    pub requests: ResourceList,
    /// The raw request, used for NUMA accounting of CPU-bound
    /// workloads.
    pub original_requests: ResourceList,
    /// True if the bind policy is mandatory rather than preferred.
    pub required_cpu_bind_policy: bool,
    /// How requested CPUs map onto logical CPUs.
    pub cpu_bind_policy: CpuBindPolicy,
    /// Exclusivity the workload claims for its CPUs.
    pub cpu_exclusive_policy: CpuExclusivePolicy,
    /// CPUs the workload already holds and may reuse.
    pub preferred_cpus: CpuSet,
    /// Per-cell quantities the workload may reclaim.
    pub reusable_resources: BTreeMap<usize, ResourceList>,
    /// The NUMA affinity chosen by the topology manager, if any.
    pub hint: Option<NumaTopologyHint>,
    /// The node's topology snapshot for this decision.
    pub topology_options: TopologyOptions,
}

/// Per-node NUMA-aware CPU and resource allocator.
///
/// All methods are safe for concurrent use: a short mutex guards the
/// node map, and each node ledger has its own reader-writer lock. No
/// lock is held across calls back into the embedding scheduler.
pub struct ResourceManager {
    default_numa_allocate_strategy: NumaAllocateStrategy,
    topology_options_manager: Arc<TopologyOptionsManager>,
    node_allocations: Mutex<FxHashMap<String, Arc<RwLock<NodeAllocation>>>>,
}

impl ResourceManager {
    /// Creates a manager with the given default allocate strategy.
    #[must_use]
    pub fn new(
        default_numa_allocate_strategy: NumaAllocateStrategy,
        topology_options_manager: Arc<TopologyOptionsManager>,
    ) -> Self {
        Self {
            default_numa_allocate_strategy,
            topology_options_manager,
            node_allocations: Mutex::new(FxHashMap::default()),
        }
    }

    /// Drops the ledger of a deleted node. Wired to the orchestration
    /// layer's node-deletion events.
    pub fn on_node_delete(&self, node_name: &str) {
        self.node_allocations.lock().remove(node_name);
        tracing::debug!(node = %node_name, "dropped node allocation state");
    }

    fn get_or_create_node_allocation(&self, node_name: &str) -> Arc<RwLock<NodeAllocation>> {
        let mut nodes = self.node_allocations.lock();
        nodes
            .entry(node_name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(NodeAllocation::new(node_name))))
            .clone()
    }

    /// Enumerates the NUMA placements that can satisfy the request on
    /// this node, per resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFoundCpuTopology`] when the node has no
    /// registered NUMA resources.
    pub fn get_topology_hints(
        &self,
        node: &NodeInfo,
        pod: &PodInfo,
        options: &ResourceOptions,
    ) -> Result<ResourceHints> {
        let topology_options = &options.topology_options;
        if topology_options.numa_node_resources.is_empty() {
            return Err(Error::NotFoundCpuTopology);
        }

        let (total_available, _) = self.get_available_numa_node_resources(
            &node.name,
            topology_options,
            &options.reusable_resources,
        );

        let cells: Vec<usize> = topology_options
            .numa_node_resources
            .iter()
            .map(|numa_resource| numa_resource.node)
            .collect();

        tracing::trace!(node = %node.name, pod = %pod.uid, cells = cells.len(), "generating topology hints");
        Ok(generate_resource_hints(
            &cells,
            &options.requests,
            &total_available,
        ))
    }

    /// Computes a placement for the workload without committing it.
    ///
    /// When the options carry a NUMA hint, per-cell resources are
    /// allocated along the hint's cells first; when the workload binds
    /// CPUs, logical CPUs are then selected within the allocated cells.
    /// The returned [`PodAllocation`] only enters the ledgers through
    /// [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// Any [`Error`] kind, depending on which stage fails. The ledgers
    /// are never mutated on failure.
    pub fn allocate(
        &self,
        node: &NodeInfo,
        pod: &PodInfo,
        options: &ResourceOptions,
    ) -> Result<PodAllocation> {
        let mut allocation = PodAllocation {
            uid: pod.uid.clone(),
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            cpuset: CpuSet::new(),
            cpu_exclusive_policy: options.cpu_exclusive_policy,
            numa_node_resources: Vec::new(),
        };
        if let Some(hint) = &options.hint {
            allocation.numa_node_resources =
                self.allocate_resources_by_hint(node, options, hint)?;
        }
        if options.request_cpu_bind {
            allocation.cpuset =
                self.allocate_cpuset(node, options, &allocation.numa_node_resources)?;
        }
        Ok(allocation)
    }

    fn allocate_resources_by_hint(
        &self,
        node: &NodeInfo,
        options: &ResourceOptions,
        hint: &NumaTopologyHint,
    ) -> Result<Vec<NumaNodeResource>> {
        let topology_options = &options.topology_options;
        if topology_options.numa_node_resources.is_empty() {
            return Err(Error::NotFoundCpuTopology);
        }

        let (mut total_available, _) = self.get_available_numa_node_resources(
            &node.name,
            topology_options,
            &options.reusable_resources,
        );

        // CPU-bound workloads are accounted at their raw request; the
        // amplified request only participates in capacity fitting.
        let mut requests = if options.request_cpu_bind {
            options.original_requests.clone()
        } else {
            options.requests.clone()
        };

        let mut intersection: Vec<ResourceName> = Vec::new();
        let mut result = Vec::new();
        for cell in hint.affinity.bits() {
            let Some(allocatable) = total_available.get_mut(&cell) else {
                continue;
            };
            let mut cell_allocation = NumaNodeResource {
                node: cell,
                resources: ResourceList::new(),
            };
            let names: Vec<ResourceName> =
                requests.iter().map(|(name, _)| name.clone()).collect();
            for name in names {
                let Some(available) = allocatable.get(&name) else {
                    continue;
                };
                if !intersection.contains(&name) {
                    intersection.push(name.clone());
                }
                let wanted = requests.get(&name).unwrap_or(Quantity::ZERO);
                let (available, remaining, allocated) = allocate_res(available, wanted);
                allocatable.insert(name.clone(), available);
                requests.insert(name.clone(), remaining);
                if !allocated.is_zero() {
                    cell_allocation.resources.insert(name, allocated);
                }
            }
            if !cell_allocation.resources.is_zero() {
                result.push(cell_allocation);
            }
            if requests.is_zero() {
                break;
            }
        }

        for (name, remaining) in requests.iter() {
            if intersection.contains(name) && !remaining.is_zero() {
                return Err(Error::InsufficientNumaResource {
                    resource: name.clone(),
                });
            }
        }
        Ok(result)
    }

    fn allocate_cpuset(
        &self,
        node: &NodeInfo,
        options: &ResourceOptions,
        allocated_numa_nodes: &[NumaNodeResource],
    ) -> Result<CpuSet> {
        let topology_options = &options.topology_options;
        let (mut available_cpus, allocated_cpus) = self.available_cpus_with_options(
            &node.name,
            topology_options,
            &options.preferred_cpus,
        )?;
        let topology = topology_options
            .cpu_topology
            .as_ref()
            .ok_or(Error::NotFoundCpuTopology)?;

        if options.required_cpu_bind_policy {
            let cpu_details = topology.details().keep_only(&available_cpus);
            available_cpus = filter_available_cpus_by_required_cpu_bind_policy(
                options.cpu_bind_policy,
                &available_cpus,
                &cpu_details,
                topology.cpus_per_core(),
            );
        }

        if available_cpus.len() < options.num_cpus_needed {
            return Err(Error::InsufficientCpus {
                needed: options.num_cpus_needed,
                available: available_cpus.len(),
            });
        }

        let numa_allocate_strategy = policy::numa_allocate_strategy_for_node(
            &node.labels,
            self.default_numa_allocate_strategy,
        );
        let max_ref_count = topology_options.effective_max_ref_count();

        let mut result = CpuSet::new();
        if allocated_numa_nodes.is_empty() {
            if options.num_cpus_needed > 0 {
                result = take_preferred_cpus(
                    topology,
                    max_ref_count,
                    &available_cpus,
                    &options.preferred_cpus,
                    &allocated_cpus,
                    options.num_cpus_needed,
                    options.cpu_bind_policy,
                    options.cpu_exclusive_policy,
                    numa_allocate_strategy,
                )?;
            }
        } else {
            for numa_node in allocated_numa_nodes {
                let cpus_in_cell = topology.details().cpus_in_numa_nodes([numa_node.node]);
                let available_in_cell = available_cpus.intersection(&cpus_in_cell);

                // cap by the CPU-millis allocated to this cell
                #[allow(clippy::cast_sign_loss)]
                let cell_needed = numa_node.resources.cpu().whole_units().max(0) as usize;
                let num_cpus = available_in_cell.len().min(cell_needed);

                let cpus = take_preferred_cpus(
                    topology,
                    max_ref_count,
                    &available_in_cell,
                    &options.preferred_cpus,
                    &allocated_cpus,
                    num_cpus,
                    options.cpu_bind_policy,
                    options.cpu_exclusive_policy,
                    numa_allocate_strategy,
                )?;
                result = result.union(&cpus);
            }
            if result.len() < options.num_cpus_needed {
                return Err(Error::InsufficientCpus {
                    needed: options.num_cpus_needed - result.len(),
                    available: available_cpus.difference(&result).len(),
                });
            }
        }

        if options.required_cpu_bind_policy {
            satisfied_required_cpu_bind_policy(options.cpu_bind_policy, &result, topology)?;
        }

        Ok(result)
    }

    /// Writes a committed allocation through to the node ledger.
    /// Idempotent on UID; a later call with the same UID supersedes the
    /// earlier state. Ignored while the node has no valid topology.
    pub fn update(&self, node_name: &str, allocation: &PodAllocation) {
        let topology_options = self.topology_options_manager.get_topology_options(node_name);
        let Some(topology) = topology_options.cpu_topology else {
            return;
        };
        if !topology.is_valid() {
            return;
        }

        let node_allocation = self.get_or_create_node_allocation(node_name);
        let mut ledger = node_allocation.write();
        ledger.update(allocation, &topology);
        tracing::debug!(node = %node_name, pod = %allocation.uid, cpus = %allocation.cpuset, "updated pod allocation");
    }

    /// Removes a workload's allocation from the node ledger. No-op when
    /// absent.
    pub fn release(&self, node_name: &str, pod_uid: &PodUid) {
        let node_allocation = self.get_or_create_node_allocation(node_name);
        let mut ledger = node_allocation.write();
        ledger.release(pod_uid);
        tracing::debug!(node = %node_name, pod = %pod_uid, "released pod allocation");
    }

    /// The CPUs bound to a workload on a node, if recorded.
    #[must_use]
    pub fn get_allocated_cpuset(&self, node_name: &str, pod_uid: &PodUid) -> Option<CpuSet> {
        let node_allocation = self.get_or_create_node_allocation(node_name);
        let ledger = node_allocation.read();
        ledger.get_cpus(pod_uid)
    }

    /// The CPUs currently selectable on a node, with the allocation
    /// view backing the computation. Uses the node's registered
    /// topology snapshot.
    ///
    /// # Errors
    ///
    /// [`Error::NotFoundCpuTopology`] when no topology is registered,
    /// [`Error::InvalidCpuTopology`] when the registered one is
    /// unusable.
    pub fn get_available_cpus(
        &self,
        node_name: &str,
        preferred_cpus: &CpuSet,
    ) -> Result<(CpuSet, CpuDetails)> {
        let topology_options = self.topology_options_manager.get_topology_options(node_name);
        self.available_cpus_with_options(node_name, &topology_options, preferred_cpus)
    }

    fn available_cpus_with_options(
        &self,
        node_name: &str,
        topology_options: &TopologyOptions,
        preferred_cpus: &CpuSet,
    ) -> Result<(CpuSet, CpuDetails)> {
        let Some(topology) = &topology_options.cpu_topology else {
            return Err(Error::NotFoundCpuTopology);
        };
        if !topology.is_valid() {
            return Err(Error::InvalidCpuTopology);
        }

        let node_allocation = self.get_or_create_node_allocation(node_name);
        let ledger = node_allocation.read();
        Ok(ledger.get_available_cpus(
            topology,
            topology_options.effective_max_ref_count(),
            &topology_options.reserved_cpus,
            preferred_cpus,
        ))
    }

    /// The ledger of a node, creating it lazily. Callers take the
    /// ledger's own lock for reads or writes.
    #[must_use]
    pub fn get_node_allocation(&self, node_name: &str) -> Arc<RwLock<NodeAllocation>> {
        self.get_or_create_node_allocation(node_name)
    }

    fn get_available_numa_node_resources(
        &self,
        node_name: &str,
        topology_options: &TopologyOptions,
        reusable_resources: &BTreeMap<usize, ResourceList>,
    ) -> (BTreeMap<usize, ResourceList>, BTreeMap<usize, ResourceList>) {
        let node_allocation = self.get_or_create_node_allocation(node_name);
        let ledger = node_allocation.read();
        ledger.get_available_numa_resources(topology_options, reusable_resources)
    }
}

/// Splits a request against an availability: returns the updated
/// availability, the remaining request, and the allocated amount.
fn allocate_res(available: Quantity, request: Quantity) -> (Quantity, Quantity, Quantity) {
    match available.cmp(&request) {
        std::cmp::Ordering::Greater => (available.saturating_sub(request), Quantity::ZERO, request),
        std::cmp::Ordering::Less => (Quantity::ZERO, request.saturating_sub(available), available),
        std::cmp::Ordering::Equal => (Quantity::ZERO, Quantity::ZERO, available),
    }
}
