//! # Topology Options
//!
//! A process-wide, node-keyed store of topology descriptors: the CPU
//! topology, per-NUMA-cell capacities, reserved CPUs, the per-CPU
//! sharing bound, and amplification state. Topology discovery pushes
//! new descriptors through [`TopologyOptionsManager::update_topology_options`];
//! readers always observe a consistent snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::cpuset::CpuSet;
use crate::policy::{amplification_ratios_from_annotations, PolicyParseError};
use crate::resource::{AmplificationRatios, NumaNodeResource};
use crate::topology::CpuTopology;

/// The topology descriptor of one node.
#[derive(Debug, Clone, Default)]
pub struct TopologyOptions {
    /// The node's CPU topology, if discovery has reported it.
    pub cpu_topology: Option<Arc<CpuTopology>>,
    /// Advertised capacity per NUMA cell (amplified at most once).
    pub numa_node_resources: Vec<NumaNodeResource>,
    /// CPUs withheld from workloads (system reserved).
    pub reserved_cpus: CpuSet,
    /// How many workloads may share one logical CPU. Zero is treated
    /// as the default of 1.
    pub max_ref_count: u32,
    /// Amplification ratios already applied to
    /// `numa_node_resources`. `Some` marks an amplified snapshot.
    pub amplification_ratios: Option<AmplificationRatios>,
}

impl TopologyOptions {
    /// The effective per-CPU sharing bound.
    #[must_use]
    pub fn effective_max_ref_count(&self) -> u32 {
        self.max_ref_count.max(1)
    }

    /// Applies amplification ratios to the per-NUMA capacities.
    ///
    /// Idempotent: once a snapshot carries ratios, further calls are
    /// no-ops, so capacity is never amplified twice.
    pub fn amplify_with(&mut self, ratios: AmplificationRatios) {
        if self.amplification_ratios.is_some() {
            return;
        }
        for numa_resource in &mut self.numa_node_resources {
            numa_resource.resources.amplify(&ratios);
        }
        self.amplification_ratios = Some(ratios);
    }
}

/// Applies the node's amplification annotation to a topology snapshot.
///
/// A node without the annotation gets an empty ratio set recorded, so
/// the snapshot is still marked amplified and later calls stay no-ops.
///
/// # Errors
///
/// Returns [`PolicyParseError`] when the annotation is malformed; the
/// snapshot is left untouched in that case.
pub fn apply_node_amplification(
    node_annotations: &BTreeMap<String, String>,
    options: &mut TopologyOptions,
) -> Result<(), PolicyParseError> {
    if options.amplification_ratios.is_some() {
        return Ok(());
    }
    let ratios = amplification_ratios_from_annotations(node_annotations)?.unwrap_or_default();
    options.amplify_with(ratios);
    Ok(())
}

/// Node-keyed store of [`TopologyOptions`].
///
/// Shared across the scheduler behind an `Arc`; one reader-writer lock
/// guards the map, and snapshots are cloned out so readers never hold
/// the lock across their own work.
#[derive(Debug, Default)]
pub struct TopologyOptionsManager {
    options: RwLock<FxHashMap<String, TopologyOptions>>,
}

impl TopologyOptionsManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The topology snapshot for `node_name`, or an empty-but-valid
    /// default when the node is unknown.
    #[must_use]
    pub fn get_topology_options(&self, node_name: &str) -> TopologyOptions {
        self.options
            .read()
            .get(node_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Mutates (creating if needed) the snapshot for `node_name` under
    /// the write lock and publishes the result atomically.
    pub fn update_topology_options(
        &self,
        node_name: &str,
        mutator: impl FnOnce(&mut TopologyOptions),
    ) {
        let mut options = self.options.write();
        let entry = options.entry(node_name.to_string()).or_default();
        mutator(entry);
        tracing::debug!(node = %node_name, "updated topology options");
    }

    /// Drops the snapshot for a deleted node.
    pub fn remove_topology_options(&self, node_name: &str) {
        self.options.write().remove(node_name);
    }
}
