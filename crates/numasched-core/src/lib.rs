//! # `numasched` Core
//!
//! The per-node NUMA-aware CPU and resource allocator behind the
//! `numasched` scheduler plugin.
//!
//! Given a node's CPU topology (sockets, NUMA cells, physical cores,
//! SMT threads), its current allocation state, and a workload's
//! request, this crate:
//! - enumerates the NUMA-cell subsets that can satisfy the request
//!   ([`hint`]),
//! - selects logical CPUs honoring binding and exclusivity policies
//!   and the node's packing strategy ([`selector`]),
//! - keeps reference-counted CPU and per-NUMA resource ledgers
//!   consistent under concurrent scheduling ([`allocation`],
//!   [`manager`]).
//!
//! ## Design Principles
//!
//! 1. **Pure allocation** - `allocate` computes, only `update` commits
//! 2. **Deterministic selection** - every decision iterates sorted keys
//! 3. **Two-layer locking** - a short map mutex plus one lock per node
//! 4. **Closed error surface** - tagged kinds, no string sentinels
//!
//! ## Example
//!
//! ```rust,ignore
//! use numasched_core::{ResourceManager, TopologyOptionsManager};
//!
//! let topology_manager = Arc::new(TopologyOptionsManager::new());
//! let manager = ResourceManager::new(Default::default(), topology_manager);
//!
//! let hints = manager.get_topology_hints(&node, &pod, &options)?;
//! // ... the topology manager picks an affinity ...
//! let allocation = manager.allocate(&node, &pod, &options)?;
//! manager.update(&node.name, &allocation);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod allocation;
pub mod bitmask;
pub mod cpuset;
pub mod error;
pub mod hint;
pub mod manager;
pub mod options;
pub mod policy;
pub mod resource;
pub mod selector;
pub mod topology;

pub use allocation::{NodeAllocation, PodAllocation, PodUid};
pub use bitmask::BitMask;
pub use cpuset::CpuSet;
pub use error::{Error, Result};
pub use hint::{NumaTopologyHint, ResourceHints};
pub use manager::{NodeInfo, PodInfo, ResourceManager, ResourceOptions};
pub use options::{TopologyOptions, TopologyOptionsManager};
pub use policy::{
    CpuBindPolicy, CpuExclusivePolicy, NumaAllocateStrategy, NumaTopologyPolicy, PriorityClass,
    QosClass,
};
pub use resource::{NumaNodeResource, Quantity, ResourceList, ResourceName};
pub use topology::{CpuDetails, CpuInfo, CpuTopology};
