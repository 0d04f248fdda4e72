//! # Allocator Error Surface
//!
//! The closed set of error kinds surfaced by the allocator. All of them
//! are local to a single call: no error leaves a node ledger partially
//! mutated, and the manager never retries internally — the embedding
//! scheduler retries on its next cycle.

use crate::policy::CpuBindPolicy;
use crate::resource::ResourceName;

/// Errors surfaced by allocation, hint generation, and availability
/// queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No CPU topology has been registered for the node yet. The caller
    /// should defer scheduling until topology discovery reports in.
    #[error("CPU topology not found")]
    NotFoundCpuTopology,

    /// A CPU topology is registered but fails validation.
    #[error("invalid CPU topology")]
    InvalidCpuTopology,

    /// The NUMA cells chosen by the hint cannot cover the request for
    /// the named resource.
    #[error("Insufficient NUMA {resource}")]
    InsufficientNumaResource {
        /// Resource that could not be satisfied.
        resource: ResourceName,
    },

    /// The candidate CPU pool is smaller than the number of CPUs the
    /// request needs after filtering.
    #[error("not enough cpus available to satisfy request: needed {needed}, available {available}")]
    InsufficientCpus {
        /// CPUs the request still needs.
        needed: usize,
        /// CPUs left in the candidate pool.
        available: usize,
    },

    /// The selected CPUs do not satisfy the required CPU bind policy.
    #[error("insufficient CPUs to satisfy required cpu bind policy {policy}")]
    PolicyUnsatisfiable {
        /// The policy that was violated.
        policy: CpuBindPolicy,
    },
}

/// Result type for allocator operations.
pub type Result<T> = std::result::Result<T, Error>;
