//! # Binding, Exclusivity, and Placement Policies
//!
//! The policy vocabulary the allocator understands, plus the
//! label/annotation keys through which nodes and workloads express it.
//! Policy values arrive as strings on cluster objects; everything here
//! parses them into closed enums once, at the edge, so the allocator
//! core never touches raw strings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::resource::{AmplificationRatios, Ratio, ResourceName};

/// Node label selecting the per-node NUMA allocate strategy.
pub const LABEL_NUMA_ALLOCATE_STRATEGY: &str = "numasched.io/numa-allocate-strategy";
/// Node label selecting the NUMA topology policy.
pub const LABEL_NUMA_TOPOLOGY_POLICY: &str = "numasched.io/numa-topology-policy";
/// Node annotation carrying resource amplification ratios as JSON.
pub const ANNOTATION_RESOURCE_AMPLIFICATION_RATIOS: &str =
    "numasched.io/resource-amplification-ratios";
/// Pod annotation selecting the CPU bind policy.
pub const ANNOTATION_CPU_BIND_POLICY: &str = "numasched.io/cpu-bind-policy";
/// Pod annotation selecting the CPU exclusive policy.
pub const ANNOTATION_CPU_EXCLUSIVE_POLICY: &str = "numasched.io/cpu-exclusive-policy";

/// A label or annotation value failed to parse.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyParseError {
    /// The value is not one of the recognized variants.
    #[error("unrecognized {kind} {value:?}")]
    Unknown {
        /// What was being parsed ("cpu bind policy", ...).
        kind: &'static str,
        /// The offending value.
        value: String,
    },

    /// An amplification ratio below 1.0.
    #[error("invalid amplification ratio {ratio} for {resource}")]
    InvalidRatio {
        /// The resource the ratio applies to.
        resource: ResourceName,
        /// The rejected ratio.
        ratio: f64,
    },

    /// An annotation value was not well-formed JSON of the expected
    /// shape.
    #[error("malformed annotation {annotation}: {reason}")]
    MalformedAnnotation {
        /// The annotation key.
        annotation: String,
        /// Parser diagnostic.
        reason: String,
    },
}

/// How a requested CPU count maps onto logical CPUs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum CpuBindPolicy {
    /// No shape constraint: prefer whole physical cores, fall back to
    /// individual threads.
    #[default]
    #[serde(rename = "Default")]
    Default,
    /// Whole physical cores only.
    #[serde(rename = "FullPCPUs")]
    FullPcpus,
    /// At most one logical CPU per physical core.
    #[serde(rename = "SpreadByPCPUs")]
    SpreadByPcpus,
}

impl fmt::Display for CpuBindPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "Default",
            Self::FullPcpus => "FullPCPUs",
            Self::SpreadByPcpus => "SpreadByPCPUs",
        })
    }
}

impl FromStr for CpuBindPolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Default" => Ok(Self::Default),
            "FullPCPUs" => Ok(Self::FullPcpus),
            "SpreadByPCPUs" => Ok(Self::SpreadByPcpus),
            other => Err(PolicyParseError::Unknown {
                kind: "cpu bind policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether selected CPUs exclude other workloads, and at which
/// granularity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum CpuExclusivePolicy {
    /// No exclusivity.
    #[default]
    None,
    /// The workload's physical cores admit no other exclusive workload.
    #[serde(rename = "PCPULevel")]
    PcpuLevel,
    /// The workload's sockets admit no other exclusive workload.
    #[serde(rename = "SocketLevel")]
    SocketLevel,
}

impl fmt::Display for CpuExclusivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::PcpuLevel => "PCPULevel",
            Self::SocketLevel => "SocketLevel",
        })
    }
}

impl FromStr for CpuExclusivePolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(Self::None),
            "PCPULevel" => Ok(Self::PcpuLevel),
            "SocketLevel" => Ok(Self::SocketLevel),
            other => Err(PolicyParseError::Unknown {
                kind: "cpu exclusive policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Packing polarity for NUMA cells, sockets, and cores.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum NumaAllocateStrategy {
    /// Pack: prefer the most-allocated cells.
    #[default]
    MostAllocated,
    /// Spread: prefer the least-allocated cells.
    LeastAllocated,
}

impl fmt::Display for NumaAllocateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MostAllocated => "MostAllocated",
            Self::LeastAllocated => "LeastAllocated",
        })
    }
}

impl FromStr for NumaAllocateStrategy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MostAllocated" => Ok(Self::MostAllocated),
            "LeastAllocated" => Ok(Self::LeastAllocated),
            other => Err(PolicyParseError::Unknown {
                kind: "numa allocate strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// How strictly hint affinity constrains placement. Consumed by the
/// topology manager that merges hints; carried here so node labels can
/// be resolved in one place.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum NumaTopologyPolicy {
    /// No NUMA alignment.
    #[default]
    None,
    /// Prefer aligned placement, admit unaligned.
    BestEffort,
    /// Admit only aligned placement.
    Restricted,
    /// Admit only single-cell placement.
    #[serde(rename = "SingleNUMANode")]
    SingleNumaNode,
}

impl fmt::Display for NumaTopologyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::BestEffort => "BestEffort",
            Self::Restricted => "Restricted",
            Self::SingleNumaNode => "SingleNUMANode",
        })
    }
}

impl FromStr for NumaTopologyPolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(Self::None),
            "BestEffort" => Ok(Self::BestEffort),
            "Restricted" => Ok(Self::Restricted),
            "SingleNUMANode" => Ok(Self::SingleNumaNode),
            other => Err(PolicyParseError::Unknown {
                kind: "numa topology policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Workload quality-of-service class.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum QosClass {
    /// Not classified.
    #[default]
    None,
    /// Latency-sensitive exclusive.
    #[serde(rename = "LSE")]
    Lse,
    /// Latency-sensitive reserved.
    #[serde(rename = "LSR")]
    Lsr,
    /// Latency-sensitive.
    #[serde(rename = "LS")]
    Ls,
    /// Best effort.
    #[serde(rename = "BE")]
    Be,
}

/// Workload priority class.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum PriorityClass {
    /// Not classified.
    #[default]
    None,
    /// Production.
    Prod,
    /// Mid tier.
    Mid,
    /// Batch.
    Batch,
    /// Free tier.
    Free,
}

/// Returns true if a workload with this QoS and priority is eligible
/// for CPU binding. Everything else is treated as CPU-share.
#[must_use]
pub fn allow_use_cpu_set(qos: QosClass, priority: PriorityClass) -> bool {
    matches!(qos, QosClass::Lse | QosClass::Lsr) && priority == PriorityClass::Prod
}

/// Resolves the NUMA allocate strategy for a node: the node label wins
/// when present and well-formed, otherwise the configured default.
#[must_use]
pub fn numa_allocate_strategy_for_node(
    node_labels: &BTreeMap<String, String>,
    default: NumaAllocateStrategy,
) -> NumaAllocateStrategy {
    node_labels
        .get(LABEL_NUMA_ALLOCATE_STRATEGY)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Resolves the NUMA topology policy for a node: a non-`None` node
/// label overrides the policy inherited from the kubelet.
#[must_use]
pub fn node_numa_topology_policy(
    node_labels: &BTreeMap<String, String>,
    kubelet_policy: NumaTopologyPolicy,
) -> NumaTopologyPolicy {
    match node_labels
        .get(LABEL_NUMA_TOPOLOGY_POLICY)
        .and_then(|value| value.parse().ok())
    {
        Some(NumaTopologyPolicy::None) | None => kubelet_policy,
        Some(policy) => policy,
    }
}

/// Parses the resource-amplification annotation, if present.
///
/// The value is a JSON object mapping resource names to ratios, e.g.
/// `{"cpu": 1.5}`. Ratios below 1.0 are rejected.
///
/// # Errors
///
/// Returns [`PolicyParseError`] when the annotation is present but
/// malformed or carries a ratio below 1.0.
pub fn amplification_ratios_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<AmplificationRatios>, PolicyParseError> {
    let Some(raw) = annotations.get(ANNOTATION_RESOURCE_AMPLIFICATION_RATIOS) else {
        return Ok(None);
    };
    let parsed: BTreeMap<ResourceName, f64> =
        serde_json::from_str(raw).map_err(|e| PolicyParseError::MalformedAnnotation {
            annotation: ANNOTATION_RESOURCE_AMPLIFICATION_RATIOS.to_string(),
            reason: e.to_string(),
        })?;
    let mut ratios = AmplificationRatios::new();
    for (resource, ratio) in parsed {
        if ratio < 1.0 {
            return Err(PolicyParseError::InvalidRatio { resource, ratio });
        }
        ratios.insert(resource, Ratio(ratio));
    }
    Ok(Some(ratios))
}

/// Parses the pod CPU bind policy annotation, if present.
///
/// # Errors
///
/// Returns [`PolicyParseError::Unknown`] for unrecognized values.
pub fn cpu_bind_policy_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<CpuBindPolicy>, PolicyParseError> {
    annotations
        .get(ANNOTATION_CPU_BIND_POLICY)
        .map(|value| value.parse())
        .transpose()
}

/// Parses the pod CPU exclusive policy annotation, if present.
///
/// # Errors
///
/// Returns [`PolicyParseError::Unknown`] for unrecognized values.
pub fn cpu_exclusive_policy_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<CpuExclusivePolicy>, PolicyParseError> {
    annotations
        .get(ANNOTATION_CPU_EXCLUSIVE_POLICY)
        .map(|value| value.parse())
        .transpose()
}

/// Scoring strategy configured on the plugin, from which the default
/// NUMA allocate strategy is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringStrategyType {
    /// Favor packed nodes.
    #[default]
    MostAllocated,
    /// Favor empty nodes.
    LeastAllocated,
}

/// Plugin-level configuration for the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNumaResourceArgs {
    /// Bind policy applied when a workload requests binding without
    /// naming a policy.
    pub default_cpu_bind_policy: CpuBindPolicy,
    /// Node scoring strategy; its polarity seeds the default NUMA
    /// allocate strategy.
    pub scoring_strategy: ScoringStrategyType,
}

impl NodeNumaResourceArgs {
    /// The default NUMA allocate strategy implied by the scoring
    /// strategy.
    #[must_use]
    pub fn default_numa_allocate_strategy(&self) -> NumaAllocateStrategy {
        match self.scoring_strategy {
            ScoringStrategyType::LeastAllocated => NumaAllocateStrategy::LeastAllocated,
            ScoringStrategyType::MostAllocated => NumaAllocateStrategy::MostAllocated,
        }
    }
}
