//! End-to-end allocator flows over a 2-socket, 2-thread SMT topology
//! (26 cores per socket, one NUMA cell each, CPUs 0-103).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use numasched_core::policy::LABEL_NUMA_ALLOCATE_STRATEGY;
use numasched_core::{
    BitMask, CpuBindPolicy, CpuSet, CpuTopology, Error, NodeInfo, NumaAllocateStrategy,
    NumaNodeResource, NumaTopologyHint, PodAllocation, PodInfo, Quantity, ResourceList,
    ResourceManager, ResourceName, ResourceOptions, TopologyOptions, TopologyOptionsManager,
};

const NODE: &str = "node-1";

fn cpu_list(units: i64) -> ResourceList {
    [(ResourceName::Cpu, Quantity::from_units(units))]
        .into_iter()
        .collect()
}

fn cell(node: usize, cpu_units: i64) -> NumaNodeResource {
    NumaNodeResource {
        node,
        resources: cpu_list(cpu_units),
    }
}

fn topology_options() -> TopologyOptions {
    TopologyOptions {
        cpu_topology: Some(Arc::new(CpuTopology::uniform(2, 1, 26, 2))),
        numa_node_resources: vec![cell(0, 52), cell(1, 52)],
        max_ref_count: 1,
        ..TopologyOptions::default()
    }
}

fn manager_with_node(options: &TopologyOptions) -> ResourceManager {
    let topology_manager = Arc::new(TopologyOptionsManager::new());
    let registered = options.clone();
    topology_manager.update_topology_options(NODE, move |entry| *entry = registered);
    ResourceManager::new(NumaAllocateStrategy::MostAllocated, topology_manager)
}

fn pod(uid: &str) -> PodInfo {
    PodInfo {
        uid: uid.into(),
        namespace: "default".to_string(),
        name: format!("pod-{uid}"),
        ..PodInfo::default()
    }
}

fn hint(cells: &[usize]) -> NumaTopologyHint {
    NumaTopologyHint {
        affinity: BitMask::from_bits(cells.iter().copied()),
        preferred: true,
    }
}

fn bind_options(
    topology_options: &TopologyOptions,
    cpus: usize,
    policy: CpuBindPolicy,
    cells: &[usize],
) -> ResourceOptions {
    ResourceOptions {
        num_cpus_needed: cpus,
        request_cpu_bind: true,
        requests: cpu_list(cpus as i64),
        original_requests: cpu_list(cpus as i64),
        required_cpu_bind_policy: true,
        cpu_bind_policy: policy,
        hint: Some(hint(cells)),
        topology_options: topology_options.clone(),
        ..ResourceOptions::default()
    }
}

fn existing_big_pod() -> PodAllocation {
    // consumes CPUs 4-103: 48 CPUs on cell 0, all 52 of cell 1
    PodAllocation {
        uid: "existing".into(),
        namespace: "default".to_string(),
        name: "existing".to_string(),
        cpuset: "4-103".parse().unwrap(),
        numa_node_resources: vec![cell(0, 48), cell(1, 52)],
        ..PodAllocation::default()
    }
}

#[test]
fn full_pcpus_on_empty_node() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    let options = bind_options(&topo, 4, CpuBindPolicy::FullPcpus, &[0]);

    let allocation = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    assert_eq!(allocation.cpuset.to_string(), "0-3");
    assert_eq!(allocation.numa_node_resources, vec![cell(0, 4)]);

    manager.update(NODE, &allocation);
    assert_eq!(
        manager.get_allocated_cpuset(NODE, &"a".into()),
        Some("0-3".parse().unwrap())
    );

    // NUMA cell 0 consumed 4 whole CPUs
    let ledger = manager.get_node_allocation(NODE);
    let (available, _) = ledger
        .read()
        .get_available_numa_resources(&topo, &BTreeMap::new());
    assert_eq!(available[&0].cpu(), Quantity::from_units(48));
    assert_eq!(available[&1].cpu(), Quantity::from_units(52));
}

#[test]
fn full_pcpus_with_prior_allocations() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    manager.update(NODE, &existing_big_pod());

    let options = bind_options(&topo, 4, CpuBindPolicy::FullPcpus, &[0]);
    let allocation = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    assert_eq!(allocation.cpuset.to_string(), "0-3");
    assert_eq!(allocation.numa_node_resources, vec![cell(0, 4)]);
}

#[test]
fn full_pcpus_fails_on_fragmented_cores() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    // only odd sibling threads remain free: no whole core anywhere
    manager.update(
        NODE,
        &PodAllocation {
            uid: "existing".into(),
            cpuset: "1,3,5,7-103".parse().unwrap(),
            numa_node_resources: vec![cell(0, 48), cell(1, 52)],
            ..PodAllocation::default()
        },
    );

    let options = bind_options(&topo, 4, CpuBindPolicy::FullPcpus, &[0]);
    let err = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientCpus { .. }));
}

#[test]
fn spread_by_pcpus_on_empty_node() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    let options = bind_options(&topo, 4, CpuBindPolicy::SpreadByPcpus, &[0]);

    let allocation = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    assert_eq!(allocation.cpuset.to_string(), "0,2,4,6");
}

#[test]
fn spread_by_pcpus_fails_when_cores_exhausted() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    manager.update(NODE, &existing_big_pod());

    // CPUs 0-3 are free but span only two cores
    let options = bind_options(&topo, 4, CpuBindPolicy::SpreadByPcpus, &[0]);
    let err = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientCpus { .. }));
}

#[test]
fn spread_by_pcpus_exceeding_physical_cores() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    // 27 CPUs across cell 0's 26 cores cannot spread
    let options = bind_options(&topo, 27, CpuBindPolicy::SpreadByPcpus, &[0]);
    let err = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientCpus { .. }));
}

#[test]
fn full_pcpus_rejects_ragged_count() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    // 3 is not a multiple of the 2 threads per core
    let options = bind_options(&topo, 3, CpuBindPolicy::FullPcpus, &[0]);
    let err = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap_err();
    assert_eq!(
        err,
        Error::PolicyUnsatisfiable {
            policy: CpuBindPolicy::FullPcpus
        }
    );
}

#[test]
fn amplified_capacity_binds_raw_cpu_count() {
    // 1.5x CPU amplification: cells advertise 78, requests arrive
    // amplified (6) alongside the raw 4; the ledger and the cpuset
    // stay raw.
    let mut topo = topology_options();
    topo.amplify_with(
        [(ResourceName::Cpu, numasched_core::resource::Ratio(1.5))]
            .into_iter()
            .collect(),
    );
    assert_eq!(topo.numa_node_resources[0].resources.cpu(), Quantity::from_units(78));

    let manager = manager_with_node(&topo);
    let options = ResourceOptions {
        num_cpus_needed: 4,
        request_cpu_bind: true,
        requests: cpu_list(6),
        original_requests: cpu_list(4),
        required_cpu_bind_policy: true,
        cpu_bind_policy: CpuBindPolicy::FullPcpus,
        hint: Some(hint(&[0])),
        topology_options: topo.clone(),
        ..ResourceOptions::default()
    };

    let allocation = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    assert_eq!(allocation.cpuset.len(), 4);
    assert_eq!(allocation.numa_node_resources, vec![cell(0, 4)]);
}

#[test]
fn allocate_ignores_resources_missing_from_cells() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);

    let mut requests = cpu_list(4);
    requests.insert(
        ResourceName::Extended("vendor.com/gpu-memory".to_string()),
        Quantity::from_units(10),
    );
    let options = ResourceOptions {
        num_cpus_needed: 4,
        request_cpu_bind: false,
        requests,
        hint: Some(hint(&[0])),
        topology_options: topo.clone(),
        ..ResourceOptions::default()
    };

    let allocation = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    assert!(allocation.cpuset.is_empty());
    assert_eq!(allocation.numa_node_resources, vec![cell(0, 4)]);
}

#[test]
fn allocate_fails_on_insufficient_cell_capacity() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    let options = ResourceOptions {
        num_cpus_needed: 54,
        request_cpu_bind: false,
        requests: cpu_list(54),
        hint: Some(hint(&[0])),
        topology_options: topo.clone(),
        ..ResourceOptions::default()
    };

    let err = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap_err();
    assert_eq!(
        err,
        Error::InsufficientNumaResource {
            resource: ResourceName::Cpu
        }
    );
}

#[test]
fn allocate_whole_node_capacity() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    let options = bind_options(&topo, 104, CpuBindPolicy::FullPcpus, &[0, 1]);

    let allocation = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    let numa_millis: i64 = allocation
        .numa_node_resources
        .iter()
        .map(|r| r.resources.cpu().milli_value())
        .sum();
    assert_eq!(allocation.cpuset.len(), (numa_millis / 1000) as usize);
    assert_eq!(allocation.cpuset.len(), 104);
}

#[test]
fn hints_prefer_minimal_cell_subsets() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    let options = ResourceOptions {
        requests: cpu_list(4),
        topology_options: topo.clone(),
        ..ResourceOptions::default()
    };

    let hints = manager
        .get_topology_hints(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    let cpu_hints = &hints[&ResourceName::Cpu];
    let rendered: Vec<(Vec<usize>, bool)> = cpu_hints
        .iter()
        .map(|h| (h.affinity.bits().to_vec(), h.preferred))
        .collect();
    assert_eq!(
        rendered,
        vec![
            (vec![0], true),
            (vec![1], true),
            (vec![0, 1], false),
        ]
    );
}

#[test]
fn hints_span_cells_when_one_is_drained() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    // cell 0 down to 12 free CPUs
    manager.update(
        NODE,
        &PodAllocation {
            uid: "existing".into(),
            numa_node_resources: vec![cell(0, 40)],
            ..PodAllocation::default()
        },
    );

    let options = ResourceOptions {
        requests: cpu_list(60),
        topology_options: topo.clone(),
        ..ResourceOptions::default()
    };
    let hints = manager
        .get_topology_hints(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    let cpu_hints = &hints[&ResourceName::Cpu];
    assert_eq!(cpu_hints.len(), 1);
    assert_eq!(cpu_hints[0].affinity.bits().to_vec(), vec![0, 1]);
    // the spanning mask is the narrowest satisfying one
    assert!(cpu_hints[0].preferred);

    // beyond even the union, no placement is feasible
    let options = ResourceOptions {
        requests: cpu_list(70),
        topology_options: topo.clone(),
        ..ResourceOptions::default()
    };
    let hints = manager
        .get_topology_hints(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    assert!(hints.is_empty());
}

#[test]
fn node_label_flips_allocate_strategy() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    // a workload already sits on cell 1
    manager.update(
        NODE,
        &PodAllocation {
            uid: "existing".into(),
            cpuset: "52-55".parse().unwrap(),
            numa_node_resources: vec![cell(1, 4)],
            ..PodAllocation::default()
        },
    );

    let options = ResourceOptions {
        num_cpus_needed: 2,
        request_cpu_bind: true,
        requests: cpu_list(2),
        original_requests: cpu_list(2),
        cpu_bind_policy: CpuBindPolicy::FullPcpus,
        topology_options: topo.clone(),
        ..ResourceOptions::default()
    };

    // default strategy packs onto the busy cell
    let allocation = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    assert_eq!(allocation.cpuset.to_string(), "56-57");

    // the node label overrides to spreading
    let mut node = NodeInfo::new(NODE);
    node.labels.insert(
        LABEL_NUMA_ALLOCATE_STRATEGY.to_string(),
        "LeastAllocated".to_string(),
    );
    let allocation = manager.allocate(&node, &pod("a"), &options).unwrap();
    assert_eq!(allocation.cpuset.to_string(), "0-1");
}

#[test]
fn pod_reuses_its_prior_cpus_and_resources() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);
    // pod "a" holds 0-3; another pod fills the rest of cell 0
    manager.update(
        NODE,
        &PodAllocation {
            uid: "a".into(),
            cpuset: "0-3".parse().unwrap(),
            numa_node_resources: vec![cell(0, 4)],
            ..PodAllocation::default()
        },
    );
    manager.update(
        NODE,
        &PodAllocation {
            uid: "b".into(),
            cpuset: "4-51".parse().unwrap(),
            numa_node_resources: vec![cell(0, 48)],
            ..PodAllocation::default()
        },
    );

    let options = ResourceOptions {
        num_cpus_needed: 4,
        request_cpu_bind: true,
        requests: cpu_list(4),
        original_requests: cpu_list(4),
        required_cpu_bind_policy: true,
        cpu_bind_policy: CpuBindPolicy::FullPcpus,
        preferred_cpus: "0-3".parse().unwrap(),
        reusable_resources: [(0usize, cpu_list(4))].into_iter().collect(),
        hint: Some(hint(&[0])),
        topology_options: topo.clone(),
        ..ResourceOptions::default()
    };

    let allocation = manager
        .allocate(&NodeInfo::new(NODE), &pod("a"), &options)
        .unwrap();
    assert_eq!(allocation.cpuset.to_string(), "0-3");
}

#[test]
fn update_release_restores_availability() {
    let topo = topology_options();
    let manager = manager_with_node(&topo);

    let (before, _) = manager.get_available_cpus(NODE, &CpuSet::new()).unwrap();
    manager.update(NODE, &existing_big_pod());
    let (during, _) = manager.get_available_cpus(NODE, &CpuSet::new()).unwrap();
    assert_eq!(during.to_string(), "0-3");

    // idempotent replay changes nothing
    manager.update(NODE, &existing_big_pod());
    let (replayed, _) = manager.get_available_cpus(NODE, &CpuSet::new()).unwrap();
    assert_eq!(replayed, during);

    manager.release(NODE, &"existing".into());
    let (after, _) = manager.get_available_cpus(NODE, &CpuSet::new()).unwrap();
    assert_eq!(after, before);
}

#[test]
fn concurrent_updates_and_releases_converge() {
    let topo = topology_options();
    let manager = Arc::new(manager_with_node(&topo));

    thread::scope(|scope| {
        for worker in 0..8usize {
            let manager = Arc::clone(&manager);
            scope.spawn(move || {
                let uid = format!("pod-{worker}");
                let cpuset: CpuSet =
                    CpuSet::from_cpus([worker * 2, worker * 2 + 1]);
                for _ in 0..200 {
                    let allocation = PodAllocation {
                        uid: uid.as_str().into(),
                        cpuset: cpuset.clone(),
                        numa_node_resources: vec![cell(0, 2)],
                        ..PodAllocation::default()
                    };
                    manager.update(NODE, &allocation);
                    let _ = manager.get_available_cpus(NODE, &CpuSet::new());
                    manager.release(NODE, &uid.as_str().into());
                }
            });
        }
    });

    let (available, _) = manager.get_available_cpus(NODE, &CpuSet::new()).unwrap();
    assert_eq!(available.len(), 104);
    let ledger = manager.get_node_allocation(NODE);
    assert_eq!(ledger.read().num_pods(), 0);
}
