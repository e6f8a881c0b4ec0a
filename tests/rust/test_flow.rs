/// Integration tests for the resource-flow engine and its use by hosts.
use fleetsim_core::flow::{max_min_fair, FlowCounters, FlowGraph, NodeId};
use fleetsim_core::host::{GuestSpec, GuestState, HostSpec, MachineModel, SimHost};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const EPS: f64 = 1e-6;

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < EPS,
        "expected {}, got {}",
        expected,
        actual
    );
}

fn assert_balanced(c: &FlowCounters) {
    assert_close(
        c.requested,
        c.granted + c.overcommitted + c.interfered + c.lost,
    );
}

#[test]
fn test_distributor_properties_random() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    for _ in 0..500 {
        let n = rng.gen_range(1..32);
        let supply = rng.gen_range(0.0..10_000.0);
        let demands: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..2_000.0)).collect();
        let grants = max_min_fair(supply, &demands);

        assert_eq!(grants.len(), demands.len());
        let total: f64 = grants.iter().sum();
        assert!(total <= supply + EPS);
        for (g, d) in grants.iter().zip(&demands) {
            assert!(*g >= 0.0 && *g <= d + EPS);
        }

        let wanted: f64 = demands.iter().sum();
        if wanted <= supply {
            // enough for everyone
            for (g, d) in grants.iter().zip(&demands) {
                assert_close(*g, *d);
            }
        } else {
            // work-conserving, and nobody short-changed gets less than anyone else
            assert_close(total, supply);
            let top = grants.iter().cloned().fold(0.0, f64::max);
            for (g, d) in grants.iter().zip(&demands) {
                if *g + EPS < *d {
                    assert!(*g + EPS >= top);
                }
            }
        }
    }
}

struct Tree {
    graph: FlowGraph,
    source: NodeId,
    muxes: Vec<NodeId>,
    sinks: Vec<NodeId>,
}

/// A source feeding a top distributor with two sub-distributors, sinks
/// spread over all three.
fn random_tree(rng: &mut ChaCha8Rng, capacity: f64) -> Tree {
    let mut graph = FlowGraph::new();
    let source = graph.add_source(capacity, 0).unwrap();
    let top = graph.add_distributor(0);
    graph.connect(top, source, 0).unwrap();
    let mut muxes = vec![top];
    for _ in 0..2 {
        let m = graph.add_distributor(0);
        graph.connect(m, top, 0).unwrap();
        muxes.push(m);
    }
    let sinks = (0..rng.gen_range(3..16))
        .map(|i| {
            let s = graph.add_sink(0);
            graph.connect(s, muxes[i % muxes.len()], 0).unwrap();
            s
        })
        .collect();
    Tree {
        graph,
        source,
        muxes,
        sinks,
    }
}

#[test]
fn test_conservation_under_random_demand() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for _ in 0..20 {
        let capacity = rng.gen_range(1_000.0..20_000.0);
        let mut tree = random_tree(&mut rng, capacity);
        let mut now = 0;
        for _ in 0..200 {
            now += rng.gen_range(0..1_000);
            let sink = tree.sinks[rng.gen_range(0..tree.sinks.len())];
            let demand = rng.gen_range(0.0..5_000.0);
            tree.graph.set_demand(sink, demand, now).unwrap();

            let g = &tree.graph;
            assert!(g.supply(tree.source).unwrap() <= capacity + EPS);
            for &m in &tree.muxes {
                let handed_out: f64 = g
                    .consumers(m)
                    .unwrap()
                    .iter()
                    .map(|&c| g.supply(c).unwrap())
                    .sum();
                assert!(handed_out <= g.supply(m).unwrap() + EPS);
            }
            for &s in &tree.sinks {
                assert!(g.supply(s).unwrap() <= g.demand(s).unwrap() + EPS);
            }
        }
        for &s in &tree.sinks {
            let c = tree.graph.counters(s, now + 1_000).unwrap();
            assert_balanced(&c);
        }
    }
}

#[test]
fn test_recompute_stays_inside_tree() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut a = random_tree(&mut rng, 4_000.0);
    let b_sink = a.graph.add_sink(0);
    let b_src = a.graph.add_source(1_000.0, 0).unwrap();
    a.graph.connect(b_sink, b_src, 0).unwrap();
    a.graph.set_demand(b_sink, 800.0, 0).unwrap();

    let before = a.graph.stats();
    a.graph.set_demand(a.sinks[0], 100.0, 10).unwrap();
    let after = a.graph.stats();
    let tree_size = (1 + a.muxes.len() + a.sinks.len()) as u64;
    assert_eq!(after.recomputations, before.recomputations + 1);
    assert!(after.nodes_visited - before.nodes_visited <= tree_size);
    assert_eq!(a.graph.supply(b_sink).unwrap(), 800.0);
}

#[test]
fn test_detached_sink_loses_demand() {
    let mut g = FlowGraph::new();
    let src = g.add_source(1_000.0, 0).unwrap();
    let sink = g.add_sink(0);
    g.connect(sink, src, 0).unwrap();
    g.set_demand(sink, 400.0, 0).unwrap();
    g.disconnect(sink, 1_000).unwrap();
    let c = g.counters(sink, 3_000).unwrap();
    assert_close(c.granted, 400.0);
    assert_close(c.lost, 800.0);
    assert_close(c.overcommitted, 0.0);
    assert_balanced(&c);
}

fn two_core_host() -> SimHost {
    let spec = HostSpec::new("h0", MachineModel::new(2, 3200.0, 8192)).with_vcpu_overcommit(2.0);
    let mut host = SimHost::new(0, spec, 0);
    host.launch(0).unwrap();
    host
}

#[test]
fn test_two_guests_share_a_saturated_host() {
    let mut host = two_core_host();
    let a = host.spawn_guest(GuestSpec::new("a", 2, 1024), 0).unwrap();
    let b = host.spawn_guest(GuestSpec::new("b", 2, 1024), 0).unwrap();

    let demands = [(0, 28.0, 28.0), (1000, 3500.0, 3100.0), (2000, 0.0, 0.0), (3000, 183.0, 73.0)];
    for (t, da, db) in demands {
        host.set_guest_demand(a, da, t).unwrap();
        host.set_guest_demand(b, db, t).unwrap();
        assert!(host.cpu_usage_mhz() <= 6400.0 + EPS);
    }

    let ea = host.complete_guest(a, 4000).unwrap();
    let eb = host.complete_guest(b, 4000).unwrap();
    assert_eq!(ea.state, GuestState::Completed);

    // 3500 + 3100 against 6400: b is below the fair share and keeps 3100
    assert_close(ea.counters.requested, 3711.0);
    assert_close(ea.counters.granted, 3511.0);
    assert_close(ea.counters.overcommitted, 200.0);
    assert_close(eb.counters.requested, 3201.0);
    assert_close(eb.counters.granted, 3201.0);
    assert_close(eb.counters.overcommitted, 0.0);

    let total = host.stats(4000).unwrap().work;
    assert_close(total.requested, 6912.0);
    assert_close(total.granted, 6712.0);
    assert_close(total.overcommitted, 200.0);
    assert_balanced(&total);
}

#[test]
fn test_demand_is_capped_by_guest_width() {
    let mut host = two_core_host();
    let g = host.spawn_guest(GuestSpec::new("one", 1, 512), 0).unwrap();
    host.set_guest_demand(g, 10_000.0, 0).unwrap();
    assert_eq!(host.guest(g).unwrap().demand_mhz, 3200.0);
    assert_eq!(host.cpu_usage_mhz(), 3200.0);
}
