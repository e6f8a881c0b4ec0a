/// Integration tests for the placement policies.
use fleetsim_scheduler::filters::default_filters;
use fleetsim_scheduler::memorizing::DEFAULT_MAX_INSTANCES;
use fleetsim_scheduler::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, VecDeque};

fn random_pool(rng: &mut ChaCha8Rng, n: u32) -> Vec<HostView> {
    (0..n)
        .map(|i| {
            let cores = [8, 16, 32, 64][rng.gen_range(0..4)];
            let memory = [16_384, 65_536, 262_144][rng.gen_range(0..3)];
            let mut h = HostView::new(i, format!("host-{}", i), cores, 2900.0, memory);
            h.provisioned_cores = rng.gen_range(0..=cores);
            h.available_memory_mb = rng.gen_range(0..=memory);
            h.instance_count = rng.gen_range(0..10);
            h
        })
        .collect()
}

fn random_request(rng: &mut ChaCha8Rng, id: u64) -> SchedulingRequest {
    SchedulingRequest::new(
        id,
        format!("task-{}", id),
        rng.gen_range(1..=16),
        rng.gen_range(256..=32_768),
    )
}

/// Register `n` empty hosts; returns the host-side record of each.
fn healthy_pool(
    s: &mut dyn ComputeScheduler,
    n: u32,
    cores: u32,
    memory_mb: u64,
) -> HashMap<HostId, HostView> {
    (0..n)
        .map(|i| {
            let h = HostView::new(i, format!("h{}", i), cores, 2900.0, memory_mb);
            s.add_host(h.clone());
            (i, h)
        })
        .collect()
}

/// Apply a placement to the host record and hand the fresh view back to
/// the policy, the way the compute service does.
fn realize(
    s: &mut dyn ComputeScheduler,
    truth: &mut HashMap<HostId, HostView>,
    placed: &Placement,
) -> HostView {
    let host = truth.get_mut(&placed.host.id).unwrap();
    host.reserve(&placed.request);
    s.update_host(host.clone());
    host.clone()
}

#[test]
fn test_filter_picks_only_host_passing_all_filters() {
    let mut s = FilterScheduler::with_defaults();

    let mut low_memory = HostView::new(0, "low-memory", 32, 3200.0, 65_536);
    low_memory.available_memory_mb = 1_024;
    let mut low_cpu = HostView::new(1, "low-cpu", 32, 3200.0, 262_144);
    low_cpu.provisioned_cores = 30;
    low_cpu.available_memory_mb = 200_000;
    let mut good = HostView::new(2, "good", 32, 3200.0, 131_072);
    good.provisioned_cores = 8;
    good.available_memory_mb = 100_000;

    for h in [low_memory, low_cpu, good] {
        s.add_host(h);
    }

    let req = SchedulingRequest::new(1, "vm", 4, 8_192);
    let chosen = s.select(&req).unwrap();
    assert_eq!(chosen.name, "good");
    // the low-cpu host has the most free memory but fails the vCPU filter
    assert_eq!(chosen.id, 2);
}

#[test]
fn test_filter_select_is_deterministic() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    for round in 0..50 {
        let mut s = FilterScheduler::with_defaults();
        for h in random_pool(&mut rng, 40) {
            s.add_host(h);
        }
        for i in 0..20 {
            let req = random_request(&mut rng, round * 100 + i);
            let first = s.select(&req).map(|h| h.id);
            let second = s.select(&req).map(|h| h.id);
            assert_eq!(first, second);
        }
    }
}

#[test]
fn test_filter_never_overcommits_reserved_capacity() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut s = FilterScheduler::with_defaults();
    let mut truth = healthy_pool(&mut s, 8, 16, 65_536);
    let mut queue: VecDeque<SchedulingRequest> =
        (0..200).map(|i| random_request(&mut rng, i)).collect();
    while let Some(placed) = s.select_from(&mut queue) {
        let host = realize(&mut s, &mut truth, &placed);
        assert!(host.provisioned_cores <= host.cores);
        assert!(host.available_memory_mb <= host.memory_mb);
    }
    // whatever is left does not fit at the head of the queue
    assert!(!queue.is_empty());
}

fn memorizing(max_skip: u32, hosts: Vec<HostView>) -> MemorizingScheduler {
    let mut s = MemorizingScheduler::new(
        default_filters(&FilterParams::default()),
        max_skip,
        DEFAULT_MAX_INSTANCES,
        42,
    );
    for h in hosts {
        s.add_host(h);
    }
    s
}

fn oversized_then_small() -> VecDeque<SchedulingRequest> {
    VecDeque::from(vec![
        SchedulingRequest::new(0, "huge", 8, 1_024),
        SchedulingRequest::new(1, "small", 2, 1_024),
    ])
}

#[test]
fn test_memorizing_without_skip_budget_blocks_on_head() {
    let mut s = memorizing(0, vec![HostView::new(0, "h", 4, 3200.0, 8_192)]);
    let mut queue = oversized_then_small();

    assert!(s.select_from(&mut queue).is_none());
    assert_eq!(queue.len(), 2);
    assert_eq!(s.custom_metrics()["exhaustive_scans"], 1.0);
    assert_eq!(s.host(0).unwrap().instance_count, 0);
}

#[test]
fn test_memorizing_skips_head_that_never_fits() {
    let mut s = memorizing(1, vec![HostView::new(0, "h", 4, 3200.0, 8_192)]);
    let mut queue = oversized_then_small();

    let placed = s.select_from(&mut queue).unwrap();
    assert_eq!(placed.request.name, "small");
    assert_eq!(placed.host.id, 0);
    assert_eq!(placed.host.instance_count, 1);

    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].name, "huge");
    assert_eq!(queue[0].times_skipped, 1);

    // out of skips: scanned once more, still no host
    assert!(s.select_from(&mut queue).is_none());
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_memorizing_bucket_invariant_random_ops() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut s = memorizing(3, Vec::new());
    let mut next_id = 0u32;
    let mut live: Vec<HostId> = Vec::new();

    for step in 0..3_000u64 {
        match rng.gen_range(0..10) {
            0 | 1 => {
                let h = HostView::new(next_id, format!("h{}", next_id), 32, 2900.0, 131_072);
                live.push(next_id);
                next_id += 1;
                s.add_host(h);
            }
            2 if !live.is_empty() => {
                let id = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(s.remove_host(id).is_some());
            }
            _ => {
                let req = SchedulingRequest::new(step, "t", rng.gen_range(1..=2), 512);
                let _ = s.select(&req);
            }
        }

        assert_eq!(s.len(), live.len());
        let buckets = s.buckets();
        let saturation = buckets.len() - 1;
        let mut seen = 0;
        for (i, bucket) in buckets.iter().enumerate() {
            for (j, &id) in bucket.iter().enumerate() {
                let view = s.host(id).unwrap();
                if i < saturation {
                    assert_eq!(view.instance_count as usize, i);
                }
                assert_eq!(view.priority_index, i);
                assert_eq!(view.list_index, j);
                seen += 1;
            }
        }
        assert_eq!(seen, live.len());
    }
}

#[test]
fn test_memorizing_instance_bound_is_configurable() {
    let mut s = MemorizingScheduler::new(default_filters(&FilterParams::default()), 0, 2, 7);
    s.add_host(HostView::new(0, "h", 64, 2900.0, 262_144));
    let req = SchedulingRequest::new(0, "t", 1, 64);
    assert!(s.select(&req).is_some());
    assert!(s.select(&req).is_some());
    // parked in the saturation bucket
    assert!(s.select(&req).is_none());
    assert_eq!(s.buckets().len(), 3);
    assert_eq!(s.buckets()[2], vec![0]);
}

#[test]
fn test_seeded_policies_are_reproducible() {
    for name in ["memorizing", "two_choice"] {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let pool = random_pool(&mut rng, 30);
        let requests: Vec<_> = (0..100).map(|i| random_request(&mut rng, i)).collect();

        let run = |seed: u64| -> Vec<Option<HostId>> {
            let mut s = scheduler_by_name(name, seed).unwrap();
            for h in pool.clone() {
                s.add_host(h);
            }
            requests.iter().map(|r| s.select(r).map(|h| h.id)).collect()
        };
        assert_eq!(run(42), run(42), "{} is not reproducible", name);
    }
}

#[test]
fn test_replay_follows_recorded_cluster() {
    let table = HashMap::from([("db-7".to_string(), "west".to_string())]);
    let mut s = ReplayScheduler::new(table);
    s.add_host(HostView::new(0, "e0", 16, 2900.0, 262_144).with_cluster("east"));
    s.add_host(HostView::new(1, "w0", 16, 2900.0, 32_768).with_cluster("west"));
    s.add_host(HostView::new(2, "w1", 16, 2900.0, 65_536).with_cluster("west"));

    let req = SchedulingRequest::new(0, "db-7", 2, 1_024);
    assert_eq!(s.select(&req).unwrap().id, 2);

    s.remove_host(1);
    s.remove_host(2);
    assert_eq!(s.select(&req).unwrap().id, 0);
    assert_eq!(s.custom_metrics()["replay_fallbacks"], 1.0);
}

#[test]
fn test_every_policy_places_on_a_healthy_pool() {
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    for name in available_schedulers() {
        let mut s = scheduler_by_name(name, 42).unwrap();
        let mut truth = healthy_pool(s.as_mut(), 10, 32, 131_072);
        let mut queue: VecDeque<_> = (0..20).map(|i| random_request(&mut rng, i)).collect();
        let mut placed = 0;
        while let Some(p) = s.select_from(&mut queue) {
            realize(s.as_mut(), &mut truth, &p);
            placed += 1;
        }
        assert!(placed > 0, "{} placed nothing", name);
        assert_eq!(s.len(), 10);
    }
}
