/// Integration tests for the host and guest lifecycle.
use fleetsim_core::error::SimError;
use fleetsim_core::host::{
    GuestSpec, GuestState, HostEvent, HostListener, HostSpec, HostState, InterferenceGroup,
    InterferenceModel, MachineModel, SimHost,
};
use fleetsim_core::power::PowerModel;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

struct Log(Rc<RefCell<Vec<HostEvent>>>);

impl HostListener for Log {
    fn on_event(&mut self, event: &HostEvent) {
        self.0.borrow_mut().push(event.clone());
    }
}

fn launched(cores: u32, speed: f64, memory_mb: u64) -> SimHost {
    let mut h = SimHost::new(0, HostSpec::new("h0", MachineModel::new(cores, speed, memory_mb)), 0);
    h.launch(0).unwrap();
    h
}

#[test]
fn test_host_error_fails_running_guests() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut h = launched(8, 2000.0, 16_384);
    h.add_listener(Box::new(Log(Rc::clone(&events))));
    for i in 0..3 {
        let g = h
            .spawn_guest(GuestSpec::new(format!("vm-{}", i), 2, 2048), 0)
            .unwrap();
        h.set_guest_demand(g, 1500.0, 0).unwrap();
    }
    assert_eq!(h.guest_count(), 3);

    let exits = h.fail(60_000).unwrap();
    assert_eq!(h.state(), HostState::Error);
    assert_eq!(exits.len(), 3);
    assert!(exits.iter().all(|e| e.state == GuestState::Failed));
    assert!(exits.iter().all(|e| e.ended_ms == 60_000));
    assert_eq!(h.guest_count(), 0);
    assert_eq!(h.guests().count(), 0);

    let failed = events
        .borrow()
        .iter()
        .filter(|e| {
            matches!(
                e,
                HostEvent::Guest {
                    from: GuestState::Running,
                    to: GuestState::Failed,
                    ..
                }
            )
        })
        .count();
    assert_eq!(failed, 3);

    // work done before the failure is kept on the exits
    for e in &exits {
        assert_eq!(e.counters.granted, 1500.0 * 60.0);
    }
}

#[test]
fn test_close_terminates_and_is_idempotent() {
    let mut h = launched(4, 1000.0, 4096);
    h.spawn_guest(GuestSpec::new("a", 1, 256), 0).unwrap();
    let exits = h.close(100).unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].state, GuestState::Terminated);
    assert_eq!(h.state(), HostState::Down);
    assert!(h.close(200).unwrap().is_empty());
    assert!(!h.can_fit(&GuestSpec::new("b", 1, 1)));
    assert!(h.spawn_guest(GuestSpec::new("b", 1, 1), 200).is_err());
}

#[test]
fn test_failed_host_rejects_transitions() {
    let mut h = launched(2, 1000.0, 1024);
    h.fail(10).unwrap();
    assert_eq!(
        h.fail(20).unwrap_err(),
        SimError::InvalidHostTransition {
            host: 0,
            from: HostState::Error,
            to: HostState::Error
        }
    );
    assert!(h.launch(20).is_err());
    h.recover(30).unwrap();
    assert!(h.is_up());
}

#[test]
fn test_guest_transitions_are_checked() {
    let mut h = launched(2, 1000.0, 1024);
    let g = h.create_guest(GuestSpec::new("a", 1, 128), 0).unwrap();
    assert_eq!(
        h.complete_guest(g, 0).unwrap_err(),
        SimError::InvalidGuestTransition {
            guest: g,
            from: GuestState::Created,
            to: GuestState::Completed
        }
    );
    assert!(h.set_guest_demand(g, 100.0, 0).is_err());
    let exit = h.terminate_guest(g, 5).unwrap();
    assert_eq!(exit.state, GuestState::Terminated);
    assert_eq!(exit.started_ms, None);
    assert!(h.guest(g).is_none());
}

#[test]
fn test_capacity_never_exceeded_random() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let spec = HostSpec::new("h", MachineModel::new(16, 2400.0, 65_536)).with_vcpu_overcommit(1.5);
    let limit = spec.vcpu_limit();
    let mut h = SimHost::new(0, spec, 0);
    h.launch(0).unwrap();

    let mut running = Vec::new();
    for t in 0..2_000u64 {
        if running.is_empty() || rng.gen_bool(0.6) {
            let spec = GuestSpec::new(
                format!("g{}", t),
                rng.gen_range(1..=8),
                rng.gen_range(512..=16_384),
            );
            let fits = h.can_fit(&spec);
            match h.spawn_guest(spec, t) {
                Ok(id) => {
                    assert!(fits);
                    running.push(id);
                }
                Err(err) => {
                    assert!(!fits);
                    assert!(matches!(err, SimError::InsufficientCapacity { .. }));
                }
            }
        } else {
            let id = running.swap_remove(rng.gen_range(0..running.len()));
            h.complete_guest(id, t).unwrap();
        }

        let (cores, memory) = h
            .guests()
            .filter(|g| g.state == GuestState::Running)
            .fold((0, 0), |(c, m), g| (c + g.spec.cores, m + g.spec.memory_mb));
        assert!(cores <= limit);
        assert!(memory <= 65_536);
        let view = h.view();
        assert_eq!(view.provisioned_cores, cores);
        assert_eq!(view.available_memory_mb, 65_536 - memory);
    }
}

#[test]
fn test_energy_follows_utilization() {
    let spec = HostSpec::new("h", MachineModel::new(2, 1000.0, 1024)).with_power_model(
        PowerModel::Linear {
            idle_watts: 200.0,
            max_watts: 350.0,
        },
    );
    let mut h = SimHost::new(0, spec, 0);
    h.launch(0).unwrap();
    let g = h.spawn_guest(GuestSpec::new("a", 2, 128), 0).unwrap();
    h.set_guest_demand(g, 2000.0, 0).unwrap();
    assert_eq!(h.power_draw(), 350.0);

    h.set_guest_demand(g, 0.0, 10_000).unwrap();
    assert_eq!(h.power_draw(), 200.0);
    let s = h.stats(20_000).unwrap();
    assert_eq!(s.energy_joules, 350.0 * 10.0 + 200.0 * 10.0);

    h.fail(20_000).unwrap();
    assert_eq!(h.power_draw(), 0.0);
    let s = h.stats(30_000).unwrap();
    assert_eq!(s.energy_joules, 5_500.0);
    assert_eq!(s.downtime_ms, 10_000);
    assert_eq!(s.uptime_ms, 20_000);
}

#[test]
fn test_colocated_group_members_interfere() {
    let model = InterferenceModel::new(vec![InterferenceGroup {
        members: vec!["db".into(), "cache".into()],
        target_load: 0.5,
        score: 0.8,
    }]);
    let mut h = SimHost::new(0, HostSpec::new("h", MachineModel::new(2, 1000.0, 4096)), 0)
        .with_interference(Arc::new(model));
    h.launch(0).unwrap();

    let db = h.spawn_guest(GuestSpec::new("db", 1, 512), 0).unwrap();
    let web = h.spawn_guest(GuestSpec::new("web", 1, 512), 0).unwrap();
    h.set_guest_demand(db, 1000.0, 0).unwrap();
    h.set_guest_demand(web, 1000.0, 0).unwrap();
    // no group neighbour yet
    let alone = h.complete_guest(db, 1000).unwrap();
    assert_eq!(alone.counters.interfered, 0.0);

    let db = h.spawn_guest(GuestSpec::new("db", 1, 512), 1000).unwrap();
    h.complete_guest(web, 1000).unwrap();
    let cache = h.spawn_guest(GuestSpec::new("cache", 1, 512), 1000).unwrap();
    h.set_guest_demand(db, 1000.0, 1000).unwrap();
    h.set_guest_demand(cache, 1000.0, 1000).unwrap();

    let exit = h.complete_guest(db, 2000).unwrap();
    assert!((exit.counters.requested - 1000.0).abs() < 1e-6);
    assert!((exit.counters.granted - 800.0).abs() < 1e-6);
    assert!((exit.counters.interfered - 200.0).abs() < 1e-6);
}
