/// End-to-end tests: configs in, reports out.
use fleetsim_core::config::SimConfig;
use fleetsim_core::host::{HostSpec, MachineModel};
use fleetsim_core::simulation::Simulation;
use fleetsim_core::workload::{DemandTrace, Fragment, Task};
use fleetsim_core::{compare_schedulers, run_simulation, SimulationReport};
use fleetsim_scheduler::filters::default_filters;
use fleetsim_scheduler::weighers::RamWeigher;
use fleetsim_scheduler::{available_schedulers, FilterParams, FilterScheduler};

fn small_cluster(policy: &str, failures: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[simulation]
name = "integration-test"
seed = 42
sample_interval_ms = 300000

[scheduler]
policy = "{}"

[[hosts]]
count = 4
cluster = "rack-a"
cores = 16
core_speed_mhz = 2900
memory_mb = 65536

[[hosts]]
count = 2
cluster = "rack-b"
cores = 32
core_speed_mhz = 3200
memory_mb = 131072
power_model = {{ kind = "square", idle_watts = 150, max_watts = 400 }}

[workload]
task_count = 60
mean_interarrival_ms = 30000
min_duration_ms = 600000
max_duration_ms = 3600000
{}
"#,
        policy, failures
    ))
    .unwrap()
}

fn assert_accounted(r: &SimulationReport) {
    assert_eq!(
        r.tasks_completed + r.tasks_failed + r.tasks_dropped + r.tasks_unfinished,
        r.tasks_submitted
    );
    let w = &r.work;
    let parts = w.granted + w.overcommitted + w.interfered + w.lost;
    assert!((w.requested - parts).abs() <= 1e-6 * w.requested.max(1.0));
}

#[test]
fn test_full_run_completes_every_task() {
    let config = small_cluster("filter", "");
    let r = run_simulation(&config, None).unwrap();

    assert_eq!(r.name, "integration-test");
    assert_eq!(r.scheduler, "filter");
    assert_eq!(r.hosts, 6);
    assert_eq!(r.tasks_submitted, 60);
    assert_eq!(r.tasks_completed, 60);
    assert_eq!(r.placements, 60);
    assert_accounted(&r);

    assert!(r.duration_ms >= r.makespan_ms);
    assert!(r.work.granted > 0.0);
    assert!(r.energy_kwh > 0.0);
    assert!(r.peak_power_w > 0.0);
    assert!(r.telemetry_samples > 1);
    assert!(r.mean_host_utilization > 0.0 && r.mean_host_utilization <= 1.0);
    assert!(r.peak_cluster_utilization <= 1.0 + 1e-9);
    assert_eq!(r.kernel.processes_failed, 0);
    assert!(r.completion_rate() > 0.99);
}

#[test]
fn test_same_seed_same_report() {
    let config = small_cluster("memorizing", "");
    let a = run_simulation(&config, None).unwrap();
    let b = run_simulation(&config, None).unwrap();
    assert_eq!(a.duration_ms, b.duration_ms);
    assert_eq!(a.makespan_ms, b.makespan_ms);
    assert_eq!(a.work, b.work);
    assert_eq!(a.wait_time.mean, b.wait_time.mean);
    assert_eq!(a.kernel, b.kernel);
}

#[test]
fn test_compare_runs_every_policy() {
    let config = small_cluster("filter", "");
    let names = available_schedulers();
    let results = compare_schedulers(&config, &names);
    assert_eq!(results.len(), names.len());
    for (r, name) in results.iter().zip(&names) {
        assert_eq!(&r.scheduler, name);
        assert_accounted(r);
    }
}

#[test]
fn test_unknown_policy_is_rejected() {
    let config = small_cluster("filter", "");
    assert!(run_simulation(&config, Some("round_robin")).is_err());
    let results = compare_schedulers(&config, &["filter", "round_robin"]);
    assert_eq!(results.len(), 1);
}

#[test]
fn test_failure_injection_is_reported() {
    let failures = r#"
[[failures]]
host = 0
at_ms = 600000
duration_ms = 1200000

[[failures]]
host = 5
at_ms = 900000
"#;
    let config = small_cluster("filter", failures);
    let r = run_simulation(&config, None).unwrap();

    assert_eq!(r.host_failures, 2);
    assert_eq!(r.host_recoveries, 1);
    assert!(r.tasks_failed > 0);
    assert_accounted(&r);
    assert_eq!(r.tasks_unfinished, 0);
}

#[test]
fn test_run_until_reports_partial_progress() {
    let config = small_cluster("two_choice", "");
    let sim = Simulation::from_config(&config).unwrap();
    let r = sim.run_until(600_000).unwrap();
    assert_eq!(r.duration_ms, 600_000);
    assert!(r.tasks_unfinished > 0);
    assert!(r.tasks_submitted < 60);
    assert_accounted(&r);
}

fn task(id: u64, cores: u32, fragments: &[(u64, u64, f64)]) -> Task {
    let trace = DemandTrace::new(
        fragments
            .iter()
            .map(|&(t, d, mhz)| Fragment::new(t, d, mhz))
            .collect(),
    );
    Task::new(id, format!("vm-{}", id), cores, 2048, trace)
}

#[test]
fn test_two_tasks_contending_for_one_host() {
    let params = FilterParams {
        cpu_allocation_ratio: 2.0,
        ..FilterParams::default()
    };
    let scheduler = FilterScheduler::new(
        default_filters(&params),
        vec![Box::new(RamWeigher::new(1.0))],
    );
    let mut sim = Simulation::new("contention", Box::new(scheduler))
        .unwrap()
        .with_sample_interval(1000);
    sim.add_host(
        HostSpec::new("h0", MachineModel::new(2, 3200.0, 8192)).with_vcpu_overcommit(2.0),
    )
    .unwrap();
    sim.submit(task(
        1,
        2,
        &[(0, 1000, 28.0), (1000, 1000, 3500.0), (2000, 1000, 0.0), (3000, 1000, 183.0)],
    ))
    .unwrap();
    sim.submit(task(
        2,
        2,
        &[(0, 1000, 28.0), (1000, 1000, 3100.0), (2000, 1000, 0.0), (3000, 1000, 73.0)],
    ))
    .unwrap();

    let r = sim.run().unwrap();
    assert_eq!(r.tasks_completed, 2);
    assert_eq!(r.makespan_ms, 4000);
    assert!((r.work.requested - 6912.0).abs() < 1e-6);
    assert!((r.work.granted - 6712.0).abs() < 1e-6);
    assert!((r.work.overcommitted - 200.0).abs() < 1e-6);
    assert!((r.overcommit_ratio - 200.0 / 6912.0).abs() < 1e-9);
    assert_eq!(r.wait_time.max, 0.0);
}

#[test]
fn test_task_larger_than_any_host_is_dropped() {
    let mut sim = Simulation::new("drop", Box::new(FilterScheduler::with_defaults())).unwrap();
    sim.add_host(HostSpec::new("h0", MachineModel::new(4, 2000.0, 8192)))
        .unwrap();
    sim.submit(task(0, 64, &[(0, 1000, 100.0)])).unwrap();
    sim.submit(task(1, 2, &[(0, 1000, 100.0)])).unwrap();

    let r = sim.run().unwrap();
    assert_eq!(r.tasks_dropped, 1);
    assert_eq!(r.tasks_completed, 1);
    assert_accounted(&r);
}

#[test]
fn test_report_serializes_to_json() {
    let config = small_cluster("replay", "");
    let r = run_simulation(&config, None).unwrap();
    let json = serde_json::to_value(&r).unwrap();
    assert_eq!(json["scheduler"], "replay");
    assert!(json["work"]["granted"].as_f64().unwrap() > 0.0);
    assert!(json["custom_metrics"]["replay_fallbacks"].as_f64().unwrap() > 0.0);
}

#[test]
fn test_run_returns_with_task_stranded_on_dead_host() {
    let mut sim = Simulation::new("stranded", Box::new(FilterScheduler::with_defaults()))
        .unwrap()
        .with_sample_interval(1000);
    sim.add_host(HostSpec::new("h0", MachineModel::new(4, 2000.0, 8192)))
        .unwrap();
    sim.inject_failure(0, 0, None).unwrap();
    sim.submit(task(0, 2, &[(0, 1000, 100.0)]).submitted_at(10))
        .unwrap();

    let r = sim.run().unwrap();
    assert_eq!(r.host_failures, 1);
    assert_eq!(r.host_recoveries, 0);
    assert_eq!(r.tasks_unfinished, 1);
    assert_eq!(r.tasks_completed, 0);
    assert_accounted(&r);
}

#[test]
fn test_config_run_ends_when_only_host_never_recovers() {
    let config = SimConfig::from_str(
        r#"
[simulation]
name = "no-recovery"
seed = 42
sample_interval_ms = 60000

[[hosts]]
count = 1
cores = 16
core_speed_mhz = 2900
memory_mb = 65536

[workload]
task_count = 3
mean_interarrival_ms = 30000
min_duration_ms = 600000
max_duration_ms = 600000

[[failures]]
host = 0
at_ms = 0
"#,
    )
    .unwrap();
    let r = run_simulation(&config, None).unwrap();

    assert_eq!(r.host_failures, 1);
    assert_eq!(r.tasks_completed, 0);
    assert_eq!(r.tasks_failed + r.tasks_unfinished, 3);
    assert!(r.tasks_unfinished >= 2);
    assert_accounted(&r);
}
