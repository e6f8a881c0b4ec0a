//! Metrics aggregation for simulation runs.
//!
//! Turns the final state of a [`Datacenter`] and its kernel into a
//! [`SimulationReport`]: task outcomes, scheduling wait times, CPU work
//! accounting, energy, and placement statistics.

use crate::flow::FlowCounters;
use crate::kernel::KernelStats;
use crate::service::{Datacenter, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Percentile values for a distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    /// Compute percentiles from a slice of values.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                p50: 0.0,
                p75: 0.0,
                p90: 0.0,
                p95: 0.0,
                p99: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;

        Self {
            p50: percentile_sorted(&sorted, 50.0),
            p75: percentile_sorted(&sorted, 75.0),
            p90: percentile_sorted(&sorted, 90.0),
            p95: percentile_sorted(&sorted, 95.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean,
        }
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Aggregated results of one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    /// Simulation name from the config.
    pub name: String,
    /// Placement policy name.
    pub scheduler: String,
    /// Virtual time at the end of the run, in ms.
    pub duration_ms: u64,
    /// Time the last task ended, in ms.
    pub makespan_ms: u64,
    pub hosts: u32,

    // Tasks
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    /// Killed by a host failure.
    pub tasks_failed: u64,
    /// Larger than every host.
    pub tasks_dropped: u64,
    /// Still queued or running when the run ended.
    pub tasks_unfinished: u64,

    // Scheduling
    pub placements: u64,
    pub placement_rejections: u64,
    pub no_fit_passes: u64,
    /// Submit-to-start delay of every placed task, in ms.
    pub wait_time: Percentiles,
    /// Start-to-end time of every completed task, in ms.
    pub run_time: Percentiles,

    // CPU work, MHz x s
    pub work: FlowCounters,
    /// Share of requested work that was not granted for lack of capacity.
    pub overcommit_ratio: f64,
    pub mean_host_utilization: f64,
    pub peak_cluster_utilization: f64,

    // Power
    pub energy_kwh: f64,
    pub peak_power_w: f64,

    // Availability
    pub host_failures: u64,
    pub host_recoveries: u64,
    pub telemetry_samples: u64,

    pub kernel: KernelStats,
    pub custom_metrics: HashMap<String, f64>,
}

impl SimulationReport {
    /// Build the report from the end state of a run.
    pub fn collect(
        name: &str,
        datacenter: &Datacenter,
        duration_ms: u64,
        kernel: &KernelStats,
    ) -> Self {
        let stats = datacenter.stats();
        let telemetry = datacenter.telemetry();

        let wait: Vec<f64> = datacenter
            .tasks()
            .filter_map(|r| r.wait_ms())
            .map(|ms| ms as f64)
            .collect();
        let run: Vec<f64> = datacenter
            .tasks()
            .filter(|r| r.state == TaskState::Completed)
            .filter_map(|r| {
                let exit = r.exit.as_ref()?;
                Some(exit.ended_ms.saturating_sub(exit.started_ms?) as f64)
            })
            .collect();
        let makespan_ms = datacenter
            .tasks()
            .filter_map(|r| r.exit.as_ref().map(|e| e.ended_ms))
            .max()
            .unwrap_or(0);
        let unfinished = datacenter
            .tasks()
            .filter(|r| matches!(r.state, TaskState::Pending | TaskState::Running))
            .count() as u64;

        let work = telemetry.work();
        let overcommit_ratio = if work.requested > 0.0 {
            (work.overcommitted + work.lost) / work.requested
        } else {
            0.0
        };

        Self {
            name: name.to_string(),
            scheduler: datacenter.scheduler().name().to_string(),
            duration_ms,
            makespan_ms,
            hosts: datacenter.hosts().len() as u32,
            tasks_submitted: stats.submitted,
            tasks_completed: stats.completed,
            tasks_failed: stats.failed,
            tasks_dropped: stats.dropped,
            tasks_unfinished: unfinished,
            placements: stats.placed,
            placement_rejections: stats.rejected,
            no_fit_passes: stats.no_fit,
            wait_time: Percentiles::from_values(&wait),
            run_time: Percentiles::from_values(&run),
            work,
            overcommit_ratio,
            mean_host_utilization: telemetry.mean_host_utilization(),
            peak_cluster_utilization: telemetry
                .cluster_utilization()
                .iter()
                .copied()
                .fold(0.0, f64::max),
            energy_kwh: telemetry.energy_joules() / 3.6e6,
            peak_power_w: telemetry.cluster_power_w().iter().copied().fold(0.0, f64::max),
            host_failures: stats.host_failures,
            host_recoveries: stats.host_recoveries,
            telemetry_samples: telemetry.samples(),
            kernel: kernel.clone(),
            custom_metrics: datacenter.scheduler().custom_metrics(),
        }
    }

    /// Fraction of submitted tasks that completed.
    pub fn completion_rate(&self) -> f64 {
        if self.tasks_submitted == 0 {
            return 0.0;
        }
        self.tasks_completed as f64 / self.tasks_submitted as f64
    }
}

/// Format a report as a pretty-printed table string.
pub fn format_table(report: &SimulationReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:=<70}\n",
        format!("  {} / {} Results  ", report.name, report.scheduler)
    ));
    out.push_str(&format!(
        "  Duration: {:.1}h (makespan {:.1}h) | Hosts: {} | Tasks: {} ({} dropped)\n",
        report.duration_ms as f64 / 3_600_000.0,
        report.makespan_ms as f64 / 3_600_000.0,
        report.hosts,
        report.tasks_submitted,
        report.tasks_dropped
    ));
    out.push_str(&format!("{:-<70}\n", "  Tasks  "));
    out.push_str(&format!(
        "  Completed: {}  Failed: {}  Unfinished: {}  ({:.1}% done)\n",
        report.tasks_completed,
        report.tasks_failed,
        report.tasks_unfinished,
        report.completion_rate() * 100.0
    ));
    out.push_str(&format!(
        "  Wait (s)        P50={:>8.1}  P90={:>8.1}  P99={:>8.1}\n",
        report.wait_time.p50 / 1000.0,
        report.wait_time.p90 / 1000.0,
        report.wait_time.p99 / 1000.0
    ));
    out.push_str(&format!(
        "  Runtime (s)     P50={:>8.1}  P90={:>8.1}  P99={:>8.1}\n",
        report.run_time.p50 / 1000.0,
        report.run_time.p90 / 1000.0,
        report.run_time.p99 / 1000.0
    ));
    out.push_str(&format!("{:-<70}\n", "  Scheduling  "));
    out.push_str(&format!(
        "  Placements: {}  Rejected: {}  Passes with no fit: {}\n",
        report.placements, report.placement_rejections, report.no_fit_passes
    ));
    let mut custom: Vec<(&String, &f64)> = report.custom_metrics.iter().collect();
    custom.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in custom {
        out.push_str(&format!("  {}: {:.0}\n", k, v));
    }
    out.push_str(&format!("{:-<70}\n", "  CPU  "));
    out.push_str(&format!(
        "  Requested: {:.3e}  Granted: {:.3e} MHz*s\n",
        report.work.requested, report.work.granted
    ));
    out.push_str(&format!(
        "  Overcommitted: {:.3e}  Interfered: {:.3e}  Lost: {:.3e}\n",
        report.work.overcommitted, report.work.interfered, report.work.lost
    ));
    out.push_str(&format!(
        "  Overcommit ratio: {:.2}%  Mean host util: {:.1}%  Peak cluster util: {:.1}%\n",
        report.overcommit_ratio * 100.0,
        report.mean_host_utilization * 100.0,
        report.peak_cluster_utilization * 100.0
    ));
    out.push_str(&format!("{:-<70}\n", "  Power  "));
    out.push_str(&format!(
        "  Energy: {:.2} kWh  Peak draw: {:.0} W\n",
        report.energy_kwh, report.peak_power_w
    ));
    out.push_str(&format!("{:-<70}\n", "  Availability  "));
    out.push_str(&format!(
        "  Host failures: {}  Recoveries: {}\n",
        report.host_failures, report.host_recoveries
    ));
    out.push_str(&format!(
        "  Events: {}  Processes: {} ({} failed)\n",
        report.kernel.events_processed,
        report.kernel.processes_spawned,
        report.kernel.processes_failed
    ));
    out.push_str(&format!("{:=<70}\n", ""));
    out
}

/// Format a comparison table of several policies' reports.
pub fn format_comparison_table(results: &[SimulationReport]) -> String {
    if results.is_empty() {
        return String::from("No results to compare.\n");
    }

    let mut out = String::new();
    out.push_str(&format!("\n{:=<90}\n", "  Scheduler Comparison  "));
    out.push_str(&format!(
        "{:<14} {:>9} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
        "Scheduler", "Done", "Failed", "Wait p50", "Wait p99", "Overcmt%", "Util%", "kWh"
    ));
    out.push_str(&format!("{:-<90}\n", ""));

    for r in results {
        out.push_str(&format!(
            "{:<14} {:>9} {:>8} {:>9.1} {:>9.1} {:>8.2}% {:>8.1}% {:>9.2}\n",
            r.scheduler,
            r.tasks_completed,
            r.tasks_failed,
            r.wait_time.p50 / 1000.0,
            r.wait_time.p99 / 1000.0,
            r.overcommit_ratio * 100.0,
            r.mean_host_utilization * 100.0,
            r.energy_kwh,
        ));
    }
    out.push_str(&format!("{:=<90}\n", ""));
    out
}
