//! Periodic host telemetry.
//!
//! The [`TelemetrySampler`] process wakes every `interval_ms`, snapshots
//! every host with [`SimHost::stats`](crate::host::SimHost::stats), folds the
//! snapshot into [`Telemetry`] and resets the host's counters. Work and
//! energy therefore add up exactly across periods.

use crate::error::SimError;
use crate::flow::FlowCounters;
use crate::host::HostStats;
use crate::kernel::{Behavior, Context, Step, Wakeup};
use crate::service::Datacenter;
use fleetsim_scheduler::HostId;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Totals of one host over the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostTotals {
    pub host: HostId,
    pub name: String,
    pub work: FlowCounters,
    pub energy_joules: f64,
    pub uptime_ms: u64,
    pub downtime_ms: u64,
    pub boot_count: u32,
    pub failure_count: u32,
    pub peak_utilization: f64,
    /// Sum of sampled utilizations; divide by the sample count for a mean.
    utilization_sum: f64,
}

impl HostTotals {
    fn record(&mut self, stats: &HostStats) {
        self.host = stats.host;
        self.name.clone_from(&stats.name);
        self.work.add(&stats.work);
        self.energy_joules += stats.energy_joules;
        self.uptime_ms += stats.uptime_ms;
        self.downtime_ms += stats.downtime_ms;
        self.boot_count += stats.boot_count;
        self.failure_count += stats.failure_count;
        self.peak_utilization = self.peak_utilization.max(stats.utilization);
        self.utilization_sum += stats.utilization;
    }
}

/// Accumulated samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    samples: u64,
    hosts: Vec<HostTotals>,
    /// Cluster-wide CPU usage over capacity, one entry per sample.
    cluster_utilization: Vec<f64>,
    /// Cluster-wide draw in watts, one entry per sample.
    cluster_power_w: Vec<f64>,
    last_sample_ms: Option<u64>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one snapshot of every host into the totals.
    pub fn record(&mut self, now_ms: u64, stats: &[HostStats]) {
        if self.hosts.len() < stats.len() {
            self.hosts.resize_with(stats.len(), HostTotals::default);
        }
        for (totals, s) in self.hosts.iter_mut().zip(stats) {
            totals.record(s);
        }
        let capacity: f64 = stats
            .iter()
            .filter(|s| s.cpu_capacity_mhz > 0.0)
            .map(|s| s.cpu_capacity_mhz)
            .sum();
        let usage: f64 = stats.iter().map(|s| s.cpu_usage_mhz).sum();
        self.cluster_utilization.push(if capacity > 0.0 {
            usage / capacity
        } else {
            0.0
        });
        self.cluster_power_w
            .push(stats.iter().map(|s| s.power_draw_w).sum());
        self.samples += 1;
        self.last_sample_ms = Some(now_ms);
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn last_sample_ms(&self) -> Option<u64> {
        self.last_sample_ms
    }

    pub fn hosts(&self) -> &[HostTotals] {
        &self.hosts
    }

    pub fn cluster_utilization(&self) -> &[f64] {
        &self.cluster_utilization
    }

    pub fn cluster_power_w(&self) -> &[f64] {
        &self.cluster_power_w
    }

    /// Work of all hosts together.
    pub fn work(&self) -> FlowCounters {
        let mut total = FlowCounters::default();
        for h in &self.hosts {
            total.add(&h.work);
        }
        total
    }

    pub fn energy_joules(&self) -> f64 {
        self.hosts.iter().map(|h| h.energy_joules).sum()
    }

    /// Mean of the per-host mean utilizations.
    pub fn mean_host_utilization(&self) -> f64 {
        if self.samples == 0 || self.hosts.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .hosts
            .iter()
            .map(|h| h.utilization_sum / self.samples as f64)
            .sum();
        sum / self.hosts.len() as f64
    }
}

/// Samples every host on a fixed period until the simulation drains.
pub struct TelemetrySampler {
    interval_ms: u64,
}

impl TelemetrySampler {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
        }
    }
}

impl Behavior<Datacenter> for TelemetrySampler {
    fn resume(
        &mut self,
        ctx: &mut Context<'_, Datacenter>,
        wakeup: Wakeup,
    ) -> Result<Step, SimError> {
        let now = ctx.now();
        if !matches!(wakeup, Wakeup::Start) {
            ctx.world_mut().sample(now)?;
            trace!(t = now, "telemetry sample");
        }
        // nothing left to happen but our own wakeups
        if ctx.world().is_idle() && ctx.kernel().pending_events() == 0 {
            if matches!(wakeup, Wakeup::Start) {
                ctx.world_mut().sample(now)?;
            }
            return Ok(Step::Exit);
        }
        ctx.delay(self.interval_ms);
        Ok(Step::Suspend)
    }
}
