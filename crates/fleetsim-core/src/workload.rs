//! Workloads: CPU demand traces, tasks, a seeded synthetic generator, and
//! the process that replays a task's trace on the guest it was placed on.

use crate::error::SimError;
use crate::host::GuestSpec;
use crate::kernel::{Behavior, Context, SendPort, SendRef, Step, Wakeup};
use crate::service::{Datacenter, ServiceSignal};
use fleetsim_scheduler::SchedulingRequest;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// CPU demand held for a stretch of time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Offset from the start of the trace.
    pub timestamp_ms: u64,
    pub duration_ms: u64,
    /// Demand across all of the task's vCPUs, in MHz.
    pub usage_mhz: f64,
}

impl Fragment {
    pub fn new(timestamp_ms: u64, duration_ms: u64, usage_mhz: f64) -> Self {
        Self {
            timestamp_ms,
            duration_ms,
            usage_mhz,
        }
    }
}

/// Ordered fragments of one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemandTrace {
    fragments: Vec<Fragment>,
}

impl DemandTrace {
    pub fn new(mut fragments: Vec<Fragment>) -> Self {
        fragments.sort_by_key(|f| f.timestamp_ms);
        Self { fragments }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Time from the first fragment's start to the last one's end.
    pub fn duration_ms(&self) -> u64 {
        match (self.fragments.first(), self.fragments.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp_ms + last.duration_ms).saturating_sub(first.timestamp_ms)
            }
            _ => 0,
        }
    }

    /// `(duration, demand)` segments to play back to back. Gaps between
    /// fragments become zero-demand segments; overlaps are cut short.
    pub fn segments(&self) -> Vec<(u64, f64)> {
        let mut out = Vec::with_capacity(self.fragments.len());
        let Some(first) = self.fragments.first() else {
            return out;
        };
        let mut cursor = first.timestamp_ms;
        for f in &self.fragments {
            if f.timestamp_ms > cursor {
                out.push((f.timestamp_ms - cursor, 0.0));
                cursor = f.timestamp_ms;
            }
            let end = f.timestamp_ms + f.duration_ms;
            if end > cursor {
                out.push((end - cursor, f.usage_mhz.max(0.0)));
                cursor = end;
            }
        }
        out
    }
}

/// A unit of work submitted to the compute service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub name: String,
    pub submit_ms: u64,
    pub cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub architecture: Option<String>,
    pub trace: DemandTrace,
}

impl Task {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        cores: u32,
        memory_mb: u64,
        trace: DemandTrace,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            submit_ms: 0,
            cores,
            memory_mb,
            architecture: None,
            trace,
        }
    }

    pub fn submitted_at(mut self, submit_ms: u64) -> Self {
        self.submit_ms = submit_ms;
        self
    }

    pub fn request(&self) -> SchedulingRequest {
        let peak = self
            .trace
            .fragments()
            .iter()
            .map(|f| f.usage_mhz)
            .fold(0.0, f64::max);
        let mut req = SchedulingRequest::new(self.id, self.name.clone(), self.cores, self.memory_mb);
        req.cpu_capacity_mhz = if self.cores > 0 {
            peak / self.cores as f64
        } else {
            0.0
        };
        req.architecture = self.architecture.clone();
        req
    }

    pub fn guest_spec(&self) -> GuestSpec {
        GuestSpec::new(self.name.clone(), self.cores, self.memory_mb).for_task(self.id)
    }
}

/// Parameters of the synthetic task generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticWorkload {
    #[serde(default = "default_task_count")]
    pub task_count: u32,
    /// Mean of the exponential inter-arrival time.
    #[serde(default = "default_mean_interarrival_ms")]
    pub mean_interarrival_ms: u64,
    #[serde(default = "default_min_duration_ms")]
    pub min_duration_ms: u64,
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    /// Length of each demand fragment.
    #[serde(default = "default_fragment_ms")]
    pub fragment_ms: u64,
    /// vCPU counts to draw from.
    #[serde(default = "default_cores")]
    pub cores: Vec<u32>,
    #[serde(default = "default_memory_mb_per_core")]
    pub memory_mb_per_core: u64,
    /// Per-vCPU speed that utilization is relative to.
    #[serde(default = "default_core_speed_mhz")]
    pub core_speed_mhz: f64,
    #[serde(default = "default_min_utilization")]
    pub min_utilization: f64,
    #[serde(default = "default_max_utilization")]
    pub max_utilization: f64,
    /// When non-zero, tasks share this many workload names
    /// (`family-0`, `family-1`, ...) so replay tables and interference
    /// groups can refer to them.
    #[serde(default)]
    pub families: u32,
}

fn default_task_count() -> u32 {
    100
}
fn default_mean_interarrival_ms() -> u64 {
    60_000
}
fn default_min_duration_ms() -> u64 {
    600_000
}
fn default_max_duration_ms() -> u64 {
    7_200_000
}
fn default_fragment_ms() -> u64 {
    300_000
}
fn default_cores() -> Vec<u32> {
    vec![1, 2, 4, 8]
}
fn default_memory_mb_per_core() -> u64 {
    2048
}
fn default_core_speed_mhz() -> f64 {
    2900.0
}
fn default_min_utilization() -> f64 {
    0.1
}
fn default_max_utilization() -> f64 {
    0.9
}

impl Default for SyntheticWorkload {
    fn default() -> Self {
        Self {
            task_count: default_task_count(),
            mean_interarrival_ms: default_mean_interarrival_ms(),
            min_duration_ms: default_min_duration_ms(),
            max_duration_ms: default_max_duration_ms(),
            fragment_ms: default_fragment_ms(),
            cores: default_cores(),
            memory_mb_per_core: default_memory_mb_per_core(),
            core_speed_mhz: default_core_speed_mhz(),
            min_utilization: default_min_utilization(),
            max_utilization: default_max_utilization(),
            families: 0,
        }
    }
}

impl SyntheticWorkload {
    pub fn validate(&self) -> Result<(), String> {
        if self.cores.is_empty() || self.cores.contains(&0) {
            return Err("workload.cores must be a non-empty list of positive counts".into());
        }
        if self.fragment_ms == 0 {
            return Err("workload.fragment_ms must be > 0".into());
        }
        if self.min_duration_ms > self.max_duration_ms {
            return Err("workload.min_duration_ms must be <= max_duration_ms".into());
        }
        if !(0.0..=1.0).contains(&self.min_utilization)
            || !(0.0..=1.0).contains(&self.max_utilization)
            || self.min_utilization > self.max_utilization
        {
            return Err("workload utilization bounds must satisfy 0 <= min <= max <= 1".into());
        }
        if self.core_speed_mhz <= 0.0 {
            return Err("workload.core_speed_mhz must be > 0".into());
        }
        Ok(())
    }

    /// Generate tasks, sorted by submission time.
    pub fn generate(&self, seed: u64) -> Vec<Task> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut now = 0u64;
        (0..self.task_count as u64)
            .map(|id| {
                let u: f64 = rng.gen();
                now += (-(1.0 - u).ln() * self.mean_interarrival_ms as f64) as u64;
                let cores = self.cores[rng.gen_range(0..self.cores.len())];
                let duration = rng.gen_range(self.min_duration_ms..=self.max_duration_ms);
                let mut fragments = Vec::new();
                let mut offset = 0;
                while offset < duration {
                    let len = self.fragment_ms.min(duration - offset);
                    let util = rng.gen_range(self.min_utilization..=self.max_utilization);
                    let usage = util * cores as f64 * self.core_speed_mhz;
                    fragments.push(Fragment::new(offset, len, usage));
                    offset += len;
                }
                let name = if self.families > 0 {
                    format!("family-{}", id % self.families as u64)
                } else {
                    format!("task-{}", id)
                };
                Task::new(
                    id,
                    name,
                    cores,
                    cores as u64 * self.memory_mb_per_core,
                    DemandTrace::new(fragments),
                )
                .submitted_at(now)
            })
            .collect()
    }
}

/// Replays a placed task's demand on its guest, then reports completion.
pub struct TaskRunner {
    task_id: u64,
    segments: Vec<(u64, f64)>,
    next: usize,
    signals: SendRef<ServiceSignal>,
    port: Option<SendPort<ServiceSignal>>,
}

impl TaskRunner {
    pub fn new(task_id: u64, trace: &DemandTrace, signals: SendRef<ServiceSignal>) -> Self {
        Self {
            task_id,
            segments: trace.segments(),
            next: 0,
            signals,
            port: None,
        }
    }
}

impl Behavior<Datacenter> for TaskRunner {
    fn resume(
        &mut self,
        ctx: &mut Context<'_, Datacenter>,
        wakeup: Wakeup,
    ) -> Result<Step, SimError> {
        if let Wakeup::Start = wakeup {
            self.port = Some(ctx.connect(self.signals)?);
        }
        // the guest may have died with its host while we slept
        if !ctx.world().is_task_running(self.task_id) {
            trace!(task = self.task_id, "guest gone, runner exits");
            return Ok(Step::Exit);
        }
        let now = ctx.now();
        match self.segments.get(self.next) {
            Some(&(duration_ms, demand)) => {
                ctx.world_mut().set_task_demand(self.task_id, demand, now)?;
                self.next += 1;
                ctx.delay(duration_ms);
                Ok(Step::Suspend)
            }
            None => {
                ctx.world_mut().complete_task(self.task_id, now)?;
                if let Some(port) = &self.port {
                    ctx.send(port, ServiceSignal::GuestFinished(self.task_id))?;
                }
                Ok(Step::Exit)
            }
        }
    }
}
