//! Placement policy trait definitions.
//!
//! All placement policies implement the [`ComputeScheduler`] trait. A policy
//! owns a pool of [`HostView`]s that the host-management layer keeps fresh via
//! explicit [`ComputeScheduler::add_host`] / [`ComputeScheduler::remove_host`]
//! calls, and answers placement questions for [`SchedulingRequest`]s.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Identifier of a simulated host, unique within one simulation.
pub type HostId = u32;

/// Lifecycle status of a host as seen by a scheduler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostStatus {
    /// Host is up and may accept new guests.
    #[default]
    Up,
    /// Host is powered off.
    Down,
    /// Host failed and is waiting for recovery.
    Error,
}

/// Scheduler-local summary of a host's placement-relevant state.
///
/// This is the scheduler crate's view of a host: it carries only what the
/// policies need, not the host's flow graph or guests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostView {
    pub id: HostId,
    pub name: String,
    pub cluster: String,
    pub architecture: String,
    pub status: HostStatus,
    /// Physical core count.
    pub cores: u32,
    /// Capacity of a single core in MHz.
    pub core_speed_mhz: f64,
    /// Total memory in MB.
    pub memory_mb: u64,
    /// vCPUs handed out to guests placed on this host.
    pub provisioned_cores: u32,
    /// Memory not yet reserved by guests, in MB.
    pub available_memory_mb: u64,
    /// Number of guests currently placed on this host.
    pub instance_count: u32,
    /// Bucket the host sits in (bucketed policies only).
    pub priority_index: usize,
    /// Position of the host inside its bucket (bucketed policies only).
    pub list_index: usize,
}

impl HostView {
    /// Create an empty, running host view.
    pub fn new(
        id: HostId,
        name: impl Into<String>,
        cores: u32,
        core_speed_mhz: f64,
        memory_mb: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            cluster: "default".to_string(),
            architecture: "x86_64".to_string(),
            status: HostStatus::Up,
            cores,
            core_speed_mhz,
            memory_mb,
            provisioned_cores: 0,
            available_memory_mb: memory_mb,
            instance_count: 0,
            priority_index: 0,
            list_index: 0,
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    /// Physical cores not yet provisioned to any guest.
    pub fn free_cores(&self) -> u32 {
        self.cores.saturating_sub(self.provisioned_cores)
    }

    /// Record a placement in the view's bookkeeping fields.
    pub fn reserve(&mut self, request: &SchedulingRequest) {
        self.instance_count += 1;
        self.provisioned_cores += request.cores;
        self.available_memory_mb = self.available_memory_mb.saturating_sub(request.memory_mb);
    }
}

/// A request to place one task somewhere in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingRequest {
    pub task_id: u64,
    /// Workload name; replay tables are keyed by it.
    pub name: String,
    /// vCPUs the task needs.
    pub cores: u32,
    /// Memory the task needs, in MB.
    pub memory_mb: u64,
    /// Peak per-vCPU capacity the task expects, in MHz.
    pub cpu_capacity_mhz: f64,
    /// Required CPU architecture, if any.
    pub architecture: Option<String>,
    /// How many times a bucketed policy has passed over this request.
    #[serde(default)]
    pub times_skipped: u32,
}

impl SchedulingRequest {
    pub fn new(task_id: u64, name: impl Into<String>, cores: u32, memory_mb: u64) -> Self {
        Self {
            task_id,
            name: name.into(),
            cores,
            memory_mb,
            cpu_capacity_mhz: 0.0,
            architecture: None,
            times_skipped: 0,
        }
    }
}

/// Outcome of a successful batch selection.
#[derive(Debug, Clone)]
pub struct Placement {
    /// The chosen host.
    pub host: HostView,
    /// The request, already removed from the queue it came from.
    pub request: SchedulingRequest,
}

/// The core placement policy trait.
///
/// `select` never touches the host itself; the caller spawns the guest and
/// then refreshes the view with [`ComputeScheduler::update_host`]. All
/// implementations support `add_host` / `remove_host` interleaved freely
/// between `select` calls.
pub trait ComputeScheduler {
    /// Register a host with the pool. Re-adding a known host replaces its view.
    fn add_host(&mut self, host: HostView);

    /// Drop a host from the pool, returning its last view.
    fn remove_host(&mut self, host: HostId) -> Option<HostView>;

    /// Refresh a registered host's view. Unknown hosts are ignored.
    fn update_host(&mut self, host: HostView) {
        if self.remove_host(host.id).is_some() {
            self.add_host(host);
        }
    }

    /// Pick a host for a single request, or `None` if no host fits.
    fn select(&mut self, request: &SchedulingRequest) -> Option<HostView>;

    /// Pick a host for some request of `queue`, removing that request.
    ///
    /// The default only considers the head of the queue.
    fn select_from(&mut self, queue: &mut VecDeque<SchedulingRequest>) -> Option<Placement> {
        let host = self.select(queue.front()?)?;
        let request = queue.pop_front()?;
        Some(Placement { host, request })
    }

    /// Look up a registered host.
    fn host(&self, id: HostId) -> Option<&HostView>;

    /// Number of hosts in the pool.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name for reports.
    fn name(&self) -> &str;

    /// Optional: policy-specific metrics to include in output.
    fn custom_metrics(&self) -> HashMap<String, f64> {
        HashMap::new()
    }
}

/// Return the first host with the most available memory.
pub fn max_available_memory<'a>(
    hosts: impl IntoIterator<Item = &'a HostView>,
) -> Option<&'a HostView> {
    hosts.into_iter().fold(None, |best: Option<&HostView>, host| match best {
        Some(b) if b.available_memory_mb >= host.available_memory_mb => Some(b),
        _ => Some(host),
    })
}
