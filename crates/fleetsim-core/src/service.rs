//! The simulated datacenter and its compute service.
//!
//! [`Datacenter`] is the kernel's world: the hosts, the placement policy and
//! the queue of tasks waiting for a host. The [`ComputeService`] process
//! drains that queue through the policy whenever something may have freed
//! or added capacity. It is poked over a conflated channel, so a burst of
//! arrivals at one instant costs a single scheduling pass.

use crate::error::SimError;
use crate::host::{GuestExit, GuestId, GuestState, HostSpec, InterferenceModel, SimHost};
use crate::kernel::{Behavior, Context, Kernel, ReceivePort, ReceiveRef, SendRef, Step, Wakeup};
use crate::telemetry::Telemetry;
use crate::workload::{Task, TaskRunner};
use fleetsim_scheduler::{ComputeScheduler, HostId, SchedulingRequest};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Why the compute service was poked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceSignal {
    TaskArrived(u64),
    GuestFinished(u64),
    HostRecovered(HostId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    /// Killed with its host.
    Failed,
    /// Could never fit any host.
    Dropped,
}

/// Per-task bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub state: TaskState,
    pub placed_on: Option<(HostId, GuestId)>,
    pub started_ms: Option<u64>,
    pub exit: Option<GuestExit>,
}

impl TaskRecord {
    /// Time spent waiting for a host.
    pub fn wait_ms(&self) -> Option<u64> {
        self.started_ms
            .map(|s| s.saturating_sub(self.task.submit_ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub submitted: u64,
    pub placed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Tasks larger than every host.
    pub dropped: u64,
    /// Scheduling passes that ended with tasks still waiting.
    pub no_fit: u64,
    /// Placements the chosen host refused on re-check.
    pub rejected: u64,
    pub host_failures: u64,
    pub host_recoveries: u64,
}

/// World of a datacenter simulation.
pub struct Datacenter {
    hosts: Vec<SimHost>,
    scheduler: Box<dyn ComputeScheduler>,
    pending: VecDeque<SchedulingRequest>,
    tasks: HashMap<u64, TaskRecord>,
    signals: Option<SendRef<ServiceSignal>>,
    interference: Option<Arc<InterferenceModel>>,
    stats: ServiceStats,
    telemetry: Telemetry,
}

impl Datacenter {
    pub fn new(scheduler: Box<dyn ComputeScheduler>) -> Self {
        Self {
            hosts: Vec::new(),
            scheduler,
            pending: VecDeque::new(),
            tasks: HashMap::new(),
            signals: None,
            interference: None,
            stats: ServiceStats::default(),
            telemetry: Telemetry::new(),
        }
    }

    pub fn with_interference(mut self, model: InterferenceModel) -> Self {
        self.interference = Some(Arc::new(model));
        self
    }

    /// Build, launch and register a host.
    pub fn add_host(&mut self, spec: HostSpec, now_ms: u64) -> Result<HostId, SimError> {
        let id = self.hosts.len() as HostId;
        let mut host = SimHost::new(id, spec, now_ms);
        if let Some(model) = &self.interference {
            host = host.with_interference(Arc::clone(model));
        }
        host.launch(now_ms)?;
        self.scheduler.add_host(host.view());
        self.hosts.push(host);
        Ok(id)
    }

    pub fn hosts(&self) -> &[SimHost] {
        &self.hosts
    }

    pub fn hosts_mut(&mut self) -> &mut [SimHost] {
        &mut self.hosts
    }

    pub fn host(&self, id: HostId) -> Option<&SimHost> {
        self.hosts.get(id as usize)
    }

    fn host_mut(&mut self, id: HostId) -> Result<&mut SimHost, SimError> {
        self.hosts
            .get_mut(id as usize)
            .ok_or(SimError::HostNotFound(id))
    }

    pub fn scheduler(&self) -> &dyn ComputeScheduler {
        self.scheduler.as_ref()
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Snapshot every host into the telemetry and start a new period.
    pub fn sample(&mut self, now_ms: u64) -> Result<(), SimError> {
        let mut snapshot = Vec::with_capacity(self.hosts.len());
        for host in &mut self.hosts {
            snapshot.push(host.stats(now_ms)?);
            host.reset_stats(now_ms)?;
        }
        self.telemetry.record(now_ms, &snapshot);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn task(&self, id: u64) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn signals(&self) -> Option<SendRef<ServiceSignal>> {
        self.signals
    }

    pub(crate) fn set_signals(&mut self, signals: SendRef<ServiceSignal>) {
        self.signals = Some(signals);
    }

    pub fn is_task_running(&self, id: u64) -> bool {
        self.tasks
            .get(&id)
            .map(|t| t.state == TaskState::Running)
            .unwrap_or(false)
    }

    /// No task is running. Pending tasks only move when an arrival, a
    /// completion or a recovery pokes the service, so once the event queue
    /// is also empty they stay pending for good.
    pub fn is_idle(&self) -> bool {
        self.tasks.values().all(|t| t.state != TaskState::Running)
    }

    /// Queue a task. A task wider or larger than every host is dropped and
    /// reported as [`SimError::NeverFits`].
    pub fn submit(&mut self, task: Task) -> Result<(), SimError> {
        self.stats.submitted += 1;
        let fits_somewhere = self.hosts.iter().any(|h| {
            let m = &h.spec().model;
            task.cores <= m.cores && task.memory_mb <= m.memory_mb
        });
        let id = task.id;
        if !fits_somewhere {
            self.stats.dropped += 1;
            let err = SimError::NeverFits {
                task: id,
                cores: task.cores,
                memory_mb: task.memory_mb,
            };
            self.tasks.insert(id, record(task, TaskState::Dropped));
            return Err(err);
        }
        self.pending.push_back(task.request());
        self.tasks.insert(id, record(task, TaskState::Pending));
        Ok(())
    }

    /// Place as many pending tasks as the policy allows. Returns the tasks
    /// that now run.
    pub fn schedule_pending(&mut self, now_ms: u64) -> Vec<u64> {
        let mut started = Vec::new();
        while let Some(placement) = self.scheduler.select_from(&mut self.pending) {
            let request = placement.request;
            let host_id = placement.host.id;
            match self.realize(&request, host_id, now_ms) {
                Ok(()) => started.push(request.task_id),
                Err(err) => {
                    debug!(task = request.task_id, host = host_id, error = %err, "placement refused");
                    self.stats.rejected += 1;
                    self.refresh_view(host_id);
                    self.pending.push_front(request);
                    break;
                }
            }
        }
        if !self.pending.is_empty() {
            self.stats.no_fit += 1;
            debug!(waiting = self.pending.len(), t = now_ms, "tasks left without a host");
        }
        started
    }

    fn realize(
        &mut self,
        request: &SchedulingRequest,
        host_id: HostId,
        now_ms: u64,
    ) -> Result<(), SimError> {
        let spec = self
            .tasks
            .get(&request.task_id)
            .map(|r| r.task.guest_spec())
            .ok_or_else(|| SimError::Internal(format!("no record for task {}", request.task_id)))?;
        let guest = self.host_mut(host_id)?.spawn_guest(spec, now_ms)?;
        self.refresh_view(host_id);
        if let Some(record) = self.tasks.get_mut(&request.task_id) {
            record.state = TaskState::Running;
            record.placed_on = Some((host_id, guest));
            record.started_ms = Some(now_ms);
        }
        self.stats.placed += 1;
        trace!(task = request.task_id, host = host_id, guest = %guest, "placed");
        Ok(())
    }

    fn refresh_view(&mut self, host_id: HostId) {
        if let Some(host) = self.hosts.get(host_id as usize) {
            if host.is_up() {
                self.scheduler.update_host(host.view());
            }
        }
    }

    fn placement(&self, task_id: u64) -> Result<(HostId, GuestId), SimError> {
        self.tasks
            .get(&task_id)
            .and_then(|r| r.placed_on)
            .ok_or_else(|| SimError::Process(format!("task {} is not placed", task_id)))
    }

    pub fn set_task_demand(&mut self, task_id: u64, mhz: f64, now_ms: u64) -> Result<(), SimError> {
        let (host, guest) = self.placement(task_id)?;
        self.host_mut(host)?.set_guest_demand(guest, mhz, now_ms)
    }

    pub fn complete_task(&mut self, task_id: u64, now_ms: u64) -> Result<(), SimError> {
        let (host, guest) = self.placement(task_id)?;
        let exit = self.host_mut(host)?.complete_guest(guest, now_ms)?;
        self.refresh_view(host);
        self.stats.completed += 1;
        if let Some(record) = self.tasks.get_mut(&task_id) {
            record.state = TaskState::Completed;
            record.exit = Some(exit);
        }
        Ok(())
    }

    /// Fail a host. Its tasks are marked failed and not resubmitted; the
    /// host leaves the policy's pool until it recovers.
    pub fn fail_host(&mut self, id: HostId, now_ms: u64) -> Result<Vec<GuestExit>, SimError> {
        let exits = self.host_mut(id)?.fail(now_ms)?;
        self.scheduler.remove_host(id);
        self.stats.host_failures += 1;
        for exit in &exits {
            let Some(task_id) = exit.task_id else { continue };
            if let Some(record) = self.tasks.get_mut(&task_id) {
                record.state = TaskState::Failed;
                record.exit = Some(exit.clone());
                self.stats.failed += 1;
            }
        }
        warn!(host = id, guests = exits.len(), t = now_ms, "host failed");
        Ok(exits)
    }

    pub fn recover_host(&mut self, id: HostId, now_ms: u64) -> Result<(), SimError> {
        self.host_mut(id)?.recover(now_ms)?;
        self.stats.host_recoveries += 1;
        let view = self.host_mut(id)?.view();
        self.scheduler.add_host(view);
        info!(host = id, t = now_ms, "host recovered");
        Ok(())
    }

    /// Guests killed with their host, across the run.
    pub fn failed_guests(&self) -> impl Iterator<Item = &GuestExit> {
        self.tasks
            .values()
            .filter(|r| r.state == TaskState::Failed)
            .filter_map(|r| r.exit.as_ref())
            .filter(|e| e.state == GuestState::Failed)
    }
}

fn record(task: Task, state: TaskState) -> TaskRecord {
    TaskRecord {
        task,
        state,
        placed_on: None,
        started_ms: None,
        exit: None,
    }
}

/// Send `signal` to the compute service from driver code.
pub fn poke(kernel: &mut Kernel<Datacenter>, signal: ServiceSignal) -> Result<(), SimError> {
    let Some(signals) = kernel.world().signals() else {
        return Ok(());
    };
    let port = kernel.connect(signals)?;
    kernel.send(&port, signal)
}

/// Submit `task` at the current time and poke the service. A task that can
/// never fit is dropped with a warning.
pub fn submit_task(kernel: &mut Kernel<Datacenter>, task: Task) -> Result<(), SimError> {
    let id = task.id;
    match kernel.world_mut().submit(task) {
        Ok(()) => poke(kernel, ServiceSignal::TaskArrived(id)),
        Err(err) if err.is_contract_violation() => {
            warn!(task = id, error = %err, "dropping task");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Logical process that places pending tasks and starts their runners.
pub struct ComputeService {
    signals: ReceiveRef<ServiceSignal>,
    send: SendRef<ServiceSignal>,
    port: Option<ReceivePort<ServiceSignal>>,
}

impl ComputeService {
    pub fn new(signals: ReceiveRef<ServiceSignal>, send: SendRef<ServiceSignal>) -> Self {
        Self {
            signals,
            send,
            port: None,
        }
    }

    fn drain(&mut self, ctx: &mut Context<'_, Datacenter>) -> Result<(), SimError> {
        let now = ctx.now();
        for task_id in ctx.world_mut().schedule_pending(now) {
            let runner = {
                let record = ctx
                    .world()
                    .task(task_id)
                    .ok_or_else(|| SimError::Internal(format!("no record for task {}", task_id)))?;
                TaskRunner::new(task_id, &record.task.trace, self.send)
            };
            ctx.spawn(runner, &format!("/tasks/{}", task_id))?;
        }
        Ok(())
    }
}

impl Behavior<Datacenter> for ComputeService {
    fn resume(
        &mut self,
        ctx: &mut Context<'_, Datacenter>,
        wakeup: Wakeup,
    ) -> Result<Step, SimError> {
        match wakeup {
            Wakeup::Start => {
                self.port = Some(ctx.listen(self.signals)?);
            }
            Wakeup::Message(message) => {
                let port = self.port.as_ref().ok_or(SimError::PortClosed)?;
                let signal = port.accept(message)?;
                trace!(?signal, t = ctx.now(), "compute service woken");
            }
            _ => {}
        }
        loop {
            self.drain(ctx)?;
            let port = self.port.as_ref().ok_or(SimError::PortClosed)?;
            match ctx.receive(port)? {
                Some(signal) => trace!(?signal, "signal already pending"),
                None => return Ok(Step::Suspend),
            }
        }
    }
}
