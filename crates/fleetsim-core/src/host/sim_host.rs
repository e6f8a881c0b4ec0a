//! A simulated physical machine and the guests it runs.
//!
//! Each host owns one [`FlowGraph`]: a CPU source sized `cores x
//! core_speed_mhz` feeding a distributor, with one sink per running guest.
//! Guests live in a map owned by the host and refer back to it by
//! [`HostId`] only.
//!
//! ```text
//!   Down --launch--> Up --fail--> Error --recover--> Up
//!     ^               |             |
//!     +-----close-----+-----close---+
//! ```
//!
//! Failing a host fails every running guest and drops all guests; recovery
//! brings back an empty host.

use super::guest::{Guest, GuestExit, GuestId, GuestSpec, GuestState};
use super::interference::InterferenceModel;
use super::machine::HostSpec;
use crate::error::SimError;
use crate::flow::{FlowCounters, FlowGraph, NodeId};
use crate::power::PowerMeter;
use fleetsim_scheduler::{HostId, HostStatus, HostView};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostState {
    Down,
    Up,
    Error,
}

impl HostState {
    fn can_transition(&self, to: HostState) -> bool {
        use HostState::*;
        matches!(
            (self, to),
            (Down, Up) | (Up, Error) | (Error, Up) | (Up, Down) | (Error, Down)
        )
    }
}

impl From<HostState> for HostStatus {
    fn from(s: HostState) -> Self {
        match s {
            HostState::Down => HostStatus::Down,
            HostState::Up => HostStatus::Up,
            HostState::Error => HostStatus::Error,
        }
    }
}

/// State change published to [`HostListener`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Host {
        host: HostId,
        from: HostState,
        to: HostState,
        at_ms: u64,
    },
    Guest {
        host: HostId,
        guest: GuestId,
        from: GuestState,
        to: GuestState,
        at_ms: u64,
    },
}

/// Observer of host and guest state changes.
pub trait HostListener {
    fn on_event(&mut self, event: &HostEvent);
}

/// Telemetry snapshot of one host since the last reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub host: HostId,
    pub name: String,
    pub state: HostState,
    pub guests_running: u32,
    pub guests_active: u32,
    pub cpu_capacity_mhz: f64,
    pub cpu_demand_mhz: f64,
    pub cpu_usage_mhz: f64,
    pub utilization: f64,
    /// Work of every guest, finished ones included, in MHz x s.
    pub work: FlowCounters,
    pub power_draw_w: f64,
    pub energy_joules: f64,
    pub uptime_ms: u64,
    pub downtime_ms: u64,
    pub boot_count: u32,
    pub failure_count: u32,
}

/// Flow nodes that exist while the host is powered.
#[derive(Debug, Clone, Copy)]
struct CpuNodes {
    source: NodeId,
    mux: NodeId,
}

pub struct SimHost {
    id: HostId,
    spec: HostSpec,
    state: HostState,
    graph: FlowGraph,
    cpu: Option<CpuNodes>,
    guests: BTreeMap<GuestId, Guest>,
    next_guest: u64,
    meter: PowerMeter,
    interference: Option<Arc<InterferenceModel>>,
    listeners: Vec<Box<dyn HostListener>>,

    // telemetry since the last reset
    work: FlowCounters,
    state_since_ms: u64,
    uptime_ms: u64,
    downtime_ms: u64,
    boot_count: u32,
    failure_count: u32,
}

impl SimHost {
    /// A powered-off host.
    pub fn new(id: HostId, spec: HostSpec, now_ms: u64) -> Self {
        let meter = PowerMeter::new(spec.power_model.clone(), now_ms);
        Self {
            id,
            spec,
            state: HostState::Down,
            graph: FlowGraph::new(),
            cpu: None,
            guests: BTreeMap::new(),
            next_guest: 0,
            meter,
            interference: None,
            listeners: Vec::new(),
            work: FlowCounters::default(),
            state_since_ms: now_ms,
            uptime_ms: 0,
            downtime_ms: 0,
            boot_count: 0,
            failure_count: 0,
        }
    }

    pub fn with_interference(mut self, model: Arc<InterferenceModel>) -> Self {
        self.interference = Some(model);
        self
    }

    pub fn add_listener(&mut self, listener: Box<dyn HostListener>) {
        self.listeners.push(listener);
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == HostState::Up
    }

    pub fn guest(&self, id: GuestId) -> Option<&Guest> {
        self.guests.get(&id)
    }

    pub fn guests(&self) -> impl Iterator<Item = &Guest> {
        self.guests.values()
    }

    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// CPU supply currently granted to the guests, in MHz.
    pub fn cpu_usage_mhz(&self) -> f64 {
        self.cpu
            .and_then(|c| self.graph.supply(c.source).ok())
            .unwrap_or(0.0)
    }

    pub fn cpu_demand_mhz(&self) -> f64 {
        self.cpu
            .and_then(|c| self.graph.demand(c.source).ok())
            .unwrap_or(0.0)
    }

    pub fn utilization(&self) -> f64 {
        let capacity = self.spec.model.cpu_capacity_mhz();
        if capacity > 0.0 {
            self.cpu_usage_mhz() / capacity
        } else {
            0.0
        }
    }

    pub fn power_draw(&self) -> f64 {
        self.meter.power_draw()
    }

    // ---- host lifecycle ----

    /// `Down -> Up`: power on with an empty CPU tree.
    pub fn launch(&mut self, now_ms: u64) -> Result<(), SimError> {
        if self.state != HostState::Down {
            return Err(self.transition_error(HostState::Up));
        }
        let source = self
            .graph
            .add_source(self.spec.model.cpu_capacity_mhz(), now_ms)?;
        let mux = self.graph.add_distributor(now_ms);
        self.graph.connect(mux, source, now_ms)?;
        self.cpu = Some(CpuNodes { source, mux });
        self.boot_count += 1;
        self.set_state(HostState::Up, now_ms);
        self.meter.update(0.0, now_ms);
        Ok(())
    }

    /// `Up -> Error`: every guest is failed (running) or terminated (not
    /// yet running) and removed.
    pub fn fail(&mut self, now_ms: u64) -> Result<Vec<GuestExit>, SimError> {
        self.check_transition(HostState::Error)?;
        let exits = self.evict_all(GuestState::Failed, now_ms)?;
        if let Some(cpu) = self.cpu {
            self.graph.set_capacity(cpu.source, 0.0, now_ms)?;
        }
        self.failure_count += 1;
        self.set_state(HostState::Error, now_ms);
        self.meter.set_off(now_ms);
        Ok(exits)
    }

    /// `Error -> Up`. Guests lost in the failure are not restored.
    pub fn recover(&mut self, now_ms: u64) -> Result<(), SimError> {
        if self.state != HostState::Error {
            return Err(self.transition_error(HostState::Up));
        }
        if let Some(cpu) = self.cpu {
            self.graph
                .set_capacity(cpu.source, self.spec.model.cpu_capacity_mhz(), now_ms)?;
        }
        self.boot_count += 1;
        self.set_state(HostState::Up, now_ms);
        self.meter.update(0.0, now_ms);
        Ok(())
    }

    /// Power off and tear down the flow graph. Closing a host that is
    /// already down does nothing.
    pub fn close(&mut self, now_ms: u64) -> Result<Vec<GuestExit>, SimError> {
        if self.state == HostState::Down {
            return Ok(Vec::new());
        }
        let exits = self.evict_all(GuestState::Terminated, now_ms)?;
        if let Some(cpu) = self.cpu.take() {
            let counters = self.graph.remove(cpu.mux, now_ms)?;
            debug!(host = self.id, requested = counters.requested, "cpu tree closed");
            self.graph.remove(cpu.source, now_ms)?;
        }
        self.graph.clear();
        self.set_state(HostState::Down, now_ms);
        self.meter.set_off(now_ms);
        Ok(exits)
    }

    fn check_transition(&self, to: HostState) -> Result<(), SimError> {
        if self.state.can_transition(to) {
            Ok(())
        } else {
            Err(self.transition_error(to))
        }
    }

    fn transition_error(&self, to: HostState) -> SimError {
        SimError::InvalidHostTransition {
            host: self.id,
            from: self.state,
            to,
        }
    }

    fn set_state(&mut self, to: HostState, now_ms: u64) {
        let from = self.state;
        self.accrue_time(now_ms);
        self.state = to;
        info!(host = self.id, name = %self.spec.name, ?from, ?to, t = now_ms, "host state change");
        self.notify(HostEvent::Host {
            host: self.id,
            from,
            to,
            at_ms: now_ms,
        });
    }

    fn accrue_time(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.state_since_ms);
        match self.state {
            HostState::Up => self.uptime_ms += elapsed,
            HostState::Error => self.downtime_ms += elapsed,
            HostState::Down => {}
        }
        self.state_since_ms = now_ms;
    }

    fn notify(&mut self, event: HostEvent) {
        for l in self.listeners.iter_mut() {
            l.on_event(&event);
        }
    }

    // ---- guests ----

    /// vCPUs and memory reserved by running guests.
    fn running_usage(&self, except: Option<GuestId>) -> (u32, u64) {
        self.guests
            .values()
            .filter(|g| g.state == GuestState::Running && Some(g.id) != except)
            .fold((0, 0), |(c, m), g| (c + g.spec.cores, m + g.spec.memory_mb))
    }

    /// Whether `spec` fits next to the guests running right now. Evaluated
    /// fresh on every call.
    pub fn can_fit(&self, spec: &GuestSpec) -> bool {
        self.fits_except(spec, None)
    }

    fn fits_except(&self, spec: &GuestSpec, except: Option<GuestId>) -> bool {
        if self.state != HostState::Up {
            return false;
        }
        // the flow graph cannot give one guest more than the whole machine
        if self.cpu.is_none() || spec.cores > self.spec.model.cores {
            return false;
        }
        let (cores, memory) = self.running_usage(except);
        cores + spec.cores <= self.spec.vcpu_limit()
            && memory + spec.memory_mb <= self.spec.model.memory_mb
    }

    fn insufficient(&self, spec: &GuestSpec) -> SimError {
        SimError::InsufficientCapacity {
            host: self.id,
            cores: spec.cores,
            memory_mb: spec.memory_mb,
        }
    }

    /// Register a guest in `Created` state.
    pub fn create_guest(&mut self, spec: GuestSpec, now_ms: u64) -> Result<GuestId, SimError> {
        if !self.can_fit(&spec) {
            return Err(self.insufficient(&spec));
        }
        let id = GuestId(self.next_guest);
        self.next_guest += 1;
        debug!(host = self.id, guest = %id, name = %spec.name, "guest created");
        self.guests.insert(id, Guest::new(id, self.id, spec, now_ms));
        Ok(id)
    }

    /// `Created -> Ready`.
    pub fn prepare_guest(&mut self, id: GuestId, now_ms: u64) -> Result<(), SimError> {
        self.transition_guest(id, GuestState::Ready, now_ms)
    }

    /// `Ready -> Running`. Capacity is checked again against the guests
    /// running now; on failure the guest stays `Ready`.
    pub fn start_guest(&mut self, id: GuestId, now_ms: u64) -> Result<(), SimError> {
        let guest = self.guest_ref(id)?;
        if guest.state != GuestState::Ready {
            return Err(SimError::InvalidGuestTransition {
                guest: id,
                from: guest.state,
                to: GuestState::Running,
            });
        }
        if !self.fits_except(&guest.spec, Some(id)) {
            return Err(self.insufficient(&guest.spec));
        }
        let cpu = self
            .cpu
            .ok_or_else(|| SimError::Internal(format!("host {} up without cpu tree", self.id)))?;
        let sink = self.graph.add_sink(now_ms);
        self.graph.connect(sink, cpu.mux, now_ms)?;
        self.guest_mut(id)?.sink = Some(sink);
        self.guest_mut(id)?.started_ms = Some(now_ms);
        self.transition_guest(id, GuestState::Running, now_ms)?;
        self.refresh(now_ms)
    }

    /// Shorthand for create, prepare and start at one instant.
    pub fn spawn_guest(&mut self, spec: GuestSpec, now_ms: u64) -> Result<GuestId, SimError> {
        let id = self.create_guest(spec, now_ms)?;
        self.prepare_guest(id, now_ms)?;
        if let Err(err) = self.start_guest(id, now_ms) {
            self.guests.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Set a running guest's CPU demand. The demand is capped at what the
    /// guest's vCPUs could use on this machine.
    pub fn set_guest_demand(
        &mut self,
        id: GuestId,
        demand_mhz: f64,
        now_ms: u64,
    ) -> Result<(), SimError> {
        let cap = self.guest_ref(id)?.spec.cores as f64 * self.spec.model.core_speed_mhz;
        let guest = self.guest_mut(id)?;
        if guest.state != GuestState::Running {
            return Err(SimError::InvalidGuestTransition {
                guest: id,
                from: guest.state,
                to: GuestState::Running,
            });
        }
        let demand = demand_mhz.clamp(0.0, cap);
        guest.demand_mhz = demand;
        let sink = guest.sink;
        if let Some(sink) = sink {
            self.graph.set_demand(sink, demand, now_ms)?;
        }
        self.refresh(now_ms)
    }

    /// `Running -> Completed`; the guest leaves the host.
    pub fn complete_guest(&mut self, id: GuestId, now_ms: u64) -> Result<GuestExit, SimError> {
        self.transition_guest(id, GuestState::Completed, now_ms)?;
        let exit = self.detach(id, now_ms)?;
        self.refresh(now_ms)?;
        Ok(exit)
    }

    /// Stop a guest that has not finished; it leaves the host.
    pub fn terminate_guest(&mut self, id: GuestId, now_ms: u64) -> Result<GuestExit, SimError> {
        self.transition_guest(id, GuestState::Terminated, now_ms)?;
        let exit = self.detach(id, now_ms)?;
        self.refresh(now_ms)?;
        Ok(exit)
    }

    fn guest_ref(&self, id: GuestId) -> Result<&Guest, SimError> {
        self.guests.get(&id).ok_or(SimError::GuestNotFound {
            host: self.id,
            guest: id,
        })
    }

    fn guest_mut(&mut self, id: GuestId) -> Result<&mut Guest, SimError> {
        let host = self.id;
        self.guests
            .get_mut(&id)
            .ok_or(SimError::GuestNotFound { host, guest: id })
    }

    fn transition_guest(
        &mut self,
        id: GuestId,
        to: GuestState,
        now_ms: u64,
    ) -> Result<(), SimError> {
        let guest = self.guest_mut(id)?;
        let from = guest.state;
        if !from.can_transition(to) {
            return Err(SimError::InvalidGuestTransition { guest: id, from, to });
        }
        guest.state = to;
        self.notify(HostEvent::Guest {
            host: self.id,
            guest: id,
            from,
            to,
            at_ms: now_ms,
        });
        Ok(())
    }

    /// Remove a guest (already in a terminal state) and its sink.
    fn detach(&mut self, id: GuestId, now_ms: u64) -> Result<GuestExit, SimError> {
        let guest = self.guests.remove(&id).ok_or(SimError::GuestNotFound {
            host: self.id,
            guest: id,
        })?;
        let counters = match guest.sink {
            Some(sink) => self.graph.remove(sink, now_ms)?,
            None => FlowCounters::default(),
        };
        self.work.add(&counters);
        Ok(GuestExit {
            guest: id,
            host: self.id,
            name: guest.spec.name,
            task_id: guest.spec.task_id,
            state: guest.state,
            counters,
            started_ms: guest.started_ms,
            ended_ms: now_ms,
        })
    }

    fn evict_all(&mut self, running_to: GuestState, now_ms: u64) -> Result<Vec<GuestExit>, SimError> {
        let ids: Vec<GuestId> = self.guests.keys().copied().collect();
        let mut exits = Vec::with_capacity(ids.len());
        for id in ids {
            let to = match self.guest_ref(id)?.state {
                GuestState::Running => running_to,
                _ => GuestState::Terminated,
            };
            self.transition_guest(id, to, now_ms)?;
            exits.push(self.detach(id, now_ms)?);
        }
        Ok(exits)
    }

    /// Re-derive power draw and interference after the guest set or demand
    /// changed.
    fn refresh(&mut self, now_ms: u64) -> Result<(), SimError> {
        let load = self.utilization();
        if self.state == HostState::Up {
            self.meter.update(load, now_ms);
        }
        let Some(model) = self.interference.clone() else {
            return Ok(());
        };
        if model.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = self
            .guests
            .values()
            .filter(|g| g.state == GuestState::Running)
            .map(|g| g.spec.name.as_str())
            .collect();
        let updates: Vec<(NodeId, f64)> = self
            .guests
            .values()
            .filter_map(|g| {
                let sink = g.sink?;
                let score = model.score(&g.spec.name, names.iter().copied(), load);
                Some((sink, 1.0 - score))
            })
            .collect();
        for (sink, fraction) in updates {
            self.graph.set_interference(sink, fraction, now_ms)?;
        }
        Ok(())
    }

    // ---- telemetry ----

    /// Snapshot of everything accumulated since the last reset.
    pub fn stats(&mut self, now_ms: u64) -> Result<HostStats, SimError> {
        let mut work = self.work;
        for sink in self.guests.values().filter_map(|g| g.sink) {
            work.add(&self.graph.counters(sink, now_ms)?);
        }
        let elapsed = now_ms.saturating_sub(self.state_since_ms);
        let (uptime_ms, downtime_ms) = match self.state {
            HostState::Up => (self.uptime_ms + elapsed, self.downtime_ms),
            HostState::Error => (self.uptime_ms, self.downtime_ms + elapsed),
            HostState::Down => (self.uptime_ms, self.downtime_ms),
        };
        Ok(HostStats {
            host: self.id,
            name: self.spec.name.clone(),
            state: self.state,
            guests_running: self
                .guests
                .values()
                .filter(|g| g.state == GuestState::Running)
                .count() as u32,
            guests_active: self.guests.len() as u32,
            cpu_capacity_mhz: self.spec.model.cpu_capacity_mhz(),
            cpu_demand_mhz: self.cpu_demand_mhz(),
            cpu_usage_mhz: self.cpu_usage_mhz(),
            utilization: self.utilization(),
            work,
            power_draw_w: self.meter.power_draw(),
            energy_joules: self.meter.energy(now_ms),
            uptime_ms,
            downtime_ms,
            boot_count: self.boot_count,
            failure_count: self.failure_count,
        })
    }

    /// Start a new telemetry period.
    pub fn reset_stats(&mut self, now_ms: u64) -> Result<(), SimError> {
        for sink in self.guests.values().filter_map(|g| g.sink) {
            self.graph.take_counters(sink, now_ms)?;
        }
        self.work = FlowCounters::default();
        self.meter.take_energy(now_ms);
        self.accrue_time(now_ms);
        self.uptime_ms = 0;
        self.downtime_ms = 0;
        self.boot_count = 0;
        self.failure_count = 0;
        Ok(())
    }

    /// Scheduler-facing summary. Every guest that still holds a reservation
    /// counts, whatever its state.
    pub fn view(&self) -> HostView {
        let model = &self.spec.model;
        let (cores, memory) = self
            .guests
            .values()
            .filter(|g| g.is_active())
            .fold((0u32, 0u64), |(c, m), g| (c + g.spec.cores, m + g.spec.memory_mb));
        let mut view = HostView::new(
            self.id,
            self.spec.name.clone(),
            model.cores,
            model.core_speed_mhz,
            model.memory_mb,
        )
        .with_cluster(self.spec.cluster.clone())
        .with_architecture(model.architecture.clone());
        view.status = self.state.into();
        view.provisioned_cores = cores;
        view.available_memory_mb = model.memory_mb.saturating_sub(memory);
        view.instance_count = self.guests.len() as u32;
        view
    }
}
