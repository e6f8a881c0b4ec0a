//! Guests: workloads running on a host.

use crate::flow::{FlowCounters, NodeId};
use fleetsim_scheduler::HostId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-local guest identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuestId(pub u64);

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// `Created -> Ready -> Running -> {Completed | Failed | Terminated}`.
/// A guest that never started can only be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestState {
    Created,
    Ready,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl GuestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GuestState::Completed | GuestState::Failed | GuestState::Terminated
        )
    }

    pub fn can_transition(&self, to: GuestState) -> bool {
        use GuestState::*;
        matches!(
            (self, to),
            (Created, Ready)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Created, Terminated)
                | (Ready, Terminated)
                | (Running, Terminated)
        )
    }
}

/// Resources a guest asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestSpec {
    pub name: String,
    pub cores: u32,
    pub memory_mb: u64,
    /// Task this guest runs, if it was placed by the compute service.
    pub task_id: Option<u64>,
}

impl GuestSpec {
    pub fn new(name: impl Into<String>, cores: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            cores,
            memory_mb,
            task_id: None,
        }
    }

    pub fn for_task(mut self, task_id: u64) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Guest {
    pub id: GuestId,
    pub host: HostId,
    pub spec: GuestSpec,
    pub state: GuestState,
    /// CPU demand last requested, in MHz.
    pub demand_mhz: f64,
    pub(crate) sink: Option<NodeId>,
    pub created_ms: u64,
    pub started_ms: Option<u64>,
}

impl Guest {
    pub(crate) fn new(id: GuestId, host: HostId, spec: GuestSpec, now_ms: u64) -> Self {
        Self {
            id,
            host,
            spec,
            state: GuestState::Created,
            demand_mhz: 0.0,
            sink: None,
            created_ms: now_ms,
            started_ms: None,
        }
    }

    /// Whether the guest still holds a reservation on its host.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// Final record of a guest that left its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestExit {
    pub guest: GuestId,
    pub host: HostId,
    pub name: String,
    pub task_id: Option<u64>,
    pub state: GuestState,
    pub counters: FlowCounters,
    pub started_ms: Option<u64>,
    pub ended_ms: u64,
}
