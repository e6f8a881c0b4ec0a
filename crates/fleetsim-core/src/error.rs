//! Error types for the simulation core.
//!
//! All fallible core APIs return `Result<T, SimError>`. The variants fall
//! into three classes that callers treat differently:
//!
//! - **kernel-fatal** ([`SimError::is_kernel_fatal`]): the run cannot go on
//!   (clock regression, double termination, flow conservation violation,
//!   broken kernel bookkeeping). Returned from anywhere, these stop `run()`.
//! - **contract violations** ([`SimError::is_contract_violation`]): the
//!   caller did something that can never succeed (closed port, foreign
//!   channel, duplicate name, a task larger than every host). Fail fast,
//!   never retry.
//! - everything else is local to the operation or process that raised it.
//!
//! A scheduler answering "no host fits right now" is not an error at all;
//! it is a `None` from `select`.

use crate::flow::NodeId;
use crate::host::{GuestId, GuestState, HostState};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    // Kernel
    #[error("process name `{0}` is already registered")]
    DuplicateName(String),
    #[error("kernel has been terminated")]
    Terminated,
    #[error("kernel was already terminated")]
    AlreadyTerminated,
    #[error("event at T={event_ms} precedes the virtual clock at T={now_ms}")]
    ClockRegression { event_ms: u64, now_ms: u64 },
    #[error("cannot schedule at T={requested_ms} when the clock is at T={now_ms}")]
    NonCausal { requested_ms: u64, now_ms: u64 },
    #[error("process {0} does not exist")]
    UnknownProcess(usize),
    #[error("kernel bookkeeping error: {0}")]
    Internal(String),

    // Channels
    #[error("channel reference is not registered with this kernel")]
    InvalidReference,
    #[error("port is closed")]
    PortClosed,
    #[error("message does not belong to this port or has the wrong type")]
    MessageMismatch,

    // Flow graph
    #[error("flow node {0} does not exist")]
    UnknownNode(NodeId),
    #[error("flow node {node} is not a {expected}")]
    WrongNodeKind { node: NodeId, expected: &'static str },
    #[error("flow node {0} is already connected")]
    AlreadyConnected(NodeId),
    #[error("invalid flow rate {0}")]
    InvalidRate(f64),
    #[error("node {node} granted {granted} out of a supply of {supply}")]
    ConservationViolation {
        node: NodeId,
        granted: f64,
        supply: f64,
    },

    // Hosts and guests
    #[error("host {0} not found")]
    HostNotFound(u32),
    #[error("guest {guest} not found on host {host}")]
    GuestNotFound { host: u32, guest: GuestId },
    #[error("host {host} cannot go from {from:?} to {to:?}")]
    InvalidHostTransition {
        host: u32,
        from: HostState,
        to: HostState,
    },
    #[error("guest {guest} cannot go from {from:?} to {to:?}")]
    InvalidGuestTransition {
        guest: GuestId,
        from: GuestState,
        to: GuestState,
    },
    #[error("host {host} cannot fit {cores} cores / {memory_mb} MB")]
    InsufficientCapacity { host: u32, cores: u32, memory_mb: u64 },
    #[error("task {task} needs {cores} cores / {memory_mb} MB, more than any host has")]
    NeverFits { task: u64, cores: u32, memory_mb: u64 },

    // Processes
    #[error("process failed: {0}")]
    Process(String),
}

impl SimError {
    /// Whether this error must stop the whole run.
    pub fn is_kernel_fatal(&self) -> bool {
        matches!(
            self,
            SimError::ClockRegression { .. }
                | SimError::AlreadyTerminated
                | SimError::ConservationViolation { .. }
                | SimError::Internal(_)
        )
    }

    /// Whether this error is a programming-contract violation that retrying
    /// can never fix.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SimError::DuplicateName(_)
                | SimError::NonCausal { .. }
                | SimError::InvalidReference
                | SimError::PortClosed
                | SimError::MessageMismatch
                | SimError::NeverFits { .. }
        )
    }
}
