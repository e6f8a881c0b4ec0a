//! fleetsim — Discrete-event simulator for datacenter compute placement.
//!
//! This crate provides the simulation core: a single-threaded event kernel
//! with logical processes and conflated channels, a resource-flow engine
//! that shares host CPU max-min fairly between guests, a host and guest
//! lifecycle model with power accounting, and a compute service that places
//! tasks through a policy from `fleetsim-scheduler`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────┐     ┌──────────────┐
//! │ Workload │────▶│  Kernel   │────▶│  Telemetry   │
//! │ (Tasks)  │     │ (Events)  │     │  & Reports   │
//! └──────────┘     └─────┬─────┘     └──────────────┘
//!                        │
//!                ┌───────┴───────┐
//!                │Compute service│
//!                │  (Scheduler)  │
//!                └───────┬───────┘
//!                        │
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │  Host 0  │  │  Host 1  │  │  Host N  │
//!    │  Guests  │  │  Guests  │  │  Guests  │
//!    │ CPU flow │  │ CPU flow │  │ CPU flow │
//!    └──────────┘  └──────────┘  └──────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod flow;
pub mod host;
pub mod kernel;
pub mod metrics;
pub mod power;
pub mod service;
pub mod simulation;
pub mod telemetry;
pub mod workload;

// Re-export key types for convenience.
pub use clock::SimClock;
pub use config::{ConfigError, SimConfig};
pub use error::SimError;
pub use flow::{FlowCounters, FlowGraph, NodeId};
pub use host::{GuestId, GuestSpec, GuestState, HostSpec, HostState, MachineModel, SimHost};
pub use kernel::{Behavior, Context, Kernel, ProcessId, Step, Wakeup};
pub use metrics::SimulationReport;
pub use power::{PowerMeter, PowerModel};
pub use service::{ComputeService, Datacenter, ServiceSignal, TaskState};
pub use simulation::Simulation;
pub use workload::{DemandTrace, Fragment, SyntheticWorkload, Task};

use tracing::warn;

/// Run a complete simulation of `config`, optionally overriding its policy.
pub fn run_simulation(
    config: &SimConfig,
    policy: Option<&str>,
) -> Result<SimulationReport, ConfigError> {
    let policy = policy.unwrap_or(config.scheduler.policy.as_str());
    let sim = Simulation::from_config_with_policy(config, policy)?;
    Ok(sim.run()?)
}

/// Run the same config under several policies. Policies that cannot be
/// built or whose run fails are skipped with a warning.
pub fn compare_schedulers(config: &SimConfig, policies: &[&str]) -> Vec<SimulationReport> {
    policies
        .iter()
        .filter_map(|name| match run_simulation(config, Some(*name)) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(policy = *name, error = %err, "skipping policy");
                None
            }
        })
        .collect()
}
