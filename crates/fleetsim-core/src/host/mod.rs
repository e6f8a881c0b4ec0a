//! Host resource model: machines, their guests, and host telemetry.

mod guest;
mod interference;
mod machine;
mod sim_host;

pub use guest::{Guest, GuestExit, GuestId, GuestSpec, GuestState};
pub use interference::{InterferenceGroup, InterferenceModel};
pub use machine::{HostSpec, MachineModel};
pub use sim_host::{HostEvent, HostListener, HostState, HostStats, SimHost};
