//! Placement policies for fleetsim.
//!
//! This crate provides the [`ComputeScheduler`] trait and the built-in
//! policies that decide which simulated host runs which workload:
//!
//! | Policy | Strategy | Best For |
//! |--------|----------|----------|
//! | [`FilterScheduler`] | Filter chain + weighted score | Production-like placement |
//! | [`MemorizingScheduler`] | Instance-count buckets, random sampling | Large pools, fast decisions |
//! | [`TwoChoiceScheduler`] | Power of two random choices | Very large pools |
//! | [`ReplayScheduler`] | Historical cluster lookup | Reproducing a recorded trace |
//!
//! Policies hold their own [`HostView`] pool; they never mutate a host. The
//! caller realizes a placement and then refreshes the view.

pub mod filter_scheduler;
pub mod filters;
pub mod memorizing;
pub mod replay;
pub mod traits;
pub mod two_choice;
pub mod weighers;

pub use filter_scheduler::FilterScheduler;
pub use filters::{filter_by_name, FilterParams, HostFilter};
pub use memorizing::MemorizingScheduler;
pub use replay::ReplayScheduler;
pub use traits::*;
pub use two_choice::TwoChoiceScheduler;
pub use weighers::{weigher_by_name, HostWeigher};

use std::collections::HashMap;

/// Create a placement policy with default settings by name.
pub fn scheduler_by_name(name: &str, seed: u64) -> Option<Box<dyn ComputeScheduler>> {
    match name {
        "filter" => Some(Box::new(FilterScheduler::with_defaults())),
        "memorizing" => Some(Box::new(MemorizingScheduler::with_seed(seed))),
        "two_choice" => Some(Box::new(TwoChoiceScheduler::with_seed(seed))),
        "replay" => Some(Box::new(ReplayScheduler::new(HashMap::new()))),
        _ => None,
    }
}

/// List all available built-in policy names.
pub fn available_schedulers() -> Vec<&'static str> {
    vec!["filter", "memorizing", "two_choice", "replay"]
}
