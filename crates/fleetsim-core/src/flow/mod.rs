//! Resource-flow engine: how CPU (and power) capacity is produced, shared
//! and consumed.

mod distributor;
mod graph;

pub use distributor::max_min_fair;
pub use graph::{FlowCounters, FlowGraph, FlowStats, NodeId, NodeKind};
