//! Trace-replay placement policy.
//!
//! Replays historical placements: a lookup table built offline maps each
//! workload name to the cluster it ran on, and the policy picks the host in
//! that cluster with the most available memory. Unknown workloads and empty
//! clusters fall back to the whole pool.

use crate::traits::*;
use std::collections::HashMap;
use tracing::info;

/// Replay scheduler.
pub struct ReplayScheduler {
    hosts: Vec<HostView>,
    /// workload name -> cluster name.
    table: HashMap<String, String>,
    fallbacks: u64,
}

impl ReplayScheduler {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self {
            hosts: Vec::new(),
            table,
            fallbacks: 0,
        }
    }
}

impl ComputeScheduler for ReplayScheduler {
    fn add_host(&mut self, host: HostView) {
        match self.hosts.iter_mut().find(|h| h.id == host.id) {
            Some(existing) => *existing = host,
            None => self.hosts.push(host),
        }
    }

    fn remove_host(&mut self, host: HostId) -> Option<HostView> {
        let pos = self.hosts.iter().position(|h| h.id == host)?;
        Some(self.hosts.remove(pos))
    }

    fn select(&mut self, request: &SchedulingRequest) -> Option<HostView> {
        let cluster = self.table.get(&request.name);
        if let Some(cluster) = cluster {
            let in_cluster = self.hosts.iter().filter(|h| &h.cluster == cluster);
            if let Some(best) = max_available_memory(in_cluster) {
                return Some(best.clone());
            }
        }

        self.fallbacks += 1;
        info!(
            task = %request.name,
            cluster = cluster.map(String::as_str).unwrap_or("<unmapped>"),
            "replay cluster has no hosts, falling back to the whole pool"
        );
        max_available_memory(&self.hosts).cloned()
    }

    fn host(&self, id: HostId) -> Option<&HostView> {
        self.hosts.iter().find(|h| h.id == id)
    }

    fn len(&self) -> usize {
        self.hosts.len()
    }

    fn name(&self) -> &str {
        "replay"
    }

    fn custom_metrics(&self) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("replay_fallbacks".to_string(), self.fallbacks as f64);
        m
    }
}
