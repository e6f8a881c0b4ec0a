//! Filter + weigher placement policy.
//!
//! Runs every host through an ordered filter chain, scores the survivors with
//! an ordered list of weighers, and picks the highest score. Ties go to the
//! host registered first, so the decision is a pure function of the pool and
//! the request.

use crate::filters::{default_filters, FilterParams, HostFilter};
use crate::traits::*;
use crate::weighers::{weighted_scores, HostWeigher, RamWeigher};

/// Filter + weigher scheduler.
pub struct FilterScheduler {
    /// Flat host list in registration order.
    hosts: Vec<HostView>,
    filters: Vec<Box<dyn HostFilter>>,
    weighers: Vec<Box<dyn HostWeigher>>,
}

impl FilterScheduler {
    pub fn new(filters: Vec<Box<dyn HostFilter>>, weighers: Vec<Box<dyn HostWeigher>>) -> Self {
        Self {
            hosts: Vec::new(),
            filters,
            weighers,
        }
    }

    /// Compute/vCPU/RAM filters with a spreading RAM weigher.
    pub fn with_defaults() -> Self {
        let params = FilterParams::default();
        Self::new(default_filters(&params), vec![Box::new(RamWeigher::new(1.0))])
    }

    fn passes(&self, host: &HostView, request: &SchedulingRequest) -> bool {
        self.filters.iter().all(|f| f.test(host, request))
    }
}

impl Default for FilterScheduler {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ComputeScheduler for FilterScheduler {
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

    fn update_host(&mut self, host: HostView) {
        // Keep the registration order stable; it breaks weigher ties.
        if let Some(existing) = self.hosts.iter_mut().find(|h| h.id == host.id) {
            *existing = host;
        }
    }

    fn select(&mut self, request: &SchedulingRequest) -> Option<HostView> {
        let candidates: Vec<&HostView> = self
            .hosts
            .iter()
            .filter(|h| self.passes(h, request))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let scores = weighted_scores(&self.weighers, &candidates, request);
        let mut best = 0;
        for (i, score) in scores.iter().enumerate() {
            if *score > scores[best] {
                best = i;
            }
        }
        Some(candidates[best].clone())
    }

    fn host(&self, id: HostId) -> Option<&HostView> {
        self.hosts.iter().find(|h| h.id == id)
    }

    fn len(&self) -> usize {
        self.hosts.len()
    }

    fn name(&self) -> &str {
        "filter"
    }
}
