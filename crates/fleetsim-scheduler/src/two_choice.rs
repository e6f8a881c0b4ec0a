//! Power-of-two-choices placement policy.
//!
//! Samples two distinct hosts uniformly at random and tries only the one
//! running fewer guests. There is no further search: if that host does not
//! pass the filters the request gets `None`, trading accuracy for O(1)
//! decisions.

use crate::filters::{default_filters, FilterParams, HostFilter};
use crate::traits::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Two-choice scheduler.
pub struct TwoChoiceScheduler {
    hosts: Vec<HostView>,
    filters: Vec<Box<dyn HostFilter>>,
    rng: ChaCha8Rng,
}

impl TwoChoiceScheduler {
    pub fn new(filters: Vec<Box<dyn HostFilter>>, seed: u64) -> Self {
        Self {
            hosts: Vec::new(),
            filters,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(default_filters(&FilterParams::default()), seed)
    }

    /// Index of the less loaded of two random hosts.
    fn pick(&mut self) -> Option<usize> {
        match self.hosts.len() {
            0 => None,
            1 => Some(0),
            n => {
                let a = self.rng.gen_range(0..n);
                let mut b = self.rng.gen_range(0..n - 1);
                if b >= a {
                    b += 1;
                }
                if self.hosts[b].instance_count < self.hosts[a].instance_count {
                    Some(b)
                } else {
                    Some(a)
                }
            }
        }
    }
}

impl ComputeScheduler for TwoChoiceScheduler {
    fn add_host(&mut self, host: HostView) {
        match self.hosts.iter_mut().find(|h| h.id == host.id) {
            Some(existing) => *existing = host,
            None => self.hosts.push(host),
        }
    }

    fn remove_host(&mut self, host: HostId) -> Option<HostView> {
        let pos = self.hosts.iter().position(|h| h.id == host)?;
        Some(self.hosts.swap_remove(pos))
    }

    fn select(&mut self, request: &SchedulingRequest) -> Option<HostView> {
        let idx = self.pick()?;
        let host = &self.hosts[idx];
        if self.filters.iter().all(|f| f.test(host, request)) {
            Some(host.clone())
        } else {
            None
        }
    }

    fn host(&self, id: HostId) -> Option<&HostView> {
        self.hosts.iter().find(|h| h.id == id)
    }

    fn len(&self) -> usize {
        self.hosts.len()
    }

    fn name(&self) -> &str {
        "two_choice"
    }
}
