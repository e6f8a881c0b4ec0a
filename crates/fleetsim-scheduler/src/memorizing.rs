//! Bucketed load-balancing placement policy ("memorizing").
//!
//! Hosts are partitioned into buckets by instance count: bucket `i` holds the
//! hosts currently running exactly `i` guests. A request samples one host at
//! random from the lowest non-empty bucket; when the sample fails the filters
//! the request's skip counter is bumped. Once a request has been skipped
//! `max_times_skipped` times the policy stops sampling and scans the buckets
//! from the lowest upward for any host that satisfies it.
//!
//! A successful placement moves the host from bucket `i` to bucket `i + 1`
//! with a swap-remove, so bookkeeping is O(1). Hosts that reach the
//! configured instance bound park in the last bucket and are never sampled.

use crate::filters::{default_filters, FilterParams, HostFilter};
use crate::traits::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, VecDeque};

/// Default bound on guests per host, i.e. the number of usable buckets.
pub const DEFAULT_MAX_INSTANCES: u32 = 200;

/// Bucketed load-balancing scheduler.
pub struct MemorizingScheduler {
    filters: Vec<Box<dyn HostFilter>>,
    views: HashMap<HostId, HostView>,
    /// `buckets[i]` holds the hosts running `i` guests; the last bucket is
    /// the saturation bucket.
    buckets: Vec<Vec<HostId>>,
    max_times_skipped: u32,
    rng: ChaCha8Rng,
    /// Requests that fell back to the exhaustive scan.
    exhaustive_scans: u64,
}

impl MemorizingScheduler {
    pub fn new(
        filters: Vec<Box<dyn HostFilter>>,
        max_times_skipped: u32,
        max_instances: u32,
        seed: u64,
    ) -> Self {
        Self {
            filters,
            views: HashMap::new(),
            buckets: vec![Vec::new(); max_instances as usize + 1],
            max_times_skipped,
            rng: ChaCha8Rng::seed_from_u64(seed),
            exhaustive_scans: 0,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        let params = FilterParams::default();
        Self::new(default_filters(&params), 7, DEFAULT_MAX_INSTANCES, seed)
    }

    /// Hosts per bucket, lowest bucket first.
    pub fn buckets(&self) -> &[Vec<HostId>] {
        &self.buckets
    }

    fn saturation_bucket(&self) -> usize {
        self.buckets.len() - 1
    }

    fn bucket_for(&self, instance_count: u32) -> usize {
        (instance_count as usize).min(self.saturation_bucket())
    }

    fn lowest_non_empty(&self) -> Option<usize> {
        (0..self.saturation_bucket()).find(|&b| !self.buckets[b].is_empty())
    }

    fn passes(&self, id: HostId, request: &SchedulingRequest) -> bool {
        match self.views.get(&id) {
            Some(view) => self.filters.iter().all(|f| f.test(view, request)),
            None => false,
        }
    }

    /// Remove `id` from its bucket, fixing up the element swapped into its slot.
    fn detach(&mut self, id: HostId) {
        let Some(view) = self.views.get(&id) else {
            return;
        };
        let (bucket, index) = (view.priority_index, view.list_index);
        self.buckets[bucket].swap_remove(index);
        if let Some(&moved) = self.buckets[bucket].get(index) {
            if let Some(moved_view) = self.views.get_mut(&moved) {
                moved_view.list_index = index;
            }
        }
    }

    fn attach(&mut self, id: HostId) {
        let Some(count) = self.views.get(&id).map(|v| v.instance_count) else {
            return;
        };
        let bucket = self.bucket_for(count);
        self.buckets[bucket].push(id);
        let index = self.buckets[bucket].len() - 1;
        if let Some(view) = self.views.get_mut(&id) {
            view.priority_index = bucket;
            view.list_index = index;
        }
    }

    /// Sample one host from the lowest non-empty bucket.
    fn sample(&mut self, request: &SchedulingRequest) -> Option<HostId> {
        let bucket = self.lowest_non_empty()?;
        let index = self.rng.gen_range(0..self.buckets[bucket].len());
        let id = self.buckets[bucket][index];
        self.passes(id, request).then_some(id)
    }

    /// Scan every usable bucket from the lowest upward, not only the lowest,
    /// so `None` means no unsaturated host fits at all.
    fn scan(&mut self, request: &SchedulingRequest) -> Option<HostId> {
        self.exhaustive_scans += 1;
        let lowest = self.lowest_non_empty()?;
        (lowest..self.saturation_bucket())
            .flat_map(|b| self.buckets[b].iter().copied())
            .find(|&id| self.passes(id, request))
    }

    fn try_place(&mut self, request: &SchedulingRequest, skipped: u32) -> Option<HostId> {
        if skipped >= self.max_times_skipped {
            self.scan(request)
        } else {
            self.sample(request)
        }
    }

    /// Move the host up one bucket and record the reservation.
    fn commit(&mut self, id: HostId, request: &SchedulingRequest) -> Option<HostView> {
        self.detach(id);
        let view = self.views.get_mut(&id)?;
        view.reserve(request);
        self.attach(id);
        self.views.get(&id).cloned()
    }
}

impl ComputeScheduler for MemorizingScheduler {
    fn add_host(&mut self, host: HostView) {
        let id = host.id;
        if self.views.contains_key(&id) {
            self.detach(id);
        }
        self.views.insert(id, host);
        self.attach(id);
    }

    fn remove_host(&mut self, host: HostId) -> Option<HostView> {
        self.detach(host);
        self.views.remove(&host)
    }

    fn select(&mut self, request: &SchedulingRequest) -> Option<HostView> {
        let mut skipped = request.times_skipped;
        loop {
            if let Some(id) = self.try_place(request, skipped) {
                return self.commit(id, request);
            }
            if skipped >= self.max_times_skipped {
                return None;
            }
            skipped += 1;
        }
    }

    fn select_from(&mut self, queue: &mut VecDeque<SchedulingRequest>) -> Option<Placement> {
        if self.lowest_non_empty().is_none() {
            return None;
        }
        let mut i = 0;
        while i < queue.len() {
            let skipped = queue[i].times_skipped;
            if let Some(id) = self.try_place(&queue[i], skipped) {
                let request = queue.remove(i)?;
                let host = self.commit(id, &request)?;
                return Some(Placement { host, request });
            }
            if skipped >= self.max_times_skipped {
                // This request used up its skip budget and nothing fits it;
                // it blocks the rest of the queue.
                return None;
            }
            queue[i].times_skipped += 1;
            i += 1;
        }
        None
    }

    fn host(&self, id: HostId) -> Option<&HostView> {
        self.views.get(&id)
    }

    fn len(&self) -> usize {
        self.views.len()
    }

    fn name(&self) -> &str {
        "memorizing"
    }

    fn custom_metrics(&self) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("exhaustive_scans".to_string(), self.exhaustive_scans as f64);
        m
    }
}
