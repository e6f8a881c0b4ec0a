//! Host weighers.
//!
//! Weighers score the hosts that survived filtering. Raw scores are min-max
//! normalized across the candidates and then multiplied by the weigher's
//! coefficient, so a negative multiplier turns "more is better" into
//! "less is better".

use crate::filters::FilterParams;
use crate::traits::*;

/// Scores a host for a request. Higher raw values are preferred when the
/// multiplier is positive.
pub trait HostWeigher {
    fn weigh(&self, host: &HostView, request: &SchedulingRequest) -> f64;

    fn multiplier(&self) -> f64;

    fn name(&self) -> &str;
}

/// Prefers hosts with more free memory (spreading).
pub struct RamWeigher {
    multiplier: f64,
}

impl RamWeigher {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }
}

impl HostWeigher for RamWeigher {
    fn weigh(&self, host: &HostView, _request: &SchedulingRequest) -> f64 {
        host.available_memory_mb as f64
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn name(&self) -> &str {
        "ram"
    }
}

/// Prefers hosts with more free memory per core.
pub struct CoreRamWeigher {
    multiplier: f64,
}

impl CoreRamWeigher {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }
}

impl HostWeigher for CoreRamWeigher {
    fn weigh(&self, host: &HostView, _request: &SchedulingRequest) -> f64 {
        host.available_memory_mb as f64 / host.cores.max(1) as f64
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn name(&self) -> &str {
        "core_ram"
    }
}

/// Prefers hosts with more unprovisioned vCPUs.
pub struct VCpuWeigher {
    allocation_ratio: f64,
    multiplier: f64,
}

impl VCpuWeigher {
    pub fn new(allocation_ratio: f64, multiplier: f64) -> Self {
        Self {
            allocation_ratio,
            multiplier,
        }
    }
}

impl HostWeigher for VCpuWeigher {
    fn weigh(&self, host: &HostView, _request: &SchedulingRequest) -> f64 {
        host.cores as f64 * self.allocation_ratio - host.provisioned_cores as f64
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn name(&self) -> &str {
        "vcpu"
    }
}

/// Scores by instance count; use a negative multiplier to prefer idle hosts.
pub struct InstanceCountWeigher {
    multiplier: f64,
}

impl InstanceCountWeigher {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }
}

impl HostWeigher for InstanceCountWeigher {
    fn weigh(&self, host: &HostView, _request: &SchedulingRequest) -> f64 {
        host.instance_count as f64
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn name(&self) -> &str {
        "instance_count"
    }
}

/// Create a weigher by name.
pub fn weigher_by_name(
    name: &str,
    multiplier: f64,
    params: &FilterParams,
) -> Option<Box<dyn HostWeigher>> {
    match name {
        "ram" => Some(Box::new(RamWeigher::new(multiplier))),
        "core_ram" => Some(Box::new(CoreRamWeigher::new(multiplier))),
        "vcpu" => Some(Box::new(VCpuWeigher::new(
            params.cpu_allocation_ratio,
            multiplier,
        ))),
        "instance_count" => Some(Box::new(InstanceCountWeigher::new(multiplier))),
        _ => None,
    }
}

/// List all built-in weigher names.
pub fn available_weighers() -> Vec<&'static str> {
    vec!["ram", "core_ram", "vcpu", "instance_count"]
}

/// Weighted, normalized score of every candidate, in candidate order.
pub fn weighted_scores(
    weighers: &[Box<dyn HostWeigher>],
    candidates: &[&HostView],
    request: &SchedulingRequest,
) -> Vec<f64> {
    let mut scores = vec![0.0; candidates.len()];
    for weigher in weighers {
        let raw: Vec<f64> = candidates
            .iter()
            .map(|host| weigher.weigh(host, request))
            .collect();
        let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
        let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        for (score, value) in scores.iter_mut().zip(&raw) {
            let normalized = if range > 0.0 { (value - min) / range } else { 0.0 };
            *score += weigher.multiplier() * normalized;
        }
    }
    scores
}
