//! Host filters.
//!
//! A filter is a pure predicate over `(host, request)`. The filter-based
//! policies run every candidate through an ordered chain of filters and drop
//! the host as soon as one of them returns `false`.

use crate::traits::*;

/// Tunables shared by the built-in filters and weighers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    /// vCPUs that may be provisioned per physical core.
    pub cpu_allocation_ratio: f64,
    /// Memory that may be reserved per MB of physical memory.
    pub ram_allocation_ratio: f64,
    /// Maximum number of guests per host.
    pub max_instances: u32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            cpu_allocation_ratio: 1.0,
            ram_allocation_ratio: 1.0,
            max_instances: 200,
        }
    }
}

/// A boolean predicate deciding whether a host may run a request.
pub trait HostFilter {
    fn test(&self, host: &HostView, request: &SchedulingRequest) -> bool;

    fn name(&self) -> &str;
}

/// Only hosts that are up.
pub struct ComputeFilter;

impl HostFilter for ComputeFilter {
    fn test(&self, host: &HostView, _request: &SchedulingRequest) -> bool {
        host.status == HostStatus::Up
    }

    fn name(&self) -> &str {
        "compute"
    }
}

/// Enough vCPUs left under the CPU allocation ratio.
pub struct VCpuFilter {
    allocation_ratio: f64,
}

impl VCpuFilter {
    pub fn new(allocation_ratio: f64) -> Self {
        Self { allocation_ratio }
    }
}

impl HostFilter for VCpuFilter {
    fn test(&self, host: &HostView, request: &SchedulingRequest) -> bool {
        // A guest can never be wider than the machine, whatever the ratio.
        if request.cores > host.cores {
            return false;
        }
        let limit = host.cores as f64 * self.allocation_ratio;
        (host.provisioned_cores + request.cores) as f64 <= limit
    }

    fn name(&self) -> &str {
        "vcpu"
    }
}

/// Enough memory left under the RAM allocation ratio.
pub struct RamFilter {
    allocation_ratio: f64,
}

impl RamFilter {
    pub fn new(allocation_ratio: f64) -> Self {
        Self { allocation_ratio }
    }
}

impl HostFilter for RamFilter {
    fn test(&self, host: &HostView, request: &SchedulingRequest) -> bool {
        let used = host.memory_mb.saturating_sub(host.available_memory_mb) as f64;
        let usable = host.memory_mb as f64 * self.allocation_ratio - used;
        usable >= request.memory_mb as f64
    }

    fn name(&self) -> &str {
        "ram"
    }
}

/// Host cores are at least as fast as the request's per-vCPU peak.
pub struct VCpuCapacityFilter;

impl HostFilter for VCpuCapacityFilter {
    fn test(&self, host: &HostView, request: &SchedulingRequest) -> bool {
        request.cpu_capacity_mhz <= host.core_speed_mhz
    }

    fn name(&self) -> &str {
        "vcpu_capacity"
    }
}

/// Caps the number of guests per host.
pub struct InstanceCountFilter {
    limit: u32,
}

impl InstanceCountFilter {
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }
}

impl HostFilter for InstanceCountFilter {
    fn test(&self, host: &HostView, _request: &SchedulingRequest) -> bool {
        host.instance_count < self.limit
    }

    fn name(&self) -> &str {
        "instance_count"
    }
}

/// Host has the architecture the request asks for.
pub struct ArchitectureFilter;

impl HostFilter for ArchitectureFilter {
    fn test(&self, host: &HostView, request: &SchedulingRequest) -> bool {
        match &request.architecture {
            Some(arch) => &host.architecture == arch,
            None => true,
        }
    }

    fn name(&self) -> &str {
        "architecture"
    }
}

/// Create a filter by name.
pub fn filter_by_name(name: &str, params: &FilterParams) -> Option<Box<dyn HostFilter>> {
    match name {
        "compute" => Some(Box::new(ComputeFilter)),
        "vcpu" => Some(Box::new(VCpuFilter::new(params.cpu_allocation_ratio))),
        "ram" => Some(Box::new(RamFilter::new(params.ram_allocation_ratio))),
        "vcpu_capacity" => Some(Box::new(VCpuCapacityFilter)),
        "instance_count" => Some(Box::new(InstanceCountFilter::new(params.max_instances))),
        "architecture" => Some(Box::new(ArchitectureFilter)),
        _ => None,
    }
}

/// List all built-in filter names.
pub fn available_filters() -> Vec<&'static str> {
    vec![
        "compute",
        "vcpu",
        "ram",
        "vcpu_capacity",
        "instance_count",
        "architecture",
    ]
}

/// The filter chain used when none is configured.
pub fn default_filters(params: &FilterParams) -> Vec<Box<dyn HostFilter>> {
    vec![
        Box::new(ComputeFilter),
        Box::new(VCpuFilter::new(params.cpu_allocation_ratio)),
        Box::new(RamFilter::new(params.ram_allocation_ratio)),
    ]
}
