//! Static description of simulated machines.

use crate::power::PowerModel;
use serde::{Deserialize, Serialize};

/// Physical resources of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineModel {
    pub cores: u32,
    /// Capacity of one core in MHz.
    pub core_speed_mhz: f64,
    pub memory_mb: u64,
    pub architecture: String,
}

impl MachineModel {
    pub fn new(cores: u32, core_speed_mhz: f64, memory_mb: u64) -> Self {
        Self {
            cores,
            core_speed_mhz,
            memory_mb,
            architecture: "x86_64".to_string(),
        }
    }

    /// Total CPU capacity in MHz.
    pub fn cpu_capacity_mhz(&self) -> f64 {
        self.cores as f64 * self.core_speed_mhz
    }
}

/// Everything needed to build a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub cluster: String,
    pub model: MachineModel,
    /// vCPUs that may be reserved per physical core.
    pub vcpu_overcommit: f64,
    pub power_model: PowerModel,
}

impl HostSpec {
    pub fn new(name: impl Into<String>, model: MachineModel) -> Self {
        Self {
            name: name.into(),
            cluster: "default".to_string(),
            model,
            vcpu_overcommit: 1.0,
            power_model: PowerModel::default(),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_vcpu_overcommit(mut self, ratio: f64) -> Self {
        self.vcpu_overcommit = ratio;
        self
    }

    pub fn with_power_model(mut self, model: PowerModel) -> Self {
        self.power_model = model;
        self
    }

    /// vCPUs the host can hand out in total.
    pub fn vcpu_limit(&self) -> u32 {
        (self.model.cores as f64 * self.vcpu_overcommit).floor() as u32
    }
}
