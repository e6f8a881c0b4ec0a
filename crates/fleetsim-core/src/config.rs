//! TOML configuration parsing for fleetsim.
//!
//! Defines the complete configuration schema for a simulation run: the host
//! inventory, the placement policy, the synthetic workload, interference
//! groups and scripted host failures.

use crate::error::SimError;
use crate::host::{HostSpec, InterferenceGroup, InterferenceModel, MachineModel};
use crate::power::PowerModel;
use crate::workload::SyntheticWorkload;
use fleetsim_scheduler::filters::{available_filters, default_filters};
use fleetsim_scheduler::weighers::{available_weighers, RamWeigher};
use fleetsim_scheduler::{
    available_schedulers, filter_by_name, weigher_by_name, ComputeScheduler, FilterParams,
    FilterScheduler, HostFilter, HostWeigher, MemorizingScheduler, ReplayScheduler,
    TwoChoiceScheduler,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Simulation failed: {0}")]
    Simulation(#[from] SimError),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    pub hosts: Vec<HostGroup>,
    #[serde(default)]
    pub workload: SyntheticWorkload,
    #[serde(default)]
    pub interference: Vec<InterferenceGroup>,
    #[serde(default)]
    pub failures: Vec<FailureInjection>,
}

/// General simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Human-readable name for this simulation.
    #[serde(default = "default_sim_name")]
    pub name: String,
    /// Random seed for reproducibility.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Telemetry sampling period.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_sim_name() -> String {
    "simulation".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_sample_interval_ms() -> u64 {
    300_000
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            seed: default_seed(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

/// One weigher of the filter policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeigherEntry {
    pub name: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

/// Placement policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// One of `filter`, `memorizing`, `two_choice`, `replay`.
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Filter chain, in order. Empty means compute + vcpu + ram.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Weighers of the `filter` policy. Empty means a spreading RAM weigher.
    #[serde(default)]
    pub weighers: Vec<WeigherEntry>,
    #[serde(default = "default_allocation_ratio")]
    pub cpu_allocation_ratio: f64,
    #[serde(default = "default_allocation_ratio")]
    pub ram_allocation_ratio: f64,
    /// Skip budget of a queued request under the `memorizing` policy.
    #[serde(default = "default_max_times_skipped")]
    pub max_times_skipped: u32,
    /// Bucket bound of the `memorizing` policy and limit of the
    /// `instance_count` filter.
    #[serde(default = "default_max_instances")]
    pub max_instances_per_host: u32,
    /// Workload name -> cluster name, for the `replay` policy.
    #[serde(default)]
    pub replay_table: HashMap<String, String>,
}

fn default_policy() -> String {
    "filter".to_string()
}
fn default_allocation_ratio() -> f64 {
    1.0
}
fn default_max_times_skipped() -> u32 {
    7
}
fn default_max_instances() -> u32 {
    200
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            filters: Vec::new(),
            weighers: Vec::new(),
            cpu_allocation_ratio: default_allocation_ratio(),
            ram_allocation_ratio: default_allocation_ratio(),
            max_times_skipped: default_max_times_skipped(),
            max_instances_per_host: default_max_instances(),
            replay_table: HashMap::new(),
        }
    }
}

impl SchedulerSection {
    pub fn filter_params(&self) -> FilterParams {
        FilterParams {
            cpu_allocation_ratio: self.cpu_allocation_ratio,
            ram_allocation_ratio: self.ram_allocation_ratio,
            max_instances: self.max_instances_per_host,
        }
    }

    fn filter_chain(&self) -> Result<Vec<Box<dyn HostFilter>>, ConfigError> {
        let params = self.filter_params();
        if self.filters.is_empty() {
            return Ok(default_filters(&params));
        }
        self.filters
            .iter()
            .map(|name| {
                filter_by_name(name, &params)
                    .ok_or_else(|| ConfigError::Validation(format!("Unknown filter: {}", name)))
            })
            .collect()
    }

    fn weigher_list(&self) -> Result<Vec<Box<dyn HostWeigher>>, ConfigError> {
        if self.weighers.is_empty() {
            return Ok(vec![Box::new(RamWeigher::new(1.0))]);
        }
        let params = self.filter_params();
        self.weighers
            .iter()
            .map(|w| {
                weigher_by_name(&w.name, w.multiplier, &params)
                    .ok_or_else(|| ConfigError::Validation(format!("Unknown weigher: {}", w.name)))
            })
            .collect()
    }

    /// Build the configured policy.
    pub fn build(&self, seed: u64) -> Result<Box<dyn ComputeScheduler>, ConfigError> {
        self.build_policy(&self.policy, seed)
    }

    /// Build `policy` with this section's tunables.
    pub fn build_policy(
        &self,
        policy: &str,
        seed: u64,
    ) -> Result<Box<dyn ComputeScheduler>, ConfigError> {
        let scheduler: Box<dyn ComputeScheduler> = match policy {
            "filter" => Box::new(FilterScheduler::new(
                self.filter_chain()?,
                self.weigher_list()?,
            )),
            "memorizing" => Box::new(MemorizingScheduler::new(
                self.filter_chain()?,
                self.max_times_skipped,
                self.max_instances_per_host,
                seed,
            )),
            "two_choice" => Box::new(TwoChoiceScheduler::new(self.filter_chain()?, seed)),
            "replay" => Box::new(ReplayScheduler::new(self.replay_table.clone())),
            other => {
                return Err(ConfigError::Validation(format!(
                    "Unknown scheduler policy: {} (available: {})",
                    other,
                    available_schedulers().join(", ")
                )))
            }
        };
        Ok(scheduler)
    }
}

/// A group of identical hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostGroup {
    #[serde(default = "default_host_count")]
    pub count: u32,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    pub cores: u32,
    pub core_speed_mhz: f64,
    pub memory_mb: u64,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// vCPUs a host may run per physical core.
    #[serde(default = "default_vcpu_overcommit")]
    pub vcpu_overcommit: f64,
    #[serde(default)]
    pub power_model: PowerModel,
}

fn default_host_count() -> u32 {
    1
}
fn default_cluster() -> String {
    "default".to_string()
}
fn default_architecture() -> String {
    "x86_64".to_string()
}
fn default_vcpu_overcommit() -> f64 {
    1.0
}

impl HostGroup {
    /// Specs of every host of the group, named `<cluster>-<n>` with `n`
    /// counted from `first`.
    pub fn specs(&self, first: usize) -> Vec<HostSpec> {
        (0..self.count as usize)
            .map(|i| {
                let mut model = MachineModel::new(self.cores, self.core_speed_mhz, self.memory_mb);
                model.architecture = self.architecture.clone();
                HostSpec::new(format!("{}-{}", self.cluster, first + i), model)
                    .with_cluster(self.cluster.clone())
                    .with_vcpu_overcommit(self.vcpu_overcommit)
                    .with_power_model(self.power_model.clone())
            })
            .collect()
    }
}

/// A scripted host failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailureInjection {
    /// Host index, in declaration order across all groups.
    pub host: u32,
    pub at_ms: u64,
    /// Time until the host recovers. Absent means it stays down.
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Every host spec, in declaration order.
    pub fn host_specs(&self) -> Vec<HostSpec> {
        let mut specs = Vec::new();
        for group in &self.hosts {
            let first = specs.len();
            specs.extend(group.specs(first));
        }
        specs
    }

    pub fn host_count(&self) -> u32 {
        self.hosts.iter().map(|g| g.count).sum()
    }

    pub fn interference_model(&self) -> InterferenceModel {
        InterferenceModel::new(self.interference.clone())
    }

    /// Validate configuration consistency.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.host_count() == 0 {
            return Err(ConfigError::Validation(
                "at least one host is required".to_string(),
            ));
        }
        if self.simulation.sample_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "sample_interval_ms must be > 0".to_string(),
            ));
        }
        for group in &self.hosts {
            if group.cores == 0 {
                return Err(ConfigError::Validation(format!(
                    "hosts in cluster {} must have cores > 0",
                    group.cluster
                )));
            }
            if group.core_speed_mhz <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "hosts in cluster {} must have core_speed_mhz > 0",
                    group.cluster
                )));
            }
            if group.vcpu_overcommit < 1.0 {
                return Err(ConfigError::Validation(format!(
                    "hosts in cluster {} must have vcpu_overcommit >= 1",
                    group.cluster
                )));
            }
            group
                .power_model
                .validate()
                .map_err(ConfigError::Validation)?;
        }

        let sched = &self.scheduler;
        if !available_schedulers().contains(&sched.policy.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Unknown scheduler policy: {}",
                sched.policy
            )));
        }
        if let Some(name) = sched
            .filters
            .iter()
            .find(|f| !available_filters().contains(&f.as_str()))
        {
            return Err(ConfigError::Validation(format!("Unknown filter: {}", name)));
        }
        if let Some(w) = sched
            .weighers
            .iter()
            .find(|w| !available_weighers().contains(&w.name.as_str()))
        {
            return Err(ConfigError::Validation(format!("Unknown weigher: {}", w.name)));
        }
        if sched.cpu_allocation_ratio <= 0.0 || sched.ram_allocation_ratio <= 0.0 {
            return Err(ConfigError::Validation(
                "allocation ratios must be > 0".to_string(),
            ));
        }
        if sched.max_instances_per_host == 0 {
            return Err(ConfigError::Validation(
                "max_instances_per_host must be > 0".to_string(),
            ));
        }

        self.workload.validate().map_err(ConfigError::Validation)?;

        for group in &self.interference {
            if !(0.0..=1.0).contains(&group.score) || !(0.0..=1.0).contains(&group.target_load) {
                return Err(ConfigError::Validation(
                    "interference score and target_load must be in [0, 1]".to_string(),
                ));
            }
        }

        let hosts = self.host_count();
        if let Some(f) = self.failures.iter().find(|f| f.host >= hosts) {
            return Err(ConfigError::Validation(format!(
                "failure injection names host {} but only {} hosts exist",
                f.host, hosts
            )));
        }
        Ok(())
    }
}
