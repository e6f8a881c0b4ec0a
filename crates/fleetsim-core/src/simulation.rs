//! Assembly of a complete datacenter simulation.
//!
//! A [`Simulation`] wires a [`Datacenter`] into a kernel, starts the compute
//! service, turns task submissions and host failures into timed kernel
//! actions, and runs the telemetry sampler until everything has drained.

use crate::config::{ConfigError, SimConfig};
use crate::error::SimError;
use crate::host::HostSpec;
use crate::kernel::{Kernel, KernelStats};
use crate::metrics::SimulationReport;
use crate::service::{poke, submit_task, ComputeService, Datacenter, ServiceSignal};
use crate::telemetry::TelemetrySampler;
use crate::workload::Task;
use fleetsim_scheduler::{ComputeScheduler, HostId};
use tracing::info;

pub const COMPUTE_SERVICE: &str = "/compute";
pub const TELEMETRY: &str = "/telemetry";

/// A datacenter simulation ready to run.
pub struct Simulation {
    kernel: Kernel<Datacenter>,
    name: String,
    sample_interval_ms: u64,
}

impl Simulation {
    /// An empty datacenter managed by `scheduler`.
    pub fn new(name: &str, scheduler: Box<dyn ComputeScheduler>) -> Result<Self, SimError> {
        Self::with_datacenter(name, Datacenter::new(scheduler))
    }

    pub fn with_datacenter(name: &str, datacenter: Datacenter) -> Result<Self, SimError> {
        let mut kernel = Kernel::new(datacenter);
        let channel = kernel.open::<ServiceSignal>();
        kernel.world_mut().set_signals(channel.send);
        kernel.spawn(
            ComputeService::new(channel.receive, channel.send),
            COMPUTE_SERVICE,
        )?;
        Ok(Self {
            kernel,
            name: name.to_string(),
            sample_interval_ms: 300_000,
        })
    }

    /// Build the simulation a config describes, with its configured policy.
    pub fn from_config(config: &SimConfig) -> Result<Self, ConfigError> {
        Self::from_config_with_policy(config, &config.scheduler.policy)
    }

    /// Build the simulation a config describes, placing with `policy`.
    pub fn from_config_with_policy(config: &SimConfig, policy: &str) -> Result<Self, ConfigError> {
        let seed = config.simulation.seed;
        let scheduler = config.scheduler.build_policy(policy, seed)?;
        let mut datacenter = Datacenter::new(scheduler);
        if !config.interference.is_empty() {
            datacenter = datacenter.with_interference(config.interference_model());
        }
        let mut sim = Self::with_datacenter(&config.simulation.name, datacenter)?
            .with_sample_interval(config.simulation.sample_interval_ms);
        for spec in config.host_specs() {
            sim.add_host(spec)?;
        }
        for task in config.workload.generate(seed) {
            sim.submit(task)?;
        }
        for f in &config.failures {
            sim.inject_failure(f.host, f.at_ms, f.duration_ms)?;
        }
        info!(
            name = %config.simulation.name,
            policy,
            hosts = config.host_count(),
            tasks = config.workload.task_count,
            "simulation built"
        );
        Ok(sim)
    }

    pub fn with_sample_interval(mut self, interval_ms: u64) -> Self {
        self.sample_interval_ms = interval_ms.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &Kernel<Datacenter> {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel<Datacenter> {
        &mut self.kernel
    }

    pub fn datacenter(&self) -> &Datacenter {
        self.kernel.world()
    }

    /// Add and launch a host at the current time.
    pub fn add_host(&mut self, spec: HostSpec) -> Result<HostId, SimError> {
        let now = self.kernel.now();
        self.kernel.world_mut().add_host(spec, now)
    }

    /// Submit `task` at its submission time.
    pub fn submit(&mut self, task: Task) -> Result<(), SimError> {
        let at = task.submit_ms.max(self.kernel.now());
        self.kernel.schedule_at(at, move |k| submit_task(k, task))
    }

    /// Fail `host` at `at_ms`; bring it back after `duration_ms` if given.
    pub fn inject_failure(
        &mut self,
        host: HostId,
        at_ms: u64,
        duration_ms: Option<u64>,
    ) -> Result<(), SimError> {
        self.kernel.schedule_at(at_ms, move |k| {
            let now = k.now();
            k.world_mut().fail_host(host, now).map(|_| ())
        })?;
        if let Some(d) = duration_ms {
            self.kernel.schedule_at(at_ms.saturating_add(d), move |k| {
                let now = k.now();
                k.world_mut().recover_host(host, now)?;
                poke(k, ServiceSignal::HostRecovered(host))
            })?;
        }
        Ok(())
    }

    fn start_sampler(&mut self) -> Result<(), SimError> {
        if self.kernel.lookup(TELEMETRY).is_none() {
            self.kernel
                .spawn(TelemetrySampler::new(self.sample_interval_ms), TELEMETRY)?;
        }
        Ok(())
    }

    /// Run until nothing is running and nothing else is scheduled. Tasks
    /// still pending at that point are reported as unfinished.
    pub fn run(mut self) -> Result<SimulationReport, SimError> {
        self.start_sampler()?;
        self.kernel.run()?;
        Ok(self.report())
    }

    /// Run up to `deadline_ms` and report on what happened so far.
    pub fn run_until(mut self, deadline_ms: u64) -> Result<SimulationReport, SimError> {
        self.start_sampler()?;
        self.kernel.run_until(deadline_ms)?;
        let now = self.kernel.now();
        self.kernel.world_mut().sample(now)?;
        Ok(self.report())
    }

    fn report(&self) -> SimulationReport {
        let kernel: &KernelStats = self.kernel.stats();
        SimulationReport::collect(&self.name, self.kernel.world(), self.kernel.now(), kernel)
    }
}
