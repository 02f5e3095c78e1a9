//! Machine orchestrator.
//!
//! A [`Machine`] owns the pieces shared by its CPUs:
//! 1. **Time:** one [`QuantumTimeSource`] with its [`PeriodicClock`]; every CPU gets its
//!    own time handle from it.
//! 2. **Bus:** a [`FlatBus`] all CPUs access.
//! 3. **Identity:** an [`InstanceCounter`] used to name engine instances.
//! 4. **CPUs:** the registered CPUs, grouped in a root [`Cluster`].

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::bus::{BusController, FlatBus};
use crate::cluster::Cluster;
use crate::common::{CpuError, InstanceCounter};
use crate::config::{Config, CpuConfig};
use crate::cpu::{Cpu, TranslationCpu};
use crate::engine::ExecutionEngine;
use crate::time::{
    ClockSource, HostTimeSync, PeriodicClock, QuantumTimeSource, SyncTimeHandle, TimeHandle,
    TimeInterval,
};

struct Registered {
    cpu: Cpu,
    handle: Arc<SyncTimeHandle>,
}

/// CPUs, time source and bus of one emulated machine.
pub struct Machine {
    config: Config,
    instances: InstanceCounter,
    clock: Arc<PeriodicClock>,
    source: Arc<QuantumTimeSource>,
    bus: Arc<FlatBus>,
    root: Arc<Cluster>,
    cpus: RwLock<Vec<Registered>>,
}

impl Machine {
    /// Creates a machine without CPUs.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated machine configuration. Its CPU list is not instantiated.
    /// * `bus` - System bus shared by all CPUs.
    pub fn new(config: Config, bus: Arc<FlatBus>) -> Result<Self, CpuError> {
        config.validate()?;
        let clock = Arc::new(PeriodicClock::new(
            config
                .machine
                .timer_periods_us
                .iter()
                .map(|&us| TimeInterval::from_microseconds(us)),
        ));
        let source = Arc::new(QuantumTimeSource::new(
            TimeInterval::from_microseconds(config.machine.quantum_us),
            Arc::clone(&clock),
            config.machine.advance_immediately,
        ));
        let root = Cluster::new(config.machine.name.clone());
        info!(
            machine = %config.machine.name,
            quantum_us = config.machine.quantum_us,
            "machine created"
        );
        Ok(Self {
            config,
            instances: InstanceCounter::new(),
            clock,
            source,
            bus,
            root,
            cpus: RwLock::new(Vec::new()),
        })
    }

    /// Machine name.
    pub fn name(&self) -> &str {
        &self.config.machine.name
    }

    /// Configuration the machine was built from.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Counter naming engine instances of this machine.
    pub const fn instance_counter(&self) -> &InstanceCounter {
        &self.instances
    }

    /// Shared bus.
    pub const fn bus(&self) -> &Arc<FlatBus> {
        &self.bus
    }

    /// Shared time source.
    pub const fn time_source(&self) -> &Arc<QuantumTimeSource> {
        &self.source
    }

    /// Shared clock.
    pub const fn clock(&self) -> &Arc<PeriodicClock> {
        &self.clock
    }

    /// Cluster holding every registered CPU.
    pub const fn root_cluster(&self) -> &Arc<Cluster> {
        &self.root
    }

    /// Builds a [`TranslationCpu`] around `engine` and registers it.
    pub fn add_translation_cpu(
        &self,
        config: &CpuConfig,
        engine: Box<dyn ExecutionEngine>,
    ) -> Result<TranslationCpu, CpuError> {
        let bus: Arc<dyn BusController> = Arc::clone(&self.bus) as Arc<dyn BusController>;
        let cpu = TranslationCpu::new(config, self.name(), engine, bus)?;
        self.register_cpu(&cpu);
        Ok(cpu)
    }

    /// Attaches a fresh time handle, the clock and host synchronisation to `cpu`.
    pub fn register_cpu(&self, cpu: &Cpu) {
        let mut cpus = self.cpus.write().unwrap_or_else(PoisonError::into_inner);
        if cpus.iter().any(|r| r.cpu.same_as(cpu)) {
            warn!(cpu = cpu.id(), "CPU already registered");
            return;
        }
        let handle = self.source.new_handle(cpu.thread_name());
        cpu.set_time_handle(Arc::clone(&handle) as Arc<dyn TimeHandle>);
        cpu.set_clock_source(Arc::clone(&self.clock) as Arc<dyn ClockSource>);
        cpu.set_host_time_sync(Arc::clone(&self.source) as Arc<dyn HostTimeSync>);
        self.root.add_cpu(cpu.clone());
        cpus.push(Registered {
            cpu: cpu.clone(),
            handle,
        });
        debug!(cpu = cpu.id(), "CPU registered");
    }

    /// Registered CPUs in registration order.
    pub fn cpus(&self) -> Vec<Cpu> {
        self.cpus
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.cpu.clone())
            .collect()
    }

    /// Resumes every CPU.
    pub fn start(&self) {
        for cpu in self.cpus() {
            cpu.start();
        }
        info!(machine = %self.name(), "machine started");
    }

    /// Pauses every CPU and waits for their threads.
    pub fn pause(&self) -> Result<(), CpuError> {
        self.root.pause()?;
        info!(machine = %self.name(), "machine paused");
        Ok(())
    }

    /// Runs `quanta` rounds of the time source on the calling thread.
    pub fn run_quanta(&self, quanta: u64) -> TimeInterval {
        self.source.run_rounds(quanta)
    }

    /// Virtual time of all completed rounds.
    pub fn elapsed_virtual_time(&self) -> TimeInterval {
        self.source.elapsed_virtual_time()
    }

    /// Stops and disposes every CPU, joining their threads before engines are released.
    pub fn dispose(&self) {
        let registered =
            std::mem::take(&mut *self.cpus.write().unwrap_or_else(PoisonError::into_inner));
        for entry in &registered {
            entry.cpu.dispose();
            let _ = self.source.remove_handle(&entry.handle);
            let _ = self.root.remove_cpu(&entry.cpu);
        }
        self.source.unblock_all();
        info!(machine = %self.name(), cpus = registered.len(), "machine disposed");
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name())
            .field(
                "cpus",
                &self.cpus.read().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .field("elapsed", &self.elapsed_virtual_time())
            .finish_non_exhaustive()
    }
}
