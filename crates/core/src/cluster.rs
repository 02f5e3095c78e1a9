//! Recursive grouping of CPUs.
//!
//! A cluster holds CPUs and nested clusters. Operations on a cluster apply to
//! every CPU reachable from it, each CPU once.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::common::CpuError;
use crate::cpu::Cpu;

/// Named group of CPUs and sub-clusters.
pub struct Cluster {
    name: String,
    cpus: RwLock<Vec<Cpu>>,
    clusters: RwLock<Vec<Arc<Cluster>>>,
}

impl Cluster {
    /// Creates an empty cluster.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            cpus: RwLock::new(Vec::new()),
            clusters: RwLock::new(Vec::new()),
        })
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a CPU. Adding the same CPU twice has no effect.
    pub fn add_cpu(&self, cpu: Cpu) {
        let mut cpus = self.cpus.write().unwrap_or_else(PoisonError::into_inner);
        if !cpus.iter().any(|c| c.same_as(&cpu)) {
            cpus.push(cpu);
        }
    }

    /// Removes a CPU from this cluster only. Returns `false` if it was not a direct member.
    pub fn remove_cpu(&self, cpu: &Cpu) -> bool {
        let mut cpus = self.cpus.write().unwrap_or_else(PoisonError::into_inner);
        let before = cpus.len();
        cpus.retain(|c| !c.same_as(cpu));
        cpus.len() != before
    }

    /// Nests `child` in this cluster.
    ///
    /// Rejected with [`CpuError::ClusterCycle`] if `child` is this cluster or
    /// already contains it.
    pub fn add_cluster(self: &Arc<Self>, child: Arc<Self>) -> Result<(), CpuError> {
        if Arc::ptr_eq(self, &child) || child.contains(self) {
            return Err(CpuError::ClusterCycle {
                parent: self.name.clone(),
                child: child.name.clone(),
            });
        }
        let mut clusters = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
        if !clusters.iter().any(|c| Arc::ptr_eq(c, &child)) {
            debug!(parent = %self.name, child = %child.name, "cluster nested");
            clusters.push(child);
        }
        Ok(())
    }

    /// Whether `target` is reachable from this cluster.
    pub fn contains(&self, target: &Arc<Self>) -> bool {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|c| Arc::ptr_eq(c, target) || c.contains(target))
    }

    /// Every CPU reachable from this cluster, direct members first, without duplicates.
    pub fn clustered(&self) -> Vec<Cpu> {
        let mut out: Vec<Cpu> = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<Cpu>) {
        for cpu in self.cpus.read().unwrap_or_else(PoisonError::into_inner).iter() {
            if !out.iter().any(|c| c.same_as(cpu)) {
                out.push(cpu.clone());
            }
        }
        for cluster in self
            .clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            cluster.collect(out);
        }
    }

    /// Sets the program counter of every CPU.
    pub fn set_pc(&self, pc: u64) {
        for cpu in self.clustered() {
            cpu.set_pc(pc);
        }
    }

    /// Whether every CPU is halted. An empty cluster counts as halted.
    pub fn is_halted(&self) -> bool {
        self.clustered().iter().all(Cpu::is_halted)
    }

    /// Halts or releases every CPU.
    pub fn set_halted(&self, value: bool) {
        for cpu in self.clustered() {
            cpu.set_halted(value);
        }
    }

    /// Resumes every CPU.
    pub fn resume(&self) {
        for cpu in self.clustered() {
            cpu.resume();
        }
    }

    /// Pauses every CPU, reporting the first failure after trying all of them.
    pub fn pause(&self) -> Result<(), CpuError> {
        let mut first_error = None;
        for cpu in self.clustered() {
            if let Err(e) = cpu.pause() {
                let _ = first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field(
                "cpus",
                &self.cpus.read().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .field(
                "clusters",
                &self
                    .clusters
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len(),
            )
            .finish()
    }
}
