//! Cluster Tests.

use pretty_assertions::assert_eq;
use tempo_core::cluster::Cluster;
use tempo_core::common::CpuError;
use tempo_core::cpu::Cpu;
use tempo_core::engine::SyntheticEngine;
use tempo_core::time::TimeInterval;

use crate::common::harness::{TestContext, WAIT, cpu_config, engine_config};
use crate::common::mocks::time::ScriptedTimeHandle;

fn context(id: u32) -> TestContext {
    TestContext::build(
        &cpu_config(id),
        Box::new(SyntheticEngine::new(engine_config())),
        ScriptedTimeHandle::new(),
    )
}

fn member(ctx: &TestContext) -> Cpu {
    Cpu::clone(&ctx.cpu)
}

fn ids(cpus: &[Cpu]) -> Vec<u32> {
    cpus.iter().map(Cpu::id).collect()
}

#[test]
fn nesting_rejects_cycles() {
    let a = Cluster::new("a");
    let b = Cluster::new("b");
    let c = Cluster::new("c");
    a.add_cluster(b.clone()).unwrap();
    b.add_cluster(c.clone()).unwrap();
    a.add_cluster(b.clone()).unwrap();

    assert!(a.contains(&c));
    assert!(!c.contains(&a));
    assert!(matches!(
        c.add_cluster(a.clone()),
        Err(CpuError::ClusterCycle { ref parent, ref child }) if parent == "c" && child == "a"
    ));
    assert!(matches!(
        a.add_cluster(a.clone()),
        Err(CpuError::ClusterCycle { .. })
    ));
}

#[test]
fn reachable_cpus_are_listed_once() {
    let cpu0 = context(0);
    let cpu1 = context(1);
    let root = Cluster::new("root");
    let child = Cluster::new("child");

    root.add_cpu(member(&cpu0));
    root.add_cpu(member(&cpu0));
    child.add_cpu(member(&cpu0));
    child.add_cpu(member(&cpu1));
    root.add_cluster(child.clone()).unwrap();
    assert_eq!(ids(&root.clustered()), vec![0, 1]);

    assert!(root.remove_cpu(&cpu0.cpu));
    assert!(!root.remove_cpu(&cpu0.cpu));
    // Still reachable through the child.
    assert_eq!(ids(&root.clustered()), vec![0, 1]);
    assert_eq!(ids(&child.clustered()), vec![0, 1]);
}

#[test]
fn halting_applies_to_every_cpu() {
    let cpu0 = context(0);
    let cpu1 = context(1);
    let root = Cluster::new("root");
    assert!(root.is_halted());

    root.add_cpu(member(&cpu0));
    root.add_cpu(member(&cpu1));
    assert!(!root.is_halted());

    cpu0.cpu.set_halted(true);
    assert!(!root.is_halted());
    root.set_halted(true);
    assert!(root.is_halted());
    assert!(cpu1.cpu.is_halted());

    root.set_halted(false);
    assert!(!cpu0.cpu.is_halted());
    assert!(!cpu1.cpu.is_halted());
}

#[test]
fn pc_and_lifecycle_fan_out() {
    let cpu0 = context(0);
    let cpu1 = context(1);
    let root = Cluster::new("root");
    let child = Cluster::new("child");
    root.add_cpu(member(&cpu0));
    child.add_cpu(member(&cpu1));
    root.add_cluster(child).unwrap();

    root.set_pc(0x4000);
    assert_eq!(cpu0.cpu.pc(), 0x4000);
    assert_eq!(cpu1.cpu.pc(), 0x4000);

    cpu0.time.grant(TimeInterval::from_microseconds(1));
    cpu1.time.grant(TimeInterval::from_microseconds(1));
    root.resume();
    assert!(cpu0.cpu.is_started());
    assert!(cpu1.cpu.is_started());
    assert!(cpu0.time.wait_for_continue(WAIT));
    assert!(cpu1.time.wait_for_continue(WAIT));
    assert_eq!(cpu1.cpu.pc(), 0x4000 + 400);

    root.pause().unwrap();
    assert!(cpu0.cpu.is_paused());
    assert!(cpu1.cpu.is_paused());
    assert!(!cpu0.cpu.is_thread_running());
    assert!(!cpu1.cpu.is_thread_running());
}
