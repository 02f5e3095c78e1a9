//! ELF Entry Point Tests.

use tempo_core::common::CpuError;
use tempo_core::config::CpuConfig;
use tempo_core::cpu::Bitness;
use tempo_core::engine::SyntheticEngine;

use crate::common::harness::{
    ENTRY_PC, TestContext, cpu_config, elf32_image, elf64_image, engine_config,
};
use crate::common::mocks::time::ScriptedTimeHandle;

#[test]
fn elf32_entry_becomes_the_pc() {
    let ctx = TestContext::new();
    ctx.cpu.init_from_elf(&elf32_image(0x8000_0000)).unwrap();
    assert_eq!(ctx.cpu.pc(), 0x8000_0000);
}

#[test]
fn wider_image_is_rejected_and_keeps_the_pc() {
    let ctx = TestContext::new();
    let result = ctx.cpu.init_from_elf(&elf64_image(0x8000_0000));
    assert!(matches!(
        result,
        Err(CpuError::UnsupportedElf {
            elf_bits: 64,
            cpu_bits: 32
        })
    ));
    assert_eq!(ctx.cpu.pc(), ENTRY_PC);
}

#[test]
fn wide_cpu_accepts_both_classes() {
    let config = CpuConfig {
        bitness: Bitness::Bits64,
        ..cpu_config(0)
    };
    let ctx = TestContext::build(
        &config,
        Box::new(SyntheticEngine::new(engine_config())),
        ScriptedTimeHandle::new(),
    );
    ctx.cpu.init_from_elf(&elf64_image(0x1_0000_0000)).unwrap();
    assert_eq!(ctx.cpu.pc(), 0x1_0000_0000);
    ctx.cpu.init_from_elf(&elf32_image(0x2000)).unwrap();
    assert_eq!(ctx.cpu.pc(), 0x2000);
}

#[test]
fn garbage_is_not_an_image() {
    let ctx = TestContext::new();
    assert!(matches!(
        ctx.cpu.init_from_elf(b"\x7fELF but not really"),
        Err(CpuError::Elf(_))
    ));
    assert!(matches!(
        ctx.cpu.init_from_elf(&[]),
        Err(CpuError::Elf(_))
    ));
    assert_eq!(ctx.cpu.pc(), ENTRY_PC);
}
