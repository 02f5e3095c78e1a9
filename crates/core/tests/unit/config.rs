//! Configuration Tests.

use pretty_assertions::assert_eq;
use rstest::rstest;
use tempo_core::common::CpuError;
use tempo_core::config::Config;
use tempo_core::cpu::{Bitness, Endianness};
use tempo_core::tracer::TraceFormat;

#[test]
fn empty_document_uses_defaults() {
    let config = Config::from_json("{}").unwrap();
    assert_eq!(config.machine.name, "machine-0");
    assert_eq!(config.machine.quantum_us, 100);
    assert!(config.machine.advance_immediately);
    assert!(config.machine.timer_periods_us.is_empty());
    assert!(config.cpus.is_empty());
    assert_eq!(config.tracer.format, TraceFormat::Pc);
    assert_eq!(config.tracer.flush_threshold_bytes, 64 * 1024);
    assert_eq!(config.tracer.opcode_cache_capacity, 4096);
}

#[test]
fn full_document_round_trips() {
    let json = r#"{
        "machine": { "name": "board", "quantum_us": 50, "advance_immediately": false,
                     "timer_periods_us": [1000, 250] },
        "cpus": [
            { "id": 0, "model": "rv64", "bitness": 64, "endianness": "big",
              "performance_in_mips": 250, "synchronized_io": true },
            { "id": 1 }
        ],
        "tracer": { "format": "PcAndOpcode", "opcode_cache_capacity": 16 }
    }"#;
    let config = Config::from_json(json).unwrap();

    assert_eq!(config.machine.name, "board");
    assert_eq!(config.machine.timer_periods_us, vec![1000, 250]);
    assert!(!config.machine.advance_immediately);
    let cpu0 = &config.cpus[0];
    assert_eq!(cpu0.model, "rv64");
    assert_eq!(cpu0.bitness, Bitness::Bits64);
    assert_eq!(cpu0.endianness, Endianness::Big);
    assert_eq!(cpu0.performance_in_mips, 250);
    assert!(cpu0.synchronized_io);
    let cpu1 = &config.cpus[1];
    assert_eq!(cpu1.model, "synthetic");
    assert_eq!(cpu1.bitness, Bitness::Bits32);
    assert_eq!(cpu1.pause_probe_timeout_ms, 10);
    assert_eq!(cpu1.pause_probe_warn_after, 100);
    assert_eq!(config.tracer.format, TraceFormat::PcAndOpcode);

    let again = Config::from_json(&serde_json::to_string(&config).unwrap()).unwrap();
    assert_eq!(again.cpus[0].bitness, Bitness::Bits64);
    assert_eq!(again.machine.quantum_us, 50);
}

#[rstest]
#[case::zero_quantum(r#"{"machine": {"quantum_us": 0}}"#, "machine.quantum_us")]
#[case::zero_performance(r#"{"cpus": [{"performance_in_mips": 0}]}"#, "performance_in_mips")]
#[case::zero_probe(r#"{"cpus": [{"pause_probe_timeout_ms": 0}]}"#, "pause_probe_timeout_ms")]
#[case::zero_cache(r#"{"tracer": {"opcode_cache_capacity": 0}}"#, "tracer.opcode_cache_capacity")]
fn out_of_range_values_name_their_field(#[case] json: &str, #[case] expected: &str) {
    match Config::from_json(json) {
        Err(CpuError::InvalidConfig { field, .. }) => assert_eq!(field, expected),
        other => panic!("expected InvalidConfig for `{expected}`, got {other:?}"),
    }
}

#[test]
fn blank_model_cannot_be_constructed() {
    assert!(matches!(
        Config::from_json(r#"{"cpus": [{"model": ""}]}"#),
        Err(CpuError::Construction(_))
    ));
}

#[rstest]
#[case::odd_bitness(r#"{"cpus": [{"bitness": 48}]}"#)]
#[case::unknown_format(r#"{"tracer": {"format": "Hex"}}"#)]
#[case::not_json("machine = 1")]
fn malformed_documents_are_parse_errors(#[case] json: &str) {
    assert!(matches!(
        Config::from_json(json),
        Err(CpuError::ConfigParse(_))
    ));
}
