//! Tempo machine driver.
//!
//! Builds a machine from a JSON configuration and runs it against the bundled synthetic
//! engine. It provides:
//! 1. **Run:** Execute a number of quanta on every configured CPU, optionally recording an
//!    execution trace, and print per-CPU statistics as JSON.
//! 2. **Defaults:** Print the default configuration as a starting point.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, process};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tempo_core::bus::{BusController, FlatBus};
use tempo_core::config::{Config, CpuConfig};
use tempo_core::cpu::{CpuState, ExecutionMode};
use tempo_core::engine::{SyntheticEngine, SyntheticEngineConfig};
use tempo_core::tracer::{ExecutionTracer, FixedWidthDisassembler, TraceStats};
use tempo_core::{Machine, TranslationCpu};

#[derive(Parser, Debug)]
#[command(
    name = "tempo-sim",
    author,
    version,
    about = "Multi-core CPU scheduler driven by virtual time",
    long_about = "Run a machine of synthetic CPUs for a number of quanta and report what each CPU executed.\n\nExamples:\n  tempo-sim run --config machine.json --quanta 500\n  tempo-sim run --elf firmware.elf --trace cpu.trace\n  tempo-sim defaults > machine.json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a machine and run it.
    Run(RunArgs),

    /// Print the default configuration.
    Defaults,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Machine configuration (JSON). Built-in defaults with one CPU if omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Synthetic engine behaviour (JSON), shared by every CPU.
    #[arg(short, long)]
    engine: Option<PathBuf>,

    /// Number of quanta to run.
    #[arg(short, long, default_value_t = 1000)]
    quanta: u64,

    /// ELF image whose entry point becomes the PC of every CPU.
    #[arg(long)]
    elf: Option<PathBuf>,

    /// RAM base address (decimal or 0x-prefixed hex).
    #[arg(long, default_value = "0", value_parser = parse_address)]
    ram_base: u64,

    /// RAM size in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    ram_size: usize,

    /// Write an execution trace of every CPU to this file.
    #[arg(long)]
    trace: Option<PathBuf>,
}

#[derive(Serialize, Debug)]
struct Report {
    machine: String,
    quanta: u64,
    virtual_time_us: u64,
    cpus: Vec<CpuReport>,
    trace: Option<TraceStats>,
}

#[derive(Serialize, Debug)]
struct CpuReport {
    id: u32,
    model: String,
    state: CpuState,
    execution_mode: ExecutionMode,
    pc: u64,
    executed_instructions: u64,
    skipped_instructions: u64,
}

impl CpuReport {
    fn of(cpu: &TranslationCpu) -> Self {
        Self {
            id: cpu.id(),
            model: cpu.model().to_string(),
            state: cpu.state(),
            execution_mode: cpu.execution_mode(),
            pc: cpu.pc(),
            executed_instructions: cpu.executed_instructions(),
            skipped_instructions: cpu.skipped_instructions(),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => match cmd_run(&args) {
            Ok(report) => print_json(&report),
            Err(e) => {
                error!(error = %e, "run failed");
                process::exit(1);
            }
        },
        Commands::Defaults => print_json(&default_config()),
    }
}

fn default_config() -> Config {
    Config {
        cpus: vec![CpuConfig::default()],
        ..Config::default()
    }
}

/// Accepts `4096` as well as `0x1000`.
fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address `{s}`: {e}"))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error serialising output: {e}");
            process::exit(1);
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

/// Builds the machine, runs the requested quanta and collects the report.
///
/// CPUs are paused before they are inspected, and the tracer is stopped before the
/// machine is disposed so every traced block is on disk.
fn cmd_run(args: &RunArgs) -> Result<Report, Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            let mut config = Config::from_json(&text)?;
            if config.cpus.is_empty() {
                config.cpus.push(CpuConfig::default());
            }
            config
        }
        None => default_config(),
    };
    let engine_config: SyntheticEngineConfig = match &args.engine {
        Some(path) => read_json(path)?,
        None => SyntheticEngineConfig::default(),
    };
    let image = match &args.elf {
        Some(path) => Some(
            fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?,
        ),
        None => None,
    };

    let bus = Arc::new(FlatBus::new(args.ram_base, args.ram_size));
    let machine = Machine::new(config.clone(), Arc::clone(&bus))?;

    let tracer = match &args.trace {
        Some(path) => {
            let width = usize::try_from(engine_config.instruction_width).unwrap_or(4);
            Some(Arc::new(ExecutionTracer::start(
                path,
                &config.tracer,
                Arc::clone(&bus) as Arc<dyn BusController>,
                Box::new(FixedWidthDisassembler::new(width)),
            )?))
        }
        None => None,
    };

    let mut cpus = Vec::with_capacity(config.cpus.len());
    for cpu_config in &config.cpus {
        let cpu = machine.add_translation_cpu(
            cpu_config,
            Box::new(SyntheticEngine::new(engine_config.clone())),
        )?;
        if let Some(image) = &image {
            cpu.init_from_elf(image)?;
        }
        cpu.attach_tracer(tracer.clone());
        cpus.push(cpu);
    }

    info!(
        machine = %machine.name(),
        cpus = cpus.len(),
        quanta = args.quanta,
        "running"
    );
    machine.start();
    let elapsed = machine.run_quanta(args.quanta);
    let paused = machine.pause();

    let cpu_reports = cpus.iter().map(CpuReport::of).collect();
    for cpu in &cpus {
        cpu.attach_tracer(None);
    }
    let trace = tracer.map(|tracer| tracer.stop()).transpose();
    machine.dispose();
    paused?;

    Ok(Report {
        machine: machine.name().to_string(),
        quanta: args.quanta,
        virtual_time_us: elapsed.microseconds(),
        cpus: cpu_reports,
        trace: trace?,
    })
}
