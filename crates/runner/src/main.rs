mod scenarios;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cpu_core::FeatureSet;

use scenarios::{Report, Scenario};

#[derive(Parser, Debug)]
#[command(name = "pmcore", version, about = "x86 protection-mode control plane", long_about=None)]
struct Cli {
    /// Log filter passed to env_logger when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Load the feature set from a JSON file.
    #[arg(long, global = true)]
    features_json: Option<PathBuf>,
    #[arg(long, global = true)]
    halt_spin_limit: Option<u64>,
    #[arg(long, global = true)]
    no_alignment_check: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List the built-in scenarios.
    List,
    /// Print the effective feature set as JSON.
    Features,
    /// Run a scenario and print the resulting processor state.
    Run {
        #[arg(value_enum)]
        scenario: Scenario,
        /// Print the full state snapshot as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn load_features(cli: &Cli) -> Result<FeatureSet> {
    let mut features = match &cli.features_json {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => FeatureSet::default(),
    };
    if cli.halt_spin_limit.is_some() {
        features.halt_spin_limit = cli.halt_spin_limit;
    }
    if cli.no_alignment_check {
        features.alignment_check = false;
    }
    Ok(features)
}

fn print_report(mut report: Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report.cpu.save_state())?);
        return Ok(());
    }
    let cpu = &report.cpu;
    println!("mode={:?} cpl={} cs={:#06x} eip={:#010x} ss={:#06x} esp={:#010x}",
        cpu.mode(), cpu.cpl(), cpu.segs.cs.selector(), cpu.regs.eip, cpu.segs.ss.selector(), cpu.regs.esp());
    println!("cr0={:#010x} cr2={:#010x} cycles={}", cpu.cr0().bits(), cpu.cr2(), cpu.cycles());
    if let Some(fault) = report.fault {
        println!("raised: {fault}");
    }
    for t in &report.transitions {
        println!("transition: {t:?} (now {:?})", t.target());
    }
    if let Some(halt) = report.halt {
        println!("halt: {halt:?}");
    }
    match &report.fatal {
        Some(e) => println!("fatal: {e}"),
        None => println!("fatal: none"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level)).init();
    let features = load_features(&cli)?;
    match cli.cmd {
        Cmd::List => {
            for s in Scenario::value_variants() {
                if let Some(v) = s.to_possible_value() {
                    println!("{:<28} {}", v.get_name(), v.get_help().map(|h| h.to_string()).unwrap_or_default());
                }
            }
        }
        Cmd::Features => println!("{}", serde_json::to_string_pretty(&features)?),
        Cmd::Run { scenario, json } => print_report(scenarios::run(scenario, &features)?, json)?,
    }
    Ok(())
}
