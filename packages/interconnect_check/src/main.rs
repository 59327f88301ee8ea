#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Binary entry point for the interconnect check.
//!
//! This module is excluded from mutation testing because testing process entry/exit behavior
//! is impractical - it requires spawning subprocesses and checking exit codes.

use std::io;
use std::num::NonZero;
use std::process::ExitCode;

use argh::FromArgs;
use exclusive_turns::ContextModel;
use interconnect_check::{
    AdapterKind, AllocationStrategy, Config, MeasurementMode, Options, Report, RunError,
    Topology, parse_sizes, run,
};
use tracing_subscriber::EnvFilter;

/// Measures the latency or bandwidth from every execution context to every device, one context
/// at a time, and reports each measurement relative to the best one.
///
/// The environment variables REPS, INCLUDE_ALLOC, SIZES, DEVICES, CONTEXTS and DEVICE_MEMORY
/// are also recognized; flags take precedence over them.
#[derive(FromArgs)]
struct Args {
    /// what to measure (latency, bandwidth)
    #[argh(option, default = "MeasurementMode::Bandwidth")]
    mode: MeasurementMode,

    /// device work to time (copy-kernel, offload-region, kernel-only)
    #[argh(option)]
    adapter: Option<AdapterKind>,

    /// how execution contexts are hosted (threads, processes)
    #[argh(option, default = "ContextModel::MessagePassing", from_str_fn(parse_model))]
    model: ContextModel,

    /// timed operations per sample
    #[argh(option)]
    reps: Option<NonZero<u32>>,

    /// comma-separated payload sizes in bytes
    #[argh(option)]
    sizes: Option<String>,

    /// number of emulated devices
    #[argh(option)]
    devices: Option<NonZero<usize>>,

    /// number of execution contexts
    #[argh(option)]
    contexts: Option<NonZero<usize>>,

    /// include device memory allocation in the timed region
    #[argh(switch)]
    include_alloc: bool,
}

fn parse_model(value: &str) -> Result<ContextModel, String> {
    match value.to_lowercase().as_str() {
        "threads" => Ok(ContextModel::Threads),
        "processes" => Ok(ContextModel::MessagePassing),
        _ => Err(format!(
            "invalid model '{value}', valid options are: threads, processes"
        )),
    }
}

fn options(args: &Args) -> Result<Options, RunError> {
    let mut options = Options::from_env()?;

    if let Some(reps) = args.reps {
        options = options.with_repetitions(reps);
    }

    if let Some(sizes) = &args.sizes {
        options = options.with_sizes(parse_sizes("--sizes", sizes)?);
    }

    if let Some(devices) = args.devices {
        options = options.with_devices(devices);
    }

    if let Some(contexts) = args.contexts {
        options = options.with_contexts(contexts);
    }

    if args.include_alloc {
        options = options.with_allocation(AllocationStrategy::InsideTimedRegion);
    }

    Ok(options)
}

fn execute(args: &Args) -> Result<String, RunError> {
    let topology = Topology::current();

    let config = Config::resolve(
        args.mode,
        args.adapter,
        args.model,
        options(args)?,
        topology.processor_count(),
        topology.memory_region_count(),
    )?;

    let aggregate = run(&config, &topology)?;

    Ok(Report::new(&aggregate).to_string())
}

// Binary entry point - mutations would require subprocess testing which is impractical.
#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_unset| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Args = argh::from_env();

    match execute(&args) {
        Ok(report) => {
            print!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
