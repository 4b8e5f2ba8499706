mod collector;
mod config;
mod executors;
mod job;
mod machinefile;
mod metrics;
mod nodes;
mod orchestrator;
mod progress;

use clap::{Args, Parser, Subcommand};
use config::RunnerConfig;
use job::KernelSize;
use machinefile::DecodeMode;
use metrics::MetricsReader;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nodes::NodeEntry;
use orchestrator::{Orchestrator, RunEvent};
use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(author, version, about = "Launch and monitor distributed image processing runs")]
struct Cli {
    /// YAML config, built-in defaults are used without it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log debug output (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process every image in a directory on the configured nodes
    Run(RunArgs),
    /// Machine-file utilities
    #[command(subcommand)]
    Machinefile(MachinefileCommand),
    /// Print the metrics reported by the worker
    Metrics {
        /// Report to read, defaults to metrics.path from the config
        path: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Directory with the images to process
    #[arg(short, long)]
    input: PathBuf,

    /// Load the nodes from this machine-file instead of the configured one
    #[arg(short, long)]
    machinefile: Option<PathBuf>,

    /// Additional node as host:slots, may be repeated
    #[arg(long = "host", value_parser = parse_node)]
    hosts: Vec<NodeEntry>,

    #[arg(short, long, value_parser = parse_kernel_size)]
    kernel_size: Option<KernelSize>,
}

#[derive(Subcommand)]
enum MachinefileCommand {
    /// Strictly decode a machine-file and print it normalised
    Check { path: PathBuf },
}

fn parse_node(value: &str) -> Result<NodeEntry, String> {
    let (host, slots) = value
        .split_once(':')
        .ok_or_else(|| format!("expected host:slots, got {value:?}"))?;
    let slots = slots
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid slot count {slots:?}: {e}"))?;

    NodeEntry::new(host, slots).map_err(|e| e.to_string())
}

fn parse_kernel_size(value: &str) -> Result<KernelSize, String> {
    let size = value.parse::<u32>().map_err(|e| e.to_string())?;

    KernelSize::new(size).map_err(|e| e.to_string())
}

extern "C" fn handle_sigint(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // the handler only stores to an atomic
    unsafe { signal::sigaction(Signal::SIGINT, &action) }.map(|_| ())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = match RunnerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if config.preflight_checks() {
        error!("Config contains errors, aborting");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Run(args) => run(config, args),
        Command::Machinefile(MachinefileCommand::Check { path }) => check_machinefile(path),
        Command::Metrics { path } => print_metrics(path.unwrap_or(config.metrics.path)),
    }
}

fn run(mut config: RunnerConfig, args: RunArgs) -> ExitCode {
    if let Some(path) = &args.machinefile {
        // an explicit file is loaded strictly below and rewritten in place on launch
        config.machinefile.path = path.clone();
        config.machinefile.autoload = false;
    }

    let (sender, events) = mpsc::channel();
    let mut orchestrator = Orchestrator::new(config, sender);

    if let Some(path) = &args.machinefile {
        if let Err(e) = orchestrator.load_machinefile(path) {
            error!("Failed to load machine-file: {e}");
            return ExitCode::FAILURE;
        }
    }

    for entry in args.hosts {
        if let Err(e) = orchestrator.add_node(entry.host(), entry.slots()) {
            error!("Invalid node {entry}: {e}");
            return ExitCode::FAILURE;
        }
    }

    if let Some(kernel_size) = args.kernel_size {
        orchestrator.set_kernel_size(kernel_size);
    }

    orchestrator.select_directory(args.input);

    if orchestrator.nodes().is_empty() {
        warn!("No nodes configured, pass --host or --machinefile");
    }

    if let Err(e) = install_sigint_handler() {
        warn!("Failed to install SIGINT handler, Ctrl-C will not cancel cleanly: {e}");
    }

    if let Err(e) = orchestrator.start() {
        error!("Run not started: {e}");
        return ExitCode::FAILURE;
    }
    debug!(state = ?orchestrator.state(), "Run requested");

    let outcome = loop {
        if INTERRUPTED.swap(false, Ordering::SeqCst) {
            orchestrator.cancel();
        }

        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(RunEvent::Finished(outcome)) => break Some(outcome),
            Ok(event) => print_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break None,
        }
    };

    // the run thread already sent its outcome, joining only reaps it
    let joined = orchestrator.wait();
    let outcome = outcome.or(joined);

    match outcome {
        Some(outcome) => {
            println!("{outcome}");

            if outcome.is_completed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        None => {
            error!("Run ended without an outcome");
            ExitCode::FAILURE
        }
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Started { items, slots } => {
            info!("Processing {items} images on {slots} slots");
        }
        RunEvent::Progress(percent) => println!("[{percent:>3}%]"),
        RunEvent::Log(line) => println!("{line}"),
        RunEvent::Metrics(snapshot) if snapshot.is_empty() => {}
        RunEvent::Metrics(snapshot) => match serde_yaml::to_string(snapshot) {
            Ok(yaml) => print!("{yaml}"),
            Err(e) => warn!("Failed to format metrics: {e}"),
        },
        RunEvent::Anomaly(anomaly) => warn!(
            "Worker reported {} finished images, {} were expected",
            anomaly.observed, anomaly.expected
        ),
        RunEvent::Finished(outcome) => println!("{outcome}"),
    }
}

fn check_machinefile(path: PathBuf) -> ExitCode {
    match machinefile::load(&path, DecodeMode::Strict) {
        Ok(nodes) => {
            print!("{}", machinefile::encode(&nodes));
            println!("# {} nodes, {} slots", nodes.len(), nodes.total_slots());

            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}: {e}", path.display());

            ExitCode::FAILURE
        }
    }
}

fn print_metrics(path: PathBuf) -> ExitCode {
    let mut reader = MetricsReader::new(path);
    let snapshot = reader.read();

    if snapshot.is_empty() {
        warn!(path = ?reader.path(), "No metrics reported");
    }

    match serde_yaml::to_string(reader.snapshot()) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to format metrics: {e}");
            ExitCode::FAILURE
        }
    }
}
