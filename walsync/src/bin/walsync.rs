//! `walsync`: deterministic DR synchronization to named restore points.
//!
//! Two modes over one config file: `primary` publishes restore-point
//! manifests and proves WAL durability; `dr` consumes them and parks every
//! DR instance at the corresponding LSN. Each mode carries the same
//! subcommands: `run`, `stop`, `pid-status`, `status`, `logs`.

use std::process::exit;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use walsync::config::{defaults, SyncConfig};
use walsync::consumer::{self, RunOutcome};
use walsync::status::StatusFormat;
use walsync::{exit_code, logging, pid_file, publisher, status, Side};
use walsync_api::RestorePointName;

const ABOUT: &str = "\
Coordinates disaster-recovery synchronization of a coordinator-plus-segments
cluster to named, cross-cluster-consistent restore points. The primary side
publishes restore-point manifests and proves the per-segment WAL files are
archived; the dr side drives every DR instance to stop exactly at the
published positions and advances its state only on validated evidence.";

#[derive(Parser)]
#[command(name = "walsync", version, about = ABOUT)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, default_value = defaults::DEFAULT_CONFIG_PATH)]
    config: Utf8PathBuf,
    #[command(subcommand)]
    side: SideCommand,
}

#[derive(Subcommand)]
enum SideCommand {
    /// Publisher commands, run next to the Primary cluster.
    Primary {
        #[command(subcommand)]
        command: PrimaryCommand,
    },
    /// Consumer commands, run next to the DR cluster.
    Dr {
        #[command(subcommand)]
        command: DrCommand,
    },
}

#[derive(Subcommand)]
enum PrimaryCommand {
    /// Publish restore points: forever by default, one cycle with --once.
    Run {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
        /// Skip the WAL switch after creating the restore point.
        #[arg(long)]
        no_gp_switch_wal: bool,
    },
    /// Stop the running publisher daemon.
    Stop,
    /// Report whether the publisher daemon is running (exit 0) or not
    /// (exit 1).
    PidStatus,
    /// Show publisher-side state from on-disk artifacts.
    Status {
        #[arg(long, value_enum, default_value = "table")]
        format: StatusFormat,
        /// Ignored on the primary side; accepted for symmetry.
        #[arg(long)]
        include_history: bool,
    },
    /// Print the tail of the publisher daemon log.
    Logs {
        /// Number of lines.
        #[arg(short, long, default_value_t = 100)]
        n: usize,
    },
}

#[derive(Subcommand)]
enum DrCommand {
    /// Consume restore points: forever by default, one run with --once.
    Run {
        /// Run a single selection-and-recovery pass and exit.
        #[arg(long)]
        once: bool,
        /// Drive DR to this restore point instead of the selector's choice;
        /// a floor violation becomes a hard error.
        #[arg(long, value_name = "NAME")]
        target: Option<RestorePointName>,
    },
    /// Stop the running consumer daemon.
    Stop,
    /// Report whether the consumer daemon is running (exit 0) or not
    /// (exit 1).
    PidStatus,
    /// Show consumer-side state from on-disk artifacts.
    Status {
        #[arg(long, value_enum, default_value = "table")]
        format: StatusFormat,
        /// Also list recent receipts.
        #[arg(long)]
        include_history: bool,
    },
    /// Print the tail of the consumer daemon log.
    Logs {
        /// Number of lines.
        #[arg(short, long, default_value_t = 100)]
        n: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match SyncConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            exit(exit_code::CONFIG);
        }
    };

    let code = match cli.side {
        SideCommand::Primary { command } => primary_main(&config, command),
        SideCommand::Dr { command } => dr_main(&config, command),
    };
    exit(code);
}

fn primary_main(config: &SyncConfig, command: PrimaryCommand) -> i32 {
    match command {
        PrimaryCommand::Run {
            once,
            no_gp_switch_wal,
        } => run_daemon(config, Side::Primary, once, |cancel| async move {
            publisher::run(config, once, !no_gp_switch_wal, &cancel).await?;
            Ok(exit_code::SUCCESS)
        }),
        PrimaryCommand::Stop => stop_daemon(config, Side::Primary),
        PrimaryCommand::PidStatus => pid_status(config, Side::Primary),
        PrimaryCommand::Status {
            format,
            include_history,
        } => print_status(config, Side::Primary, format, include_history),
        PrimaryCommand::Logs { n } => print_logs(config, Side::Primary, n),
    }
}

fn dr_main(config: &SyncConfig, command: DrCommand) -> i32 {
    match command {
        DrCommand::Run { once, target } => {
            run_daemon(config, Side::Dr, once, |cancel| async move {
                let outcome = consumer::run(config, once, target.as_ref(), &cancel).await?;
                Ok(match outcome {
                    RunOutcome::Advanced(_) | RunOutcome::AlreadyCurrent(_) => exit_code::SUCCESS,
                    RunOutcome::NoTarget(_) | RunOutcome::TargetRejected(_) => {
                        exit_code::TARGET_UNAVAILABLE
                    }
                    RunOutcome::ValidationFailed(_) => exit_code::VALIDATION_FAILED,
                })
            })
        }
        DrCommand::Stop => stop_daemon(config, Side::Dr),
        DrCommand::PidStatus => pid_status(config, Side::Dr),
        DrCommand::Status {
            format,
            include_history,
        } => print_status(config, Side::Dr, format, include_history),
        DrCommand::Logs { n } => print_logs(config, Side::Dr, n),
    }
}

/// Shared scaffolding for both `run` subcommands: logging, the pid-file
/// claim, the tokio runtime, and signal-driven cancellation.
fn run_daemon<'a, F, Fut>(config: &'a SyncConfig, side: Side, once: bool, body: F) -> i32
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<i32>> + 'a,
{
    if once {
        logging::init_cli();
    } else if let Err(e) = logging::init_daemon(&config.log_path(side)) {
        eprintln!("could not set up logging: {e:#}");
        return exit_code::FAILURE;
    }

    // One runner per side, whether daemonized or --once.
    let _pid_guard = match pid_file::claim(&config.pid_path(side)) {
        Ok(guard) => guard,
        Err(e) => {
            error!("{e:#}");
            return exit_code::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("could not start runtime: {e}");
            return exit_code::FAILURE;
        }
    };

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        spawn_signal_listener(cancel.clone());
        match body(cancel).await {
            Ok(code) => code,
            Err(e) => {
                error!("{e:#}");
                exit_code::FAILURE
            }
        }
    })
}

/// Translate SIGINT/SIGTERM/SIGQUIT into cancellation; the current cycle or
/// run finishes (or aborts at its next suspension point) before the process
/// exits.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("could not install SIGINT handler: {e}");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("could not install SIGTERM handler: {e}");
                return;
            }
        };
        let mut sigquit = match signal(SignalKind::quit()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("could not install SIGQUIT handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, finishing current work"),
            _ = sigterm.recv() => info!("received SIGTERM, finishing current work"),
            _ = sigquit.recv() => info!("received SIGQUIT, finishing current work"),
        }
        cancel.cancel();
    });
}

fn stop_daemon(config: &SyncConfig, side: Side) -> i32 {
    logging::init_cli();
    match pid_file::stop(&config.pid_path(side)) {
        Ok(true) => {
            println!("{} daemon stopped", side.as_str());
            exit_code::SUCCESS
        }
        Ok(false) => {
            println!("{} daemon is not running", side.as_str());
            exit_code::SUCCESS
        }
        Err(e) => {
            eprintln!("could not stop {} daemon: {e:#}", side.as_str());
            exit_code::FAILURE
        }
    }
}

fn pid_status(config: &SyncConfig, side: Side) -> i32 {
    match pid_file::status(&config.pid_path(side)) {
        Ok(pid_file::PidStatus::Running(pid)) => {
            println!("running (pid {pid})");
            exit_code::SUCCESS
        }
        Ok(pid_file::PidStatus::NotRunning) => {
            println!("not running");
            exit_code::FAILURE
        }
        Err(e) => {
            eprintln!("could not read pid file: {e:#}");
            exit_code::FAILURE
        }
    }
}

fn print_status(config: &SyncConfig, side: Side, format: StatusFormat, include_history: bool) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("could not start runtime: {e}");
            return exit_code::FAILURE;
        }
    };
    match runtime.block_on(async {
        let report = status::gather(config, side, include_history).await?;
        status::render(&report, format)
    }) {
        Ok(rendered) => {
            println!("{rendered}");
            exit_code::SUCCESS
        }
        Err(e) => {
            eprintln!("could not gather status: {e:#}");
            exit_code::FAILURE
        }
    }
}

fn print_logs(config: &SyncConfig, side: Side, n: usize) -> i32 {
    match logging::print_tail(&config.log_path(side), n) {
        Ok(()) => exit_code::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            exit_code::FAILURE
        }
    }
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert()
}
