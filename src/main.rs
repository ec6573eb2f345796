//! Binary entry point: flags, signals, exit codes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use consul_terraform_sync::config::Config;
use consul_terraform_sync::controller::{exit_code_for, Controller, ExitCode, RunMode};
use consul_terraform_sync::registration::SelfRegistrationManager;
use consul_terraform_sync::{health, logging};

/// Wall-clock bound on graceful shutdown, measured from the first
/// signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const USAGE: &str = "\
consul-terraform-sync

USAGE:
    consul-terraform-sync --config <FILE> [--once | --inspect]

OPTIONS:
    --config <FILE>    Configuration file (YAML or JSON). Required.
    --once             Converge every task once, then exit.
    --inspect          Plan every task, print the plans, then exit.
    -h, --help         Print this help.
";

struct Flags {
    config: PathBuf,
    mode: RunMode,
}

enum FlagError {
    Help,
    MissingConfig,
    MissingValue(String),
    Unknown(String),
}

impl Flags {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self, FlagError> {
        let mut config: Option<PathBuf> = None;
        let mut mode = RunMode::Daemon;

        let mut args = args.peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => match args.next() {
                    Some(value) => config = Some(PathBuf::from(value)),
                    None => return Err(FlagError::MissingValue(arg)),
                },
                "--once" => mode = RunMode::Once,
                "--inspect" => mode = RunMode::Inspect,
                "-h" | "--help" => return Err(FlagError::Help),
                other => return Err(FlagError::Unknown(other.to_string())),
            }
        }

        match config {
            Some(config) => Ok(Self { config, mode }),
            None => Err(FlagError::MissingConfig),
        }
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code as i32);
}

async fn run() -> ExitCode {
    let flags = match Flags::parse(std::env::args().skip(1)) {
        Ok(flags) => flags,
        Err(FlagError::Help) => {
            print!("{}", USAGE);
            return ExitCode::Ok;
        }
        Err(FlagError::MissingConfig) => {
            eprintln!("--config is required\n\n{}", USAGE);
            return ExitCode::RequiredFlagsError;
        }
        Err(FlagError::MissingValue(flag)) => {
            eprintln!("{} requires a value\n\n{}", flag, USAGE);
            return ExitCode::ParseFlagsError;
        }
        Err(FlagError::Unknown(flag)) => {
            eprintln!("unknown flag {}\n\n{}", flag, USAGE);
            return ExitCode::ParseFlagsError;
        }
    };

    let config = match Config::from_file(&flags.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::ConfigError;
        }
    };

    if let Err(e) = logging::setup(&config.log.level, config.log.json) {
        eprintln!("failed to set up logging: {}", e);
        return ExitCode::ConfigError;
    }

    let cancel = CancellationToken::new();
    let controller = match Controller::new(config.clone(), cancel.clone()).await {
        Ok(controller) => Arc::new(controller),
        Err(e) => {
            error!(error = %e, "Startup failed");
            return exit_code_for(&e);
        }
    };

    match flags.mode {
        RunMode::Once => match controller.once().await {
            Ok(()) => ExitCode::Ok,
            Err(e) => {
                error!(error = %e, "Once mode failed");
                exit_code_for(&e)
            }
        },
        RunMode::Inspect => match controller.inspect().await {
            Ok(plans) => {
                for (task, plan) in plans {
                    println!(
                        "=== task \"{}\" (changes present: {}) ===",
                        task, plan.changes_present
                    );
                    println!("{}", plan.output);
                }
                ExitCode::Ok
            }
            Err(e) => {
                error!(error = %e, "Inspect mode failed");
                exit_code_for(&e)
            }
        },
        RunMode::Daemon => daemon(controller, config, cancel).await,
    }
}

async fn daemon(controller: Arc<Controller>, config: Config, cancel: CancellationToken) -> ExitCode {
    let mut services = tokio::task::JoinSet::new();

    services.spawn(health::serve(
        config.port,
        config.id.clone(),
        cancel.clone(),
    ));

    if config.service_registration.enabled {
        let manager =
            SelfRegistrationManager::new(controller.consul_client(), &config);
        let registration_cancel = cancel.clone();
        services.spawn(async move {
            if let Err(e) = manager.start(&registration_cancel).await {
                error!(error = %e, "Self-registration failed");
            }
        });
    }

    let daemon_cancel = cancel.clone();
    let daemon_controller = controller.clone();
    services.spawn(async move {
        if let Err(e) = daemon_controller.run().await {
            error!(error = %e, "Daemon loop failed");
            daemon_cancel.cancel();
        }
    });

    wait_for_shutdown_signal().await;
    info!("Signal received; shutting down");
    cancel.cancel();

    // Everything supervised reports completion before the deadline, or
    // the process exits hard with the interrupt code.
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while services.join_next().await.is_some() {}
    })
    .await;

    match drained {
        Ok(()) => {
            info!("Graceful shutdown complete");
            ExitCode::Ok
        }
        Err(_) => {
            error!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Shutdown timed out with work still in flight"
            );
            ExitCode::Interrupt
        }
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
}
