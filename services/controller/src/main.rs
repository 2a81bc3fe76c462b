// controller: CLI entry point.
//
// `serve` runs the orchestration runtime against the configured Redis bus;
// `check` lexes and parses a script, printing diagnostics; `run` executes a
// script against a station and prints the report summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use art_bus::RedisBus;
use clap::{Parser, Subcommand};
use controller::{config, Controller};
use tracing::info;

#[derive(Parser)]
#[command(name = "controller", about = "Arturo test-automation controller")]
struct Cli {
    /// Path to controller.toml.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration runtime until interrupted.
    Serve,
    /// Lex and parse a script, printing diagnostics.
    Check { script: PathBuf },
    /// Execute a script against a station and print the report summary.
    Run {
        script: PathBuf,
        #[arg(long)]
        station: String,
        #[arg(long, default_value = "operator")]
        operator: String,
        /// Optional external reference id recorded on the session.
        #[arg(long)]
        reference: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Check { script } => {
            let diagnostics = controller::check_script(&script).await?;
            if diagnostics.is_empty() {
                println!("{}: OK", script.display());
            } else {
                for diagnostic in &diagnostics {
                    println!("{}", diagnostic);
                }
                std::process::exit(1);
            }
        }
        Command::Serve => {
            let cfg = config::load_config_from(&cli.config)?;
            let ctrl = start_controller(&cfg).await?;
            info!(instance = %cfg.instance, "serving; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            ctrl.shutdown();
        }
        Command::Run {
            script,
            station,
            operator,
            reference,
        } => {
            let cfg = config::load_config_from(&cli.config)?;
            let ctrl = start_controller(&cfg).await?;
            // Stations announce themselves by heartbeat (~30 s cadence);
            // wait up to one heartbeat interval for the target to appear.
            let deadline = std::time::Instant::now() + Duration::from_secs(35);
            while ctrl.tracker().state(&station) == controller::stations::StationState::Offline {
                if std::time::Instant::now() > deadline {
                    eprintln!("FATAL: station '{}' not seen on the bus", station);
                    std::process::exit(1);
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }

            let outcome =
                controller::run_script(&ctrl, &script, &station, &operator, reference).await?;
            if !outcome.diagnostics.is_empty() {
                for diagnostic in &outcome.diagnostics {
                    println!("{}", diagnostic);
                }
                std::process::exit(2);
            }
            if let Some(report) = outcome.report {
                println!(
                    "tests: {} passed, {} failed, {} skipped, {} errored ({} total, {:.1?})",
                    report.overall.passed,
                    report.overall.failed,
                    report.overall.skipped,
                    report.overall.errors,
                    report.overall.total(),
                    report.duration,
                );
                for test in &report.tests {
                    let suite = test
                        .suite
                        .as_deref()
                        .map(|s| format!("{}::", s))
                        .unwrap_or_default();
                    println!("  [{}] {}{}", test.outcome.as_str(), suite, test.name);
                }
                if !report.success() {
                    std::process::exit(1);
                }
            }
            ctrl.shutdown();
        }
    }
    Ok(())
}

async fn start_controller(
    cfg: &config::ControllerConfig,
) -> Result<Controller, Box<dyn std::error::Error>> {
    let bus = RedisBus::connect(&cfg.bus.redis_url).await?;
    let ctrl = Controller::start(
        Arc::new(bus),
        &cfg.instance,
        Duration::from_secs(cfg.liveness.window_secs),
        Duration::from_secs(cfg.liveness.sweep_secs),
        cfg.bus.stream_max_len,
    )
    .await?;
    Ok(ctrl)
}
