// station: Simulated station binary.
//
// Bridges the pump simulator onto a Redis bus so the controller can drive
// it like real firmware.

use std::sync::Arc;
use std::time::Duration;

use art_bus::RedisBus;
use clap::Parser;
use pump_sim::PumpConfig;
use station::StationConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "station", about = "Arturo simulated station (cryopump)")]
struct Cli {
    /// Redis URL of the message backbone.
    #[arg(long, default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,
    /// Station instance id.
    #[arg(long, default_value = "pump-sim-01")]
    instance: String,
    /// Hosted pump device id.
    #[arg(long, default_value = "PUMP-01")]
    device_id: String,
    /// Heartbeat cadence in seconds.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    /// Simulated seconds per wall second (>1 accelerates, and starts cold).
    #[arg(long, default_value_t = 1.0)]
    time_scale: f64,
    /// Use the accelerated pump phase timings (CI/demo).
    #[arg(long)]
    accelerated: bool,
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
    let bus = RedisBus::connect(&cli.redis_url).await?;

    let mut cfg = StationConfig::new(cli.instance.clone(), cli.device_id);
    cfg.heartbeat_interval = Duration::from_secs(cli.heartbeat_secs);
    cfg.time_scale = cli.time_scale;
    if cli.accelerated {
        cfg.pump = PumpConfig::accelerated();
    }

    let handle = station::spawn(Arc::new(bus), cfg).await?;
    info!(instance = %cli.instance, "station serving; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    handle.stop();
    Ok(())
}
