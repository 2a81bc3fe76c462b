// station: A simulated field node hosting the pump simulator behind the bus.
//
// Consumes its command stream, executes pump commands, replies on each
// request's reply-to stream, publishes heartbeats with presence refresh,
// honors emergency stop, and advances the simulator clock.  The binary
// wires this runtime to Redis; integration tests run it on the in-memory
// bus, satisfying the same station wire contract as real firmware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use art_bus::{channels, Bus};
use art_protocol::{
    error_codes, message_types, CommandRequest, CommandResponse, Envelope, Source,
};
use pump_sim::{CommandError, PumpConfig, PumpSimulator};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long each blocking command-stream read waits before re-checking
/// cancellation.
const READ_BLOCK: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Station instance id, e.g. `pump-sim-01`.
    pub instance: String,
    /// The hosted pump's device id, e.g. `PUMP-01`.
    pub device_id: String,
    pub firmware_version: String,
    pub heartbeat_interval: Duration,
    /// Wall-clock cadence of simulator ticks.
    pub tick_interval: Duration,
    /// Simulated seconds per wall second (CI acceleration).
    pub time_scale: f64,
    pub stream_max_len: usize,
    pub pump: PumpConfig,
}

impl StationConfig {
    pub fn new(instance: impl Into<String>, device_id: impl Into<String>) -> Self {
        StationConfig {
            instance: instance.into(),
            device_id: device_id.into(),
            firmware_version: "1.4.2-sim".to_owned(),
            heartbeat_interval: Duration::from_secs(30),
            tick_interval: Duration::from_millis(250),
            time_scale: 1.0,
            stream_max_len: channels::STREAM_MAX_LEN,
            pump: PumpConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

struct Shared {
    cfg: StationConfig,
    bus: Arc<dyn Bus>,
    pump: Mutex<PumpSimulator>,
    commands_processed: AtomicU64,
    commands_failed: AtomicU64,
    started: Instant,
}

/// Handle to a spawned station; dropping it does NOT stop the tasks.
pub struct StationHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl StationHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn instance(&self) -> &str {
        &self.shared.cfg.instance
    }

    /// Direct access to the simulator (tests drive and inspect it).
    pub async fn with_pump<R>(&self, f: impl FnOnce(&mut PumpSimulator) -> R) -> R {
        let mut pump = self.shared.pump.lock().await;
        f(&mut pump)
    }
}

/// Spawn the station's flows: command loop, heartbeat loop, emergency-stop
/// listener, and simulator clock.
pub async fn spawn(bus: Arc<dyn Bus>, cfg: StationConfig) -> Result<StationHandle, art_bus::BusError> {
    let pump = if cfg.time_scale > 1.0 {
        // Accelerated stations start cold so tests regen immediately.
        PumpSimulator::cold(cfg.pump.clone())
    } else {
        PumpSimulator::new(cfg.pump.clone())
    };
    let shared = Arc::new(Shared {
        bus: Arc::clone(&bus),
        pump: Mutex::new(pump),
        commands_processed: AtomicU64::new(0),
        commands_failed: AtomicU64::new(0),
        started: Instant::now(),
        cfg,
    });
    let cancel = CancellationToken::new();

    // Emergency stop: subscribe before anything else so a stop can never be
    // missed while starting up.
    let mut estops = bus.subscribe(channels::EMERGENCY_STOP).await?;
    {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = estops.recv() => {
                        if msg.is_none() {
                            return;
                        }
                        warn!(station = %shared.cfg.instance, "emergency stop: pump off");
                        let mut pump = shared.pump.lock().await;
                        let _ = pump.handle_command("pump_off");
                    }
                }
            }
        });
    }

    // Command loop.
    {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            command_loop(shared, cancel).await;
        });
    }

    // Heartbeat loop (first beat immediately).
    {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.cfg.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = publish_heartbeat(&shared).await {
                    warn!(station = %shared.cfg.instance, error = %e, "heartbeat publish failed");
                }
            }
        });
    }

    // Simulator clock.
    {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.cfg.tick_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let dt = shared.cfg.tick_interval.as_secs_f64() * shared.cfg.time_scale;
                shared.pump.lock().await.tick(dt);
            }
        });
    }

    info!(station = %shared.cfg.instance, device = %shared.cfg.device_id, "station running");
    Ok(StationHandle { shared, cancel })
}

// ---------------------------------------------------------------------------
// Command handling
// ---------------------------------------------------------------------------

async fn command_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let stream = channels::commands(&shared.cfg.instance);
    let mut cursor = art_bus::CURSOR_TAIL.to_owned();
    loop {
        let entries = tokio::select! {
            _ = cancel.cancelled() => return,
            result = shared.bus.read_blocking(&stream, &cursor, READ_BLOCK) => match result {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "command stream read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
        };
        for entry in entries {
            cursor = entry.id.clone();
            handle_entry(&shared, &entry.payload).await;
            let _ = shared.bus.ack(&stream, &entry.id).await;
        }
    }
}

async fn handle_entry(shared: &Arc<Shared>, bytes: &[u8]) {
    let envelope = match Envelope::parse(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(station = %shared.cfg.instance, error = %e, "dropping malformed command");
            return;
        }
    };
    match envelope.message_type.as_str() {
        message_types::DEVICE_COMMAND_REQUEST => {
            let request: CommandRequest = match envelope.payload_as() {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "dropping malformed command payload");
                    return;
                }
            };
            let response = execute(shared, &request).await;
            if response.success {
                shared.commands_processed.fetch_add(1, Ordering::Relaxed);
            } else {
                shared.commands_failed.fetch_add(1, Ordering::Relaxed);
            }
            reply(shared, &envelope, response).await;
        }
        message_types::SYSTEM_OTA_REQUEST => {
            // Simulated firmware: acknowledge receipt, otherwise ignore.
            info!(station = %shared.cfg.instance, "OTA request acknowledged (simulator ignores)");
        }
        other => {
            debug!(message_type = %other, "ignoring message on command stream");
        }
    }
}

async fn execute(shared: &Arc<Shared>, request: &CommandRequest) -> CommandResponse {
    if request.device_id != shared.cfg.device_id {
        return CommandResponse::failed(
            &request.device_id,
            &request.command_name,
            error_codes::E_DEVICE_NOT_FOUND,
            format!("station hosts no device '{}'", request.device_id),
        );
    }
    let started = Instant::now();
    let result = {
        let mut pump = shared.pump.lock().await;
        pump.handle_command(&request.command_name)
    };
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(text) => CommandResponse::ok(
            &request.device_id,
            &request.command_name,
            text,
            duration_ms,
        ),
        Err(CommandError::Unknown(_)) => CommandResponse::failed(
            &request.device_id,
            &request.command_name,
            error_codes::E_INVALID_PARAMETER,
            format!("unknown command '{}'", request.command_name),
        ),
        Err(e @ CommandError::Rejected(..)) => CommandResponse::failed(
            &request.device_id,
            &request.command_name,
            error_codes::E_COMMAND_FAILED,
            e.to_string(),
        ),
    }
}

async fn reply(shared: &Arc<Shared>, request: &Envelope, response: CommandResponse) {
    let Some(reply_to) = &request.reply_to else {
        warn!("command request without reply_to; dropping response");
        return;
    };
    let payload = match serde_json::to_value(&response) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "response payload encode failed");
            return;
        }
    };
    let envelope = match Envelope::build(
        station_source(&shared.cfg),
        message_types::DEVICE_COMMAND_RESPONSE,
        request.correlation_id,
        None,
        payload,
    ) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "response envelope build failed");
            return;
        }
    };
    let bytes = match envelope.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "response encode failed");
            return;
        }
    };
    if let Err(e) = shared.bus.append(reply_to, bytes).await {
        warn!(reply_to = %reply_to, error = %e, "response append failed");
        return;
    }
    // Writers keep their streams bounded.
    let _ = shared.bus.trim(reply_to, shared.cfg.stream_max_len).await;
}

// ---------------------------------------------------------------------------
// Heartbeats
// ---------------------------------------------------------------------------

async fn publish_heartbeat(shared: &Arc<Shared>) -> Result<(), art_bus::BusError> {
    let mut device_types = std::collections::BTreeMap::new();
    device_types.insert(shared.cfg.device_id.clone(), art_protocol::DeviceProtocol::Cti);
    let heartbeat = art_protocol::Heartbeat {
        status: "online".to_owned(),
        uptime_seconds: shared.started.elapsed().as_secs(),
        devices: vec![shared.cfg.device_id.clone()],
        device_types,
        free_heap: 183_000,
        min_free_heap: None,
        wifi_rssi: -58,
        wifi_reconnects: None,
        redis_reconnects: None,
        commands_processed: Some(shared.commands_processed.load(Ordering::Relaxed)),
        commands_failed: Some(shared.commands_failed.load(Ordering::Relaxed)),
        last_error: None,
        watchdog_resets: None,
        firmware_version: shared.cfg.firmware_version.clone(),
    };
    let payload = serde_json::to_value(&heartbeat)
        .map_err(|e| art_bus::BusError::Encoding(e.to_string()))?;
    let envelope = Envelope::build(
        station_source(&shared.cfg),
        message_types::SERVICE_HEARTBEAT,
        None,
        None,
        payload,
    )
    .map_err(|e| art_bus::BusError::Encoding(e.to_string()))?;
    let bytes = envelope
        .to_bytes()
        .map_err(|e| art_bus::BusError::Encoding(e.to_string()))?;

    shared.bus.publish(channels::HEARTBEAT, bytes).await?;
    shared
        .bus
        .refresh_presence(&shared.cfg.instance, channels::PRESENCE_TTL)
        .await?;
    debug!(station = %shared.cfg.instance, "heartbeat published");
    Ok(())
}

fn station_source(cfg: &StationConfig) -> Source {
    Source::new("station", &cfg.instance, &cfg.firmware_version)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
