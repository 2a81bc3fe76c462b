// controller: The central Arturo orchestration runtime.
//
// Owns the device registry, station-state tracker, and response dispatcher;
// wires them to the bus; and exposes the script runner and manual-command
// path.  One reader task serves the controller's response stream, one
// listener each for heartbeats and emergency stop, plus a periodic
// liveness sweep.

pub mod config;
pub mod dispatch;
pub mod registry;
pub mod router;
pub mod runner;
pub mod stations;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use art_bus::{channels, Bus, BusError};
use art_protocol::{error_codes, message_types, Envelope, Heartbeat, Source};
use art_script::{CommandOutcome, DeviceRouter, RouteError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::ResponseDispatcher;
use crate::registry::DeviceRegistry;
use crate::router::BusDeviceRouter;
use crate::stations::{StationTracker, TrackerError};

pub use crate::config::{load_config_from, parse_config, ControllerConfig};
pub use crate::runner::{check_script, run_script, RunError, RunOutcome};

pub struct Controller {
    bus: Arc<dyn Bus>,
    registry: Arc<DeviceRegistry>,
    tracker: Arc<StationTracker>,
    dispatcher: Arc<ResponseDispatcher>,
    router: Arc<BusDeviceRouter>,
    source: Source,
    stream_max_len: usize,
    shutdown: CancellationToken,
}

impl Controller {
    /// Construct the runtime and spawn its background flows: the response
    /// stream reader, the heartbeat listener, the emergency-stop listener,
    /// and the liveness sweeper.
    pub async fn start(
        bus: Arc<dyn Bus>,
        instance: &str,
        liveness_window: Duration,
        sweep_interval: Duration,
        stream_max_len: usize,
    ) -> Result<Self, BusError> {
        let source = Source::new("controller", instance, env!("CARGO_PKG_VERSION"));
        let registry = Arc::new(DeviceRegistry::new(liveness_window));
        let tracker = Arc::new(StationTracker::new());
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let router = Arc::new(BusDeviceRouter::new(
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            source.clone(),
        ));
        let shutdown = CancellationToken::new();

        // Response stream reader.
        dispatcher.spawn_reader(
            Arc::clone(&bus),
            channels::responses(instance),
            shutdown.clone(),
        );

        // Heartbeat listener.
        let mut heartbeats = bus.subscribe(channels::HEARTBEAT).await?;
        {
            let registry = Arc::clone(&registry);
            let tracker = Arc::clone(&tracker);
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => return,
                        msg = heartbeats.recv() => match msg {
                            Some(msg) => msg,
                            None => return,
                        },
                    };
                    let envelope = match Envelope::parse(&msg.payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(error = %e, "dropping malformed heartbeat");
                            continue;
                        }
                    };
                    if envelope.message_type != message_types::SERVICE_HEARTBEAT {
                        continue;
                    }
                    let hb: Heartbeat = match envelope.payload_as() {
                        Ok(hb) => hb,
                        Err(e) => {
                            warn!(error = %e, "dropping malformed heartbeat payload");
                            continue;
                        }
                    };
                    let instance = envelope.source.instance;
                    registry.update_from_heartbeat(&instance, &hb, Instant::now());
                    tracker.heartbeat_received(&instance);
                }
            });
        }

        // Emergency-stop listener: terminate every active session.
        let mut estops = bus.subscribe(channels::EMERGENCY_STOP).await?;
        {
            let tracker = Arc::clone(&tracker);
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => return,
                        msg = estops.recv() => match msg {
                            Some(msg) => msg,
                            None => return,
                        },
                    };
                    warn!(bytes = msg.payload.len(), "emergency stop received");
                    for session in tracker.active_sessions() {
                        let _ = tracker.terminate_test(&session.station, "emergency stop");
                    }
                }
            });
        }

        // Liveness sweeper.
        {
            let registry = Arc::clone(&registry);
            let tracker = Arc::clone(&tracker);
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    let window = registry.liveness_window();
                    for instance in registry.expire_stale(Instant::now(), window) {
                        tracker.mark_offline(&instance);
                    }
                }
            });
        }

        info!(instance = %instance, "controller started");
        Ok(Controller {
            bus,
            registry,
            tracker,
            dispatcher,
            router,
            source,
            stream_max_len,
            shutdown,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &StationTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Arc<ResponseDispatcher> {
        &self.dispatcher
    }

    pub fn router(&self) -> Arc<dyn DeviceRouter> {
        Arc::clone(&self.router) as Arc<dyn DeviceRouter>
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Operator paths
    // -----------------------------------------------------------------------

    /// Route a manual (non-script) device command.  Rejected with
    /// `E_STATION_BUSY` while the owning station runs or pauses a session.
    pub async fn manual_command(
        &self,
        device_id: &str,
        command: &str,
        params: &BTreeMap<String, String>,
        timeout_ms: u64,
    ) -> Result<CommandOutcome, RouteError> {
        let entry = self.registry.lookup_device(device_id).ok_or_else(|| {
            RouteError::new(
                error_codes::E_DEVICE_NOT_FOUND,
                format!("no station advertises device '{}'", device_id),
            )
        })?;
        match self.tracker.manual_allowed(&entry.station) {
            Ok(()) => {}
            Err(e @ TrackerError::Busy(_)) => {
                return Err(RouteError::new(error_codes::E_STATION_BUSY, e.to_string()));
            }
            Err(e) => {
                return Err(RouteError::new(
                    error_codes::E_STATION_OFFLINE,
                    e.to_string(),
                ));
            }
        }
        self.router.send(device_id, command, params, timeout_ms).await
    }

    /// Broadcast an emergency stop: pub/sub for latency AND a durable
    /// stream append for audit, then terminate every active session.
    pub async fn emergency_stop(
        &self,
        reason: &str,
        triggered_by: &str,
        severity: &str,
    ) -> Result<(), BusError> {
        let payload = serde_json::json!({
            "reason": reason,
            "triggered_by": triggered_by,
            "severity": severity,
        });
        let envelope = Envelope::build(
            self.source.clone(),
            message_types::SYSTEM_EMERGENCY_STOP,
            None,
            None,
            payload,
        )
        .map_err(|e| BusError::Encoding(e.to_string()))?;
        let bytes = envelope
            .to_bytes()
            .map_err(|e| BusError::Encoding(e.to_string()))?;

        self.bus
            .publish(channels::EMERGENCY_STOP, bytes.clone())
            .await?;
        self.bus.append(channels::EMERGENCY_STOP, bytes).await?;
        self.bus
            .trim(channels::EMERGENCY_STOP, self.stream_max_len)
            .await?;

        for session in self.tracker.active_sessions() {
            let _ = self
                .tracker
                .terminate_test(&session.station, "emergency stop");
        }
        warn!(reason = %reason, triggered_by = %triggered_by, "emergency stop issued");
        Ok(())
    }

    /// Stop all background flows.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
