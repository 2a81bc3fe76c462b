//! `DeviceRouter` implementation over the registry, bus, and dispatcher.
//!
//! Routing a command: look the device up in the registry, register the
//! correlation id with the dispatcher BEFORE publishing, append the request
//! envelope to the owning station's command stream, then block on the slot
//! with the request's own timeout.  On deadline the slot is deregistered —
//! exactly one of {response delivered, timeout observed} happens.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use art_bus::{channels, Bus};
use art_protocol::{error_codes, message_types, CommandRequest, Envelope, Source};
use art_script::{CommandOutcome, DeviceRouter, RouteError};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::dispatch::ResponseDispatcher;
use crate::registry::{DeviceRegistry, StationStatus};

pub struct BusDeviceRouter {
    bus: Arc<dyn Bus>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<ResponseDispatcher>,
    source: Source,
    reply_stream: String,
}

impl BusDeviceRouter {
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<ResponseDispatcher>,
        source: Source,
    ) -> Self {
        let reply_stream = channels::responses(&source.instance);
        BusDeviceRouter {
            bus,
            registry,
            dispatcher,
            source,
            reply_stream,
        }
    }
}

#[async_trait]
impl DeviceRouter for BusDeviceRouter {
    async fn send(
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
        if entry.status == StationStatus::Offline {
            return Err(RouteError::new(
                error_codes::E_STATION_OFFLINE,
                format!("station '{}' is offline", entry.station),
            ));
        }

        let request = CommandRequest {
            device_id: device_id.to_owned(),
            command_name: command.to_owned(),
            parameters: params.clone(),
            timeout_ms,
        };
        let payload = serde_json::to_value(&request).map_err(|e| {
            RouteError::new(error_codes::E_INTERNAL, format!("encode request: {}", e))
        })?;

        let correlation_id = Uuid::new_v4();
        // Register before publishing so a fast responder cannot race the
        // waiter.
        let slot = self.dispatcher.register(correlation_id);

        let envelope = match Envelope::build(
            self.source.clone(),
            message_types::DEVICE_COMMAND_REQUEST,
            Some(correlation_id),
            Some(self.reply_stream.clone()),
            payload,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.dispatcher.deregister(&correlation_id);
                return Err(RouteError::new(
                    error_codes::E_VALIDATION_FAILED,
                    e.to_string(),
                ));
            }
        };
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.dispatcher.deregister(&correlation_id);
                return Err(RouteError::new(error_codes::E_INTERNAL, e.to_string()));
            }
        };

        let stream = channels::commands(&entry.station);
        if let Err(e) = self.bus.append(&stream, bytes).await {
            self.dispatcher.deregister(&correlation_id);
            return Err(RouteError::new(error_codes::E_INTERNAL, e.to_string()));
        }
        // Writers keep their streams bounded.
        let _ = self.bus.trim(&stream, channels::STREAM_MAX_LEN).await;
        debug!(
            device = %device_id,
            station = %entry.station,
            command = %command,
            correlation_id = %correlation_id,
            "command dispatched"
        );

        match tokio::time::timeout(Duration::from_millis(timeout_ms), slot).await {
            Err(_) => {
                self.dispatcher.deregister(&correlation_id);
                Err(RouteError::new(
                    error_codes::E_DEVICE_TIMEOUT,
                    format!(
                        "no response from '{}' within {} ms",
                        device_id, timeout_ms
                    ),
                ))
            }
            Ok(Err(_)) => {
                // Dispatcher dropped the sender (shutdown).
                self.dispatcher.deregister(&correlation_id);
                Err(RouteError::new(
                    error_codes::E_INTERNAL,
                    "response dispatcher shut down",
                ))
            }
            Ok(Ok(response)) => {
                if response.success {
                    Ok(CommandOutcome {
                        response: response.response,
                        duration_ms: response.duration_ms.unwrap_or(0),
                    })
                } else {
                    let error = response.error.unwrap_or_else(|| art_protocol::CommandError {
                        code: error_codes::E_INTERNAL.to_owned(),
                        message: "station reported failure without detail".to_owned(),
                        details: None,
                    });
                    Err(RouteError::new(error.code, error.message))
                }
            }
        }
    }
}
