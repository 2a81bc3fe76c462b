//! The device-routing collaborator consumed by the interpreter.
//!
//! The script engine never talks to the bus directly; SEND/QUERY/RELAY go
//! through a `DeviceRouter`, which the controller implements on top of its
//! registry and response dispatcher.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

/// Routing failure: the device is unknown, its station is busy or offline,
/// the transport failed, or the station reported a command error.
#[derive(Debug, Clone)]
pub struct RouteError {
    /// Stable error code (e.g. `E_DEVICE_TIMEOUT`, `E_STATION_BUSY`).
    pub code: String,
    pub message: String,
}

impl RouteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        RouteError {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RouteError {}

/// Result of a successfully round-tripped command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub response: Option<String>,
    pub duration_ms: u64,
}

/// One-operation collaborator: route a command to a device and wait for the
/// correlated result.  Implementations enforce `timeout_ms`.
#[async_trait]
pub trait DeviceRouter: Send + Sync {
    async fn send(
        &self,
        device_id: &str,
        command: &str,
        params: &BTreeMap<String, String>,
        timeout_ms: u64,
    ) -> Result<CommandOutcome, RouteError>;
}
