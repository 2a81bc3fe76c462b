//! Type-specific message payloads.
//!
//! Payload structs use `deny_unknown_fields` so that structural validation
//! (known fields, required fields) falls out of deserialization.  Parameter
//! values in command requests are string-only at the type level.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default command timeout when the caller does not specify one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Lowest accepted `timeout_ms`.
pub const MIN_TIMEOUT_MS: u64 = 100;
/// Highest accepted `timeout_ms`.
pub const MAX_TIMEOUT_MS: u64 = 300_000;

// ---------------------------------------------------------------------------
// Device id validation
// ---------------------------------------------------------------------------

/// Validate a device id against `^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$`.
///
/// Hand-rolled so the check stays allocation-free and dependency-free.
pub fn validate_device_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    if id.len() > 64 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Device protocols
// ---------------------------------------------------------------------------

/// Wire protocol a station speaks to an attached instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProtocol {
    Scpi,
    Modbus,
    Cti,
    Ascii,
    Gpio,
}

impl std::fmt::Display for DeviceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceProtocol::Scpi => "scpi",
            DeviceProtocol::Modbus => "modbus",
            DeviceProtocol::Cti => "cti",
            DeviceProtocol::Ascii => "ascii",
            DeviceProtocol::Gpio => "gpio",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// device.command.request
// ---------------------------------------------------------------------------

/// Payload of `device.command.request`.
///
/// `command_name` is either a profile-defined symbol (`measure_dc_voltage`)
/// or a raw device command (`MEAS:VOLT:DC?`); interpretation is up to the
/// station.  Parameter values are strings only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandRequest {
    pub device_id: String,
    pub command_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl CommandRequest {
    pub fn new(device_id: impl Into<String>, command_name: impl Into<String>) -> Self {
        CommandRequest {
            device_id: device_id.into(),
            command_name: command_name.into(),
            parameters: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Structural checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), String> {
        if !validate_device_id(&self.device_id) {
            return Err(format!("invalid device_id '{}'", self.device_id));
        }
        if self.command_name.is_empty() {
            return Err("command_name must not be empty".to_owned());
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(format!(
                "timeout_ms {} outside [{}, {}]",
                self.timeout_ms, MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// device.command.response
// ---------------------------------------------------------------------------

/// Error detail carried in a failed command response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandError {
    /// One of the frozen `error_codes` device codes.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Payload of `device.command.response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandResponse {
    pub device_id: String,
    pub command_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl CommandResponse {
    /// A successful response carrying the device's reply text.
    pub fn ok(
        device_id: impl Into<String>,
        command_name: impl Into<String>,
        response: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        CommandResponse {
            device_id: device_id.into(),
            command_name: command_name.into(),
            success: true,
            response: Some(response.into()),
            duration_ms: Some(duration_ms),
            error: None,
        }
    }

    /// A failed response with a frozen error code.
    pub fn failed(
        device_id: impl Into<String>,
        command_name: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CommandResponse {
            device_id: device_id.into(),
            command_name: command_name.into(),
            success: false,
            response: None,
            duration_ms: None,
            error: Some(CommandError {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.success {
            if self.error.is_some() {
                return Err("successful response must not carry an error".to_owned());
            }
        } else {
            match &self.error {
                None => return Err("failed response must carry an error".to_owned()),
                Some(err) if !crate::error_codes::is_device_code(&err.code) => {
                    return Err(format!("unknown error code '{}'", err.code));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// service.heartbeat
// ---------------------------------------------------------------------------

/// Payload of `service.heartbeat`, published by stations every ~30 s.
///
/// Required fields match what every firmware build reports; the optional
/// counters arrived in later firmware revisions and default to absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    pub status: String,
    pub uptime_seconds: u64,
    pub devices: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_types: BTreeMap<String, DeviceProtocol>,
    pub free_heap: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_free_heap: Option<u64>,
    pub wifi_rssi: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_reconnects: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_reconnects: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_failed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_resets: Option<u32>,
    pub firmware_version: String,
}

impl Heartbeat {
    pub fn validate(&self) -> Result<(), String> {
        for device in &self.devices {
            if !validate_device_id(device) {
                return Err(format!("invalid device id '{}' in heartbeat", device));
            }
        }
        // device_types may only describe advertised devices.
        for id in self.device_types.keys() {
            if !self.devices.iter().any(|d| d == id) {
                return Err(format!("device_types entry '{}' not in devices list", id));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// system.emergency_stop
// ---------------------------------------------------------------------------

/// Payload of `system.emergency_stop`.
///
/// Published both as pub/sub (latency) and as a durable stream append
/// (audit).  The station-local hardware interlock acts before this message
/// is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmergencyStop {
    pub reason: String,
    pub triggered_by: String,
    pub severity: String,
}

// ---------------------------------------------------------------------------
// system.ota.request
// ---------------------------------------------------------------------------

/// Payload of `system.ota.request` (controller -> station).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtaRequest {
    pub firmware_url: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_accepts_plain_and_hyphenated_ids() {
        assert!(validate_device_id("PUMP-01"));
        assert!(validate_device_id("dmm_main"));
        assert!(validate_device_id("A"));
        assert!(validate_device_id("relay-board-3"));
    }

    #[test]
    fn device_id_rejects_bad_shapes() {
        assert!(!validate_device_id(""));
        assert!(!validate_device_id("-leading-dash"));
        assert!(!validate_device_id("_underscore-first"));
        assert!(!validate_device_id("has space"));
        assert!(!validate_device_id("unicode-é"));
        let too_long = "a".repeat(65);
        assert!(!validate_device_id(&too_long));
        let max_len = "a".repeat(64);
        assert!(validate_device_id(&max_len));
    }

    #[test]
    fn command_request_timeout_bounds() {
        let mut req = CommandRequest::new("PUMP-01", "pump_status");
        assert!(req.validate().is_ok());

        req.timeout_ms = 99;
        assert!(req.validate().is_err());
        req.timeout_ms = 100;
        assert!(req.validate().is_ok());
        req.timeout_ms = 300_000;
        assert!(req.validate().is_ok());
        req.timeout_ms = 300_001;
        assert!(req.validate().is_err());
    }

    #[test]
    fn command_request_defaults_timeout_on_deserialize() {
        let req: CommandRequest = serde_json::from_str(
            r#"{"device_id":"DMM-01","command_name":"MEAS:VOLT:DC?"}"#,
        )
        .unwrap();
        assert_eq!(req.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(req.parameters.is_empty());
    }

    #[test]
    fn command_request_rejects_non_string_parameters() {
        let result: Result<CommandRequest, _> = serde_json::from_str(
            r#"{"device_id":"DMM-01","command_name":"x","parameters":{"range":10}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn command_request_rejects_unknown_fields() {
        let result: Result<CommandRequest, _> = serde_json::from_str(
            r#"{"device_id":"DMM-01","command_name":"x","bogus":true}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn command_response_requires_error_on_failure() {
        let ok = CommandResponse::ok("PUMP-01", "pump_status", "0", 12);
        assert!(ok.validate().is_ok());

        let failed = CommandResponse::failed(
            "PUMP-01",
            "pump_status",
            crate::error_codes::E_DEVICE_TIMEOUT,
            "no reply from pump",
        );
        assert!(failed.validate().is_ok());

        let mut inconsistent = ok.clone();
        inconsistent.success = false;
        inconsistent.error = None;
        assert!(inconsistent.validate().is_err());

        let mut bad_code = failed;
        bad_code.error.as_mut().unwrap().code = "E_MADE_UP".to_owned();
        assert!(bad_code.validate().is_err());
    }

    #[test]
    fn heartbeat_device_types_must_reference_devices() {
        let hb: Heartbeat = serde_json::from_str(
            r#"{
                "status": "online",
                "uptime_seconds": 120,
                "devices": ["PUMP-01"],
                "device_types": {"PUMP-01": "cti"},
                "free_heap": 180000,
                "wifi_rssi": -61,
                "firmware_version": "1.4.2"
            }"#,
        )
        .unwrap();
        assert!(hb.validate().is_ok());
        assert_eq!(hb.device_types["PUMP-01"], DeviceProtocol::Cti);

        let mut orphan = hb;
        orphan
            .device_types
            .insert("GHOST-01".to_owned(), DeviceProtocol::Gpio);
        assert!(orphan.validate().is_err());
    }
}
