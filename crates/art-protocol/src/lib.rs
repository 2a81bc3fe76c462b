// art-protocol: Message envelope and payload types for the Arturo backbone.
//
// Every message on the bus is wrapped in a uniform `Envelope`; the payload
// is type-specific and validated against the declared `type` tag.  The
// envelope layer itself treats payloads as opaque JSON.

pub mod envelope;
pub mod payload;

pub use envelope::{Envelope, ProtocolError, Source, SCHEMA_VERSION};
pub use payload::{
    validate_device_id, CommandError, CommandRequest, CommandResponse, DeviceProtocol,
    EmergencyStop, Heartbeat, OtaRequest, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS,
};

/// Dotted lowercase type tags for all v1.0.0 message kinds.
pub mod message_types {
    pub const DEVICE_COMMAND_REQUEST: &str = "device.command.request";
    pub const DEVICE_COMMAND_RESPONSE: &str = "device.command.response";
    pub const SERVICE_HEARTBEAT: &str = "service.heartbeat";
    pub const SYSTEM_EMERGENCY_STOP: &str = "system.emergency_stop";
    pub const SYSTEM_OTA_REQUEST: &str = "system.ota.request";
}

/// Frozen v1 device error codes carried in `CommandResponse.error.code`.
pub mod error_codes {
    pub const E_DEVICE_TIMEOUT: &str = "E_DEVICE_TIMEOUT";
    pub const E_DEVICE_NOT_FOUND: &str = "E_DEVICE_NOT_FOUND";
    pub const E_DEVICE_NOT_CONNECTED: &str = "E_DEVICE_NOT_CONNECTED";
    pub const E_DEVICE_ERROR: &str = "E_DEVICE_ERROR";
    pub const E_COMMAND_FAILED: &str = "E_COMMAND_FAILED";
    pub const E_VALIDATION_FAILED: &str = "E_VALIDATION_FAILED";
    pub const E_INVALID_PARAMETER: &str = "E_INVALID_PARAMETER";
    pub const E_INTERNAL: &str = "E_INTERNAL";

    // Station lifecycle codes surfaced by the controller, not by stations.
    pub const E_STATION_BUSY: &str = "E_STATION_BUSY";
    pub const E_STATION_OFFLINE: &str = "E_STATION_OFFLINE";
    pub const E_SCRIPT_PARSE_FAILED: &str = "E_SCRIPT_PARSE_FAILED";

    /// True for codes a station may legally place in `CommandResponse.error`.
    pub fn is_device_code(code: &str) -> bool {
        matches!(
            code,
            E_DEVICE_TIMEOUT
                | E_DEVICE_NOT_FOUND
                | E_DEVICE_NOT_CONNECTED
                | E_DEVICE_ERROR
                | E_COMMAND_FAILED
                | E_VALIDATION_FAILED
                | E_INVALID_PARAMETER
                | E_INTERNAL
        )
    }
}
