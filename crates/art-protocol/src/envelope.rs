//! The uniform message envelope.
//!
//! `build` assigns a fresh UUID and the current UTC epoch-seconds; `parse`
//! rejects messages missing required envelope fields for the declared type
//! and payloads failing the structural checks for that type.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::message_types;
use crate::payload::{CommandRequest, CommandResponse, EmergencyStop, Heartbeat, OtaRequest};

/// Envelope schema version tag stamped on every message.
pub const SCHEMA_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Identifies the emitting process: service name, instance id, version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub service: String,
    pub instance: String,
    pub version: String,
}

impl Source {
    pub fn new(
        service: impl Into<String>,
        instance: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Source {
            service: service.into(),
            instance: instance.into(),
            version: version.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Envelope codec failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Bytes were not valid JSON / UTF-8.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// JSON was well-formed but violated the envelope or payload schema.
    #[error("schema error: {0}")]
    Schema(String),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The outer record wrapping every message on the bus.
///
/// The payload is opaque at this layer; `validate` checks it structurally
/// against the declared `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    /// UTC epoch seconds.
    pub timestamp: i64,
    pub source: Source,
    pub schema_version: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a validated envelope with a fresh UUID and current timestamp.
    pub fn build(
        source: Source,
        message_type: &str,
        correlation_id: Option<Uuid>,
        reply_to: Option<String>,
        payload: serde_json::Value,
    ) -> Result<Envelope, ProtocolError> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            timestamp: Utc::now().timestamp(),
            source,
            schema_version: SCHEMA_VERSION.to_owned(),
            message_type: message_type.to_owned(),
            correlation_id,
            reply_to,
            payload,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Parse and validate an envelope from wire bytes.
    pub fn parse(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }

    /// Deserialize the payload as a concrete payload type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::Schema(format!("payload: {}", e)))
    }

    /// Validate envelope fields and the payload structure for the declared
    /// message type.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.source.service.is_empty() || self.source.instance.is_empty() {
            return Err(ProtocolError::Schema(
                "source.service and source.instance must be non-empty".to_owned(),
            ));
        }
        if self.schema_version != SCHEMA_VERSION {
            return Err(ProtocolError::Schema(format!(
                "unsupported schema_version '{}'",
                self.schema_version
            )));
        }

        match self.message_type.as_str() {
            message_types::DEVICE_COMMAND_REQUEST => {
                self.require_correlation_id()?;
                if self.reply_to.is_none() {
                    return Err(ProtocolError::Schema(
                        "device.command.request requires reply_to".to_owned(),
                    ));
                }
                let req: CommandRequest = self.payload_as()?;
                req.validate().map_err(ProtocolError::Schema)?;
            }
            message_types::DEVICE_COMMAND_RESPONSE => {
                self.require_correlation_id()?;
                let resp: CommandResponse = self.payload_as()?;
                resp.validate().map_err(ProtocolError::Schema)?;
            }
            message_types::SERVICE_HEARTBEAT => {
                let hb: Heartbeat = self.payload_as()?;
                hb.validate().map_err(ProtocolError::Schema)?;
            }
            message_types::SYSTEM_EMERGENCY_STOP => {
                let _: EmergencyStop = self.payload_as()?;
            }
            message_types::SYSTEM_OTA_REQUEST => {
                self.require_correlation_id()?;
                let _: OtaRequest = self.payload_as()?;
            }
            other => {
                return Err(ProtocolError::Schema(format!(
                    "unknown message type '{}'",
                    other
                )));
            }
        }
        Ok(())
    }

    fn require_correlation_id(&self) -> Result<(), ProtocolError> {
        if self.correlation_id.is_none() {
            return Err(ProtocolError::Schema(format!(
                "{} requires correlation_id",
                self.message_type
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
