//! Controller configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides
//! (RUST_LOG excepted).  Default config path: `/etc/arturo/controller.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `instance`
//! - `bus.redis_url`

use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/arturo/controller.toml";

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub schema_version: u32,
    /// Controller instance id, e.g. `controller-01`.
    pub instance: String,
    pub bus: BusConfig,
    pub liveness: LivenessConfig,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub redis_url: String,
    /// Approximate max length writers keep streams trimmed to.
    pub stream_max_len: usize,
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Stations not heard from within this window are offline.
    pub window_secs: u64,
    /// Sweep cadence.
    pub sweep_secs: u64,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    instance: Option<String>,
    bus: Option<RawBusConfig>,
    liveness: Option<RawLivenessConfig>,
}

#[derive(Debug, Deserialize)]
struct RawBusConfig {
    redis_url: Option<String>,
    stream_max_len: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawLivenessConfig {
    window_secs: Option<u64>,
    sweep_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config read error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub fn load_config_from(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<ControllerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::Invalid("schema_version is required".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::Invalid(format!(
            "unsupported schema_version {}",
            schema_version
        )));
    }
    let instance = raw
        .instance
        .filter(|i| !i.is_empty())
        .ok_or_else(|| ConfigError::Invalid("instance is required".to_owned()))?;
    let raw_bus = raw
        .bus
        .ok_or_else(|| ConfigError::Invalid("[bus] section is required".to_owned()))?;
    let redis_url = raw_bus
        .redis_url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ConfigError::Invalid("bus.redis_url is required".to_owned()))?;

    let liveness = raw.liveness.unwrap_or(RawLivenessConfig {
        window_secs: None,
        sweep_secs: None,
    });

    Ok(ControllerConfig {
        schema_version,
        instance,
        bus: BusConfig {
            redis_url,
            stream_max_len: raw_bus.stream_max_len.unwrap_or(10_000),
        },
        liveness: LivenessConfig {
            window_secs: liveness.window_secs.unwrap_or(90),
            sweep_secs: liveness.sweep_secs.unwrap_or(30),
        },
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
schema_version = 1
instance = "controller-01"

[bus]
redis_url = "redis://10.0.0.5:6379/"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.instance, "controller-01");
        assert_eq!(cfg.bus.stream_max_len, 10_000);
        assert_eq!(cfg.liveness.window_secs, 90);
        assert_eq!(cfg.liveness.sweep_secs, 30);
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        assert!(matches!(
            parse_config("schema_version = 1"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_config("instance = \"c\"\n[bus]\nredis_url = \"redis://x/\""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let text = MINIMAL.replace("schema_version = 1", "schema_version = 2");
        assert!(matches!(parse_config(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn overrides_apply() {
        let text = format!(
            "{}\nstream_max_len = 500\n\n[liveness]\nwindow_secs = 45\nsweep_secs = 10\n",
            MINIMAL
        );
        let cfg = parse_config(&text).unwrap();
        assert_eq!(cfg.bus.stream_max_len, 500);
        assert_eq!(cfg.liveness.window_secs, 45);
        assert_eq!(cfg.liveness.sweep_secs, 10);
    }
}
