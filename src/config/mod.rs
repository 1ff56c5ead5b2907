//! # Configuration Management Module
//!
//! Static configuration for the logger: where the bus is, which broker to talk
//! to, and where data lives. Loaded once at startup from a TOML file; settings
//! that can change at runtime (poll period, baud rate, output format, the
//! request list) live in the [`crate::persist`] store instead.
//!
//! ## Configuration File Format
//!
//! ```toml
//! [mqtt]
//! host = "broker.example.net"
//! port = 8883
//! username = "logger"
//! password = "secret"
//! client_id = "buslogger"
//! zone = "greenhouse-north"
//! control_topic = "logger/greenhouse-north/config"
//! keep_alive_secs = 30
//! # ca_cert = "/etc/buslogger/root-ca.pem"
//!
//! [bus]
//! port = "/dev/ttyUSB0"
//! turnaround_ms = 250
//!
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! # file = "buslogger.log"
//! ```
//!
//! Telemetry topics are derived, not configured: readings publish to
//! `{username}/{zone}/{peer address}`, with a per-value letter suffix in
//! segmented mode.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub bus: BusConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Zone identifier used in telemetry topic paths.
    pub zone: String,
    /// Topic carrying inbound configuration commands.
    pub control_topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// PEM CA certificate path; enables TLS on the broker connection when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Serial device node of the RS-485 transceiver.
    pub port: String,
    /// Fixed wait between a transmit and reading the reply.
    #[serde(default = "default_turnaround_ms")]
    pub turnaround_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for the settings store and the reading log.
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; console output is kept when stdout is a TTY.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_client_id() -> String {
    "buslogger".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_turnaround_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub async fn load(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("cannot read config file {}: {}", path, e))?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| anyhow!("cannot parse {}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Write a starter configuration file. Refuses to overwrite.
    pub async fn create_default(path: &str) -> Result<()> {
        if fs::metadata(path).await.is_ok() {
            return Err(anyhow!("{} already exists", path));
        }
        let config = Config {
            mqtt: MqttConfig {
                host: "broker.example.net".to_string(),
                port: 8883,
                username: "logger".to_string(),
                password: "change-me".to_string(),
                client_id: default_client_id(),
                zone: "zone-1".to_string(),
                control_topic: "logger/zone-1/config".to_string(),
                keep_alive_secs: default_keep_alive(),
                ca_cert: None,
            },
            bus: BusConfig {
                port: "/dev/ttyUSB0".to_string(),
                turnaround_ms: default_turnaround_ms(),
            },
            storage: StorageConfig {
                data_dir: "./data".to_string(),
            },
            logging: LoggingConfig::default(),
        };
        fs::write(path, toml::to_string_pretty(&config)?).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(anyhow!("mqtt.host must not be empty"));
        }
        if self.mqtt.zone.trim().is_empty() || self.mqtt.zone.contains('/') {
            return Err(anyhow!("mqtt.zone must be a single non-empty topic segment"));
        }
        if self.mqtt.control_topic.trim().is_empty() {
            return Err(anyhow!("mqtt.control_topic must not be empty"));
        }
        if self.bus.port.trim().is_empty() {
            return Err(anyhow!("bus.port must not be empty"));
        }
        if self.bus.turnaround_ms == 0 {
            return Err(anyhow!("bus.turnaround_ms must be at least 1"));
        }
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(anyhow!("unknown logging.level {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        toml::from_str(
            r#"
            [mqtt]
            host = "broker.example.net"
            port = 8883
            username = "logger"
            password = "secret"
            zone = "greenhouse"
            control_topic = "logger/greenhouse/config"

            [bus]
            port = "/dev/ttyUSB0"

            [storage]
            data_dir = "./data"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let cfg = sample();
        assert_eq!(cfg.mqtt.client_id, "buslogger");
        assert_eq!(cfg.mqtt.keep_alive_secs, 30);
        assert_eq!(cfg.bus.turnaround_ms, 250);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_multi_segment_zone() {
        let mut cfg = sample();
        cfg.mqtt.zone = "a/b".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_turnaround() {
        let mut cfg = sample();
        cfg.bus.turnaround_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut cfg = sample();
        cfg.logging.level = "loud".to_string();
        assert!(cfg.validate().is_err());
    }
}
