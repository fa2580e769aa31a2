use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::JhviewError;

/// Fixed address the device assigns itself on its own access point.
pub const DEFAULT_DEVICE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 100, 1);
pub const DEFAULT_CONTROL_PORT: u16 = 8081;
pub const DEFAULT_DATA_PORT: u16 = 8080;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "JHVIEW_CONFIG";

/// Engine configuration: device addressing, timings and redundancy.
///
/// Timing values are device-firmware tuned defaults, not protocol minima.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(alias = "deviceIp")]
    pub device_ip: IpAddr,
    #[serde(alias = "controlPort")]
    pub control_port: u16,
    /// Local UDP port the device pushes frames to. `0` binds an ephemeral
    /// port, which is only useful against a simulated device.
    #[serde(alias = "dataPort")]
    pub data_port: u16,
    #[serde(alias = "bindIp")]
    pub bind_ip: IpAddr,
    #[serde(alias = "keepaliveIntervalMs")]
    pub keepalive_interval_ms: u64,
    #[serde(alias = "reconnectBackoffMs")]
    pub reconnect_backoff_ms: u64,
    #[serde(alias = "handshakeDelayMs")]
    pub handshake_delay_ms: u64,
    #[serde(alias = "redundantSendCount")]
    pub redundant_send_count: u32,
    #[serde(alias = "redundantSendSpacingMs")]
    pub redundant_send_spacing_ms: u64,
    #[serde(alias = "startStreamRepeats")]
    pub start_stream_repeats: u32,
    #[serde(alias = "recvTimeoutMs")]
    pub recv_timeout_ms: u64,
    #[serde(alias = "commandTimeoutMs")]
    pub command_timeout_ms: u64,
    #[serde(alias = "joinTimeoutMs")]
    pub join_timeout_ms: u64,
    #[serde(alias = "maxDatagramBytes")]
    pub max_datagram_bytes: usize,
    #[serde(alias = "livenessThresholdMs")]
    pub liveness_threshold_ms: u64,
    /// Drop data datagrams whose source IP is not `device_ip`.
    #[serde(alias = "strictSource")]
    pub strict_source: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_ip: IpAddr::V4(DEFAULT_DEVICE_IP),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: DEFAULT_DATA_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            keepalive_interval_ms: 5_000,
            reconnect_backoff_ms: 3_000,
            handshake_delay_ms: 100,
            redundant_send_count: 2,
            redundant_send_spacing_ms: 50,
            start_stream_repeats: 2,
            recv_timeout_ms: 100,
            command_timeout_ms: 1_000,
            join_timeout_ms: 1_500,
            max_datagram_bytes: 2_048,
            liveness_threshold_ms: 3_000,
            strict_source: true,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, JhviewError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    /// Builds the effective config: `JHVIEW_CONFIG` file if set, then
    /// per-field env overrides, then validation.
    pub fn load() -> Result<Self, JhviewError> {
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_json_file(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `JHVIEW_DEVICE_IP`, `JHVIEW_CONTROL_PORT` and `JHVIEW_DATA_PORT`.
    pub fn apply_env_overrides(&mut self) -> Result<(), JhviewError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), JhviewError> {
        if let Some(ip) = lookup("JHVIEW_DEVICE_IP") {
            self.device_ip = ip.trim().parse().map_err(|_| JhviewError::ConfigurationInvalid {
                reason: format!("JHVIEW_DEVICE_IP is not an IP address: {ip}"),
            })?;
            debug!("device_ip overridden from env: {}", self.device_ip);
        }
        if let Some(port) = lookup("JHVIEW_CONTROL_PORT") {
            self.control_port = parse_port("JHVIEW_CONTROL_PORT", &port)?;
        }
        if let Some(port) = lookup("JHVIEW_DATA_PORT") {
            self.data_port = parse_port("JHVIEW_DATA_PORT", &port)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), JhviewError> {
        let invalid = |reason: &str| {
            Err(JhviewError::ConfigurationInvalid {
                reason: reason.to_owned(),
            })
        };
        if self.control_port == 0 {
            return invalid("control_port must be non-zero");
        }
        if self.redundant_send_count == 0 {
            return invalid("redundant_send_count must be at least 1");
        }
        if self.recv_timeout_ms == 0 {
            return invalid("recv_timeout_ms must be non-zero");
        }
        if self.keepalive_interval_ms == 0 {
            return invalid("keepalive_interval_ms must be non-zero");
        }
        if self.max_datagram_bytes <= 8 {
            return invalid("max_datagram_bytes must exceed the 8-byte packet header");
        }
        Ok(())
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.device_ip, self.control_port)
    }

    pub fn data_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.data_port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    pub fn redundant_send_spacing(&self) -> Duration {
        Duration::from_millis(self.redundant_send_spacing_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_millis(self.liveness_threshold_ms)
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, JhviewError> {
    value.trim().parse().map_err(|_| JhviewError::ConfigurationInvalid {
        reason: format!("{key} is not a port number: {value}"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.keepalive_interval(), Duration::from_secs(5));
        assert_eq!(cfg.reconnect_backoff(), Duration::from_secs(3));
        assert_eq!(cfg.control_addr().to_string(), "192.168.100.1:8081");
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "deviceIp": "10.0.0.7",
            "controlPort": 9000,
            "keepaliveIntervalMs": 2500,
            "strictSource": false
        }"#;

        let cfg: EngineConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.device_ip, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.control_port, 9000);
        assert_eq!(cfg.keepalive_interval_ms, 2_500);
        assert!(!cfg.strict_source);
        // untouched fields keep their defaults
        assert_eq!(cfg.reconnect_backoff_ms, 3_000);
    }

    #[test]
    fn deserializes_snake_case_fields() {
        let json = r#"{ "data_port": 20001, "handshake_delay_ms": 200 }"#;

        let cfg: EngineConfig = serde_json::from_str(json).expect("valid snake_case config");
        assert_eq!(cfg.data_port, 20_001);
        assert_eq!(cfg.handshake_delay_ms, 200);
    }

    #[test]
    fn loads_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "reconnectBackoffMs": 2000 }}"#).unwrap();

        let cfg = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(cfg.reconnect_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn env_overrides_replace_addressing() {
        let vars: HashMap<&str, &str> = [
            ("JHVIEW_DEVICE_IP", "127.0.0.1"),
            ("JHVIEW_CONTROL_PORT", "4000"),
            ("JHVIEW_DATA_PORT", " 4001 "),
        ]
        .into_iter()
        .collect();

        let mut cfg = EngineConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.control_addr().to_string(), "127.0.0.1:4000");
        assert_eq!(cfg.data_port, 4001);
    }

    #[test]
    fn bad_env_override_is_rejected() {
        let mut cfg = EngineConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "JHVIEW_CONTROL_PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(matches!(err, JhviewError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn validation_rejects_zero_control_port() {
        let cfg = EngineConfig { control_port: 0, ..Default::default() };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig { max_datagram_bytes: 8, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
