//! Hub Configuration
//!
//! Defaults match the deployed hub. A TOML file and `BREEZE_*` environment
//! variables are layered on top, e.g.
//! `BREEZE_DISPATCH__MIN_COMMAND_INTERVAL_MS=250`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Top-level hub configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub network: NetworkConfig,
    pub links: LinkConfig,
    pub dispatch: DispatchConfig,
    pub control: ControlConfig,
    pub simulation: SimulationConfig,
}

impl GatewayConfig {
    /// Load defaults, then the optional TOML file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(GatewayError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: GatewayConfig = figment
            .merge(Env::prefixed("BREEZE_").split("__"))
            .extract()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the hub cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(GatewayError::Config(msg.to_string()));

        if self.network.receive_timeout_ms == 0 {
            return invalid("network.receive_timeout_ms must be positive");
        }
        if self.network.max_datagram_size < 4 {
            return invalid("network.max_datagram_size must hold a command code");
        }
        if self.links.initial_connect_attempts == 0 {
            return invalid("links.initial_connect_attempts must be positive");
        }
        if self.links.max_reconnect_attempts == 0 {
            return invalid("links.max_reconnect_attempts must be positive");
        }
        if self.links.monitor_interval_ms == 0 || self.links.reconnect_base_delay_ms == 0 {
            return invalid("links monitor interval and backoff base must be positive");
        }
        if self.dispatch.queue_capacity == 0 {
            return invalid("dispatch.queue_capacity must be positive");
        }
        if self.dispatch.poll_interval_ms == 0 {
            return invalid("dispatch.poll_interval_ms must be positive");
        }
        if self.control.pid.dt <= 0.0 {
            return invalid("control.pid.dt must be positive");
        }
        let HysteresisConfig {
            high_threshold,
            low_threshold,
        } = self.control.hysteresis;
        if !high_threshold.is_finite() || !low_threshold.is_finite() {
            return invalid("control.hysteresis thresholds must be finite");
        }
        // the band is [desired - low, desired + high]
        if high_threshold < 0.0 || low_threshold < 0.0 {
            return invalid("control.hysteresis thresholds must not be negative");
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GatewayError::Config(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// UDP link to the control application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the hub receives application packets on
    pub listen_addr: SocketAddr,
    /// Send reports to the learned application IP on this port instead of
    /// the port the first packet came from
    pub app_reply_port: Option<u16>,
    pub receive_timeout_ms: u64,
    pub max_datagram_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            app_reply_port: None,
            receive_timeout_ms: 1000,
            max_datagram_size: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Wireless link lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Attempts made for the first connect after a setup request
    pub initial_connect_attempts: u32,
    /// How long each first-connect attempt scans for the named peer
    pub scan_timeout_ms: u64,
    /// Pause between first-connect attempts
    pub inter_attempt_delay_ms: u64,
    /// Bound on a single monitor-driven reconnect
    pub reconnect_timeout_ms: u64,
    /// Consecutive reconnect failures before a vent is given up
    pub max_reconnect_attempts: u32,
    /// Backoff base; attempt k waits base * 2^k
    pub reconnect_base_delay_ms: u64,
    /// Period of the health check / reconnect sweep
    pub monitor_interval_ms: u64,
    /// Bound on a single characteristic write
    pub write_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            initial_connect_attempts: 3,
            scan_timeout_ms: 30_000,
            inter_attempt_delay_ms: 1_000,
            reconnect_timeout_ms: 15_000,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 5_000,
            monitor_interval_ms: 5_000,
            write_timeout_ms: 5_000,
        }
    }
}

impl LinkConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn inter_attempt_delay(&self) -> Duration {
        Duration::from_millis(self.inter_attempt_delay_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Per-vent command queue and rate limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub min_command_interval_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            min_command_interval_ms: 500,
            poll_interval_ms: 100,
        }
    }
}

impl DispatchConfig {
    pub fn min_command_interval(&self) -> Duration {
        Duration::from_millis(self.min_command_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Which controller drives vents in auto mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlPolicy {
    Pid,
    #[default]
    Hysteresis,
}

/// PID gains and nominal step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Fixed step between telemetry updates, not measured wall-clock time
    pub dt: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 1.5,
            ki: 0.5,
            kd: 0.05,
            dt: 1.0,
        }
    }
}

/// Hysteresis dead-band around the set point, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteresisConfig {
    pub high_threshold: f32,
    pub low_threshold: f32,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            high_threshold: 1.0,
            low_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub policy: ControlPolicy,
    pub pid: PidConfig,
    pub hysteresis: HysteresisConfig,
    /// Temperature change below which telemetry does not re-run the controller
    pub telemetry_deadband: f32,
    /// Set point a new vent starts with before the application sends one
    pub default_desired_temperature: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            policy: ControlPolicy::Hysteresis,
            pid: PidConfig::default(),
            hysteresis: HysteresisConfig::default(),
            telemetry_deadband: 0.1,
            default_desired_temperature: 23.0,
        }
    }
}

/// Behaviour of the simulated radio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub telemetry_interval_ms: u64,
    pub ambient_temperature: f32,
    /// Degrees of cooling a fully open vent pulls the room toward
    pub cooling_capacity: f32,
    pub noise: f32,
    pub connect_latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: 2_000,
            ambient_temperature: 25.0,
            cooling_capacity: 6.0,
            noise: 0.05,
            connect_latency_ms: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_deployed_hub() {
        let config = GatewayConfig::default();
        assert_eq!(config.network.listen_addr.port(), 5000);
        assert_eq!(config.links.initial_connect_attempts, 3);
        assert_eq!(config.links.scan_timeout(), Duration::from_secs(30));
        assert_eq!(config.links.reconnect_timeout(), Duration::from_secs(15));
        assert_eq!(config.links.max_reconnect_attempts, 5);
        assert_eq!(config.links.reconnect_base_delay(), Duration::from_secs(5));
        assert_eq!(config.dispatch.queue_capacity, 5);
        assert_eq!(config.dispatch.min_command_interval(), Duration::from_millis(500));
        assert_eq!(config.control.policy, ControlPolicy::Hysteresis);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        // env-touching tests run inside a jail so they cannot see each other
        figment::Jail::expect_with(|_jail| {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(
                file,
                r#"
[network]
listen_addr = "127.0.0.1:6000"
app_reply_port = 3001

[dispatch]
min_command_interval_ms = 300

[control]
policy = "pid"

[control.pid]
kp = 2.0
"#
            )
            .unwrap();

            let config = GatewayConfig::load(Some(file.path())).unwrap();
            assert_eq!(config.network.listen_addr, "127.0.0.1:6000".parse().unwrap());
            assert_eq!(config.network.app_reply_port, Some(3001));
            assert_eq!(config.dispatch.min_command_interval_ms, 300);
            assert_eq!(config.dispatch.queue_capacity, 5);
            assert_eq!(config.control.policy, ControlPolicy::Pid);
            assert_eq!(config.control.pid.kp, 2.0);
            assert_eq!(config.control.pid.ki, 0.5);
            Ok(())
        });
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = GatewayConfig::load(Some(&dir.path().join("hub.toml")));
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = GatewayConfig::default();
        config.dispatch.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_hysteresis_band() {
        let mut config = GatewayConfig::default();
        config.control.hysteresis.low_threshold = -2.0;
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));

        let mut config = GatewayConfig::default();
        config.control.hysteresis.high_threshold = f32::NAN;
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));

        let mut config = GatewayConfig::default();
        config.control.hysteresis.high_threshold = 0.0;
        config.control.hysteresis.low_threshold = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_environment_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BREEZE_DISPATCH__MIN_COMMAND_INTERVAL_MS", "250");
            jail.set_env("BREEZE_CONTROL__POLICY", "pid");

            let config = GatewayConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.dispatch.min_command_interval(), Duration::from_millis(250));
            assert_eq!(config.dispatch.queue_capacity, 5);
            assert_eq!(config.control.policy, ControlPolicy::Pid);
            Ok(())
        });
    }

    #[test]
    fn test_environment_wins_over_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("hub.toml", "[dispatch]\nmin_command_interval_ms = 750\n")?;
            jail.set_env("BREEZE_DISPATCH__MIN_COMMAND_INTERVAL_MS", "250");

            let path = jail.directory().join("hub.toml");
            let config = GatewayConfig::load(Some(&path)).map_err(|e| e.to_string())?;
            assert_eq!(config.dispatch.min_command_interval_ms, 250);
            Ok(())
        });
    }

    #[test]
    fn test_toml_rendering_round_trips() {
        let config = GatewayConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: GatewayConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
