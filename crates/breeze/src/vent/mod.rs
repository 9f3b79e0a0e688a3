//! Vent Model
//!
//! A [`VentNode`] is the authoritative record of one vent. Nodes live inside
//! the [`VentRegistry`] and are only mutated while its lock is held; nothing
//! outside the registry keeps a node reference across an await.

mod registry;

pub use registry::VentRegistry;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use breeze_protocol::VentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ControlConfig, ControlPolicy, GatewayConfig};
use crate::control::PositionController;
use crate::dispatch::CommandQueue;
use crate::transport::SharedLink;

// ─────────────────────────────────────────────────────────────────────────────
// States
// ─────────────────────────────────────────────────────────────────────────────

/// Link lifecycle of one vent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No connect has succeeded and none is running
    Unconnected,
    Connecting,
    Connected,
    /// Lost after a successful connect; eligible for reconnection
    Disconnected,
    /// Reconnect attempts exhausted; only an explicit reset revives it
    GivenUp,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Unconnected => "unconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::GivenUp => "given_up",
        };
        f.write_str(s)
    }
}

/// Who decides the vent position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Set directly by the application
    #[default]
    Manual,
    /// Driven by the position controller from temperature error
    Auto,
}

/// Per-node settings taken from the gateway config
#[derive(Debug, Clone)]
pub struct NodeDefaults {
    pub max_reconnect_attempts: u32,
    pub queue_capacity: usize,
    pub desired_temperature: f32,
    pub control: ControlConfig,
}

impl NodeDefaults {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_reconnect_attempts: config.links.max_reconnect_attempts,
            queue_capacity: config.dispatch.queue_capacity,
            desired_temperature: config.control.default_desired_temperature,
            control: config.control.clone(),
        }
    }
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vent Node
// ─────────────────────────────────────────────────────────────────────────────

/// State of one vent
pub struct VentNode {
    id: VentId,
    current_temperature: f32,
    desired_temperature: f32,
    position: Option<u8>,
    mode: Mode,
    link_state: LinkState,
    /// Set on the first successful connect and kept for reconnection
    device_name: Option<String>,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    last_disconnect: Option<Instant>,
    /// Present iff `link_state == Connected`
    link: Option<SharedLink>,
    connected_since: Option<DateTime<Utc>>,
    controller: PositionController,
    pub(crate) last_command: Option<Instant>,
    pub(crate) pending: CommandQueue,
}

impl VentNode {
    pub fn new(id: VentId, defaults: &NodeDefaults) -> Self {
        Self {
            id,
            current_temperature: 0.0,
            desired_temperature: defaults.desired_temperature,
            position: None,
            mode: Mode::Manual,
            link_state: LinkState::Unconnected,
            device_name: None,
            reconnect_attempts: 0,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            last_disconnect: None,
            link: None,
            connected_since: None,
            controller: PositionController::from_config(&defaults.control),
            last_command: None,
            pending: CommandQueue::new(defaults.queue_capacity),
        }
    }

    pub fn id(&self) -> VentId {
        self.id
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn position(&self) -> Option<u8> {
        self.position
    }

    pub fn current_temperature(&self) -> f32 {
        self.current_temperature
    }

    pub fn desired_temperature(&self) -> f32 {
        self.desired_temperature
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_disconnect(&self) -> Option<Instant> {
        self.last_disconnect
    }

    /// The live link, if connected
    pub fn link(&self) -> Option<&SharedLink> {
        self.link.as_ref()
    }

    /// Whether `link` is the one this node currently holds
    pub fn owns_link(&self, link: &SharedLink) -> bool {
        self.link.as_ref().is_some_and(|own| Arc::ptr_eq(own, link))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Link lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Enter `Connecting`; refused while connecting, connected or given up
    pub fn begin_connect(&mut self) -> bool {
        match self.link_state {
            LinkState::Unconnected | LinkState::Disconnected => {
                self.link_state = LinkState::Connecting;
                true
            }
            LinkState::Connecting | LinkState::Connected | LinkState::GivenUp => false,
        }
    }

    pub fn mark_connected(&mut self, device_name: &str, link: SharedLink) {
        self.link_state = LinkState::Connected;
        self.device_name = Some(device_name.to_string());
        self.reconnect_attempts = 0;
        self.link = Some(link);
        self.connected_since = Some(Utc::now());
    }

    /// A first connect failed for good
    ///
    /// Without a device name there is nothing to reconnect to, so the node
    /// goes back to `Unconnected`.
    pub fn mark_connect_abandoned(&mut self) {
        if self.link_state != LinkState::Connecting {
            return;
        }
        self.link_state = if self.device_name.is_some() {
            LinkState::Disconnected
        } else {
            LinkState::Unconnected
        };
    }

    /// `Connected -> Disconnected`, returning the link to tear down
    pub fn mark_disconnected(&mut self, now: Instant) -> Option<SharedLink> {
        if self.link_state != LinkState::Connected {
            return None;
        }
        self.link_state = LinkState::Disconnected;
        self.last_disconnect = Some(now);
        self.connected_since = None;
        self.link.take()
    }

    /// Count a failed reconnect and re-stamp the disconnect time
    pub fn record_reconnect_failure(&mut self, now: Instant) -> LinkState {
        self.reconnect_attempts = (self.reconnect_attempts + 1).min(self.max_reconnect_attempts);
        self.last_disconnect = Some(now);
        self.link_state = if self.reconnect_attempts >= self.max_reconnect_attempts {
            LinkState::GivenUp
        } else {
            LinkState::Disconnected
        };
        self.link_state
    }

    /// `base * 2^reconnect_attempts`
    pub fn reconnect_backoff(&self, base: Duration) -> Duration {
        base.saturating_mul(1u32 << self.reconnect_attempts.min(16))
    }

    /// Whether the monitor should start a reconnect now
    pub fn reconnect_due(&self, now: Instant, base: Duration) -> bool {
        if self.link_state != LinkState::Disconnected
            || self.device_name.is_none()
            || self.reconnect_attempts >= self.max_reconnect_attempts
        {
            return false;
        }
        match self.last_disconnect {
            Some(at) => now.saturating_duration_since(at) >= self.reconnect_backoff(base),
            None => true,
        }
    }

    /// External reset out of `GivenUp` or `Disconnected`
    pub fn reset_reconnect(&mut self) -> bool {
        match self.link_state {
            LinkState::GivenUp | LinkState::Disconnected => {
                self.reconnect_attempts = 0;
                self.link_state = if self.device_name.is_some() {
                    LinkState::Disconnected
                } else {
                    LinkState::Unconnected
                };
                true
            }
            _ => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_auto(&mut self, desired: f32) {
        self.mode = Mode::Auto;
        self.desired_temperature = desired;
    }

    pub fn set_manual(&mut self, position: u8) {
        self.mode = Mode::Manual;
        self.position = Some(position);
    }

    /// Record a temperature reading
    ///
    /// Returns the new position to dispatch when the vent is in auto mode,
    /// the reading moved by more than `deadband` and the controller picked a
    /// different position.
    pub fn apply_telemetry(&mut self, temperature: f32, deadband: f32) -> Option<u8> {
        let previous = self.current_temperature;
        self.current_temperature = temperature;

        if self.mode != Mode::Auto || (temperature - previous).abs() <= deadband {
            return None;
        }

        let target = self
            .controller
            .compute(temperature, self.desired_temperature, self.position)?;
        if self.position == Some(target) {
            return None;
        }
        self.position = Some(target);
        Some(target)
    }

    /// The vent moved under direct command
    pub fn apply_motor_feedback(&mut self, value: f32) {
        self.mode = Mode::Manual;
        self.position = Some(value.round().clamp(0.0, 100.0) as u8);
    }

    pub fn reset_controller(&mut self) {
        self.controller.reset();
    }

    pub fn status(&self) -> VentStatus {
        VentStatus {
            id: self.id,
            device_name: self.device_name.clone(),
            link_state: self.link_state,
            mode: self.mode,
            policy: self.controller.policy(),
            current_temperature: self.current_temperature,
            desired_temperature: self.desired_temperature,
            position: self.position,
            reconnect_attempts: self.reconnect_attempts,
            queued_commands: self.pending.to_vec(),
            connected_since: self.connected_since,
        }
    }
}

impl fmt::Debug for VentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VentNode")
            .field("id", &self.id)
            .field("link_state", &self.link_state)
            .field("device_name", &self.device_name)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of a vent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VentStatus {
    pub id: VentId,
    pub device_name: Option<String>,
    pub link_state: LinkState,
    pub mode: Mode,
    pub policy: ControlPolicy,
    pub current_temperature: f32,
    pub desired_temperature: f32,
    pub position: Option<u8>,
    pub reconnect_attempts: u32,
    pub queued_commands: Vec<u8>,
    pub connected_since: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingLink;

    fn node() -> VentNode {
        VentNode::new(VentId(1), &NodeDefaults::default())
    }

    fn connected() -> VentNode {
        let mut node = node();
        assert!(node.begin_connect());
        node.mark_connected("esp-vent-A", RecordingLink::new("esp-vent-A"));
        node
    }

    #[test]
    fn test_connect_sets_name_and_link() {
        let node = connected();
        assert_eq!(node.link_state(), LinkState::Connected);
        assert_eq!(node.device_name(), Some("esp-vent-A"));
        assert_eq!(node.reconnect_attempts(), 0);
        assert!(node.link().is_some());
        assert!(node.status().connected_since.is_some());
    }

    #[test]
    fn test_begin_connect_refused_while_busy() {
        let mut node = connected();
        assert!(!node.begin_connect());

        node.mark_disconnected(Instant::now());
        assert!(node.begin_connect());
        assert!(!node.begin_connect());
    }

    #[test]
    fn test_failed_first_connect_returns_to_unconnected() {
        let mut node = node();
        node.begin_connect();
        node.mark_connect_abandoned();
        assert_eq!(node.link_state(), LinkState::Unconnected);
        assert!(!node.reconnect_due(Instant::now(), Duration::ZERO));
    }

    #[test]
    fn test_disconnect_releases_link() {
        let mut node = connected();
        let now = Instant::now();
        assert!(node.mark_disconnected(now).is_some());
        assert_eq!(node.link_state(), LinkState::Disconnected);
        assert!(node.link().is_none());
        assert_eq!(node.last_disconnect(), Some(now));
        assert!(node.mark_disconnected(now).is_none());
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_secs(5);
        let mut node = connected();
        let start = Instant::now();
        node.mark_disconnected(start);

        let expected = [5, 10, 20, 40, 80];
        for (attempt, secs) in expected.iter().enumerate() {
            assert_eq!(node.reconnect_attempts() as usize, attempt);
            assert_eq!(node.reconnect_backoff(base), Duration::from_secs(*secs));

            let stamp = node.last_disconnect().unwrap();
            assert!(!node.reconnect_due(stamp + Duration::from_secs(*secs) - Duration::from_millis(1), base));
            assert!(node.reconnect_due(stamp + Duration::from_secs(*secs), base));

            node.begin_connect();
            node.record_reconnect_failure(stamp + Duration::from_secs(*secs));
        }

        assert_eq!(node.link_state(), LinkState::GivenUp);
        assert_eq!(node.reconnect_attempts(), 5);
        assert!(!node.reconnect_due(start + Duration::from_secs(3600), base));
    }

    #[test]
    fn test_reset_revives_given_up_node() {
        let mut node = connected();
        node.mark_disconnected(Instant::now());
        for _ in 0..5 {
            node.record_reconnect_failure(Instant::now());
        }
        assert_eq!(node.link_state(), LinkState::GivenUp);
        assert!(!node.begin_connect());

        assert!(node.reset_reconnect());
        assert_eq!(node.link_state(), LinkState::Disconnected);
        assert_eq!(node.reconnect_attempts(), 0);
    }

    #[test]
    fn test_telemetry_in_auto_mode_moves_vent() {
        let mut node = connected();
        node.set_manual(50);
        node.set_auto(24.0);

        assert_eq!(node.apply_telemetry(26.0, 0.1), Some(100));
        assert_eq!(node.position(), Some(100));
        // same reading, inside the deadband
        assert_eq!(node.apply_telemetry(26.05, 0.1), None);
        // controller keeps 100 inside the band
        assert_eq!(node.apply_telemetry(24.5, 0.1), None);
        assert_eq!(node.apply_telemetry(23.0, 0.1), Some(0));
    }

    #[test]
    fn test_telemetry_in_manual_mode_only_records() {
        let mut node = connected();
        node.set_manual(40);
        assert_eq!(node.apply_telemetry(30.0, 0.1), None);
        assert_eq!(node.current_temperature(), 30.0);
        assert_eq!(node.position(), Some(40));
    }

    #[test]
    fn test_motor_feedback_forces_manual() {
        let mut node = connected();
        node.set_auto(22.0);
        node.apply_motor_feedback(39.6);
        assert_eq!(node.mode(), Mode::Manual);
        assert_eq!(node.position(), Some(40));
    }

    #[test]
    fn test_status_serializes() {
        let node = connected();
        let json = serde_json::to_value(node.status()).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["link_state"], "connected");
        assert_eq!(json["mode"], "manual");
        assert_eq!(json["policy"], "hysteresis");
    }
}
