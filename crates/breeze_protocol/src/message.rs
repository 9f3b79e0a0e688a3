//! Vent Characteristic Messages
//!
//! Vents notify the hub with short UTF-8 strings:
//!
//! - `"ID: <int>, temp: <float>"` - temperature telemetry
//! - `"ID: <int>, motor: <float>"` - the motor moved under direct command
//! - `"Connected"` - acknowledgment of the hub's handshake
//!
//! The hub writes `"Connected, Vent ID: <id>"` once after subscribing, then
//! bare decimal position strings.

use std::fmt;
use std::str::FromStr;

use crate::{ProtocolError, ProtocolResult, VentId};

const HANDSHAKE_ACK: &str = "Connected";
const HANDSHAKE_PREFIX: &str = "Connected, Vent ID:";

// ─────────────────────────────────────────────────────────────────────────────
// Vent -> Hub
// ─────────────────────────────────────────────────────────────────────────────

/// A notification received from a vent
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceMessage {
    /// Temperature report from the vent's sensor
    Telemetry { vent_id: VentId, temperature: f32 },
    /// Motor position report after a move
    Motor { vent_id: VentId, position: f32 },
    /// First notification after a fresh connect
    HandshakeAck,
}

impl DeviceMessage {
    /// Decode raw notification bytes
    pub fn parse(data: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::UnrecognizedMessage(String::from_utf8_lossy(data).into()))?;
        text.parse()
    }

    /// Vent id embedded in the message, if any
    pub fn vent_id(&self) -> Option<VentId> {
        match self {
            Self::Telemetry { vent_id, .. } | Self::Motor { vent_id, .. } => Some(*vent_id),
            Self::HandshakeAck => None,
        }
    }
}

impl FromStr for DeviceMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        let unrecognized = || ProtocolError::UnrecognizedMessage(text.to_string());

        if text == HANDSHAKE_ACK {
            return Ok(Self::HandshakeAck);
        }

        let rest = text.strip_prefix("ID:").ok_or_else(unrecognized)?;
        let (id, field) = rest.split_once(',').ok_or_else(unrecognized)?;
        let vent_id: VentId = id.parse().map_err(|_| unrecognized())?;
        let (key, value) = field.split_once(':').ok_or_else(unrecognized)?;
        let value = value
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(unrecognized)?;

        match key.trim() {
            "temp" => Ok(Self::Telemetry {
                vent_id,
                temperature: value,
            }),
            "motor" => Ok(Self::Motor {
                vent_id,
                position: value,
            }),
            _ => Err(unrecognized()),
        }
    }
}

impl fmt::Display for DeviceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Telemetry {
                vent_id,
                temperature,
            } => write!(f, "ID: {}, temp: {:.1}", vent_id, temperature),
            Self::Motor { vent_id, position } => {
                write!(f, "ID: {}, motor: {:.1}", vent_id, position)
            }
            Self::HandshakeAck => f.write_str(HANDSHAKE_ACK),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub -> Vent
// ─────────────────────────────────────────────────────────────────────────────

/// A write the hub sends to a vent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubCommand {
    /// Assigns the vent its id right after subscribing
    Handshake { vent_id: VentId },
    /// Move to an opening percentage (0-100)
    Position(u8),
}

impl HubCommand {
    /// Bytes written to the vent's write characteristic
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decode a write as the vent firmware would
    pub fn parse(data: &[u8]) -> ProtocolResult<Self> {
        let text = String::from_utf8_lossy(data);
        let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        if let Some(id) = text.strip_prefix(HANDSHAKE_PREFIX) {
            let vent_id = id.parse()?;
            return Ok(Self::Handshake { vent_id });
        }

        // The firmware reads positions with atof, so "40.0" is accepted too.
        text.parse::<f32>()
            .ok()
            .filter(|v| (0.0..=100.0).contains(v))
            .map(|v| Self::Position(v as u8))
            .ok_or_else(|| ProtocolError::UnrecognizedMessage(text.to_string()))
    }
}

impl fmt::Display for HubCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake { vent_id } => write!(f, "{} {}", HANDSHAKE_PREFIX, vent_id),
            Self::Position(p) => write!(f, "{}", p),
        }
    }
}
