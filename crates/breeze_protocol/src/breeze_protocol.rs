//! Breeze Protocol - Wire formats spoken by the vent hub
//!
//! This crate contains the two codecs the hub translates between:
//!
//! - [`packet`] - the UDP packet exchanged with the control application
//!   (little-endian command code followed by a float or UTF-8 payload)
//! - [`message`] - the UTF-8 strings carried on the vent's wireless
//!   characteristics (handshake, telemetry, motor feedback, position writes)
//!
//! Nothing here performs I/O; the hub crate owns sockets and links.

mod error;
pub mod message;
pub mod packet;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use error::{ProtocolError, ProtocolResult};
pub use message::{DeviceMessage, HubCommand};
pub use packet::{Command, Packet, Payload, PayloadShape, Report};

/// GATT identifiers exposed by the vent firmware
pub mod gatt {
    /// Primary service advertised by every vent
    pub const VENT_SERVICE_UUID16: u16 = 0x0180;
    /// Characteristic the vent notifies telemetry on
    pub const NOTIFY_CHARACTERISTIC_UUID16: u16 = 0xFEF4;
    /// Characteristic the hub writes handshakes and positions to
    pub const WRITE_CHARACTERISTIC_UUID16: u16 = 0xDEAD;
}

/// Identifier the hub assigns to a vent
///
/// Ids start at 1 and are never reused while the hub runs. The vent learns
/// its id from the connect handshake and prefixes every report with it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VentId(pub u32);

impl VentId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for VentId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for VentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VentId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(VentId)
            .map_err(|_| ProtocolError::InvalidPayload(format!("invalid vent id: {:?}", s)))
    }
}
