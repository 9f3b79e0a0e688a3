//! UDP Application Packets
//!
//! Every datagram exchanged with the control application has the layout:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────┐
//! │ command code (4 B)   │ payload                                  │
//! │ little-endian u32    │ f32 LE (4 B)  or  UTF-8 to end of packet │
//! └──────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The payload carries no length prefix and no type tag; the receiver picks
//! the shape from the command code (see [`Command::payload_shape`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{ProtocolError, ProtocolResult, VentId};

/// Size of the command code header
pub const HEADER_LEN: usize = 4;

/// Size of a float payload
pub const FLOAT_LEN: usize = 4;

// ─────────────────────────────────────────────────────────────────────────────
// Command Codes
// ─────────────────────────────────────────────────────────────────────────────

/// How the bytes after the header are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Legacy 4-byte little-endian IEEE-754 float
    Float,
    /// UTF-8 string filling the rest of the datagram
    Text,
}

/// Commands sent by the application to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Command {
    /// Connect a new vent; payload is the device name to scan for
    SetupRequest = 1,
    /// Put a vent in auto mode; payload `"<ventId>.<temperature>"`
    SetTarget = 2,
    /// Move a vent directly; payload `"<ventId>.<position>"`
    SetPosition = 3,
}

impl Command {
    /// Look up a registered command code
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::SetupRequest),
            2 => Some(Self::SetTarget),
            3 => Some(Self::SetPosition),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Payload shape the application uses for this command
    pub fn payload_shape(self) -> PayloadShape {
        match self {
            Self::SetupRequest | Self::SetTarget | Self::SetPosition => PayloadShape::Text,
        }
    }
}

/// Reports sent by the hub to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Report {
    /// A vent finished its handshake; payload is the vent id
    VentConnected = 1,
    /// Temperature telemetry; payload `"<ventId>.<temperature>"`
    Telemetry = 2,
    /// Motor feedback; payload `"<ventId>.motor<value>"`
    MotorFeedback = 3,
}

impl Report {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Build the outbound packet announcing a connected vent
    pub fn vent_connected(vent_id: VentId) -> Packet {
        Packet::text(Self::VentConnected.code(), vent_id.to_string())
    }

    /// Build the outbound telemetry packet
    pub fn telemetry(vent_id: VentId, temperature: f32) -> Packet {
        Packet::text(Self::Telemetry.code(), format_vent_value(vent_id, temperature))
    }

    /// Build the outbound motor feedback packet
    pub fn motor_feedback(vent_id: VentId, value: f32) -> Packet {
        Packet::text(
            Self::MotorFeedback.code(),
            format!("{}.motor{:.1}", vent_id, value),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded packet payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Float(f32),
    Text(String),
}

impl Payload {
    /// Text content, or an empty string for float payloads
    pub fn as_text(&self) -> &str {
        match self {
            Payload::Text(s) => s,
            Payload::Float(_) => "",
        }
    }

    pub fn shape(&self) -> PayloadShape {
        match self {
            Payload::Float(_) => PayloadShape::Float,
            Payload::Text(_) => PayloadShape::Text,
        }
    }
}

/// One application datagram
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub code: u32,
    pub payload: Payload,
}

impl Packet {
    pub fn text(code: u32, text: impl Into<String>) -> Self {
        Self {
            code,
            payload: Payload::Text(text.into()),
        }
    }

    pub fn float(code: u32, value: f32) -> Self {
        Self {
            code,
            payload: Payload::Float(value),
        }
    }

    /// Serialize to datagram bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = match &self.payload {
            Payload::Float(_) => BytesMut::with_capacity(HEADER_LEN + FLOAT_LEN),
            Payload::Text(s) => BytesMut::with_capacity(HEADER_LEN + s.len()),
        };
        buf.put_u32_le(self.code);
        match &self.payload {
            Payload::Float(v) => buf.put_f32_le(*v),
            Payload::Text(s) => buf.put_slice(s.as_bytes()),
        }
        buf.freeze()
    }

    /// Decode a datagram whose payload shape is already known
    ///
    /// Invalid UTF-8 in a text payload is not an error: the packet decodes
    /// with an empty string and the failure is logged.
    pub fn decode(datagram: &[u8], shape: PayloadShape) -> ProtocolResult<Self> {
        let code = peek_code(datagram)?;
        let mut body = &datagram[HEADER_LEN..];

        let payload = match shape {
            PayloadShape::Float => {
                if body.len() < FLOAT_LEN {
                    return Err(ProtocolError::MalformedPacket {
                        len: datagram.len(),
                    });
                }
                Payload::Float(body.get_f32_le())
            }
            PayloadShape::Text => Payload::Text(decode_text(code, body)),
        };

        Ok(Self { code, payload })
    }
}

/// Read the command code without interpreting the payload
pub fn peek_code(datagram: &[u8]) -> ProtocolResult<u32> {
    if datagram.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedPacket {
            len: datagram.len(),
        });
    }
    let mut header = &datagram[..HEADER_LEN];
    Ok(header.get_u32_le())
}

fn decode_text(code: u32, body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(s) => s.to_string(),
        Err(e) => {
            tracing::warn!(code, error = %e, "Text payload is not valid UTF-8, using empty string");
            String::new()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Format `"<ventId>.<value>"` with one decimal place
pub fn format_vent_value(vent_id: VentId, value: f32) -> String {
    format!("{}.{:.1}", vent_id, value)
}

/// Split a `"<ventId>.<value>"` payload at its first dot
pub fn parse_vent_value(payload: &str) -> ProtocolResult<(VentId, f32)> {
    // C clients often send the terminating NUL along with the text
    let (id, value) = payload
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .split_once('.')
        .ok_or_else(|| ProtocolError::InvalidPayload(format!("missing '.' in {:?}", payload)))?;

    let vent_id: VentId = id.parse()?;
    let value = value
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ProtocolError::InvalidPayload(format!("invalid value in {:?}", payload)))?;

    Ok((vent_id, value))
}

/// Parse a `"<ventId>.<position>"` payload, rounding to a whole percent
pub fn parse_vent_position(payload: &str) -> ProtocolResult<(VentId, u8)> {
    let (vent_id, value) = parse_vent_value(payload)?;
    if !(0.0..=100.0).contains(&value) {
        return Err(ProtocolError::InvalidPayload(format!(
            "position {} out of range 0-100",
            value
        )));
    }
    Ok((vent_id, value.round() as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_packet_round_trip() {
        let packet = Packet::text(1, "esp-vent-A");
        let bytes = packet.encode();
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..], b"esp-vent-A");

        let decoded = Packet::decode(&bytes, PayloadShape::Text).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_trailing_nul_survives_round_trip() {
        let packet = Packet::text(1, "vent\0");
        let decoded = Packet::decode(&packet.encode(), PayloadShape::Text).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.payload.as_text(), "vent\0");
    }

    #[test]
    fn test_float_packet_round_trip() {
        let packet = Packet::float(2, 22.5);
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[4..], &22.5f32.to_le_bytes());

        let decoded = Packet::decode(&bytes, PayloadShape::Float).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_short_datagram_is_malformed() {
        for len in 0..HEADER_LEN {
            let datagram = vec![1u8; len];
            assert_eq!(
                Packet::decode(&datagram, PayloadShape::Text),
                Err(ProtocolError::MalformedPacket { len })
            );
            assert!(peek_code(&datagram).is_err());
        }
    }

    #[test]
    fn test_float_payload_needs_four_bytes() {
        let datagram = [2, 0, 0, 0, 0xAA, 0xBB];
        assert_eq!(
            Packet::decode(&datagram, PayloadShape::Float),
            Err(ProtocolError::MalformedPacket { len: 6 })
        );
    }

    #[test]
    fn test_invalid_utf8_decodes_to_empty_text() {
        let datagram = [1, 0, 0, 0, 0xFF, 0xFE, 0x41];
        let packet = Packet::decode(&datagram, PayloadShape::Text).unwrap();
        assert_eq!(packet.code, 1);
        assert_eq!(packet.payload, Payload::Text(String::new()));
    }

    #[test]
    fn test_header_only_text_packet_is_empty() {
        let packet = Packet::decode(&[3, 0, 0, 0], PayloadShape::Text).unwrap();
        assert_eq!(packet.payload.as_text(), "");
    }

    #[test]
    fn test_command_lookup() {
        assert_eq!(Command::from_code(1), Some(Command::SetupRequest));
        assert_eq!(Command::from_code(3), Some(Command::SetPosition));
        assert_eq!(Command::from_code(9), None);
        assert_eq!(Command::SetTarget.payload_shape(), PayloadShape::Text);
    }

    #[test]
    fn test_report_payloads() {
        assert_eq!(
            Report::telemetry(VentId(3), 26.0),
            Packet::text(2, "3.26.0")
        );
        assert_eq!(
            Report::motor_feedback(VentId(3), 40.0),
            Packet::text(3, "3.motor40.0")
        );
        assert_eq!(Report::vent_connected(VentId(12)), Packet::text(1, "12"));
    }

    #[test]
    fn test_parse_vent_value() {
        assert_eq!(parse_vent_value("3.24.5").unwrap(), (VentId(3), 24.5));
        assert_eq!(parse_vent_value("7.21").unwrap(), (VentId(7), 21.0));
        assert!(parse_vent_value("24").is_err());
        assert!(parse_vent_value("x.24").is_err());
        assert!(parse_vent_value("3.warm").is_err());
        assert_eq!(parse_vent_value("3.24.5\0").unwrap(), (VentId(3), 24.5));
    }

    #[test]
    fn test_parse_vent_position() {
        assert_eq!(parse_vent_position("3.40").unwrap(), (VentId(3), 40));
        assert_eq!(parse_vent_position("3.40.6").unwrap(), (VentId(3), 41));
        assert!(parse_vent_position("3.140").is_err());
        assert!(parse_vent_position("3.-5").is_err());
    }
}
