use std::time::Duration;

use breeze_protocol::{ProtocolError, VentId};
use breeze_runtime::ServiceError;

use crate::transport::LinkError;

/// Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error types
///
/// None of these stop the hub: the receive and dispatch loops log them and
/// move on to the next item.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Undecodable datagram or notification, including `MalformedPacket`
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unknown command code: {0}")]
    UnknownCommand(u32),

    #[error("Unknown vent: {0}")]
    UnknownVent(VentId),

    #[error("No live link for vent {0}")]
    LinkUnavailable(VentId),

    #[error("Connect to {device:?} timed out after {timeout:?}")]
    ConnectTimeout { device: String, timeout: Duration },

    #[error("Connect to {device:?} failed after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        device: String,
        attempts: u32,
        reason: String,
    },

    #[error("Connect already in progress for vent {0}")]
    ConnectInProgress(VentId),

    #[error("Transport fault: {0}")]
    TransportFault(String),

    #[error("Link runtime unavailable")]
    RuntimeUnavailable,

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// True for datagrams too short to carry a command code
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            GatewayError::Protocol(ProtocolError::MalformedPacket { .. })
        )
    }
}

impl From<LinkError> for GatewayError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::RuntimeStopped => GatewayError::RuntimeUnavailable,
            other => GatewayError::TransportFault(other.to_string()),
        }
    }
}
