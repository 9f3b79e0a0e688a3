use thiserror::Error;

/// Errors produced while decoding hub wire formats
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Datagram too short to carry the fields its shape requires
    #[error("Malformed packet: {len} bytes")]
    MalformedPacket { len: usize },

    /// Payload present but not in the expected `<ventId>.<value>` shape
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Characteristic notification matching none of the known message shapes
    #[error("Unrecognized device message: {0:?}")]
    UnrecognizedMessage(String),
}

/// Result type for codec operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
