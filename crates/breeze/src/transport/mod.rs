//! Wireless Transport
//!
//! The hub never talks to a radio directly. A [`Transport`] scans for a named
//! vent and hands back a [`Link`]; every call on either runs on the link
//! runtime thread (see [`runtime`]).
//!
//! Hardware transports implement these two traits. [`sim::SimTransport`]
//! provides virtual vents for the binary and the tests.

pub mod runtime;
pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use runtime::{LinkEvent, LinkRuntime, LinkRuntimeHandle};

/// Notifications from a vent; the stream ends when the transport drops the link
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// A live link shared between the registry and the link runtime
pub type SharedLink = Arc<dyn Link>;

/// Errors reported by a transport or link
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Link not connected")]
    NotConnected,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Link runtime stopped")]
    RuntimeStopped,

    #[error("Transport fault: {0}")]
    Fault(String),
}

/// One established connection to a vent's firmware
#[async_trait]
pub trait Link: Send + Sync {
    /// Name the link was scanned for
    fn device_name(&self) -> &str;

    /// Whether the transport still considers the link up
    fn is_connected(&self) -> bool;

    /// Write to the vent's write characteristic
    async fn write(&self, data: &[u8]) -> Result<(), LinkError>;

    /// Start notifications on the notify characteristic
    async fn subscribe(&self) -> Result<Notifications, LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}

/// Scans for and connects to vents
#[async_trait]
pub trait Transport: Send + Sync {
    /// One scan-and-connect attempt, giving up after `scan_timeout`
    async fn connect(&self, device_name: &str, scan_timeout: Duration)
    -> Result<SharedLink, LinkError>;
}
