//! Breeze - Vent Hub
//!
//! Bridges a control application on the local network (UDP) to a fleet of
//! wireless climate vents:
//! - Link lifecycle per vent with exponential-backoff reconnection
//! - Rate-limited, bounded command queues per vent
//! - PID and hysteresis position control from vent telemetry
//! - Telemetry and connection events relayed back to the application

// Re-export core crates
pub use breeze_protocol;
pub use breeze_runtime;

pub mod config;
pub mod error;

// Vent model and registry
pub mod vent;

// Position controllers
pub mod control;

// Wireless transport seam, link runtime and simulated radio
pub mod transport;

// Link lifecycle
pub mod connection;

// Command queues and rate limiting
pub mod dispatch;

// Outbound UDP to the application
pub mod channel;

// Composition and services
pub mod gateway;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayHandle, Inbound};
pub use vent::{LinkState, Mode, VentStatus};
