//! Breeze Runtime - Service lifecycle for the vent hub
//!
//! Long-running hub actors (packet receiver, reconnection monitor, command
//! dispatcher, link event pump) implement [`service::Service`] and are
//! supervised by a [`service::ServiceManager`].

pub mod service;

pub use service::{
    Service, ServiceContext, ServiceError, ServiceHandle, ServiceManager, ServiceResult,
    ServiceSpec, ServiceState, ServiceStatus,
};
