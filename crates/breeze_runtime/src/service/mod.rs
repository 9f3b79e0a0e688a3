//! Hub services
//!
//! A service is one long-running actor of the hub: the packet receiver, the
//! link event pump, the reconnect monitor and the command dispatcher. Each
//! runs on its own tokio task and only reaches the rest of the hub through
//! the shared state it was built with.
//!
//! `on_start` runs once and must succeed before the service counts as
//! running. `on_tick` then runs every `tick_interval` (if its `ServiceSpec` sets one)
//! until a stop is requested, after which `on_stop` runs once, bounded by
//! `shutdown_timeout`. A failing tick is logged and the loop carries on.

mod handle;
mod manager;

pub use handle::{ServiceHandle, ServiceState, ServiceStatus};
pub use manager::ServiceManager;

use std::time::{Duration, Instant};

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("service {0} failed to start: {1}")]
    StartFailed(&'static str, String),

    #[error("a service with id {0} is already supervised")]
    AlreadyRunning(String),

    #[error("no running service with id {0}")]
    NotRunning(String),

    #[error("service did not stop within its shutdown timeout")]
    ShutdownTimeout,

    #[error("{0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Identity and timing of a service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub description: Option<&'static str>,
    /// `on_tick` period; `None` means the service is purely event driven
    pub tick_interval: Option<Duration>,
    pub shutdown_timeout: Duration,
}

impl ServiceSpec {
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(id: &'static str, name: &'static str) -> Self {
        Self {
            id,
            name,
            description: None,
            tick_interval: None,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_description(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }
}

/// Per-service bookkeeping handed to every lifecycle hook
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub service_id: &'static str,
    /// Ticks completed before the current call
    pub ticks: u64,
    spawned_at: Instant,
}

impl ServiceContext {
    pub fn new(service_id: &'static str) -> Self {
        Self {
            service_id,
            ticks: 0,
            spawned_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }
}

/// A supervised hub actor
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn spec(&self) -> ServiceSpec;

    /// Acquire resources and spawn background loops
    ///
    /// An error marks the service failed; it never ticks.
    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Release resources; the service counts as stopped whatever this returns
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}
