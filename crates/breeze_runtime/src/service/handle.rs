//! Outside view of a supervised service

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::{ServiceError, ServiceResult};

/// Where a service is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    /// `Stopped` or `Failed`; the service task is done
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        })
    }
}

/// Snapshot of one supervised service, as listed by the manager
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub id: &'static str,
    pub name: &'static str,
    pub state: ServiceState,
    pub uptime_ms: u64,
}

impl ServiceStatus {
    pub(crate) fn new(handle: &ServiceHandle, name: &'static str, uptime: Duration) -> Self {
        Self {
            id: handle.id,
            name,
            state: handle.state(),
            uptime_ms: u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Cloneable handle to a running service
///
/// Dropping every handle leaves the service running; only a stop request or
/// the manager's shutdown ends it.
#[derive(Clone)]
pub struct ServiceHandle {
    id: &'static str,
    stop_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<ServiceState>,
}

impl ServiceHandle {
    pub(crate) fn new(
        id: &'static str,
        stop_tx: mpsc::Sender<()>,
        state_rx: watch::Receiver<ServiceState>,
    ) -> Self {
        Self {
            id,
            stop_tx,
            state_rx,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Ask the service loop to stop; repeated requests are no-ops
    pub fn request_stop(&self) -> ServiceResult<()> {
        match self.stop_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(ServiceError::NotRunning(self.id.to_string()))
            }
        }
    }

    /// Wait until `on_start` has finished, returning `Running` or `Failed`
    pub async fn started(&self) -> ServiceState {
        self.wait_for(|state| *state != ServiceState::Starting).await
    }

    /// Wait until the service task is done
    pub async fn finished(&self) -> ServiceState {
        self.wait_for(|state| state.is_terminal()).await
    }

    async fn wait_for(&self, reached: impl FnMut(&ServiceState) -> bool) -> ServiceState {
        let mut rx = self.state_rx.clone();
        let settled = rx.wait_for(reached).await.map(|state| *state);
        match settled {
            Ok(state) => state,
            // the loop only drops its sender once it has settled, or by panicking
            Err(_) => match *rx.borrow() {
                state if state.is_terminal() => state,
                _ => ServiceState::Failed,
            },
        }
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
