//! Service supervision
//!
//! The manager owns the task of every service it spawned. Stopping goes
//! through the service's own stop channel, or through one broadcast that
//! reaches all of them at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{
    Service, ServiceContext, ServiceError, ServiceHandle, ServiceResult, ServiceSpec,
    ServiceState, ServiceStatus,
};

struct Supervised {
    handle: ServiceHandle,
    task: JoinHandle<ServiceResult<()>>,
    spec: ServiceSpec,
    spawned_at: Instant,
}

/// Spawns hub services and tears them down again
pub struct ServiceManager {
    services: DashMap<&'static str, Supervised>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            services: DashMap::new(),
            shutdown_tx,
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Start `service` on its own task
    ///
    /// Ids are unique among supervised services.
    pub fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        if self.services.contains_key(spec.id) {
            return Err(ServiceError::AlreadyRunning(spec.id.to_string()));
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ServiceState::Starting);
        let handle = ServiceHandle::new(spec.id, stop_tx, state_rx);

        let run = ServiceRun {
            ctx: ServiceContext::new(spec.id),
            spec: spec.clone(),
            state: state_tx,
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(run.drive(service, stop_rx, shutdown_rx));

        self.services.insert(
            spec.id,
            Supervised {
                handle: handle.clone(),
                task,
                spec,
                spawned_at: Instant::now(),
            },
        );
        Ok(handle)
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceHandle> {
        self.services.get(service_id).map(|s| s.handle.clone())
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.services
            .get(service_id)
            .is_some_and(|s| s.handle.state() == ServiceState::Running)
    }

    /// Stop one service and wait for its `on_stop`
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let (id, supervised) = self
            .services
            .remove(service_id)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        // a loop that already exited has closed its channel
        let _ = supervised.handle.request_stop();
        join(id, supervised).await
    }

    /// Stop every service and wait for all of them
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(count = self.services.len(), "Shutting down all services");
        let _ = self.shutdown_tx.send(());

        let ids: Vec<&'static str> = self.services.iter().map(|e| *e.key()).collect();
        let stopping = ids
            .into_iter()
            .filter_map(|id| self.services.remove(id))
            .map(|(id, supervised)| join(id, supervised));

        join_all(stopping)
            .await
            .into_iter()
            .collect::<ServiceResult<Vec<()>>>()
            .map(|_| ())
    }

    /// Snapshot of every supervised service, ordered by id
    pub fn list(&self) -> Vec<ServiceStatus> {
        let mut statuses: Vec<ServiceStatus> = self
            .services
            .iter()
            .map(|entry| {
                let s = entry.value();
                ServiceStatus::new(&s.handle, s.spec.name, s.spawned_at.elapsed())
            })
            .collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

async fn join(service_id: &'static str, supervised: Supervised) -> ServiceResult<()> {
    // on_stop is bounded inside the loop; the grace second covers noticing the signal
    let limit = supervised.spec.shutdown_timeout + Duration::from_secs(1);
    match tokio::time::timeout(limit, supervised.task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::error!(service_id, error = %e, "Service task panicked");
            Err(ServiceError::Internal(format!("service {service_id} panicked: {e}")))
        }
        Err(_) => {
            tracing::warn!(service_id, "Service did not exit in time");
            Err(ServiceError::ShutdownTimeout)
        }
    }
}

/// Everything a service task needs besides the service itself
struct ServiceRun {
    ctx: ServiceContext,
    spec: ServiceSpec,
    state: watch::Sender<ServiceState>,
}

impl ServiceRun {
    fn set(&self, state: ServiceState) {
        self.state.send_replace(state);
    }

    async fn drive<S: Service>(
        mut self,
        mut service: S,
        mut stop_rx: mpsc::Receiver<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> ServiceResult<()> {
        let id = self.ctx.service_id;

        if let Err(e) = service.on_start(&self.ctx).await {
            tracing::error!(service_id = id, error = %e, "Service failed to start");
            self.set(ServiceState::Failed);
            return Err(e);
        }
        self.set(ServiceState::Running);
        tracing::info!(service_id = id, name = self.spec.name, "Service started");

        let mut ticker = self.spec.tick_interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                // a closed channel means every handle and the manager are gone
                _ = stop_rx.recv() => break,
                _ = async {
                    match ticker.as_mut() {
                        Some(ticker) => ticker.tick().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = service.on_tick(&self.ctx).await {
                        tracing::warn!(service_id = id, error = %e, "Service tick failed");
                    }
                    self.ctx.ticks += 1;
                }
            }
        }

        self.set(ServiceState::Stopping);
        tracing::debug!(service_id = id, ticks = self.ctx.ticks, "Service stopping");

        let outcome = tokio::time::timeout(self.spec.shutdown_timeout, service.on_stop(&self.ctx))
            .await
            .unwrap_or(Err(ServiceError::ShutdownTimeout));
        match &outcome {
            Ok(()) => {
                self.set(ServiceState::Stopped);
                tracing::info!(service_id = id, uptime = ?self.ctx.uptime(), "Service stopped");
            }
            Err(e) => {
                self.set(ServiceState::Failed);
                tracing::error!(service_id = id, error = %e, "Service did not stop cleanly");
            }
        }
        outcome
    }
}
