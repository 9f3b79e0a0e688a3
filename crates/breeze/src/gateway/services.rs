//! Hub Services
//!
//! The long-running actors of the hub, each supervised by the
//! [`ServiceManager`](breeze_runtime::ServiceManager):
//!
//! - [`UdpReceiverService`] - receive loop for application packets
//! - [`LinkEventPump`] - feeds vent notifications into the gateway
//! - [`ReconnectMonitorService`] - health check and backoff-gated reconnects
//! - [`DispatchService`] - rate-limited sweep of queued positions

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use breeze_runtime::{Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Gateway;
use crate::config::NetworkConfig;
use crate::connection::ConnectionManager;
use crate::dispatch::CommandDispatcher;
use crate::transport::LinkEvent;

// ─────────────────────────────────────────────────────────────────────────────
// UDP Receiver
// ─────────────────────────────────────────────────────────────────────────────

/// Receives application datagrams and hands them to the gateway in order
///
/// Each receive waits at most `receive_timeout` so the loop notices the stop
/// flag promptly.
pub struct UdpReceiverService {
    gateway: Arc<Gateway>,
    socket: Arc<UdpSocket>,
    network: NetworkConfig,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl UdpReceiverService {
    pub fn new(gateway: Arc<Gateway>, socket: Arc<UdpSocket>, network: NetworkConfig) -> Self {
        Self {
            gateway,
            socket,
            network,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

#[async_trait]
impl Service for UdpReceiverService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("udp-receiver", "UDP Receiver")
            .with_shutdown_timeout(self.network.receive_timeout() + Duration::from_secs(1))
            .with_description("Receives application packets")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.running.store(true, Ordering::SeqCst);

        let gateway = Arc::clone(&self.gateway);
        let socket = Arc::clone(&self.socket);
        let running = Arc::clone(&self.running);
        let receive_timeout = self.network.receive_timeout();
        let mut buf = vec![0u8; self.network.max_datagram_size];

        self.task = Some(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let (len, source) =
                    match tokio::time::timeout(receive_timeout, socket.recv_from(&mut buf)).await {
                        Ok(Ok(received)) => received,
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "UDP receive failed");
                            continue;
                        }
                        Err(_) => {
                            tracing::trace!("UDP receive timed out");
                            continue;
                        }
                    };

                tracing::debug!(%source, len, "Datagram received");
                if let Err(e) = gateway.handle_datagram(&buf[..len], source).await {
                    if e.is_malformed() {
                        tracing::warn!(%source, len, "Dropping malformed datagram");
                    } else {
                        tracing::warn!(%source, error = %e, "Dropping datagram");
                    }
                }
            }
        }));

        tracing::info!(listen = ?self.socket.local_addr().ok(), "UDP receiver listening");
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ServiceError::Internal(format!("receiver task failed: {e}")))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Link Event Pump
// ─────────────────────────────────────────────────────────────────────────────

/// Processes link events one at a time in arrival order
pub struct LinkEventPump {
    gateway: Arc<Gateway>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    task: Option<JoinHandle<()>>,
}

impl LinkEventPump {
    pub fn new(gateway: Arc<Gateway>, events: mpsc::UnboundedReceiver<LinkEvent>) -> Self {
        Self {
            gateway,
            events: Some(events),
            task: None,
        }
    }
}

#[async_trait]
impl Service for LinkEventPump {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("link-events", "Link Event Pump")
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let mut events = self
            .events
            .take()
            .ok_or_else(|| ServiceError::StartFailed("link-events", "event channel already taken".into()))?;
        let gateway = Arc::clone(&self.gateway);

        self.task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                gateway.handle_link_event(event).await;
            }
            tracing::debug!("Link event channel closed");
        }));
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconnect Monitor
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic health check followed by backoff-gated reconnects
pub struct ReconnectMonitorService {
    connections: Arc<ConnectionManager>,
    interval: Duration,
    reconnects: Vec<JoinHandle<()>>,
}

impl ReconnectMonitorService {
    pub fn new(connections: Arc<ConnectionManager>, interval: Duration) -> Self {
        Self {
            connections,
            interval,
            reconnects: Vec::new(),
        }
    }
}

#[async_trait]
impl Service for ReconnectMonitorService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("reconnect-monitor", "Reconnect Monitor")
            .with_tick_interval(self.interval)
            .with_shutdown_timeout(Duration::from_secs(2))
            .with_description("Detects lost links and reconnects with backoff")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let now = Instant::now();
        self.connections.check_health(now);

        self.reconnects.retain(|task| !task.is_finished());
        self.reconnects
            .extend(self.connections.schedule_reconnects(now));
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        for task in self.reconnects.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Drains vent command queues at the poll interval
pub struct DispatchService {
    dispatcher: Arc<CommandDispatcher>,
    interval: Duration,
}

impl DispatchService {
    pub fn new(dispatcher: Arc<CommandDispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }
}

#[async_trait]
impl Service for DispatchService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("dispatcher", "Command Dispatcher").with_tick_interval(self.interval)
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let sent = self.dispatcher.sweep().await;
        if sent > 0 {
            tracing::debug!(sent, tick = ctx.ticks, "Dispatched queued commands");
        }
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}
