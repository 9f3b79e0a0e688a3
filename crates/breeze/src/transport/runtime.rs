//! Link Runtime
//!
//! All transport I/O runs on one dedicated thread with a current-thread tokio
//! runtime. Other actors submit [`LinkRequest`]s and wait for the reply with a
//! timeout; a timed-out request is a normal outcome, not a fault.
//!
//! Each subscribed link gets a long-lived listener task on the runtime that
//! turns notifications into [`LinkEvent`]s.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use breeze_protocol::VentId;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{LinkError, SharedLink, Transport};

type Reply<T> = oneshot::Sender<Result<T, LinkError>>;

/// Work submitted to the runtime thread
enum LinkRequest {
    Connect {
        device_name: String,
        scan_timeout: Duration,
        reply: Reply<SharedLink>,
    },
    Write {
        link: SharedLink,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Subscribe {
        vent_id: VentId,
        link: SharedLink,
        reply: Reply<()>,
    },
    Disconnect {
        link: SharedLink,
        reply: Reply<()>,
    },
    Shutdown,
}

/// Delivered from link listeners to the gateway
pub enum LinkEvent {
    /// Raw notification bytes from the link owned by `vent_id`
    Notification { vent_id: VentId, data: Vec<u8> },
    /// The notification stream of `link` ended
    Closed { vent_id: VentId, link: SharedLink },
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::Notification { vent_id, data } => f
                .debug_struct("Notification")
                .field("vent_id", vent_id)
                .field("data", &String::from_utf8_lossy(data))
                .finish(),
            LinkEvent::Closed { vent_id, link } => f
                .debug_struct("Closed")
                .field("vent_id", vent_id)
                .field("device", &link.device_name())
                .finish(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable submitter for link work
#[derive(Clone)]
pub struct LinkRuntimeHandle {
    tx: mpsc::UnboundedSender<LinkRequest>,
}

impl LinkRuntimeHandle {
    /// Scan for and connect to `device_name`
    ///
    /// If the connect completes after `timeout` has passed, the runtime
    /// disconnects the late link instead of leaking it.
    pub async fn connect(
        &self,
        device_name: &str,
        scan_timeout: Duration,
        timeout: Duration,
    ) -> Result<SharedLink, LinkError> {
        self.submit(timeout, |reply| LinkRequest::Connect {
            device_name: device_name.to_string(),
            scan_timeout,
            reply,
        })
        .await
    }

    pub async fn write(
        &self,
        link: &SharedLink,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        self.submit(timeout, |reply| LinkRequest::Write {
            link: Arc::clone(link),
            data,
            reply,
        })
        .await
    }

    /// Start forwarding notifications from `link` as events for `vent_id`
    pub async fn subscribe(
        &self,
        vent_id: VentId,
        link: &SharedLink,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        self.submit(timeout, |reply| LinkRequest::Subscribe {
            vent_id,
            link: Arc::clone(link),
            reply,
        })
        .await
    }

    pub async fn disconnect(&self, link: &SharedLink, timeout: Duration) -> Result<(), LinkError> {
        self.submit(timeout, |reply| LinkRequest::Disconnect {
            link: Arc::clone(link),
            reply,
        })
        .await
    }

    /// Disconnect without waiting for the outcome
    pub fn disconnect_detached(&self, link: SharedLink) {
        let (reply, _) = oneshot::channel();
        let _ = self.tx.send(LinkRequest::Disconnect { link, reply });
    }

    async fn submit<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(Reply<T>) -> LinkRequest,
    ) -> Result<T, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| LinkError::RuntimeStopped)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::RuntimeStopped),
            Err(_) => Err(LinkError::Timeout(timeout)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime Thread
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of the link runtime thread
pub struct LinkRuntime {
    handle: LinkRuntimeHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LinkRuntime {
    /// Spawn the runtime thread
    ///
    /// Returns the runtime and the receiving end of the event channel.
    pub fn start(
        transport: Arc<dyn Transport>,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("breeze-link-runtime")
            .build()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name("breeze-link-runtime".into())
            .spawn(move || {
                runtime.block_on(run(transport, rx, event_tx));
                runtime.shutdown_timeout(Duration::from_millis(500));
                tracing::debug!("Link runtime thread exiting");
            })?;

        tracing::info!("Link runtime started");

        Ok((
            Self {
                handle: LinkRuntimeHandle { tx },
                thread: Mutex::new(Some(thread)),
            },
            event_rx,
        ))
    }

    pub fn handle(&self) -> LinkRuntimeHandle {
        self.handle.clone()
    }

    /// Stop the runtime thread and wait for it to exit
    ///
    /// Listener tasks are cancelled, so no further events are delivered.
    pub async fn shutdown(&self) {
        let _ = self.handle.tx.send(LinkRequest::Shutdown);
        let Some(thread) = self.thread.lock().take() else {
            return;
        };

        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => tracing::info!("Link runtime stopped"),
            Ok(Err(_)) => tracing::error!("Link runtime thread panicked"),
            Err(e) => tracing::error!(error = %e, "Failed to join link runtime thread"),
        }
    }
}

async fn run(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<LinkRequest>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(request) = rx.recv().await {
        match request {
            LinkRequest::Connect {
                device_name,
                scan_timeout,
                reply,
            } => {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    let result = transport.connect(&device_name, scan_timeout).await;
                    if let Err(Ok(orphan)) = reply.send(result) {
                        tracing::warn!(
                            device = %device_name,
                            "Connect finished after the caller gave up, disconnecting"
                        );
                        if let Err(e) = orphan.disconnect().await {
                            tracing::warn!(device = %device_name, error = %e, "Orphan disconnect failed");
                        }
                    }
                });
            }

            LinkRequest::Write { link, data, reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(link.write(&data).await);
                });
            }

            LinkRequest::Subscribe {
                vent_id,
                link,
                reply,
            } => {
                let events = events.clone();
                tokio::spawn(async move {
                    let mut stream = match link.subscribe().await {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            return;
                        }
                    };
                    let _ = reply.send(Ok(()));
                    tracing::debug!(vent_id = %vent_id, device = %link.device_name(), "Listening for notifications");

                    while let Some(data) = stream.next().await {
                        if events
                            .send(LinkEvent::Notification { vent_id, data })
                            .is_err()
                        {
                            return;
                        }
                    }

                    tracing::debug!(vent_id = %vent_id, "Notification stream ended");
                    let _ = events.send(LinkEvent::Closed { vent_id, link });
                });
            }

            LinkRequest::Disconnect { link, reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(link.disconnect().await);
                });
            }

            LinkRequest::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::transport::sim::SimTransport;

    fn quiet_sim() -> Arc<SimTransport> {
        Arc::new(SimTransport::new(SimulationConfig {
            telemetry_interval_ms: 60_000,
            connect_latency_ms: 5,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_connect_write_and_notify() {
        let sim = quiet_sim();
        sim.add_device("vent-a");
        let (runtime, mut events) = LinkRuntime::start(sim.clone()).unwrap();
        let handle = runtime.handle();
        let timeout = Duration::from_secs(1);

        let link = handle.connect("vent-a", timeout, timeout).await.unwrap();
        assert!(link.is_connected());

        handle.subscribe(VentId(1), &link, timeout).await.unwrap();
        handle
            .write(&link, b"Connected, Vent ID: 1".to_vec(), timeout)
            .await
            .unwrap();

        let event = tokio::time::timeout(timeout, events.recv()).await.unwrap().unwrap();
        match event {
            LinkEvent::Notification { vent_id, data } => {
                assert_eq!(vent_id, VentId(1));
                assert_eq!(data, b"Connected".to_vec());
            }
            other => panic!("unexpected event {other:?}"),
        }

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_link_emits_closed() {
        let sim = quiet_sim();
        sim.add_device("vent-a");
        let (runtime, mut events) = LinkRuntime::start(sim.clone()).unwrap();
        let handle = runtime.handle();
        let timeout = Duration::from_secs(1);

        let link = handle.connect("vent-a", timeout, timeout).await.unwrap();
        handle.subscribe(VentId(4), &link, timeout).await.unwrap();
        sim.drop_link("vent-a");

        let event = tokio::time::timeout(timeout, events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, LinkEvent::Closed { vent_id: VentId(4), .. }));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_connect_is_disconnected() {
        let sim = quiet_sim();
        sim.add_device("slow-vent");
        sim.set_connect_delay("slow-vent", Duration::from_millis(100));
        let (runtime, _events) = LinkRuntime::start(sim.clone()).unwrap();
        let handle = runtime.handle();

        let result = handle
            .connect("slow-vent", Duration::from_secs(1), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(LinkError::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sim.connect_count("slow-vent"), 1);
        assert!(!sim.is_linked("slow-vent"));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_fail_after_shutdown() {
        let sim = quiet_sim();
        let (runtime, _events) = LinkRuntime::start(sim).unwrap();
        let handle = runtime.handle();
        runtime.shutdown().await;

        let result = handle
            .connect("vent-a", Duration::from_millis(10), Duration::from_millis(50))
            .await;
        assert_eq!(result.err(), Some(LinkError::RuntimeStopped));
    }
}
