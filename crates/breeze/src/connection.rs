//! Connection Manager
//!
//! Drives each vent through its link lifecycle:
//!
//! ```text
//! Unconnected ──setup──▶ Connecting ──ok──▶ Connected
//!      ▲                     │                 │ closed / health check
//!      └──first connect──────┘                 ▼
//!         failed                  ┌────── Disconnected ◀──┐
//!                                 │ backoff due            │ reconnect failed
//!                                 ▼                        │
//!                             Connecting ──────────────────┘
//!                                 │ failures == max
//!                                 ▼
//!                              GivenUp
//! ```
//!
//! First connects and monitor-driven reconnects share one connect primitive
//! and differ only in their [`ConnectPolicy`]. At most one connect is in
//! flight per vent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use breeze_protocol::{HubCommand, VentId};
use dashmap::DashSet;
use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::error::{GatewayError, Result};
use crate::transport::{LinkError, LinkRuntimeHandle, SharedLink};
use crate::vent::{LinkState, VentRegistry};

/// Extra wait on top of the scan so the transport can report its own failure
const CONNECT_GRACE: Duration = Duration::from_millis(500);

// ─────────────────────────────────────────────────────────────────────────────
// Connect Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Retry shape of one connect operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    /// Passed to the transport for each scan
    pub scan_timeout: Duration,
    /// How long the caller waits for each attempt
    pub attempt_timeout: Duration,
    pub inter_attempt_delay: Duration,
}

impl ConnectPolicy {
    /// Policy for the connect triggered by a setup request
    pub fn initial(config: &LinkConfig) -> Self {
        Self {
            max_attempts: config.initial_connect_attempts,
            scan_timeout: config.scan_timeout(),
            attempt_timeout: config.scan_timeout() + CONNECT_GRACE,
            inter_attempt_delay: config.inter_attempt_delay(),
        }
    }

    /// Policy for a monitor-driven reconnect
    pub fn reconnect(config: &LinkConfig) -> Self {
        Self {
            max_attempts: 1,
            scan_timeout: config.reconnect_timeout(),
            attempt_timeout: config.reconnect_timeout(),
            inter_attempt_delay: Duration::ZERO,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-flight Guard
// ─────────────────────────────────────────────────────────────────────────────

struct InFlight<'a> {
    set: &'a DashSet<VentId>,
    vent_id: VentId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.vent_id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Manager
// ─────────────────────────────────────────────────────────────────────────────

pub struct ConnectionManager {
    registry: Arc<VentRegistry>,
    links: LinkRuntimeHandle,
    config: LinkConfig,
    in_flight: DashSet<VentId>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<VentRegistry>, links: LinkRuntimeHandle, config: LinkConfig) -> Self {
        Self {
            registry,
            links,
            config,
            in_flight: DashSet::new(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Create a vent already in `Connecting`
    pub fn register(&self) -> VentId {
        self.registry.create_with(|node| node.begin_connect()).0
    }

    /// Whether a connect or reconnect is running for `vent_id`
    pub fn is_in_flight(&self, vent_id: VentId) -> bool {
        self.in_flight.contains(&vent_id)
    }

    fn claim(&self, vent_id: VentId) -> Result<InFlight<'_>> {
        if !self.in_flight.insert(vent_id) {
            return Err(GatewayError::ConnectInProgress(vent_id));
        }
        Ok(InFlight {
            set: &self.in_flight,
            vent_id,
        })
    }

    /// First connect to `device_name` for a vent created by a setup request
    ///
    /// On failure the vent goes back to `Unconnected`; it has no device name
    /// yet, so the monitor will not retry it.
    pub async fn initial_connect(&self, vent_id: VentId, device_name: &str) -> Result<()> {
        let _guard = self.claim(vent_id)?;

        let state = self.registry.with_node(vent_id, |node| {
            if node.link_state() != LinkState::Connecting {
                node.begin_connect();
            }
            node.link_state()
        })?;
        if state != LinkState::Connecting {
            return Err(GatewayError::ConnectFailed {
                device: device_name.to_string(),
                attempts: 0,
                reason: format!("vent is {}", state),
            });
        }

        if device_name.is_empty() {
            self.abandon(vent_id);
            tracing::warn!(vent_id = %vent_id, "Setup request without a device name, not connecting");
            return Err(GatewayError::ConnectFailed {
                device: String::new(),
                attempts: 0,
                reason: "empty device name".into(),
            });
        }

        tracing::info!(vent_id = %vent_id, device = %device_name, "Connecting to vent");
        match self
            .open(vent_id, device_name, ConnectPolicy::initial(&self.config))
            .await
        {
            Ok(link) => self.adopt(vent_id, device_name, link),
            Err(e) => {
                self.abandon(vent_id);
                tracing::warn!(vent_id = %vent_id, device = %device_name, error = %e, "Initial connect failed");
                Err(e)
            }
        }
    }

    fn abandon(&self, vent_id: VentId) {
        // the vent may have been removed while connecting
        let _ = self
            .registry
            .with_node(vent_id, |node| node.mark_connect_abandoned());
    }

    /// Settle every vent left in `Connecting` by cancelled connect tasks
    pub fn abandon_pending(&self) -> usize {
        self.registry
            .sweep(|node| {
                (node.link_state() == LinkState::Connecting).then(|| {
                    node.mark_connect_abandoned();
                    node.id()
                })
            })
            .len()
    }

    /// One reconnect attempt for a `Disconnected` vent
    ///
    /// Vents in any other state are left alone. A failure counts against the
    /// vent's reconnect budget and may move it to `GivenUp`.
    pub async fn reconnect(&self, vent_id: VentId) -> Result<()> {
        let _guard = self.claim(vent_id)?;

        let claimed = self.registry.with_node(vent_id, |node| {
            let name = node.device_name().map(str::to_string)?;
            if node.link_state() != LinkState::Disconnected || !node.begin_connect() {
                return None;
            }
            Some((name, node.reconnect_attempts()))
        })?;
        let Some((device_name, attempts)) = claimed else {
            tracing::debug!(vent_id = %vent_id, "Vent not eligible for reconnect");
            return Ok(());
        };

        tracing::info!(vent_id = %vent_id, device = %device_name, attempt = attempts + 1, "Reconnecting to vent");
        match self
            .open(vent_id, &device_name, ConnectPolicy::reconnect(&self.config))
            .await
        {
            Ok(link) => self.adopt(vent_id, &device_name, link),
            Err(e) => {
                let state = self
                    .registry
                    .with_node(vent_id, |node| node.record_reconnect_failure(Instant::now()))?;
                if state == LinkState::GivenUp {
                    tracing::warn!(vent_id = %vent_id, device = %device_name, "Reconnect attempts exhausted, giving up");
                } else {
                    tracing::warn!(vent_id = %vent_id, device = %device_name, error = %e, "Reconnect failed");
                }
                Err(e)
            }
        }
    }

    /// Connect primitive shared by first connects and reconnects
    async fn open(
        &self,
        vent_id: VentId,
        device_name: &str,
        policy: ConnectPolicy,
    ) -> Result<SharedLink> {
        let mut last_error = None;

        for attempt in 1..=policy.max_attempts {
            match self.attempt(vent_id, device_name, &policy).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    tracing::warn!(
                        vent_id = %vent_id,
                        device = %device_name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Connect attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.inter_attempt_delay).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(LinkError::Timeout(timeout)) => GatewayError::ConnectTimeout {
                device: device_name.to_string(),
                timeout,
            },
            Some(LinkError::RuntimeStopped) => GatewayError::RuntimeUnavailable,
            other => GatewayError::ConnectFailed {
                device: device_name.to_string(),
                attempts: policy.max_attempts,
                reason: other.map_or_else(|| "no attempts made".to_string(), |e| e.to_string()),
            },
        })
    }

    /// Connect, subscribe and send the handshake
    async fn attempt(
        &self,
        vent_id: VentId,
        device_name: &str,
        policy: &ConnectPolicy,
    ) -> std::result::Result<SharedLink, LinkError> {
        let link = self
            .links
            .connect(device_name, policy.scan_timeout, policy.attempt_timeout)
            .await?;

        let timeout = self.config.write_timeout();
        let handshake = async {
            self.links.subscribe(vent_id, &link, timeout).await?;
            let hello = HubCommand::Handshake { vent_id }.encode();
            self.links.write(&link, hello, timeout).await
        };

        if let Err(e) = handshake.await {
            self.links.disconnect_detached(link);
            return Err(e);
        }
        Ok(link)
    }

    /// Hand a fresh link to the vent if it is still waiting for one
    fn adopt(&self, vent_id: VentId, device_name: &str, link: SharedLink) -> Result<()> {
        let adopted = self.registry.with_node(vent_id, |node| {
            if node.link_state() != LinkState::Connecting {
                return false;
            }
            node.mark_connected(device_name, Arc::clone(&link));
            true
        });

        if let Ok(true) = adopted {
            tracing::info!(vent_id = %vent_id, device = %device_name, "Vent connected");
            return Ok(());
        }

        tracing::warn!(vent_id = %vent_id, device = %device_name, "Vent no longer waiting for a link, dropping it");
        self.links.disconnect_detached(link);
        match adopted {
            Err(e) => Err(e),
            Ok(_) => Err(GatewayError::LinkUnavailable(vent_id)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Health
    // ─────────────────────────────────────────────────────────────────────────

    /// The transport ended `link`'s notification stream
    ///
    /// Ignored unless `link` is still the vent's current link.
    pub fn handle_link_closed(&self, vent_id: VentId, link: &SharedLink, now: Instant) -> bool {
        let released = self
            .registry
            .with_node(vent_id, |node| {
                if node.owns_link(link) {
                    node.mark_disconnected(now)
                } else {
                    None
                }
            })
            .ok()
            .flatten();

        match released {
            Some(link) => {
                tracing::info!(vent_id = %vent_id, device = %link.device_name(), "Vent disconnected");
                self.links.disconnect_detached(link);
                true
            }
            None => false,
        }
    }

    /// Move connected vents whose link reports down to `Disconnected`
    pub fn check_health(&self, now: Instant) -> Vec<VentId> {
        let lost = self.registry.sweep(|node| {
            let down = node.link_state() == LinkState::Connected
                && node.link().is_some_and(|link| !link.is_connected());
            if !down {
                return None;
            }
            node.mark_disconnected(now).map(|link| (node.id(), link))
        });

        lost.into_iter()
            .map(|(vent_id, link)| {
                tracing::info!(vent_id = %vent_id, device = %link.device_name(), "Link lost, vent disconnected");
                self.links.disconnect_detached(link);
                vent_id
            })
            .collect()
    }

    /// Vents whose backoff has elapsed and that have no connect running
    pub fn due_reconnects(&self, now: Instant) -> Vec<VentId> {
        let base = self.config.reconnect_base_delay();
        self.registry.sweep(|node| {
            (node.reconnect_due(now, base) && !self.is_in_flight(node.id())).then(|| node.id())
        })
    }

    /// Start a reconnect task for every due vent
    pub fn schedule_reconnects(self: &Arc<Self>, now: Instant) -> Vec<JoinHandle<()>> {
        self.due_reconnects(now)
            .into_iter()
            .map(|vent_id| {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = manager.reconnect(vent_id).await {
                        tracing::debug!(vent_id = %vent_id, error = %e, "Scheduled reconnect did not succeed");
                    }
                })
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Administration
    // ─────────────────────────────────────────────────────────────────────────

    /// Clear the reconnect budget of a `GivenUp` or `Disconnected` vent
    pub fn reset(&self, vent_id: VentId) -> Result<bool> {
        let reset = self.registry.with_node(vent_id, |node| node.reset_reconnect())?;
        if reset {
            tracing::info!(vent_id = %vent_id, "Vent reconnect budget reset");
        }
        Ok(reset)
    }

    /// Remove a vent, disconnecting its link if it has one
    pub fn remove(&self, vent_id: VentId) -> Result<()> {
        let node = self
            .registry
            .remove(vent_id)
            .ok_or(GatewayError::UnknownVent(vent_id))?;
        if let Some(link) = node.link() {
            self.links.disconnect_detached(Arc::clone(link));
        }
        tracing::info!(vent_id = %vent_id, "Vent removed");
        Ok(())
    }

    /// Disconnect every live link, waiting up to the write timeout for each
    pub async fn disconnect_all(&self) {
        let now = Instant::now();
        let links = self
            .registry
            .sweep(|node| node.mark_disconnected(now).map(|link| (node.id(), link)));

        let timeout = self.config.write_timeout();
        join_all(links.iter().map(|(vent_id, link)| async move {
            if let Err(e) = self.links.disconnect(link, timeout).await {
                tracing::warn!(vent_id = %vent_id, error = %e, "Disconnect failed");
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::transport::LinkRuntime;
    use crate::transport::sim::SimTransport;

    struct Fixture {
        sim: Arc<SimTransport>,
        runtime: LinkRuntime,
        registry: Arc<VentRegistry>,
        manager: Arc<ConnectionManager>,
    }

    fn link_config() -> LinkConfig {
        LinkConfig {
            initial_connect_attempts: 3,
            scan_timeout_ms: 50,
            inter_attempt_delay_ms: 5,
            reconnect_timeout_ms: 100,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 10,
            monitor_interval_ms: 10,
            write_timeout_ms: 200,
        }
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimTransport::new(SimulationConfig {
            telemetry_interval_ms: 60_000,
            connect_latency_ms: 2,
            ..Default::default()
        }));
        let (runtime, _events) = LinkRuntime::start(sim.clone()).unwrap();
        let registry = Arc::new(VentRegistry::default());
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            runtime.handle(),
            link_config(),
        ));
        Fixture {
            sim,
            runtime,
            registry,
            manager,
        }
    }

    fn state(fx: &Fixture, id: VentId) -> LinkState {
        fx.registry.status(id).unwrap().link_state
    }

    #[tokio::test]
    async fn test_initial_connect_succeeds() {
        let fx = fixture();
        fx.sim.add_device("esp-vent-A");

        let id = fx.manager.register();
        assert_eq!(state(&fx, id), LinkState::Connecting);

        fx.manager.initial_connect(id, "esp-vent-A").await.unwrap();
        let status = fx.registry.status(id).unwrap();
        assert_eq!(status.link_state, LinkState::Connected);
        assert_eq!(status.device_name.as_deref(), Some("esp-vent-A"));
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(fx.sim.writes("esp-vent-A"), vec!["Connected, Vent ID: 1"]);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_initial_connect_retries() {
        let fx = fixture();
        fx.sim.add_device("vent-a");
        fx.sim.fail_next_connects("vent-a", 2);

        let id = fx.manager.register();
        fx.manager.initial_connect(id, "vent-a").await.unwrap();
        assert_eq!(fx.sim.connect_count("vent-a"), 3);
        assert_eq!(state(&fx, id), LinkState::Connected);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_initial_connect_gives_back_unconnected() {
        let fx = fixture();
        let id = fx.manager.register();

        let result = fx.manager.initial_connect(id, "nobody").await;
        assert!(matches!(result, Err(GatewayError::ConnectFailed { attempts: 3, .. })));
        assert_eq!(state(&fx, id), LinkState::Unconnected);
        assert!(fx.manager.due_reconnects(Instant::now()).is_empty());

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_device_name_is_not_scanned() {
        let fx = fixture();
        let id = fx.manager.register();

        let result = fx.manager.initial_connect(id, "").await;
        assert!(matches!(result, Err(GatewayError::ConnectFailed { attempts: 0, .. })));
        assert_eq!(state(&fx, id), LinkState::Unconnected);
        assert!(!fx.manager.is_in_flight(id));
        assert_eq!(fx.sim.connect_count(""), 0);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_abandon_pending_settles_connecting_vents() {
        let fx = fixture();
        fx.sim.add_device("vent-b");
        let fresh = fx.manager.register();
        let known = fx.manager.register();
        fx.manager.initial_connect(known, "vent-b").await.unwrap();
        fx.registry
            .with_node(known, |node| {
                let _ = node.mark_disconnected(Instant::now());
                node.begin_connect();
            })
            .unwrap();

        assert_eq!(fx.manager.abandon_pending(), 2);
        assert_eq!(state(&fx, fresh), LinkState::Unconnected);
        assert_eq!(state(&fx, known), LinkState::Disconnected);
        assert_eq!(fx.manager.abandon_pending(), 0);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_connect_in_flight_per_vent() {
        let fx = fixture();
        fx.sim.add_device("vent-a");
        fx.sim.set_connect_delay("vent-a", Duration::from_millis(30));

        let id = fx.manager.register();
        let (first, second) = tokio::join!(
            fx.manager.initial_connect(id, "vent-a"),
            fx.manager.initial_connect(id, "vent-a"),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(GatewayError::ConnectInProgress(_))));
        assert_eq!(fx.sim.connect_count("vent-a"), 1);
        assert!(!fx.manager.is_in_flight(id));

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_detects_silent_drop() {
        let fx = fixture();
        fx.sim.add_device("vent-a");
        let id = fx.manager.register();
        fx.manager.initial_connect(id, "vent-a").await.unwrap();

        assert!(fx.manager.check_health(Instant::now()).is_empty());
        fx.sim.silently_disconnect("vent-a");
        assert_eq!(fx.manager.check_health(Instant::now()), vec![id]);
        assert_eq!(state(&fx, id), LinkState::Disconnected);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_link_close_is_ignored() {
        let fx = fixture();
        fx.sim.add_device("vent-a");
        let id = fx.manager.register();
        fx.manager.initial_connect(id, "vent-a").await.unwrap();

        let stranger: SharedLink = crate::transport::testing::RecordingLink::new("vent-a");
        assert!(!fx.manager.handle_link_closed(id, &stranger, Instant::now()));
        assert_eq!(state(&fx, id), LinkState::Connected);

        let own = fx.registry.with_node(id, |n| n.link().cloned()).unwrap().unwrap();
        assert!(fx.manager.handle_link_closed(id, &own, Instant::now()));
        assert_eq!(state(&fx, id), LinkState::Disconnected);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_restores_link_and_budget() {
        let fx = fixture();
        fx.sim.add_device("vent-a");
        let id = fx.manager.register();
        fx.manager.initial_connect(id, "vent-a").await.unwrap();

        fx.sim.drop_link("vent-a");
        fx.manager.check_health(Instant::now());
        fx.sim.fail_next_connects("vent-a", 1);

        assert!(fx.manager.reconnect(id).await.is_err());
        assert_eq!(fx.registry.status(id).unwrap().reconnect_attempts, 1);

        fx.manager.reconnect(id).await.unwrap();
        let status = fx.registry.status(id).unwrap();
        assert_eq!(status.link_state, LinkState::Connected);
        assert_eq!(status.reconnect_attempts, 0);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_budget() {
        let fx = fixture();
        fx.sim.add_device("vent-a");
        let id = fx.manager.register();
        fx.manager.initial_connect(id, "vent-a").await.unwrap();

        fx.sim.drop_link("vent-a");
        fx.sim.set_reachable("vent-a", false);
        fx.manager.check_health(Instant::now());

        for _ in 0..5 {
            assert!(fx.manager.reconnect(id).await.is_err());
        }
        assert_eq!(state(&fx, id), LinkState::GivenUp);
        assert_eq!(fx.registry.status(id).unwrap().reconnect_attempts, 5);

        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(fx.manager.due_reconnects(far_future).is_empty());
        fx.manager.reconnect(id).await.unwrap();
        assert_eq!(fx.sim.connect_count("vent-a"), 6);

        assert!(fx.manager.reset(id).unwrap());
        assert_eq!(fx.manager.due_reconnects(far_future), vec![id]);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduled_reconnect_respects_backoff() {
        let fx = fixture();
        fx.sim.add_device("vent-a");
        let id = fx.manager.register();
        fx.manager.initial_connect(id, "vent-a").await.unwrap();

        let lost_at = Instant::now();
        fx.sim.drop_link("vent-a");
        fx.manager.check_health(lost_at);

        assert!(fx.manager.schedule_reconnects(lost_at).is_empty());
        let tasks = fx.manager.schedule_reconnects(lost_at + Duration::from_millis(10));
        assert_eq!(tasks.len(), 1);
        join_all(tasks).await;
        assert_eq!(state(&fx, id), LinkState::Connected);

        fx.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_disconnects_link() {
        let fx = fixture();
        fx.sim.add_device("vent-a");
        let id = fx.manager.register();
        fx.manager.initial_connect(id, "vent-a").await.unwrap();

        fx.manager.remove(id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fx.sim.is_linked("vent-a"));
        assert!(matches!(fx.manager.remove(id), Err(GatewayError::UnknownVent(_))));

        fx.runtime.shutdown().await;
    }
}
