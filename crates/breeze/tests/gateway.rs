//! End-to-end tests: a full hub on localhost UDP against the simulated radio

use std::sync::Arc;
use std::time::Duration;

use breeze::breeze_protocol::{Packet, PayloadShape, VentId};
use breeze::config::SimulationConfig;
use breeze::transport::sim::SimTransport;
use breeze::{Gateway, GatewayConfig, GatewayHandle, LinkState, Mode};
use tokio::net::UdpSocket;
use tokio_test::assert_ok;

fn fast_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.network.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.network.receive_timeout_ms = 50;
    config.links.scan_timeout_ms = 100;
    config.links.inter_attempt_delay_ms = 10;
    config.links.reconnect_timeout_ms = 100;
    config.links.reconnect_base_delay_ms = 20;
    config.links.monitor_interval_ms = 10;
    config.links.write_timeout_ms = 500;
    config.dispatch.min_command_interval_ms = 100;
    config.dispatch.poll_interval_ms = 10;
    config
}

fn quiet_sim() -> Arc<SimTransport> {
    Arc::new(SimTransport::new(SimulationConfig {
        telemetry_interval_ms: 60_000,
        connect_latency_ms: 5,
        noise: 0.0,
        ..Default::default()
    }))
}

struct Harness {
    hub: GatewayHandle,
    sim: Arc<SimTransport>,
    app: UdpSocket,
}

impl Harness {
    async fn start(config: GatewayConfig, sim: Arc<SimTransport>) -> Self {
        let hub = Gateway::start(config, sim.clone()).await.unwrap();
        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self { hub, sim, app }
    }

    async fn send(&self, packet: Packet) {
        self.send_raw(&packet.encode()).await;
    }

    async fn send_raw(&self, bytes: &[u8]) {
        self.app.send_to(bytes, self.hub.local_addr()).await.unwrap();
    }

    async fn recv(&self) -> Packet {
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), self.app.recv_from(&mut buf))
            .await
            .expect("no report from hub")
            .unwrap();
        Packet::decode(&buf[..len], PayloadShape::Text).unwrap()
    }

    /// Next report with the given code, skipping others
    async fn recv_code(&self, code: u32) -> Packet {
        loop {
            let packet = self.recv().await;
            if packet.code == code {
                return packet;
            }
        }
    }

    fn link_state(&self, id: VentId) -> LinkState {
        self.hub.gateway().vent_status(id).unwrap().link_state
    }

    async fn wait_for_state(&self, id: VentId, state: LinkState) {
        wait_until(|| self.link_state(id) == state).await;
    }

    async fn setup(&self, device: &str) -> VentId {
        let before = self.hub.gateway().registry().len();
        self.send(Packet::text(1, device)).await;
        wait_until(|| self.hub.gateway().registry().len() > before).await;
        *self.hub.gateway().registry().ids().last().unwrap()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_setup_request_connects_new_vent() {
    let sim = quiet_sim();
    sim.add_device("esp-vent-A");
    let h = Harness::start(fast_config(), sim).await;

    let id = h.setup("esp-vent-A").await;
    assert_eq!(id, VentId(1));
    h.wait_for_state(id, LinkState::Connected).await;

    let status = h.hub.gateway().vent_status(id).unwrap();
    assert_eq!(status.device_name.as_deref(), Some("esp-vent-A"));
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(h.hub.gateway().registry().len(), 1);

    assert_eq!(h.recv().await, Packet::text(1, "1"));

    h.hub.shutdown().await;
}

#[tokio::test]
async fn test_auto_mode_telemetry_end_to_end() {
    let sim = quiet_sim();
    sim.add_device("vent-a");
    let h = Harness::start(fast_config(), sim).await;

    let id = h.setup("vent-a").await;
    h.wait_for_state(id, LinkState::Connected).await;
    assert_eq!(h.recv_code(1).await, Packet::text(1, "1"));

    h.send(Packet::text(2, "1.24.0")).await;
    wait_until(|| h.hub.gateway().vent_status(id).unwrap().mode == Mode::Auto).await;

    assert!(h.sim.inject("vent-a", "ID: 1, temp: 26.0"));
    assert_eq!(h.recv_code(2).await, Packet::text(2, "1.26.0"));

    wait_until(|| h.sim.writes("vent-a").len() == 2).await;
    assert_eq!(h.sim.writes("vent-a"), vec!["Connected, Vent ID: 1", "100"]);

    // the vent confirms the move, which hands control back to the application
    assert_eq!(h.recv_code(3).await, Packet::text(3, "1.motor100.0"));
    wait_until(|| h.hub.gateway().vent_status(id).unwrap().mode == Mode::Manual).await;

    h.hub.shutdown().await;
}

#[tokio::test]
async fn test_malformed_datagrams_are_dropped() {
    let sim = quiet_sim();
    sim.add_device("vent-a");
    let h = Harness::start(fast_config(), sim).await;

    h.send_raw(&[1, 0]).await;
    h.send_raw(&[]).await;
    h.send(Packet::text(42, "nope")).await;
    h.send(Packet::text(3, "9.50")).await;

    let id = h.setup("vent-a").await;
    h.wait_for_state(id, LinkState::Connected).await;
    assert_eq!(h.hub.gateway().registry().len(), 1);

    h.hub.shutdown().await;
}

#[tokio::test]
async fn test_manual_positions_are_rate_limited() {
    let sim = quiet_sim();
    sim.add_device("vent-a");
    let h = Harness::start(fast_config(), sim).await;

    let id = h.setup("vent-a").await;
    h.wait_for_state(id, LinkState::Connected).await;

    h.send(Packet::text(3, "1.40")).await;
    h.send(Packet::text(3, "1.60")).await;

    wait_until(|| h.sim.writes("vent-a").len() == 3).await;
    assert_eq!(h.sim.writes("vent-a")[1..], ["40", "60"]);
    assert_eq!(h.sim.position("vent-a"), Some(60));

    let status = h.hub.gateway().vent_status(id).unwrap();
    assert_eq!(status.mode, Mode::Manual);
    assert!(status.queued_commands.is_empty());

    h.hub.shutdown().await;
}

#[tokio::test]
async fn test_lost_vent_reconnects() {
    let sim = quiet_sim();
    sim.add_device("vent-a");
    let h = Harness::start(fast_config(), sim).await;

    let id = h.setup("vent-a").await;
    h.wait_for_state(id, LinkState::Connected).await;

    h.sim.drop_link("vent-a");
    wait_until(|| h.sim.connect_count("vent-a") >= 2).await;
    h.wait_for_state(id, LinkState::Connected).await;

    let status = h.hub.gateway().vent_status(id).unwrap();
    assert_eq!(status.reconnect_attempts, 0);
    assert!(h.sim.writes("vent-a").iter().filter(|w| w.starts_with("Connected")).count() >= 2);

    h.hub.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_vent_is_given_up_until_reset() {
    let sim = quiet_sim();
    sim.add_device("vent-a");
    let mut config = fast_config();
    config.links.max_reconnect_attempts = 3;
    let h = Harness::start(config, sim).await;

    let id = h.setup("vent-a").await;
    h.wait_for_state(id, LinkState::Connected).await;

    h.sim.set_reachable("vent-a", false);
    h.sim.silently_disconnect("vent-a");
    h.wait_for_state(id, LinkState::GivenUp).await;

    // 1 initial connect + 3 reconnect attempts, nothing after giving up
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.sim.connect_count("vent-a"), 4);
    assert_eq!(h.hub.gateway().vent_status(id).unwrap().reconnect_attempts, 3);

    h.sim.set_reachable("vent-a", true);
    assert!(assert_ok!(h.hub.gateway().reset_vent(id)));
    h.wait_for_state(id, LinkState::Connected).await;

    h.hub.shutdown().await;
}

#[tokio::test]
async fn test_failed_setup_leaves_vent_unconnected() {
    let h = Harness::start(fast_config(), quiet_sim()).await;

    let id = h.setup("missing-vent").await;
    h.wait_for_state(id, LinkState::Unconnected).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.link_state(id), LinkState::Unconnected);
    assert_eq!(h.hub.gateway().vent_status(id).unwrap().device_name, None);

    h.hub.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_setup() {
    let sim = quiet_sim();
    sim.add_device("vent-a");
    sim.set_connect_delay("vent-a", Duration::from_millis(60));
    let h = Harness::start(fast_config(), sim).await;

    let id = h.setup("vent-a").await;
    assert_eq!(h.link_state(id), LinkState::Connecting);

    let gateway = Arc::clone(h.hub.gateway());
    h.hub.shutdown().await;

    // settled as soon as shutdown returns, and nothing adopts a late link
    assert_eq!(gateway.vent_status(id).unwrap().link_state, LinkState::Unconnected);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = gateway.vent_status(id).unwrap();
    assert_eq!(status.link_state, LinkState::Unconnected);
    assert_eq!(status.device_name, None);
}
