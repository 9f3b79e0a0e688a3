//! Simulated Radio
//!
//! Virtual vents that behave like the vent firmware: they answer the
//! handshake with `"Connected"`, move on position writes and report the move,
//! and periodically notify a temperature that drifts toward an ambient value
//! depending on how far the vent is open.
//!
//! Faults can be injected per device for tests and demos.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use breeze_protocol::{DeviceMessage, HubCommand, VentId};
use futures::channel::mpsc::{UnboundedSender, unbounded};
use parking_lot::Mutex;
use rand::Rng;

use super::{Link, LinkError, Notifications, SharedLink, Transport};
use crate::config::SimulationConfig;

/// Fraction of the gap to the target temperature closed per telemetry period
const DRIFT_RATE: f32 = 0.2;

/// In-process transport backed by virtual vents
pub struct SimTransport {
    config: SimulationConfig,
    auto_create: bool,
    devices: Mutex<HashMap<String, Arc<VirtualVent>>>,
}

impl SimTransport {
    /// Transport that only knows devices added with [`add_device`](Self::add_device)
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            auto_create: false,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Transport that materialises a vent for any name it is asked to scan for
    pub fn auto_create(config: SimulationConfig) -> Self {
        Self {
            auto_create: true,
            ..Self::new(config)
        }
    }

    pub fn add_device(&self, name: &str) {
        self.devices
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(VirtualVent::new(name, self.config.ambient_temperature)));
    }

    /// Make scans for `name` find nothing (or find it again)
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        self.with_vent(name, |state| state.reachable = reachable);
    }

    /// Fail the next `count` connects to `name` after the scan finds it
    pub fn fail_next_connects(&self, name: &str, count: u32) {
        self.with_vent(name, |state| state.failures_pending = count);
    }

    /// Override the connect latency for one device
    pub fn set_connect_delay(&self, name: &str, delay: Duration) {
        self.with_vent(name, |state| state.connect_delay = Some(delay));
    }

    /// Drop the live link as if the vent went out of range
    pub fn drop_link(&self, name: &str) {
        if let Some(session) = self.with_vent(name, |state| state.session.take()).flatten() {
            session.close();
        }
    }

    /// Mark the link down without ending its notification stream
    pub fn silently_disconnect(&self, name: &str) {
        self.with_vent(name, |state| {
            if let Some(session) = &state.session {
                session.connected.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Push a raw notification on the live link
    pub fn inject(&self, name: &str, text: &str) -> bool {
        self.with_vent(name, |state| {
            state
                .session
                .as_ref()
                .is_some_and(|s| s.notify(text.as_bytes().to_vec()))
        })
        .unwrap_or(false)
    }

    /// Writes the device received, as text
    pub fn writes(&self, name: &str) -> Vec<String> {
        self.with_vent(name, |state| {
            state
                .writes
                .iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Connect attempts made against `name`, successful or not
    pub fn connect_count(&self, name: &str) -> u32 {
        self.with_vent(name, |state| state.connects).unwrap_or(0)
    }

    pub fn is_linked(&self, name: &str) -> bool {
        self.with_vent(name, |state| {
            state
                .session
                .as_ref()
                .is_some_and(|s| s.connected.load(Ordering::SeqCst))
        })
        .unwrap_or(false)
    }

    pub fn position(&self, name: &str) -> Option<u8> {
        self.with_vent(name, |state| state.position).flatten()
    }

    fn vent(&self, name: &str) -> Option<Arc<VirtualVent>> {
        let mut devices = self.devices.lock();
        if let Some(vent) = devices.get(name) {
            return Some(Arc::clone(vent));
        }
        if !self.auto_create {
            return None;
        }
        tracing::debug!(device = %name, "Simulating new vent");
        let vent = Arc::new(VirtualVent::new(name, self.config.ambient_temperature));
        devices.insert(name.to_string(), Arc::clone(&vent));
        Some(vent)
    }

    fn with_vent<R>(&self, name: &str, f: impl FnOnce(&mut VentState) -> R) -> Option<R> {
        let vent = self.devices.lock().get(name).cloned()?;
        let mut state = vent.state.lock();
        Some(f(&mut state))
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(
        &self,
        device_name: &str,
        scan_timeout: Duration,
    ) -> Result<SharedLink, LinkError> {
        let latency = Duration::from_millis(self.config.connect_latency_ms);

        let Some(vent) = self.vent(device_name) else {
            tokio::time::sleep(latency.min(scan_timeout)).await;
            return Err(LinkError::DeviceNotFound(device_name.to_string()));
        };

        let delay = {
            let mut state = vent.state.lock();
            state.connects += 1;
            state.connect_delay.unwrap_or(latency)
        };
        let reachable = vent.state.lock().reachable;
        tokio::time::sleep(if reachable { delay } else { delay.min(scan_timeout) }).await;

        let session = {
            let mut state = vent.state.lock();
            if !state.reachable {
                return Err(LinkError::DeviceNotFound(device_name.to_string()));
            }
            if state.failures_pending > 0 {
                state.failures_pending -= 1;
                return Err(LinkError::Fault("connection refused".into()));
            }
            let session = Arc::new(Session::new());
            if let Some(previous) = state.session.replace(Arc::clone(&session)) {
                previous.close();
            }
            session
        };

        tracing::debug!(device = %device_name, "Simulated link established");
        Ok(Arc::new(SimLink {
            vent,
            session,
            config: self.config.clone(),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Virtual Vent
// ─────────────────────────────────────────────────────────────────────────────

struct VirtualVent {
    name: String,
    state: Mutex<VentState>,
}

struct VentState {
    reachable: bool,
    failures_pending: u32,
    connect_delay: Option<Duration>,
    connects: u32,
    /// Assigned by the hub's handshake
    vent_id: Option<VentId>,
    position: Option<u8>,
    temperature: f32,
    writes: Vec<Vec<u8>>,
    session: Option<Arc<Session>>,
}

impl VirtualVent {
    fn new(name: &str, ambient: f32) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(VentState {
                reachable: true,
                failures_pending: 0,
                connect_delay: None,
                connects: 0,
                vent_id: None,
                position: None,
                temperature: ambient,
                writes: Vec::new(),
                session: None,
            }),
        }
    }
}

/// One connection's notification channel
struct Session {
    connected: AtomicBool,
    notify_tx: Mutex<Option<UnboundedSender<Vec<u8>>>>,
}

impl Session {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            notify_tx: Mutex::new(None),
        }
    }

    fn notify(&self, data: Vec<u8>) -> bool {
        match self.notify_tx.lock().as_ref() {
            Some(tx) => tx.unbounded_send(data).is_ok(),
            None => false,
        }
    }

    /// Mark down and end the notification stream
    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify_tx.lock().take();
    }
}

struct SimLink {
    vent: Arc<VirtualVent>,
    session: Arc<Session>,
    config: SimulationConfig,
}

impl SimLink {
    /// Firmware reaction to a hub write
    fn handle_write(&self, data: &[u8]) {
        let mut state = self.vent.state.lock();
        state.writes.push(data.to_vec());

        match HubCommand::parse(data) {
            Ok(HubCommand::Handshake { vent_id }) => {
                state.vent_id = Some(vent_id);
                drop(state);
                self.session.notify(DeviceMessage::HandshakeAck.to_string().into_bytes());
            }
            Ok(HubCommand::Position(position)) => {
                state.position = Some(position);
                let Some(vent_id) = state.vent_id else {
                    return;
                };
                drop(state);
                let report = DeviceMessage::Motor {
                    vent_id,
                    position: f32::from(position),
                };
                self.session.notify(report.to_string().into_bytes());
            }
            Err(e) => {
                tracing::warn!(device = %self.vent.name, error = %e, "Simulated vent ignored write");
            }
        }
    }
}

#[async_trait]
impl Link for SimLink {
    fn device_name(&self) -> &str {
        &self.vent.name
    }

    fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.handle_write(data);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Notifications, LinkError> {
        if !self.is_connected() || self.session.notify_tx.lock().is_some() || !self.vent_live() {
            return Err(LinkError::NotConnected);
        }

        let (tx, rx) = unbounded();
        *self.session.notify_tx.lock() = Some(tx);

        tokio::spawn(telemetry_loop(
            Arc::clone(&self.vent),
            Arc::clone(&self.session),
            self.config.clone(),
        ));

        Ok(Box::pin(rx))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.session.close();
        let mut state = self.vent.state.lock();
        if state
            .session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, &self.session))
        {
            state.session = None;
        }
        Ok(())
    }
}

impl SimLink {
    /// Whether this link is still the vent's current session
    fn vent_live(&self) -> bool {
        self.vent
            .state
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, &self.session))
    }
}

async fn telemetry_loop(vent: Arc<VirtualVent>, session: Arc<Session>, config: SimulationConfig) {
    let period = Duration::from_millis(config.telemetry_interval_ms.max(1));

    loop {
        tokio::time::sleep(period).await;
        if !session.connected.load(Ordering::SeqCst) {
            if session.notify_tx.lock().is_none() {
                return;
            }
            continue;
        }

        let report = {
            let mut state = vent.state.lock();
            let opening = f32::from(state.position.unwrap_or(0)) / 100.0;
            let target = config.ambient_temperature - config.cooling_capacity * opening;
            let noise = rand::thread_rng().gen_range(-1.0f32..=1.0) * config.noise;
            state.temperature += (target - state.temperature) * DRIFT_RATE + noise;

            state.vent_id.map(|vent_id| DeviceMessage::Telemetry {
                vent_id,
                temperature: state.temperature,
            })
        };

        if let Some(report) = report {
            if !session.notify(report.to_string().into_bytes()) {
                return;
            }
        }
    }
}
