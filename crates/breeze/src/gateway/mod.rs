//! Gateway
//!
//! Ties the UDP side to the vent side. Inbound application packets become
//! registry mutations, connects and dispatched positions; inbound vent
//! notifications become controller updates and outbound reports.

mod services;

pub use services::{DispatchService, LinkEventPump, ReconnectMonitorService, UdpReceiverService};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use breeze_protocol::packet::{parse_vent_position, parse_vent_value, peek_code};
use breeze_protocol::{Command, DeviceMessage, Packet, Report, VentId};
use breeze_runtime::ServiceManager;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::channel::AppChannel;
use crate::config::GatewayConfig;
use crate::connection::ConnectionManager;
use crate::dispatch::CommandDispatcher;
use crate::error::{GatewayError, Result};
use crate::transport::{LinkEvent, LinkRuntime, LinkRuntimeHandle, Transport};
use crate::vent::{NodeDefaults, VentRegistry, VentStatus};

/// Outcome of one inbound application packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Inbound {
    /// A vent was created and its first connect started
    Setup(VentId),
    /// The vent switched to auto mode with this set point
    Target(VentId, f32),
    /// The vent switched to manual mode with this position
    Position(VentId, u8),
}

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<VentRegistry>,
    connections: Arc<ConnectionManager>,
    dispatcher: Arc<CommandDispatcher>,
    channel: Arc<AppChannel>,
    /// First connects started by setup requests
    connects: Mutex<JoinSet<()>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, socket: Arc<UdpSocket>, links: LinkRuntimeHandle) -> Self {
        let registry = Arc::new(VentRegistry::new(NodeDefaults::from_config(&config)));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            links.clone(),
            config.links.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            links,
            config.dispatch.min_command_interval(),
            config.links.write_timeout(),
        ));
        let channel = Arc::new(AppChannel::new(socket, config.network.app_reply_port));

        Self {
            config,
            registry,
            connections,
            dispatcher,
            channel,
            connects: Mutex::new(JoinSet::new()),
        }
    }

    /// Bind the socket, start the link runtime and every service
    pub async fn start(config: GatewayConfig, transport: Arc<dyn Transport>) -> Result<GatewayHandle> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.network.listen_addr).await?);
        let local_addr = socket.local_addr()?;
        let (runtime, events) = LinkRuntime::start(transport)?;

        let gateway = Arc::new(Gateway::new(config.clone(), Arc::clone(&socket), runtime.handle()));
        let services = ServiceManager::new_shared();

        let spawned = spawn_services(&services, &gateway, socket, events);

        let handle = GatewayHandle {
            gateway,
            services,
            runtime,
            local_addr,
        };

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start hub services");
            handle.shutdown().await;
            return Err(e);
        }

        tracing::info!(listen = %local_addr, "Hub started");
        Ok(handle)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<VentRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn channel(&self) -> &Arc<AppChannel> {
        &self.channel
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Application -> Vents
    // ─────────────────────────────────────────────────────────────────────────

    /// Interpret one datagram from the application
    pub async fn handle_datagram(&self, datagram: &[u8], source: SocketAddr) -> Result<Inbound> {
        self.channel.learn_peer(source);

        let code = peek_code(datagram)?;
        let command = Command::from_code(code).ok_or(GatewayError::UnknownCommand(code))?;
        let packet = Packet::decode(datagram, command.payload_shape())?;
        let text = packet.payload.as_text();
        tracing::debug!(?command, payload = %text, "Application packet");

        match command {
            Command::SetupRequest => Ok(Inbound::Setup(self.setup(text))),

            Command::SetTarget => {
                let (vent_id, desired) = parse_vent_value(text)?;
                self.registry
                    .with_node(vent_id, |node| node.set_auto(desired))?;
                tracing::info!(vent_id = %vent_id, desired, "Vent set to auto");
                Ok(Inbound::Target(vent_id, desired))
            }

            Command::SetPosition => {
                let (vent_id, position) = parse_vent_position(text)?;
                self.registry
                    .with_node(vent_id, |node| node.set_manual(position))?;
                tracing::info!(vent_id = %vent_id, position, "Vent set to manual");
                self.dispatcher.submit(vent_id, position).await?;
                Ok(Inbound::Position(vent_id, position))
            }
        }
    }

    /// Create a vent for `device_name` and start connecting in the background
    ///
    /// Every setup request gets a vent. One whose name is empty or failed to
    /// decode ends up `Unconnected` without a scan.
    pub fn setup(&self, device_name: &str) -> VentId {
        let device_name = device_name
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string();

        let vent_id = self.connections.register();
        tracing::info!(vent_id = %vent_id, device = %device_name, "Setup requested");

        let connections = Arc::clone(&self.connections);
        let mut connects = self.connects.lock();
        while connects.try_join_next().is_some() {}
        connects.spawn(async move {
            // failures are logged by the connection manager
            let _ = connections.initial_connect(vent_id, &device_name).await;
        });

        vent_id
    }

    /// Abort setup connects still running and settle their vents
    pub async fn cancel_connects(&self) {
        let mut connects = std::mem::take(&mut *self.connects.lock());
        connects.shutdown().await;

        let settled = self.connections.abandon_pending();
        if settled > 0 {
            tracing::info!(vents = settled, "Cancelled pending connects");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Vents -> Application
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Notification { vent_id, data } => {
                if let Err(e) = self.handle_notification(vent_id, &data).await {
                    tracing::warn!(vent_id = %vent_id, error = %e, "Dropping notification");
                }
            }
            LinkEvent::Closed { vent_id, link } => {
                self.connections
                    .handle_link_closed(vent_id, &link, Instant::now());
            }
        }
    }

    /// Handle one notification received on the link owned by `source`
    ///
    /// Telemetry and motor reports are routed by the id inside the message,
    /// which is not necessarily `source`.
    pub async fn handle_notification(&self, source: VentId, data: &[u8]) -> Result<()> {
        let message = DeviceMessage::parse(data)?;
        tracing::debug!(vent_id = %source, %message, "Vent notification");

        match message {
            DeviceMessage::Telemetry {
                vent_id,
                temperature,
            } => {
                if vent_id != source {
                    tracing::debug!(vent_id = %vent_id, link_owner = %source, "Telemetry for another vent");
                }

                let deadband = self.config.control.telemetry_deadband;
                match self
                    .registry
                    .with_node(vent_id, |node| node.apply_telemetry(temperature, deadband))
                {
                    Ok(Some(position)) => {
                        tracing::debug!(vent_id = %vent_id, temperature, position, "Controller moved vent");
                        if let Err(e) = self.dispatcher.submit(vent_id, position).await {
                            tracing::warn!(vent_id = %vent_id, position, error = %e, "Controller command not sent");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(vent_id = %vent_id, error = %e, "Telemetry for unknown vent");
                    }
                }

                self.channel
                    .send(&Report::telemetry(vent_id, temperature))
                    .await?;
            }

            DeviceMessage::Motor { vent_id, position } => {
                if let Err(e) = self
                    .registry
                    .with_node(vent_id, |node| node.apply_motor_feedback(position))
                {
                    tracing::warn!(vent_id = %vent_id, error = %e, "Motor feedback for unknown vent");
                }
                self.channel
                    .send(&Report::motor_feedback(vent_id, position))
                    .await?;
            }

            DeviceMessage::HandshakeAck => {
                tracing::info!(vent_id = %source, "Vent acknowledged handshake");
                self.channel.send(&Report::vent_connected(source)).await?;
            }
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Administration
    // ─────────────────────────────────────────────────────────────────────────

    /// Let a given-up vent be reconnected again
    pub fn reset_vent(&self, vent_id: VentId) -> Result<bool> {
        self.connections.reset(vent_id)
    }

    pub fn remove_vent(&self, vent_id: VentId) -> Result<()> {
        self.connections.remove(vent_id)
    }

    /// Clear the vent's accumulated controller state
    pub fn reset_controller(&self, vent_id: VentId) -> Result<()> {
        self.registry
            .with_node(vent_id, |node| node.reset_controller())?;
        tracing::info!(vent_id = %vent_id, "Controller reset");
        Ok(())
    }

    pub fn vent_status(&self, vent_id: VentId) -> Result<VentStatus> {
        self.registry.status(vent_id)
    }

    pub fn vents(&self) -> Vec<VentStatus> {
        self.registry.statuses()
    }
}

fn spawn_services(
    services: &ServiceManager,
    gateway: &Arc<Gateway>,
    socket: Arc<UdpSocket>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
) -> Result<()> {
    let config = gateway.config();
    services.spawn(UdpReceiverService::new(
        Arc::clone(gateway),
        socket,
        config.network.clone(),
    ))?;
    services.spawn(LinkEventPump::new(Arc::clone(gateway), events))?;
    services.spawn(ReconnectMonitorService::new(
        Arc::clone(&gateway.connections),
        config.links.monitor_interval(),
    ))?;
    services.spawn(DispatchService::new(
        Arc::clone(&gateway.dispatcher),
        config.dispatch.poll_interval(),
    ))?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Running Hub
// ─────────────────────────────────────────────────────────────────────────────

/// A started gateway with its services and link runtime
pub struct GatewayHandle {
    gateway: Arc<Gateway>,
    services: Arc<ServiceManager>,
    runtime: LinkRuntime,
    local_addr: SocketAddr,
}

impl GatewayHandle {
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    /// Address the hub is receiving application packets on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop services, cancel pending connects, disconnect every vent and
    /// stop the link runtime
    pub async fn shutdown(self) {
        tracing::info!("Shutting down hub");

        if let Err(e) = self.services.shutdown_all().await {
            tracing::warn!(error = %e, "Service shutdown incomplete");
        }
        self.gateway.cancel_connects().await;
        self.gateway.connections.disconnect_all().await;
        self.runtime.shutdown().await;

        tracing::info!("Hub stopped");
    }
}
