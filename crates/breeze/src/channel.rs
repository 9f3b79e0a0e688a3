//! Application Channel
//!
//! Outbound half of the UDP link. The application's address is learned from
//! the first inbound datagram; until then outbound reports are dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use breeze_protocol::Packet;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::error::Result;

pub struct AppChannel {
    socket: Arc<UdpSocket>,
    peer: Mutex<Option<SocketAddr>>,
    /// Replaces the learned source port when set
    reply_port: Option<u16>,
}

impl AppChannel {
    pub fn new(socket: Arc<UdpSocket>, reply_port: Option<u16>) -> Self {
        Self {
            socket,
            peer: Mutex::new(None),
            reply_port,
        }
    }

    /// Remember the sender of the first inbound datagram
    pub fn learn_peer(&self, source: SocketAddr) {
        let mut peer = self.peer.lock();
        if peer.is_some() {
            return;
        }

        let mut addr = source;
        if let Some(port) = self.reply_port {
            addr.set_port(port);
        }
        tracing::info!(peer = %addr, "Learned application address");
        *peer = Some(addr);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    /// Send `packet` to the application; returns false if no peer is known yet
    pub async fn send(&self, packet: &Packet) -> Result<bool> {
        let Some(peer) = self.peer() else {
            tracing::debug!(code = packet.code, "No application address yet, dropping report");
            return Ok(false);
        };

        let bytes = packet.encode();
        self.socket.send_to(&bytes, peer).await?;
        tracing::debug!(code = packet.code, payload = ?packet.payload, peer = %peer, "Report sent");
        Ok(true)
    }
}
