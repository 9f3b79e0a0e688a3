//! Command Dispatcher
//!
//! Each vent has a small FIFO of pending positions (drop-oldest on overflow)
//! and a minimum spacing between writes. A position goes out immediately only
//! when the vent is connected, nothing is queued ahead of it and the spacing
//! has elapsed; otherwise it waits for the periodic sweep.
//!
//! Failed writes are logged and not requeued. Noticing the dead link is the
//! reconnect monitor's job.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use breeze_protocol::{HubCommand, VentId};
use futures::future::join_all;

use crate::error::{GatewayError, Result};
use crate::transport::{LinkError, LinkRuntimeHandle, SharedLink};
use crate::vent::{LinkState, VentNode, VentRegistry};

// ─────────────────────────────────────────────────────────────────────────────
// Command Queue
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded FIFO of vent positions
#[derive(Debug, Clone)]
pub struct CommandQueue {
    items: VecDeque<u8>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append, returning the oldest entry if it had to be dropped
    pub fn push(&mut self, position: u8) -> Option<u8> {
        let dropped = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(position);
        dropped
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.items.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to a submitted position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Written to the link
    Sent,
    /// Waiting in the vent's queue; `dropped` is the entry it pushed out
    Queued { dropped: Option<u8> },
}

enum Admission {
    SendNow(SharedLink),
    Queued { dropped: Option<u8> },
}

fn spacing_elapsed(node: &VentNode, now: Instant, min_interval: Duration) -> bool {
    node.last_command
        .is_none_or(|last| now.saturating_duration_since(last) >= min_interval)
}

fn admit(node: &mut VentNode, position: u8, now: Instant, min_interval: Duration) -> Admission {
    if node.link_state() == LinkState::Connected
        && node.pending.is_empty()
        && spacing_elapsed(node, now, min_interval)
    {
        if let Some(link) = node.link().cloned() {
            node.last_command = Some(now);
            return Admission::SendNow(link);
        }
    }
    Admission::Queued {
        dropped: node.pending.push(position),
    }
}

fn take_due(node: &mut VentNode, now: Instant, min_interval: Duration) -> Option<(SharedLink, u8)> {
    if node.link_state() != LinkState::Connected || !spacing_elapsed(node, now, min_interval) {
        return None;
    }
    let link = node.link().cloned()?;
    let position = node.pending.pop()?;
    node.last_command = Some(now);
    Some((link, position))
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Rate-limited writer of vent positions
pub struct CommandDispatcher {
    registry: Arc<VentRegistry>,
    links: LinkRuntimeHandle,
    min_interval: Duration,
    write_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<VentRegistry>,
        links: LinkRuntimeHandle,
        min_interval: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            links,
            min_interval,
            write_timeout,
        }
    }

    /// Send `position` now if allowed, otherwise queue it
    pub async fn submit(&self, vent_id: VentId, position: u8) -> Result<Dispatch> {
        self.submit_at(vent_id, position, Instant::now()).await
    }

    pub async fn submit_at(&self, vent_id: VentId, position: u8, now: Instant) -> Result<Dispatch> {
        let admission = self
            .registry
            .with_node(vent_id, |node| admit(node, position, now, self.min_interval))?;

        match admission {
            Admission::SendNow(link) => {
                self.write(vent_id, &link, position).await?;
                Ok(Dispatch::Sent)
            }
            Admission::Queued { dropped } => {
                if let Some(old) = dropped {
                    tracing::warn!(vent_id = %vent_id, dropped = old, "Command queue full, dropped oldest");
                }
                tracing::debug!(vent_id = %vent_id, position, "Command queued");
                Ok(Dispatch::Queued { dropped })
            }
        }
    }

    /// Send the head of every eligible queue; returns how many were written
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> usize {
        let due = self.registry.sweep(|node| {
            take_due(node, now, self.min_interval).map(|(link, position)| (node.id(), link, position))
        });

        let results = join_all(
            due.iter()
                .map(|(vent_id, link, position)| self.write(*vent_id, link, *position)),
        )
        .await;

        let mut sent = 0;
        for (result, (vent_id, _, position)) in results.into_iter().zip(due) {
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(vent_id = %vent_id, position, error = %e, "Dropping queued command");
                }
            }
        }
        sent
    }

    async fn write(&self, vent_id: VentId, link: &SharedLink, position: u8) -> Result<()> {
        if !link.is_connected() {
            return Err(GatewayError::LinkUnavailable(vent_id));
        }

        let data = HubCommand::Position(position).encode();
        match self.links.write(link, data, self.write_timeout).await {
            Ok(()) => {
                tracing::debug!(vent_id = %vent_id, position, "Position written");
                Ok(())
            }
            Err(LinkError::NotConnected) => Err(GatewayError::LinkUnavailable(vent_id)),
            Err(e) => Err(e.into()),
        }
    }
}
