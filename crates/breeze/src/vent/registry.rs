//! Vent Registry
//!
//! One mutex guards every node and the id counter, so assigning an id and
//! inserting its node happen atomically. Callers get closures run under the
//! lock instead of references, and must not block or await inside them.

use std::collections::BTreeMap;

use breeze_protocol::VentId;
use parking_lot::Mutex;

use super::{NodeDefaults, VentNode, VentStatus};
use crate::error::{GatewayError, Result};

struct Inner {
    next_id: u32,
    nodes: BTreeMap<VentId, VentNode>,
}

/// Concurrency-safe collection of vents keyed by id
pub struct VentRegistry {
    inner: Mutex<Inner>,
    defaults: NodeDefaults,
}

impl VentRegistry {
    pub fn new(defaults: NodeDefaults) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                nodes: BTreeMap::new(),
            }),
            defaults,
        }
    }

    /// Create a node with the next id and run `init` on it before anyone else
    /// can see it
    pub fn create_with<R>(&self, init: impl FnOnce(&mut VentNode) -> R) -> (VentId, R) {
        let mut inner = self.inner.lock();
        let id = VentId(inner.next_id);
        inner.next_id += 1;

        let mut node = VentNode::new(id, &self.defaults);
        let result = init(&mut node);
        inner.nodes.insert(id, node);

        tracing::debug!(vent_id = %id, "Vent registered");
        (id, result)
    }

    pub fn create(&self) -> VentId {
        self.create_with(|_| ()).0
    }

    /// Run `f` on one node under the lock
    pub fn with_node<R>(&self, id: VentId, f: impl FnOnce(&mut VentNode) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or(GatewayError::UnknownVent(id))?;
        Ok(f(node))
    }

    /// Run `f` on every node in id order, collecting the `Some` results
    pub fn sweep<R>(&self, mut f: impl FnMut(&mut VentNode) -> Option<R>) -> Vec<R> {
        let mut inner = self.inner.lock();
        inner.nodes.values_mut().filter_map(|node| f(node)).collect()
    }

    /// Remove a node; its id is never handed out again
    pub fn remove(&self, id: VentId) -> Option<VentNode> {
        self.inner.lock().nodes.remove(&id)
    }

    pub fn contains(&self, id: VentId) -> bool {
        self.inner.lock().nodes.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<VentId> {
        self.inner.lock().nodes.keys().copied().collect()
    }

    pub fn status(&self, id: VentId) -> Result<VentStatus> {
        self.with_node(id, |node| node.status())
    }

    pub fn statuses(&self) -> Vec<VentStatus> {
        self.sweep(|node| Some(node.status()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VentRegistry {
    fn default() -> Self {
        Self::new(NodeDefaults::default())
    }
}
