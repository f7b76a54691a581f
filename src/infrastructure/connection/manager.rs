//! Connection Manager Module
//!
//! Keeps every live arm connection and decides which one receives manual
//! control. The registry is published through a watch channel and every
//! mutation swaps in a fresh copy, so readers always hold a complete
//! snapshot.

use super::DeviceConnection;
use crate::domain::models::{ConnectionState, ConnectionType, DeviceInfo};
use crate::domain::sequencer::CommandSink;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Immutable view of the registered connections.
#[derive(Clone, Default)]
pub struct Registry {
    connections: BTreeMap<String, Arc<dyn DeviceConnection>>,
    active: Option<String>,
}

impl Registry {
    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&Arc<dyn DeviceConnection>> {
        self.active.as_ref().and_then(|id| self.connections.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn DeviceConnection>> {
        self.connections.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DeviceConnection>> {
        self.connections.values()
    }
}

pub struct ConnectionManager {
    registry: watch::Sender<Arc<Registry>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (registry, _) = watch::channel(Arc::new(Registry::default()));
        Self { registry }
    }

    /// Current registry snapshot.
    pub fn snapshot(&self) -> Arc<Registry> {
        self.registry.borrow().clone()
    }

    /// Subscribe to registry and active-device changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Registry>> {
        self.registry.subscribe()
    }

    /// Replace the registry with an edited copy.
    fn update<R: Default>(&self, edit: impl FnOnce(&mut Registry) -> R) -> R {
        let mut result = R::default();
        self.registry.send_modify(|current| {
            let mut next = Registry::clone(current);
            result = edit(&mut next);
            *current = Arc::new(next);
        });
        result
    }

    /// Connect `connection` and register it on success.
    ///
    /// The first registered device becomes active. A connection already
    /// registered under the same id is replaced and disconnected.
    pub async fn add_connection(&self, connection: Arc<dyn DeviceConnection>) -> bool {
        let id = connection.device_info().id.clone();
        info!(device = %id, "Adding connection");

        if !connection.connect().await {
            warn!(device = %id, "Connection failed, not registered");
            return false;
        }

        let replaced = self.update(|registry| {
            let replaced = registry.connections.insert(id.clone(), connection);
            if registry.active.is_none() {
                registry.active = Some(id.clone());
            }
            replaced
        });

        if let Some(old) = replaced {
            debug!(device = %id, "Replacing existing connection");
            old.disconnect().await;
        }

        info!(device = %id, active = ?self.active_device_id(), "Connection registered");
        true
    }

    /// Disconnect and drop the connection with `id`.
    ///
    /// If it was active, the first remaining device becomes active.
    pub async fn remove_connection(&self, id: &str) {
        let removed = self.update(|registry| {
            let removed = registry.connections.remove(id);
            if registry.active.as_deref() == Some(id) {
                registry.active = registry.connections.keys().next().cloned();
            }
            removed
        });

        match removed {
            Some(connection) => {
                connection.disconnect().await;
                info!(device = %id, active = ?self.active_device_id(), "Connection removed");
            }
            None => debug!(device = %id, "Remove ignored, unknown device"),
        }
    }

    /// Route manual control to `id`. Unknown ids are ignored.
    pub fn set_active_device(&self, id: &str) {
        let changed = self.update(|registry| {
            if registry.connections.contains_key(id) {
                registry.active = Some(id.to_string());
                true
            } else {
                false
            }
        });

        if changed {
            info!(device = %id, "Active device changed");
        } else {
            debug!(device = %id, "Active device unchanged, unknown id");
        }
    }

    pub fn active_device_id(&self) -> Option<String> {
        self.registry.borrow().active.clone()
    }

    pub fn active_device(&self) -> Option<Arc<dyn DeviceConnection>> {
        self.registry.borrow().active().cloned()
    }

    /// All registered connections, ordered by id.
    pub fn connections(&self) -> Vec<Arc<dyn DeviceConnection>> {
        self.registry.borrow().iter().cloned().collect()
    }

    pub fn devices_by_type(&self, connection_type: ConnectionType) -> Vec<DeviceInfo> {
        self.registry
            .borrow()
            .iter()
            .filter(|c| c.device_info().connection_type == connection_type)
            .map(|c| c.device_info().clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.registry
            .borrow()
            .iter()
            .filter(|c| c.state() == ConnectionState::Connected)
            .count()
    }

    pub async fn send_to_active(&self, command: &str) -> bool {
        match self.active_device() {
            Some(connection) => connection.send_command(command).await,
            None => {
                debug!("No active device, command dropped");
                false
            }
        }
    }

    /// Send to every connected device. Returns the number of accepted writes.
    pub async fn broadcast(&self, command: &str) -> usize {
        let targets = self.connections();
        Self::send_all(targets, command).await
    }

    /// Like [`broadcast`](Self::broadcast), limited to one transport type.
    pub async fn send_by_type(&self, command: &str, connection_type: ConnectionType) -> usize {
        let targets = self
            .connections()
            .into_iter()
            .filter(|c| c.device_info().connection_type == connection_type)
            .collect();
        Self::send_all(targets, command).await
    }

    async fn send_all(targets: Vec<Arc<dyn DeviceConnection>>, command: &str) -> usize {
        let mut delivered = 0;
        for connection in targets {
            if connection.state() != ConnectionState::Connected {
                continue;
            }
            if connection.send_command(command).await {
                delivered += 1;
            } else {
                warn!(device = %connection.device_info().id, "Send failed");
            }
        }
        delivered
    }

    /// Disconnect everything and clear the registry.
    pub async fn disconnect_all(&self) {
        let previous = self.update(|registry| std::mem::take(registry));
        if previous.is_empty() {
            return;
        }

        info!("Disconnecting {} device(s)", previous.len());
        for connection in previous.iter() {
            connection.disconnect().await;
        }
    }
}

#[async_trait]
impl CommandSink for ConnectionManager {
    async fn send(&self, command: &str) -> bool {
        self.send_to_active(command).await
    }
}
