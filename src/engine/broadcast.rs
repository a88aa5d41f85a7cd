// Push channel registry for connected canvas clients

//! # Broadcast Registry
//!
//! Keeps one bounded outbound channel per connected client and indexes clients by canvas and
//! by user. The transport layer (WebSocket, SSE, tests) owns the receiving half returned by
//! [`BroadcastRegistry::register_client`] and forwards whatever arrives.
//!
//! ## Delivery
//!
//! `broadcast` pushes with `try_send` and never waits. A client whose buffer is full or whose
//! receiver is gone is evicted on the spot, so one slow reader cannot stall a canvas. A
//! message is pushed to every client of a canvas before `broadcast` returns, which means two
//! broadcasts issued one after the other arrive in that order at every client.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::clock::{Clock, SystemClock};
use crate::models::PushMessage;

/// Identity of one push connection
pub type ClientId = Uuid;

/// What the registry knows about a connected client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub canvas_id: String,
    pub user_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Handle returned to the transport when a client connects
#[derive(Debug)]
pub struct ClientRegistration {
    pub info: ClientInfo,
    pub receiver: mpsc::Receiver<PushMessage>,
}

/// Result of a broadcast
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub evicted: Vec<ClientId>,
}

struct ClientEntry {
    info: ClientInfo,
    /// Registration order, ties on `connected_at` are broken by it
    seq: u64,
    sender: mpsc::Sender<PushMessage>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, ClientEntry>,
    by_canvas: HashMap<String, HashSet<ClientId>>,
    by_user: HashMap<String, HashSet<ClientId>>,
    next_seq: u64,
}

impl Registry {
    fn remove(&mut self, client_id: &ClientId) -> Option<ClientInfo> {
        let entry = self.clients.remove(client_id)?;
        if let Some(ids) = self.by_canvas.get_mut(&entry.info.canvas_id) {
            ids.remove(client_id);
            if ids.is_empty() {
                self.by_canvas.remove(&entry.info.canvas_id);
            }
        }
        if let Some(ids) = self.by_user.get_mut(&entry.info.user_id) {
            ids.remove(client_id);
            if ids.is_empty() {
                self.by_user.remove(&entry.info.user_id);
            }
        }
        Some(entry.info)
    }
}

/// Registry of push channels, indexed by canvas and user
pub struct BroadcastRegistry {
    inner: RwLock<Registry>,
    buffer_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl BroadcastRegistry {
    pub fn new(buffer_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
            buffer_capacity: buffer_capacity.max(1),
            clock,
        }
    }

    /// Register a client on a canvas and hand back its receiving half
    pub fn register_client(&self, canvas_id: &str, user_id: &str, session_id: &str) -> ClientRegistration {
        let (sender, receiver) = mpsc::channel(self.buffer_capacity);
        let info = ClientInfo {
            client_id: Uuid::new_v4(),
            canvas_id: canvas_id.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            connected_at: self.clock.now(),
        };

        let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry
            .by_canvas
            .entry(canvas_id.to_string())
            .or_default()
            .insert(info.client_id);
        registry
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(info.client_id);
        registry.clients.insert(
            info.client_id,
            ClientEntry {
                info: info.clone(),
                seq,
                sender,
            },
        );
        info!(canvas_id, user_id, session_id, client_id = %info.client_id, "client connected");

        ClientRegistration { info, receiver }
    }

    /// Remove a client from every index
    pub fn unregister_client(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id);
        if let Some(info) = &removed {
            info!(canvas_id = %info.canvas_id, user_id = %info.user_id, client_id = %client_id, "client disconnected");
        }
        removed
    }

    /// Push a message to every client of a canvas
    pub fn broadcast(&self, canvas_id: &str, message: &PushMessage) -> DeliveryReport {
        let targets: Vec<ClientId> = {
            let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .by_canvas
                .get(canvas_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };
        let report = self.deliver(&targets, message);
        debug!(canvas_id, event_type = %message.event_type, delivered = report.delivered, "broadcast");
        report
    }

    /// Push a message to every client of a user, across canvases
    pub fn send_to_user(&self, user_id: &str, message: &PushMessage) -> DeliveryReport {
        let targets: Vec<ClientId> = {
            let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .by_user
                .get(user_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };
        self.deliver(&targets, message)
    }

    fn deliver(&self, targets: &[ClientId], message: &PushMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        {
            let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            for client_id in targets {
                let Some(entry) = registry.clients.get(client_id) else {
                    continue;
                };
                match entry.sender.try_send(message.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(client_id = %client_id, "client buffer full, disconnecting");
                        report.evicted.push(*client_id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(client_id = %client_id, "client receiver closed");
                        report.evicted.push(*client_id);
                    }
                }
            }
        }

        if !report.evicted.is_empty() {
            let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            for client_id in &report.evicted {
                registry.remove(client_id);
            }
        }
        report
    }

    /// Clients connected to a canvas
    pub fn canvas_clients(&self, canvas_id: &str) -> Vec<ClientInfo> {
        let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<&ClientEntry> = registry
            .by_canvas
            .get(canvas_id)
            .into_iter()
            .flatten()
            .filter_map(|id| registry.clients.get(id))
            .collect();
        entries.sort_by_key(|e| (e.info.connected_at, e.seq));
        entries.into_iter().map(|e| e.info.clone()).collect()
    }

    pub fn has_clients(&self, canvas_id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_canvas
            .contains_key(canvas_id)
    }

    /// Clients belonging to a user
    pub fn user_clients(&self, user_id: &str) -> Vec<ClientInfo> {
        let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| registry.clients.get(id).map(|e| e.info.clone()))
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clients.len()
    }

    /// Drop every channel; receivers observe end-of-stream
    pub fn close_all(&self) -> usize {
        let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let count = registry.clients.len();
        *registry = Registry::default();
        info!(count, "closed all client channels");
        count
    }
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new(256, Arc::new(SystemClock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use chrono::Duration;
    use serde_json::json;

    fn registry(buffer_capacity: usize) -> BroadcastRegistry {
        BroadcastRegistry::new(buffer_capacity, Arc::new(ManualClock::starting_now()))
    }

    fn message(event_type: &str) -> PushMessage {
        PushMessage::new("updated", event_type, json!({}))
    }

    #[test]
    fn test_broadcast_reaches_canvas_clients_only() {
        let registry = registry(8);
        let mut a = registry.register_client("canvas1", "alice", "A");
        let mut b = registry.register_client("canvas1", "bob", "B");
        let mut c = registry.register_client("canvas2", "carol", "C");

        let report = registry.broadcast("canvas1", &message("selection"));
        assert_eq!(report.delivered, 2);
        assert!(report.evicted.is_empty());

        assert_eq!(a.receiver.try_recv().unwrap().event_type, "selection");
        assert_eq!(b.receiver.try_recv().unwrap().event_type, "selection");
        assert!(c.receiver.try_recv().is_err());
    }

    #[test]
    fn test_messages_arrive_in_broadcast_order() {
        let registry = registry(8);
        let mut a = registry.register_client("canvas1", "alice", "A");

        registry.broadcast("canvas1", &message("first"));
        registry.broadcast("canvas1", &message("second"));

        assert_eq!(a.receiver.try_recv().unwrap().event_type, "first");
        assert_eq!(a.receiver.try_recv().unwrap().event_type, "second");
    }

    #[test]
    fn test_overflow_and_closed_receivers_are_evicted() {
        let registry = registry(1);
        let _slow = registry.register_client("canvas1", "alice", "A");
        let gone = registry.register_client("canvas1", "bob", "B");
        let gone_id = gone.info.client_id;
        drop(gone.receiver);

        assert_eq!(registry.broadcast("canvas1", &message("one")).delivered, 1);
        let report = registry.broadcast("canvas1", &message("two"));
        assert_eq!(report.delivered, 0);
        assert_eq!(report.evicted.len(), 1);
        assert_ne!(report.evicted[0], gone_id);

        assert_eq!(registry.client_count(), 0);
        assert!(registry.canvas_clients("canvas1").is_empty());
    }

    #[test]
    fn test_user_index_and_unregister() {
        let registry = registry(4);
        let first = registry.register_client("canvas1", "alice", "A1");
        let mut second = registry.register_client("canvas2", "alice", "A2");

        assert_eq!(registry.user_clients("alice").len(), 2);
        assert_eq!(registry.unregister_client(&first.info.client_id).map(|i| i.session_id), Some("A1".into()));
        assert!(registry.unregister_client(&first.info.client_id).is_none());

        assert_eq!(registry.send_to_user("alice", &message("notice")).delivered, 1);
        assert_eq!(second.receiver.try_recv().unwrap().event_type, "notice");
        assert_eq!(registry.close_all(), 1);
    }

    #[test]
    fn test_connection_times_follow_the_clock() {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = BroadcastRegistry::new(4, clock.clone());
        let start = clock.now();

        let first = registry.register_client("canvas1", "alice", "A");
        let second = registry.register_client("canvas1", "bob", "B");
        clock.advance(Duration::seconds(30));
        let third = registry.register_client("canvas1", "carol", "C");

        assert_eq!(first.info.connected_at, start);
        assert_eq!(third.info.connected_at, start + Duration::seconds(30));
        let order: Vec<String> = registry
            .canvas_clients("canvas1")
            .into_iter()
            .map(|c| c.session_id)
            .collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(registry.has_clients("canvas1"));

        for client in [first, second, third] {
            registry.unregister_client(&client.info.client_id);
        }
        assert!(!registry.has_clients("canvas1"));
    }
}
