//! Open pages ("clients") attached to the cache worker, and the broadcast
//! that reaches them.

use crate::clock::Clock;
use crate::model::{BroadcastKind, ClientMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument};
use uuid::Uuid;

struct ClientSlot {
    controlled: bool,
    tx: mpsc::UnboundedSender<ClientMessage>,
}

/// Receiving side held by an open page.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: Uuid,
    pub rx: mpsc::UnboundedReceiver<ClientMessage>,
}

pub struct ClientRegistry {
    clients: Mutex<HashMap<Uuid, ClientSlot>>,
    // Set once the worker has claimed its clients; later pages start controlled.
    claimed: Mutex<bool>,
    clock: Arc<dyn Clock>,
}

impl ClientRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            claimed: Mutex::new(false),
            clock,
        }
    }

    /// Attach a newly opened page.
    pub async fn connect(&self) -> ClientHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let controlled = *self.claimed.lock().await;
        self.clients
            .lock()
            .await
            .insert(id, ClientSlot { controlled, tx });
        debug!(%id, controlled, "client connected");
        ClientHandle { id, rx }
    }

    pub async fn disconnect(&self, id: Uuid) {
        self.clients.lock().await.remove(&id);
    }

    /// Take control of every open page.
    pub async fn claim(&self) -> usize {
        *self.claimed.lock().await = true;
        let mut guard = self.clients.lock().await;
        for slot in guard.values_mut() {
            slot.controlled = true;
        }
        guard.len()
    }

    /// Post `message` to every controlled page. Closed pages are pruned.
    /// Returns how many pages the message was handed to.
    #[instrument(skip_all, fields(kind = message.kind.as_str()))]
    pub async fn post_all(&self, message: ClientMessage) -> usize {
        let mut guard = self.clients.lock().await;
        guard.retain(|_, slot| !slot.tx.is_closed());
        let mut delivered = 0;
        for slot in guard.values().filter(|s| s.controlled) {
            if slot.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(delivered, "broadcast posted");
        delivered
    }

    pub async fn broadcast(&self, kind: BroadcastKind, message: impl Into<String>) -> usize {
        let action = match kind {
            BroadcastKind::UpdateDetected => "refresh",
            BroadcastKind::NewVersionAvailable => "reload",
        };
        self.post_all(ClientMessage {
            kind,
            message: message.into(),
            timestamp: self.clock.now().timestamp_millis(),
            action: action.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{TimeZone, Utc};

    fn registry() -> ClientRegistry {
        let at = Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, 0).unwrap();
        ClientRegistry::new(Arc::new(FixedClock::new(at)))
    }

    #[tokio::test]
    async fn only_controlled_clients_receive() {
        let reg = registry();
        let mut early = reg.connect().await;
        assert_eq!(reg.broadcast(BroadcastKind::UpdateDetected, "x").await, 0);

        assert_eq!(reg.claim().await, 1);
        let mut late = reg.connect().await;
        assert_eq!(reg.broadcast(BroadcastKind::UpdateDetected, "y").await, 2);

        let msg = early.rx.recv().await.unwrap();
        assert_eq!(msg.message, "y");
        assert_eq!(msg.action, "refresh");
        assert_eq!(msg.timestamp, 1_770_890_400_000);
        assert_eq!(late.rx.recv().await.unwrap().kind, BroadcastKind::UpdateDetected);
    }

    #[tokio::test]
    async fn closed_clients_are_pruned() {
        let reg = registry();
        reg.claim().await;
        let gone = reg.connect().await;
        let _kept = reg.connect().await;
        drop(gone);
        assert_eq!(reg.broadcast(BroadcastKind::NewVersionAvailable, "v2").await, 1);
        assert_eq!(reg.clients.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn client_opened_after_broadcast_misses_it() {
        let reg = registry();
        reg.claim().await;
        reg.broadcast(BroadcastKind::UpdateDetected, "early").await;
        let mut late = reg.connect().await;
        assert!(late.rx.try_recv().is_err());
    }
}
