// Online presence: which users hold at least one live realtime connection.

use murmur_common::protocol::events::ServerEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// Live connections per user.
///
/// Key: user_id
/// Value: connection_id -> outbound channel of that connection.
///
/// A user is online while the inner map is non-empty, so a second tab does
/// not make the user appear twice and closing one tab does not take the user
/// offline.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    users: Arc<RwLock<HashMap<Uuid, HashMap<Uuid, Outbound>>>>,
}

impl PresenceRegistry {
    /// Record a live connection. Returns `true` when this is the user's first
    /// connection, i.e. the user just came online.
    pub async fn register(&self, user_id: Uuid, connection_id: Uuid, outbound: Outbound) -> bool {
        let mut guard = self.users.write().await;
        let connections = guard.entry(user_id).or_default();
        let was_offline = connections.is_empty();
        connections.insert(connection_id, outbound);
        was_offline
    }

    /// Drop a connection. Returns `true` when it was the user's last one.
    /// Unknown connections are a no-op.
    pub async fn unregister(&self, user_id: Uuid, connection_id: Uuid) -> bool {
        let mut guard = self.users.write().await;
        let Some(connections) = guard.get_mut(&user_id) else {
            return false;
        };
        if connections.remove(&connection_id).is_none() {
            return false;
        }
        if connections.is_empty() {
            guard.remove(&user_id);
            return true;
        }
        false
    }

    /// Outbound channels of every live connection the user holds.
    pub async fn lookup(&self, user_id: Uuid) -> Vec<Outbound> {
        self.users
            .read()
            .await
            .get(&user_id)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.users.read().await.contains_key(&user_id)
    }

    /// Online user ids, sorted for stable output.
    pub async fn list_online(&self) -> Vec<Uuid> {
        let mut online: Vec<Uuid> = self.users.read().await.keys().copied().collect();
        online.sort();
        online
    }

    pub async fn online_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Send to every live connection of every user.
    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let recipients: Vec<Outbound> = {
            let guard = self.users.read().await;
            guard.values().flat_map(|connections| connections.values().cloned()).collect()
        };

        recipients.into_iter().filter(|recipient| recipient.send(event.clone()).is_ok()).count()
    }

    /// Send to every live connection of one user. Returns how many
    /// connections accepted the event; zero when the user is offline.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) -> usize {
        self.lookup(user_id)
            .await
            .into_iter()
            .filter(|recipient| recipient.send(event.clone()).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Outbound, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn first_and_last_connection_flip_online_state() {
        let registry = PresenceRegistry::default();
        let user = Uuid::new_v4();
        let (first_tx, _first_rx) = channel();
        let (second_tx, _second_rx) = channel();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(registry.register(user, first, first_tx).await);
        assert!(!registry.register(user, second, second_tx).await);
        assert!(registry.is_online(user).await);
        assert_eq!(registry.list_online().await, vec![user]);

        assert!(!registry.unregister(user, first).await);
        assert!(registry.is_online(user).await);
        assert!(registry.unregister(user, second).await);
        assert!(!registry.is_online(user).await);
        assert!(registry.list_online().await.is_empty());
    }

    #[tokio::test]
    async fn unregister_unknown_connection_is_noop() {
        let registry = PresenceRegistry::default();
        let user = Uuid::new_v4();
        let (tx, _rx) = channel();
        let connection = Uuid::new_v4();
        registry.register(user, connection, tx).await;

        assert!(!registry.unregister(user, Uuid::new_v4()).await);
        assert!(!registry.unregister(Uuid::new_v4(), connection).await);
        assert!(registry.is_online(user).await);
    }

    #[tokio::test]
    async fn send_to_user_reaches_every_connection() {
        let registry = PresenceRegistry::default();
        let user = Uuid::new_v4();
        let (first_tx, mut first_rx) = channel();
        let (second_tx, mut second_rx) = channel();
        registry.register(user, Uuid::new_v4(), first_tx).await;
        registry.register(user, Uuid::new_v4(), second_tx).await;

        let event = ServerEvent::UserOnline { user_id: Uuid::new_v4() };
        assert_eq!(registry.send_to_user(user, event.clone()).await, 2);
        assert_eq!(first_rx.recv().await, Some(event.clone()));
        assert_eq!(second_rx.recv().await, Some(event));

        let offline = ServerEvent::UserOffline { user_id: user };
        assert_eq!(registry.send_to_user(Uuid::new_v4(), offline).await, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_closed_channels() {
        let registry = PresenceRegistry::default();
        let (open_tx, mut open_rx) = channel();
        let (closed_tx, closed_rx) = channel();
        drop(closed_rx);
        registry.register(Uuid::new_v4(), Uuid::new_v4(), open_tx).await;
        registry.register(Uuid::new_v4(), Uuid::new_v4(), closed_tx).await;

        let event = ServerEvent::OnlineUsers(registry.list_online().await);
        assert_eq!(registry.broadcast(event.clone()).await, 1);
        assert_eq!(open_rx.recv().await, Some(event));
        assert_eq!(registry.online_count().await, 2);
    }
}
