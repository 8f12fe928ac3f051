use crate::presence::Outbound;
use murmur_common::protocol::events::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct RoomState {
    /// conversation_id -> connection_id -> outbound
    rooms: HashMap<Uuid, HashMap<Uuid, Outbound>>,
    /// connection_id -> joined conversation ids
    memberships: HashMap<Uuid, HashSet<Uuid>>,
}

/// Connection-scoped conversation rooms used for fan-out addressing.
///
/// Both indexes are updated under one lock so a room never lists a connection
/// whose membership set does not contain the room.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    state: Arc<RwLock<RoomState>>,
}

impl RoomRegistry {
    /// Returns `false` when the connection was already in the room.
    pub async fn join(&self, room_id: Uuid, connection_id: Uuid, outbound: Outbound) -> bool {
        let mut guard = self.state.write().await;
        let newly_joined =
            guard.memberships.entry(connection_id).or_default().insert(room_id);
        guard.rooms.entry(room_id).or_default().insert(connection_id, outbound);
        newly_joined
    }

    /// Returns `false` when the connection was not in the room.
    pub async fn leave(&self, room_id: Uuid, connection_id: Uuid) -> bool {
        let mut guard = self.state.write().await;
        let was_member = match guard.memberships.get_mut(&connection_id) {
            Some(joined) => {
                let removed = joined.remove(&room_id);
                if joined.is_empty() {
                    guard.memberships.remove(&connection_id);
                }
                removed
            }
            None => false,
        };
        remove_from_room(&mut guard.rooms, room_id, connection_id);
        was_member
    }

    /// Remove the connection from every room it joined. Returns the rooms it
    /// left, sorted.
    pub async fn leave_all(&self, connection_id: Uuid) -> Vec<Uuid> {
        let mut guard = self.state.write().await;
        let Some(joined) = guard.memberships.remove(&connection_id) else {
            return Vec::new();
        };

        let mut left: Vec<Uuid> = joined.into_iter().collect();
        left.sort();
        for room_id in &left {
            remove_from_room(&mut guard.rooms, *room_id, connection_id);
        }
        left
    }

    pub async fn is_member(&self, room_id: Uuid, connection_id: Uuid) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(&room_id)
            .is_some_and(|members| members.contains_key(&connection_id))
    }

    pub async fn member_count(&self, room_id: Uuid) -> usize {
        self.state.read().await.rooms.get(&room_id).map_or(0, HashMap::len)
    }

    pub async fn broadcast(&self, room_id: Uuid, event: ServerEvent) -> usize {
        self.fan_out(room_id, event, None).await
    }

    /// Broadcast to every room member except the originating connection.
    pub async fn broadcast_excluding(
        &self,
        room_id: Uuid,
        event: ServerEvent,
        exclude_connection: Uuid,
    ) -> usize {
        self.fan_out(room_id, event, Some(exclude_connection)).await
    }

    async fn fan_out(&self, room_id: Uuid, event: ServerEvent, exclude: Option<Uuid>) -> usize {
        let recipients: Vec<Outbound> = {
            let guard = self.state.read().await;
            guard
                .rooms
                .get(&room_id)
                .map(|members| {
                    members
                        .iter()
                        .filter(|(connection_id, _)| Some(**connection_id) != exclude)
                        .map(|(_, outbound)| outbound.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        recipients.into_iter().filter(|recipient| recipient.send(event.clone()).is_ok()).count()
    }
}

fn remove_from_room(
    rooms: &mut HashMap<Uuid, HashMap<Uuid, Outbound>>,
    room_id: Uuid,
    connection_id: Uuid,
) {
    if let Some(members) = rooms.get_mut(&room_id) {
        members.remove(&connection_id);
        if members.is_empty() {
            rooms.remove(&room_id);
        }
    }
}
