use super::rooms::RoomRegistry;
use crate::error::ChatError;
use crate::metrics;
use crate::presence::{Outbound, PresenceRegistry};
use crate::store::ChatStore;
use murmur_common::protocol::events::{ClientEvent, ServerEvent};
use murmur_common::types::normalize_content;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Shared state every realtime connection works against.
#[derive(Clone)]
pub(crate) struct RealtimeHub {
    pub(crate) store: ChatStore,
    pub(crate) presence: PresenceRegistry,
    pub(crate) rooms: RoomRegistry,
}

impl RealtimeHub {
    pub(crate) fn new(store: ChatStore) -> Self {
        Self { store, presence: PresenceRegistry::default(), rooms: RoomRegistry::default() }
    }
}

/// One authenticated connection.
///
/// A session only exists once the handshake has been authenticated, and
/// [`RealtimeSession::disconnect`] consumes it, so no event can be handled
/// before authentication or after the connection closed.
pub(crate) struct RealtimeSession {
    user_id: Uuid,
    connection_id: Uuid,
    outbound: Outbound,
    hub: RealtimeHub,
}

impl RealtimeSession {
    /// Register presence, announce the user if this is their first
    /// connection, then hand the new connection the online snapshot.
    pub(crate) async fn connect(hub: RealtimeHub, user_id: Uuid, outbound: Outbound) -> Self {
        let connection_id = Uuid::new_v4();
        let came_online = hub.presence.register(user_id, connection_id, outbound.clone()).await;
        if came_online {
            hub.presence.broadcast(ServerEvent::UserOnline { user_id }).await;
        }
        let _ = outbound.send(ServerEvent::OnlineUsers(hub.presence.list_online().await));
        metrics::increment_ws_connections();
        metrics::set_online_users(hub.presence.online_count().await);

        info!(user_id = %user_id, connection_id = %connection_id, came_online, "realtime session connected");
        Self { user_id, connection_id, outbound, hub }
    }

    pub(crate) fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub(crate) fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub(crate) async fn handle(&self, event: ClientEvent) -> Result<(), ChatError> {
        let result = match event {
            ClientEvent::JoinConversation(conversation_id) => {
                self.join_conversation(conversation_id).await
            }
            ClientEvent::LeaveConversation(conversation_id) => {
                self.leave_conversation(conversation_id).await;
                Ok(())
            }
            ClientEvent::SendMessage { conversation_id, content, receiver_id } => {
                self.send_message(conversation_id, &content, receiver_id).await
            }
            ClientEvent::Typing { conversation_id, is_typing } => {
                self.typing(conversation_id, is_typing).await;
                Ok(())
            }
            ClientEvent::MarkRead { conversation_id, sender_id } => {
                self.mark_read(conversation_id, sender_id).await
            }
        };

        if let Err(ChatError::Persistence(cause)) = &result {
            error!(
                user_id = %self.user_id,
                connection_id = %self.connection_id,
                error = ?cause,
                "realtime event failed in the chat store"
            );
        }
        result
    }

    async fn join_conversation(&self, conversation_id: Uuid) -> Result<(), ChatError> {
        self.hub.store.conversation_for_participant(conversation_id, self.user_id).await?;
        let joined =
            self.hub.rooms.join(conversation_id, self.connection_id, self.outbound.clone()).await;
        debug!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            conversation_id = %conversation_id,
            joined,
            "joined conversation room"
        );
        Ok(())
    }

    async fn leave_conversation(&self, conversation_id: Uuid) {
        let left = self.hub.rooms.leave(conversation_id, self.connection_id).await;
        debug!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            conversation_id = %conversation_id,
            left,
            "left conversation room"
        );
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        raw_content: &str,
        receiver_id: Uuid,
    ) -> Result<(), ChatError> {
        let content = normalize_content(raw_content)?;
        let message = self
            .hub
            .store
            .record_message(conversation_id, self.user_id, receiver_id, content)
            .await?;

        let room_recipients =
            self.hub.rooms.broadcast(conversation_id, ServerEvent::NewMessage(message.clone())).await;
        let notified = self
            .hub
            .presence
            .send_to_user(receiver_id, ServerEvent::MessageNotification { conversation_id, message })
            .await;

        debug!(
            user_id = %self.user_id,
            conversation_id = %conversation_id,
            room_recipients,
            notified,
            "message delivered"
        );
        Ok(())
    }

    /// Best effort: a connection outside the room has nobody to tell.
    async fn typing(&self, conversation_id: Uuid, is_typing: bool) {
        if !self.hub.rooms.is_member(conversation_id, self.connection_id).await {
            debug!(
                connection_id = %self.connection_id,
                conversation_id = %conversation_id,
                "typing event outside joined room dropped"
            );
            return;
        }

        self.hub
            .rooms
            .broadcast_excluding(
                conversation_id,
                ServerEvent::UserTyping { user_id: self.user_id, is_typing },
                self.connection_id,
            )
            .await;
    }

    async fn mark_read(&self, conversation_id: Uuid, sender_id: Uuid) -> Result<(), ChatError> {
        let conversation =
            self.hub.store.conversation_for_participant(conversation_id, self.user_id).await?;
        if conversation.other_participant(self.user_id) != Some(sender_id) {
            return Err(ChatError::validation("sender is not the other participant"));
        }

        let updated = self.hub.store.mark_read(self.user_id, sender_id).await?;
        self.hub
            .presence
            .send_to_user(sender_id, ServerEvent::MessagesRead { conversation_id, read_by: self.user_id })
            .await;

        debug!(
            user_id = %self.user_id,
            conversation_id = %conversation_id,
            updated,
            "messages marked read"
        );
        Ok(())
    }

    /// Leave every room, drop presence and announce the user offline when
    /// this was their last connection.
    pub(crate) async fn disconnect(self) {
        let rooms = self.hub.rooms.leave_all(self.connection_id).await;
        let went_offline = self.hub.presence.unregister(self.user_id, self.connection_id).await;
        if went_offline {
            self.hub.presence.broadcast(ServerEvent::UserOffline { user_id: self.user_id }).await;
        }
        metrics::set_online_users(self.hub.presence.online_count().await);

        info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            rooms_left = rooms.len(),
            went_offline,
            "realtime session disconnected"
        );
    }
}

/// Conversation an inbound event refers to, echoed on its error event.
pub(crate) fn conversation_of(event: &ClientEvent) -> Uuid {
    match event {
        ClientEvent::JoinConversation(conversation_id)
        | ClientEvent::LeaveConversation(conversation_id)
        | ClientEvent::SendMessage { conversation_id, .. }
        | ClientEvent::Typing { conversation_id, .. }
        | ClientEvent::MarkRead { conversation_id, .. } => *conversation_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn connected(
        hub: &RealtimeHub,
        user_id: Uuid,
    ) -> (RealtimeSession, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RealtimeSession::connect(hub.clone(), user_id, tx).await, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn connect_announces_then_sends_snapshot() {
        let hub = RealtimeHub::new(ChatStore::for_tests());
        let alice = Uuid::new_v4();
        let (_session, mut rx) = connected(&hub, alice).await;

        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::UserOnline { user_id: alice }, ServerEvent::OnlineUsers(vec![alice])]
        );
    }

    #[tokio::test]
    async fn second_tab_does_not_reannounce_and_first_close_keeps_user_online() {
        let hub = RealtimeHub::new(ChatStore::for_tests());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_bob_session, mut bob_rx) = connected(&hub, bob).await;
        let (first_tab, _first_rx) = connected(&hub, alice).await;
        let (second_tab, mut second_rx) = connected(&hub, alice).await;

        drain(&mut bob_rx);
        let second_tab_events = drain(&mut second_rx);
        assert!(!second_tab_events.contains(&ServerEvent::UserOnline { user_id: alice }));

        first_tab.disconnect().await;
        assert!(drain(&mut bob_rx).is_empty());
        assert!(hub.presence.is_online(alice).await);

        second_tab.disconnect().await;
        assert_eq!(drain(&mut bob_rx), vec![ServerEvent::UserOffline { user_id: alice }]);
        assert!(!hub.presence.is_online(alice).await);
    }

    #[tokio::test]
    async fn join_requires_participation() {
        let store = ChatStore::for_tests();
        let alice = store.add_user_for_tests("alice").await;
        let bob = store.add_user_for_tests("bob").await;
        let mallory = store.add_user_for_tests("mallory").await;
        let conversation = store.get_or_create_conversation(alice, bob).await.unwrap();
        let hub = RealtimeHub::new(store);

        let (intruder, _rx) = connected(&hub, mallory).await;
        let error = intruder
            .handle(ClientEvent::JoinConversation(conversation.id))
            .await
            .unwrap_err();
        assert!(matches!(error, ChatError::Authorization(_)));
        assert!(!hub.rooms.is_member(conversation.id, intruder.connection_id()).await);

        let error = intruder.handle(ClientEvent::JoinConversation(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(error, ChatError::NotFound(_)));

        let (member, _rx) = connected(&hub, alice).await;
        member.handle(ClientEvent::JoinConversation(conversation.id)).await.unwrap();
        assert!(hub.rooms.is_member(conversation.id, member.connection_id()).await);

        member.disconnect().await;
        assert_eq!(hub.rooms.member_count(conversation.id).await, 0);
    }

    #[tokio::test]
    async fn typing_reaches_other_room_members_only() {
        let store = ChatStore::for_tests();
        let alice = store.add_user_for_tests("alice").await;
        let bob = store.add_user_for_tests("bob").await;
        let conversation = store.get_or_create_conversation(alice, bob).await.unwrap();
        let hub = RealtimeHub::new(store);

        let (alice_session, mut alice_rx) = connected(&hub, alice).await;
        let (bob_session, mut bob_rx) = connected(&hub, bob).await;
        alice_session.handle(ClientEvent::JoinConversation(conversation.id)).await.unwrap();
        bob_session.handle(ClientEvent::JoinConversation(conversation.id)).await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        alice_session
            .handle(ClientEvent::Typing { conversation_id: conversation.id, is_typing: true })
            .await
            .unwrap();

        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEvent::UserTyping { user_id: alice, is_typing: true }]
        );
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn send_message_rejects_blank_content_without_persisting() {
        let store = ChatStore::for_tests();
        let alice = store.add_user_for_tests("alice").await;
        let bob = store.add_user_for_tests("bob").await;
        let conversation = store.get_or_create_conversation(alice, bob).await.unwrap();
        let hub = RealtimeHub::new(store.clone());
        let (session, _rx) = connected(&hub, alice).await;

        let error = session
            .handle(ClientEvent::SendMessage {
                conversation_id: conversation.id,
                content: "   ".to_string(),
                receiver_id: bob,
            })
            .await
            .unwrap_err();

        assert!(matches!(error, ChatError::Validation(_)));
        assert_eq!(store.unread_count(bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_read_rejects_foreign_sender() {
        let store = ChatStore::for_tests();
        let alice = store.add_user_for_tests("alice").await;
        let bob = store.add_user_for_tests("bob").await;
        let conversation = store.get_or_create_conversation(alice, bob).await.unwrap();
        let hub = RealtimeHub::new(store);
        let (session, _rx) = connected(&hub, alice).await;

        let error = session
            .handle(ClientEvent::MarkRead { conversation_id: conversation.id, sender_id: alice })
            .await
            .unwrap_err();
        assert!(matches!(error, ChatError::Validation(_)));
    }

    #[test]
    fn error_events_name_the_conversation() {
        let id = Uuid::new_v4();
        assert_eq!(conversation_of(&ClientEvent::LeaveConversation(id)), id);
        assert_eq!(
            conversation_of(&ClientEvent::Typing { conversation_id: id, is_typing: false }),
            id
        );
    }
}
