// Realtime chat events carried over the WebSocket transport.
//
// Every frame is a JSON object `{"event": "<name>", "data": <payload>}`.
// Payload keys are camelCase so browser clients can use them unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::PopulatedMessage;

/// Client -> Server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Subscribe this connection to a conversation's room.
    JoinConversation(Uuid),

    /// Unsubscribe this connection from a conversation's room.
    LeaveConversation(Uuid),

    SendMessage { conversation_id: Uuid, content: String, receiver_id: Uuid },

    /// Ephemeral typing indicator; never persisted.
    Typing { conversation_id: Uuid, is_typing: bool },

    /// Mark every unread message from `sender_id` to the caller as read.
    MarkRead { conversation_id: Uuid, sender_id: Uuid },
}

impl ClientEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinConversation(_) => "join_conversation",
            Self::LeaveConversation(_) => "leave_conversation",
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
            Self::MarkRead { .. } => "mark_read",
        }
    }
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Unicast on connect: every user currently online.
    OnlineUsers(Vec<Uuid>),

    /// Broadcast when a user goes from zero to one live connection.
    UserOnline { user_id: Uuid },

    /// Broadcast when a user's last live connection closes.
    UserOffline { user_id: Uuid },

    /// Room-scoped: a message was sent in the conversation.
    NewMessage(PopulatedMessage),

    /// Unicast to the receiver, whether or not they joined the room.
    MessageNotification { conversation_id: Uuid, message: PopulatedMessage },

    /// Room-scoped, sender excluded.
    UserTyping { user_id: Uuid, is_typing: bool },

    /// Unicast to the original sender once the receiver read their messages.
    MessagesRead { conversation_id: Uuid, read_by: Uuid },

    /// Unicast to the originator of a failed action.
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
    },
}

impl ServerEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OnlineUsers(_) => "online_users",
            Self::UserOnline { .. } => "user_online",
            Self::UserOffline { .. } => "user_offline",
            Self::NewMessage(_) => "new_message",
            Self::MessageNotification { .. } => "message_notification",
            Self::UserTyping { .. } => "user_typing",
            Self::MessagesRead { .. } => "messages_read",
            Self::Error { .. } => "error",
        }
    }
}

pub fn decode_client_event(raw: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
