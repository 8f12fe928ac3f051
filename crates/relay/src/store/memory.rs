use std::collections::HashMap;

use chrono::{DateTime, Utc};
use murmur_common::types::{
    Conversation, ConversationSummary, Message, ParticipantPair, PopulatedMessage, UserSummary,
};
use uuid::Uuid;

use super::PageRequest;
use crate::error::ChatError;

/// In-memory chat store. Messages are kept in insertion order, which is also
/// creation order.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    users: HashMap<Uuid, UserSummary>,
    conversations: HashMap<Uuid, Conversation>,
    by_pair: HashMap<ParticipantPair, Uuid>,
    messages: Vec<Message>,
}

impl MemoryChatStore {
    pub fn insert_user(&mut self, user: UserSummary) {
        self.users.insert(user.id, user);
    }

    pub fn user(&self, user_id: Uuid) -> Option<UserSummary> {
        self.users.get(&user_id).cloned()
    }

    pub fn get_or_create_conversation(
        &mut self,
        user_id: Uuid,
        other_user_id: Uuid,
    ) -> Result<Conversation, ChatError> {
        let pair = ParticipantPair::new(user_id, other_user_id)?;
        if !self.users.contains_key(&other_user_id) {
            return Err(ChatError::NotFound("user not found"));
        }

        if let Some(existing) = self.by_pair.get(&pair).and_then(|id| self.conversations.get(id)) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            participants: pair,
            last_message: None,
            created_at: now,
            updated_at: now,
        };
        self.by_pair.insert(pair, conversation.id);
        self.conversations.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    pub fn conversation(&self, conversation_id: Uuid) -> Option<Conversation> {
        self.conversations.get(&conversation_id).cloned()
    }

    pub fn list_conversations(&self, user_id: Uuid) -> Vec<ConversationSummary> {
        let mut conversations: Vec<&Conversation> =
            self.conversations.values().filter(|conversation| conversation.includes(user_id)).collect();
        conversations.sort_by(|left, right| {
            right.updated_at.cmp(&left.updated_at).then_with(|| right.id.cmp(&left.id))
        });

        conversations
            .into_iter()
            .map(|conversation| {
                let pair = conversation.participants;
                let unread_count = pair
                    .other(user_id)
                    .map(|other| {
                        self.messages
                            .iter()
                            .filter(|m| m.receiver == user_id && m.sender == other && !m.read)
                            .count() as i64
                    })
                    .unwrap_or_default();

                ConversationSummary {
                    id: conversation.id,
                    participants: [pair.low(), pair.high()]
                        .into_iter()
                        .map(|id| self.user_or_placeholder(id))
                        .collect(),
                    last_message: self.last_message_for(conversation),
                    unread_count,
                    updated_at: conversation.updated_at,
                }
            })
            .collect()
    }

    pub fn record_message(
        &mut self,
        conversation_id: Uuid,
        sender: Uuid,
        receiver: Uuid,
        content: String,
    ) -> Result<PopulatedMessage, ChatError> {
        let pair = ParticipantPair::new(sender, receiver)?;
        let Some(conversation) = self.conversations.get(&conversation_id) else {
            return Err(ChatError::NotFound("conversation not found"));
        };
        if conversation.participants != pair {
            return Err(ChatError::Authorization("access denied"));
        }

        let message = Message {
            id: Uuid::new_v4(),
            sender,
            receiver,
            content,
            read: false,
            created_at: self.next_created_at(),
        };
        self.messages.push(message.clone());

        if let Some(conversation) = self.conversations.get_mut(&conversation_id) {
            conversation.last_message = Some(message.id);
            conversation.updated_at = message.created_at;
        }

        Ok(self.populate(&message))
    }

    pub fn populated_message(&self, message_id: Uuid) -> Option<PopulatedMessage> {
        self.messages.iter().find(|m| m.id == message_id).map(|m| self.populate(m))
    }

    pub fn list_messages(
        &self,
        conversation: &Conversation,
        page: PageRequest,
    ) -> Vec<PopulatedMessage> {
        self.messages
            .iter()
            .filter(|m| between(m, conversation.participants))
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .map(|m| self.populate(m))
            .collect()
    }

    pub fn mark_read(&mut self, receiver: Uuid, sender: Uuid) -> u64 {
        let mut updated = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.receiver == receiver && m.sender == sender && !m.read)
        {
            message.read = true;
            updated += 1;
        }
        updated
    }

    pub fn unread_count(&self, user_id: Uuid) -> i64 {
        self.messages.iter().filter(|m| m.receiver == user_id && !m.read).count() as i64
    }

    pub fn delete_message(&mut self, message_id: Uuid, requester: Uuid) -> Result<(), ChatError> {
        let Some(index) = self.messages.iter().position(|m| m.id == message_id) else {
            return Err(ChatError::NotFound("message not found"));
        };
        if self.messages[index].sender != requester {
            return Err(ChatError::Authorization("you can only delete your own messages"));
        }

        let removed = self.messages.remove(index);
        let Ok(pair) = ParticipantPair::new(removed.sender, removed.receiver) else {
            return Ok(());
        };
        let replacement = self.messages.iter().rev().find(|m| between(m, pair)).map(|m| m.id);
        if let Some(conversation) = self
            .by_pair
            .get(&pair)
            .and_then(|id| self.conversations.get_mut(id))
            .filter(|conversation| conversation.last_message == Some(message_id))
        {
            conversation.last_message = replacement;
        }
        Ok(())
    }

    /// Pointer target when it still exists, otherwise the newest message in
    /// the pair's history.
    fn last_message_for(&self, conversation: &Conversation) -> Option<Message> {
        conversation
            .last_message
            .and_then(|id| self.messages.iter().find(|m| m.id == id))
            .or_else(|| {
                self.messages.iter().rev().find(|m| between(m, conversation.participants))
            })
            .cloned()
    }

    fn next_created_at(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.messages.last() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        }
    }

    fn populate(&self, message: &Message) -> PopulatedMessage {
        PopulatedMessage {
            id: message.id,
            sender: self.user_or_placeholder(message.sender),
            receiver: self.user_or_placeholder(message.receiver),
            content: message.content.clone(),
            read: message.read,
            created_at: message.created_at,
        }
    }

    fn user_or_placeholder(&self, user_id: Uuid) -> UserSummary {
        self.users.get(&user_id).cloned().unwrap_or_else(|| UserSummary {
            id: user_id,
            username: String::new(),
            profile_image: None,
        })
    }
}

fn between(message: &Message, pair: ParticipantPair) -> bool {
    pair.contains(message.sender) && pair.other(message.sender) == Some(message.receiver)
}
