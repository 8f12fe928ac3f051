// Conversation and message persistence.
//
// `ChatStore` fronts PostgreSQL in production and an in-memory map in tests.
// Every operation is a single call so handlers never compose partial writes.

mod memory;
mod postgres;

use std::sync::Arc;

use anyhow::Context;
use murmur_common::types::{Conversation, ConversationSummary, PopulatedMessage, UserSummary};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    db::pool::{check_pool_health, create_pg_pool, PoolConfig},
    error::ChatError,
};

pub use memory::MemoryChatStore;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub enum ChatStore {
    Postgres(PgPool),
    #[cfg_attr(not(test), allow(dead_code))]
    Memory(Arc<RwLock<MemoryChatStore>>),
}

/// One page of conversation history, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl ChatStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
        let pool = create_pg_pool(database_url, PoolConfig::from_env())
            .await
            .context("failed to initialize chat store PostgreSQL pool")?;
        check_pool_health(&pool).await?;
        Ok(pool)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryChatStore::default())))
    }

    #[cfg(test)]
    pub(crate) async fn add_user_for_tests(&self, username: &str) -> Uuid {
        let Self::Memory(store) = self else {
            panic!("test users can only be added to the memory store");
        };
        let id = Uuid::new_v4();
        store.write().await.insert_user(UserSummary {
            id,
            username: username.to_string(),
            profile_image: None,
        });
        id
    }

    pub async fn user(&self, user_id: Uuid) -> Result<Option<UserSummary>, ChatError> {
        match self {
            Self::Postgres(pool) => postgres::user_pg(pool, user_id).await,
            Self::Memory(store) => Ok(store.read().await.user(user_id)),
        }
    }

    /// Find the conversation between the two users, creating it on first
    /// contact. Repeated calls for the same pair return the same id.
    pub async fn get_or_create_conversation(
        &self,
        user_id: Uuid,
        other_user_id: Uuid,
    ) -> Result<Conversation, ChatError> {
        match self {
            Self::Postgres(pool) => {
                postgres::get_or_create_conversation_pg(pool, user_id, other_user_id).await
            }
            Self::Memory(store) => {
                store.write().await.get_or_create_conversation(user_id, other_user_id)
            }
        }
    }

    pub async fn conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, ChatError> {
        match self {
            Self::Postgres(pool) => postgres::conversation_pg(pool, conversation_id).await,
            Self::Memory(store) => Ok(store.read().await.conversation(conversation_id)),
        }
    }

    /// Conversation the caller participates in, or the matching error.
    pub async fn conversation_for_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .conversation(conversation_id)
            .await?
            .ok_or(ChatError::NotFound("conversation not found"))?;
        if !conversation.includes(user_id) {
            return Err(ChatError::Authorization("access denied"));
        }
        Ok(conversation)
    }

    /// The caller's conversations, most recently active first.
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        match self {
            Self::Postgres(pool) => postgres::list_conversations_pg(pool, user_id).await,
            Self::Memory(store) => Ok(store.read().await.list_conversations(user_id)),
        }
    }

    /// Persist a message and move the conversation's last-message pointer.
    ///
    /// Both writes commit together. The conversation must exist and its two
    /// participants must be exactly `sender` and `receiver`.
    pub async fn record_message(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        receiver: Uuid,
        content: String,
    ) -> Result<PopulatedMessage, ChatError> {
        if sender == receiver {
            return Err(ChatError::validation("cannot send a message to yourself"));
        }

        match self {
            Self::Postgres(pool) => {
                let message_id =
                    postgres::record_message_pg(pool, conversation_id, sender, receiver, &content)
                        .await?;
                postgres::populated_message_pg(pool, message_id).await?.ok_or_else(|| {
                    ChatError::Persistence(anyhow::anyhow!(
                        "message {message_id} vanished right after insert"
                    ))
                })
            }
            Self::Memory(store) => {
                store.write().await.record_message(conversation_id, sender, receiver, content)
            }
        }
    }

    pub async fn populated_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<PopulatedMessage>, ChatError> {
        match self {
            Self::Postgres(pool) => postgres::populated_message_pg(pool, message_id).await,
            Self::Memory(store) => Ok(store.read().await.populated_message(message_id)),
        }
    }

    /// History between the conversation's participants, oldest first.
    pub async fn list_messages(
        &self,
        conversation: &Conversation,
        page: PageRequest,
    ) -> Result<Vec<PopulatedMessage>, ChatError> {
        match self {
            Self::Postgres(pool) => postgres::list_messages_pg(pool, conversation, page).await,
            Self::Memory(store) => Ok(store.read().await.list_messages(conversation, page)),
        }
    }

    /// Flip every unread message from `sender` to `receiver` to read in one
    /// statement. Returns how many messages changed; repeating is a no-op.
    pub async fn mark_read(&self, receiver: Uuid, sender: Uuid) -> Result<u64, ChatError> {
        match self {
            Self::Postgres(pool) => postgres::mark_read_pg(pool, receiver, sender).await,
            Self::Memory(store) => Ok(store.write().await.mark_read(receiver, sender)),
        }
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64, ChatError> {
        match self {
            Self::Postgres(pool) => postgres::unread_count_pg(pool, user_id).await,
            Self::Memory(store) => Ok(store.read().await.unread_count(user_id)),
        }
    }

    /// Sender-only delete. A conversation pointing at the deleted message is
    /// re-pointed at the newest remaining message.
    pub async fn delete_message(&self, message_id: Uuid, requester: Uuid) -> Result<(), ChatError> {
        match self {
            Self::Postgres(pool) => postgres::delete_message_pg(pool, message_id, requester).await,
            Self::Memory(store) => store.write().await.delete_message(message_id, requester),
        }
    }
}
