use chrono::{DateTime, Utc};
use murmur_common::types::{
    Conversation, ConversationSummary, Message, ParticipantPair, PopulatedMessage, UserSummary,
};
use sqlx::PgPool;
use uuid::Uuid;

use super::PageRequest;
use crate::error::ChatError;

const CONVERSATION_COLUMNS: &str =
    "id, user_low, user_high, last_message_id, created_at, updated_at";

const POPULATED_MESSAGE_SELECT: &str = r#"
    SELECT m.id, m.content, m.read, m.created_at,
           s.id AS sender_id, s.username AS sender_username,
           s.profile_image AS sender_profile_image,
           r.id AS receiver_id, r.username AS receiver_username,
           r.profile_image AS receiver_profile_image
    FROM messages m
    JOIN users s ON s.id = m.sender_id
    JOIN users r ON r.id = m.receiver_id
"#;

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    profile_image: Option<String>,
}

impl From<UserRow> for UserSummary {
    fn from(row: UserRow) -> Self {
        Self { id: row.id, username: row.username, profile_image: row.profile_image }
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    user_low: Uuid,
    user_high: Uuid,
    last_message_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = ChatError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        let participants = ParticipantPair::new(row.user_low, row.user_high).map_err(|error| {
            ChatError::Persistence(anyhow::anyhow!("conversation {} is corrupt: {error}", row.id))
        })?;
        Ok(Self {
            id: row.id,
            participants,
            last_message: row.last_message_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PopulatedMessageRow {
    id: Uuid,
    content: String,
    read: bool,
    created_at: DateTime<Utc>,
    sender_id: Uuid,
    sender_username: String,
    sender_profile_image: Option<String>,
    receiver_id: Uuid,
    receiver_username: String,
    receiver_profile_image: Option<String>,
}

impl From<PopulatedMessageRow> for PopulatedMessage {
    fn from(row: PopulatedMessageRow) -> Self {
        Self {
            id: row.id,
            sender: UserSummary {
                id: row.sender_id,
                username: row.sender_username,
                profile_image: row.sender_profile_image,
            },
            receiver: UserSummary {
                id: row.receiver_id,
                username: row.receiver_username,
                profile_image: row.receiver_profile_image,
            },
            content: row.content,
            read: row.read,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConversationSummaryRow {
    id: Uuid,
    updated_at: DateTime<Utc>,
    low_id: Uuid,
    low_username: String,
    low_profile_image: Option<String>,
    high_id: Uuid,
    high_username: String,
    high_profile_image: Option<String>,
    last_id: Option<Uuid>,
    last_sender_id: Option<Uuid>,
    last_receiver_id: Option<Uuid>,
    last_content: Option<String>,
    last_read: Option<bool>,
    last_created_at: Option<DateTime<Utc>>,
    unread_count: i64,
}

impl From<ConversationSummaryRow> for ConversationSummary {
    fn from(row: ConversationSummaryRow) -> Self {
        let last_message = match (
            row.last_id,
            row.last_sender_id,
            row.last_receiver_id,
            row.last_content,
            row.last_read,
            row.last_created_at,
        ) {
            (
                Some(id),
                Some(sender),
                Some(receiver),
                Some(content),
                Some(read),
                Some(created_at),
            ) => Some(Message { id, sender, receiver, content, read, created_at }),
            _ => None,
        };

        Self {
            id: row.id,
            participants: vec![
                UserSummary {
                    id: row.low_id,
                    username: row.low_username,
                    profile_image: row.low_profile_image,
                },
                UserSummary {
                    id: row.high_id,
                    username: row.high_username,
                    profile_image: row.high_profile_image,
                },
            ],
            last_message,
            unread_count: row.unread_count,
            updated_at: row.updated_at,
        }
    }
}

pub(super) async fn user_pg(pool: &PgPool, user_id: Uuid) -> Result<Option<UserSummary>, ChatError> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, username, profile_image FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(UserSummary::from))
}

pub(super) async fn get_or_create_conversation_pg(
    pool: &PgPool,
    user_id: Uuid,
    other_user_id: Uuid,
) -> Result<Conversation, ChatError> {
    let pair = ParticipantPair::new(user_id, other_user_id)?;
    if user_pg(pool, other_user_id).await?.is_none() {
        return Err(ChatError::NotFound("user not found"));
    }

    // The unique pair constraint settles concurrent first contacts; the loser
    // of the race reads the winner's row.
    sqlx::query(
        r#"
        INSERT INTO conversations (id, user_low, user_high)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_low, user_high) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(pair.low())
    .bind(pair.high())
    .execute(pool)
    .await?;

    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user_low = $1 AND user_high = $2"
    ))
    .bind(pair.low())
    .bind(pair.high())
    .fetch_one(pool)
    .await?;

    row.try_into()
}

pub(super) async fn conversation_pg(
    pool: &PgPool,
    conversation_id: Uuid,
) -> Result<Option<Conversation>, ChatError> {
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
    ))
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;

    row.map(Conversation::try_from).transpose()
}

pub(super) async fn list_conversations_pg(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<ConversationSummary>, ChatError> {
    // A null pointer (deleted message) falls back to the newest message in
    // the pair's history.
    let rows = sqlx::query_as::<_, ConversationSummaryRow>(
        r#"
        SELECT c.id, c.updated_at,
               lo.id AS low_id, lo.username AS low_username,
               lo.profile_image AS low_profile_image,
               hi.id AS high_id, hi.username AS high_username,
               hi.profile_image AS high_profile_image,
               lm.id AS last_id, lm.sender_id AS last_sender_id,
               lm.receiver_id AS last_receiver_id, lm.content AS last_content,
               lm.read AS last_read, lm.created_at AS last_created_at,
               (
                   SELECT COUNT(*)
                   FROM messages u
                   WHERE u.receiver_id = $1
                     AND u.sender_id = CASE WHEN c.user_low = $1 THEN c.user_high ELSE c.user_low END
                     AND NOT u.read
               ) AS unread_count
        FROM conversations c
        JOIN users lo ON lo.id = c.user_low
        JOIN users hi ON hi.id = c.user_high
        LEFT JOIN LATERAL (
            SELECT m.id, m.sender_id, m.receiver_id, m.content, m.read, m.created_at
            FROM messages m
            WHERE (m.sender_id = c.user_low AND m.receiver_id = c.user_high)
               OR (m.sender_id = c.user_high AND m.receiver_id = c.user_low)
            ORDER BY (m.id = c.last_message_id) IS TRUE DESC, m.created_at DESC, m.id DESC
            LIMIT 1
        ) lm ON TRUE
        WHERE c.user_low = $1 OR c.user_high = $1
        ORDER BY c.updated_at DESC, c.id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(ConversationSummary::from).collect())
}

/// Inserts the message and moves the conversation pointer in one
/// transaction. The conversation row is locked so concurrent sends serialize
/// their pointer updates.
pub(super) async fn record_message_pg(
    pool: &PgPool,
    conversation_id: Uuid,
    sender: Uuid,
    receiver: Uuid,
    content: &str,
) -> Result<Uuid, ChatError> {
    let pair = ParticipantPair::new(sender, receiver)?;
    let mut tx = pool.begin().await?;

    let conversation = sqlx::query_as::<_, ConversationRow>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1 FOR UPDATE"
    ))
    .bind(conversation_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ChatError::NotFound("conversation not found"))?;

    if conversation.user_low != pair.low() || conversation.user_high != pair.high() {
        return Err(ChatError::Authorization("access denied"));
    }

    let message_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO messages (id, sender_id, receiver_id, content)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(message_id)
    .bind(sender)
    .bind(receiver)
    .bind(content)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE conversations SET last_message_id = $2, updated_at = now() WHERE id = $1",
    )
    .bind(conversation_id)
    .bind(message_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(message_id)
}

pub(super) async fn populated_message_pg(
    pool: &PgPool,
    message_id: Uuid,
) -> Result<Option<PopulatedMessage>, ChatError> {
    let row = sqlx::query_as::<_, PopulatedMessageRow>(&format!(
        "{POPULATED_MESSAGE_SELECT} WHERE m.id = $1"
    ))
    .bind(message_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(PopulatedMessage::from))
}

pub(super) async fn list_messages_pg(
    pool: &PgPool,
    conversation: &Conversation,
    page: PageRequest,
) -> Result<Vec<PopulatedMessage>, ChatError> {
    let pair = conversation.participants;
    let rows = sqlx::query_as::<_, PopulatedMessageRow>(&format!(
        r#"
        {POPULATED_MESSAGE_SELECT}
        WHERE (m.sender_id = $1 AND m.receiver_id = $2)
           OR (m.sender_id = $2 AND m.receiver_id = $1)
        ORDER BY m.created_at ASC, m.id ASC
        LIMIT $3 OFFSET $4
        "#
    ))
    .bind(pair.low())
    .bind(pair.high())
    .bind(i64::from(page.limit))
    .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(PopulatedMessage::from).collect())
}

pub(super) async fn mark_read_pg(
    pool: &PgPool,
    receiver: Uuid,
    sender: Uuid,
) -> Result<u64, ChatError> {
    let updated = sqlx::query(
        "UPDATE messages SET read = TRUE WHERE receiver_id = $1 AND sender_id = $2 AND NOT read",
    )
    .bind(receiver)
    .bind(sender)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated)
}

pub(super) async fn unread_count_pg(pool: &PgPool, user_id: Uuid) -> Result<i64, ChatError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM messages WHERE receiver_id = $1 AND NOT read",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

pub(super) async fn delete_message_pg(
    pool: &PgPool,
    message_id: Uuid,
    requester: Uuid,
) -> Result<(), ChatError> {
    let mut tx = pool.begin().await?;

    let (sender, receiver) = sqlx::query_as::<_, (Uuid, Uuid)>(
        "SELECT sender_id, receiver_id FROM messages WHERE id = $1 FOR UPDATE",
    )
    .bind(message_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ChatError::NotFound("message not found"))?;

    if sender != requester {
        return Err(ChatError::Authorization("you can only delete your own messages"));
    }

    sqlx::query("DELETE FROM messages WHERE id = $1")
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

    // The foreign key nulled the pointer if it targeted this message.
    let pair = ParticipantPair::new(sender, receiver)?;
    sqlx::query(
        r#"
        UPDATE conversations c
        SET last_message_id = (
            SELECT m.id
            FROM messages m
            WHERE (m.sender_id = c.user_low AND m.receiver_id = c.user_high)
               OR (m.sender_id = c.user_high AND m.receiver_id = c.user_low)
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT 1
        )
        WHERE c.user_low = $1 AND c.user_high = $2 AND c.last_message_id IS NULL
        "#,
    )
    .bind(pair.low())
    .bind(pair.high())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
