// Chat domain types shared by the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on message content, counted in characters after trimming.
pub const MAX_MESSAGE_CHARS: usize = 5_000;

/// Display attributes of a user, embedded wherever a client renders a person.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

/// A stored chat message between two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender: Uuid,
    pub receiver: Uuid,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// A message joined with the sender's and receiver's display attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PopulatedMessage {
    pub id: Uuid,
    pub sender: UserSummary,
    pub receiver: UserSummary,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl PopulatedMessage {
    pub fn unpopulated(&self) -> Message {
        Message {
            id: self.id,
            sender: self.sender.id,
            receiver: self.receiver.id,
            content: self.content.clone(),
            read: self.read,
            created_at: self.created_at,
        }
    }
}

/// A two-party conversation and its latest-message pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub participants: ParticipantPair,
    pub last_message: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn includes(&self, user_id: Uuid) -> bool {
        self.participants.contains(user_id)
    }

    /// The participant that is not `user_id`, or `None` when `user_id` is not
    /// part of this conversation.
    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        self.participants.other(user_id)
    }
}

/// Conversation as listed for one user: populated participants, latest
/// message and how many messages that user has not read yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: Uuid,
    pub participants: Vec<UserSummary>,
    pub last_message: Option<Message>,
    pub unread_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Unordered pair of two distinct users.
///
/// Stored in canonical order (lower id first) so that `(a, b)` and `(b, a)`
/// compare and hash equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "Vec<Uuid>", into = "Vec<Uuid>")]
pub struct ParticipantPair {
    low: Uuid,
    high: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantError {
    #[error("a conversation needs two distinct participants")]
    SameUser,
    #[error("a conversation has exactly two participants, got {0}")]
    WrongCount(usize),
}

impl ParticipantPair {
    pub fn new(a: Uuid, b: Uuid) -> Result<Self, ParticipantError> {
        if a == b {
            return Err(ParticipantError::SameUser);
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> Uuid {
        self.low
    }

    pub fn high(&self) -> Uuid {
        self.high
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.low == user_id || self.high == user_id
    }

    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        if self.low == user_id {
            Some(self.high)
        } else if self.high == user_id {
            Some(self.low)
        } else {
            None
        }
    }
}

impl TryFrom<Vec<Uuid>> for ParticipantPair {
    type Error = ParticipantError;

    fn try_from(value: Vec<Uuid>) -> Result<Self, Self::Error> {
        match value.as_slice() {
            [a, b] => Self::new(*a, *b),
            other => Err(ParticipantError::WrongCount(other.len())),
        }
    }
}

impl From<ParticipantPair> for Vec<Uuid> {
    fn from(value: ParticipantPair) -> Self {
        vec![value.low, value.high]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("message content is required")]
    Empty,
    #[error("message content exceeds {max} characters")]
    TooLong { max: usize },
}

/// Trim raw message content and enforce the non-empty and length rules.
pub fn normalize_content(raw: &str) -> Result<String, ContentError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ContentError::Empty);
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ContentError::TooLong { max: MAX_MESSAGE_CHARS });
    }
    Ok(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_pair_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(ParticipantPair::new(a, b).unwrap(), ParticipantPair::new(b, a).unwrap());
    }

    #[test]
    fn participant_pair_rejects_duplicates() {
        let a = Uuid::new_v4();
        assert_eq!(ParticipantPair::new(a, a), Err(ParticipantError::SameUser));
    }

    #[test]
    fn participant_pair_resolves_other_side() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let pair = ParticipantPair::new(a, b).unwrap();

        assert_eq!(pair.other(a), Some(b));
        assert_eq!(pair.other(b), Some(a));
        assert_eq!(pair.other(Uuid::new_v4()), None);
    }

    #[test]
    fn participant_pair_deserialization_enforces_length() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let json = serde_json::to_string(&ids).unwrap();

        assert!(serde_json::from_str::<ParticipantPair>(&json).is_err());
    }

    #[test]
    fn content_is_trimmed() {
        assert_eq!(normalize_content("  hi there \n").unwrap(), "hi there");
    }

    #[test]
    fn whitespace_only_content_is_rejected() {
        assert_eq!(normalize_content(" \t\n "), Err(ContentError::Empty));
        assert_eq!(normalize_content(""), Err(ContentError::Empty));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let raw = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert_eq!(normalize_content(&raw), Err(ContentError::TooLong { max: MAX_MESSAGE_CHARS }));
        assert!(normalize_content(&"x".repeat(MAX_MESSAGE_CHARS)).is_ok());
    }
}
