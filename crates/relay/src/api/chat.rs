// Chat REST surface under /api/chat.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, put},
    Router,
};
use murmur_common::types::{normalize_content, ConversationSummary, PopulatedMessage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        middleware::{require_auth, AuthenticatedUser},
    },
    error::ChatError,
    store::{ChatStore, PageRequest},
};

#[derive(Clone)]
struct ChatApiState {
    store: ChatStore,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCountResponse {
    unread_count: i64,
}

#[derive(Debug, Serialize)]
struct MarkReadResponse {
    message: &'static str,
    updated: u64,
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    message: &'static str,
}

pub fn router(jwt_service: Arc<JwtAccessTokenService>, store: ChatStore) -> Router {
    Router::new()
        .route("/api/chat/conversation/{id}", get(get_or_create_conversation))
        .route("/api/chat/conversations", get(list_conversations))
        .route(
            "/api/chat/messages/{id}",
            get(list_messages).post(send_message).delete(delete_message),
        )
        .route("/api/chat/messages/{id}/read", put(mark_read))
        .route("/api/chat/unread-count", get(unread_count))
        .route_layer(middleware::from_fn_with_state(jwt_service, require_auth))
        .with_state(ChatApiState { store })
}

/// `id` is the other user. Returns the pair's conversation as the caller
/// sees it in their list.
async fn get_or_create_conversation(
    State(state): State<ChatApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(other_user_id): Path<Uuid>,
) -> Result<Json<ConversationSummary>, ChatError> {
    let conversation =
        state.store.get_or_create_conversation(user.user_id, other_user_id).await?;

    state
        .store
        .list_conversations(user.user_id)
        .await?
        .into_iter()
        .find(|summary| summary.id == conversation.id)
        .map(Json)
        .ok_or(ChatError::NotFound("conversation not found"))
}

async fn list_conversations(
    State(state): State<ChatApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<ConversationSummary>>, ChatError> {
    Ok(Json(state.store.list_conversations(user.user_id).await?))
}

async fn list_messages(
    State(state): State<ChatApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<PopulatedMessage>>, ChatError> {
    let conversation =
        state.store.conversation_for_participant(conversation_id, user.user_id).await?;
    let page = PageRequest::new(query.page, query.limit);

    Ok(Json(state.store.list_messages(&conversation, page).await?))
}

async fn send_message(
    State(state): State<ChatApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<PopulatedMessage>), ChatError> {
    let content = normalize_content(&payload.content)?;
    let conversation =
        state.store.conversation_for_participant(conversation_id, user.user_id).await?;
    let receiver = conversation
        .other_participant(user.user_id)
        .ok_or(ChatError::Authorization("access denied"))?;

    let message = state.store.record_message(conversation.id, user.user_id, receiver, content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Marks everything the other participant sent the caller as read.
async fn mark_read(
    State(state): State<ChatApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<MarkReadResponse>, ChatError> {
    let conversation =
        state.store.conversation_for_participant(conversation_id, user.user_id).await?;
    let sender = conversation
        .other_participant(user.user_id)
        .ok_or(ChatError::Authorization("access denied"))?;

    let updated = state.store.mark_read(user.user_id, sender).await?;
    Ok(Json(MarkReadResponse { message: "messages marked as read", updated }))
}

async fn unread_count(
    State(state): State<ChatApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<UnreadCountResponse>, ChatError> {
    let unread_count = state.store.unread_count(user.user_id).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

async fn delete_message(
    State(state): State<ChatApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<DeletedResponse>, ChatError> {
    state.store.delete_message(message_id, user.user_id).await?;
    Ok(Json(DeletedResponse { message: "message deleted" }))
}
