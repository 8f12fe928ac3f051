pub mod chat;

use std::sync::Arc;

use axum::Router;

use crate::{auth::jwt::JwtAccessTokenService, store::ChatStore};

/// REST routes, all behind token authentication.
pub fn router(jwt_service: Arc<JwtAccessTokenService>, store: ChatStore) -> Router {
    chat::router(jwt_service, store)
}
