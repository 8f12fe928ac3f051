// Realtime chat transport: authenticated WebSocket connections carrying
// `{"event", "data"}` frames.

mod handler;
mod protocol;
mod rooms;
mod session;

use crate::auth::jwt::JwtAccessTokenService;
use axum::{routing::get, Router};
use std::sync::Arc;

pub(crate) use session::RealtimeHub;

#[derive(Clone)]
pub(crate) struct RealtimeRouterState {
    pub(crate) jwt_service: Arc<JwtAccessTokenService>,
    pub(crate) hub: RealtimeHub,
}

pub(crate) fn router(jwt_service: Arc<JwtAccessTokenService>, hub: RealtimeHub) -> Router {
    Router::new()
        .route("/v1/ws", get(handler::ws_upgrade))
        .with_state(RealtimeRouterState { jwt_service, hub })
}
