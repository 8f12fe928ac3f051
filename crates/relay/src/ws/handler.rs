use super::protocol::{
    close_frame_too_large, is_frame_size_violation, send_event, HEARTBEAT_INTERVAL_MS,
    HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES,
};
use super::session::{conversation_of, RealtimeHub, RealtimeSession};
use super::RealtimeRouterState;
use crate::auth::handshake::{authenticate_connection, HandshakeAuth};
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ChatError,
};
use crate::metrics;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use murmur_common::protocol::events::{decode_client_event, ServerEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Authenticates the upgrade request itself; a bad or missing credential
/// gets a 401 and the socket is never opened.
pub(crate) async fn ws_upgrade(
    State(state): State<RealtimeRouterState>,
    Query(auth): Query<HandshakeAuth>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match authenticate_connection(&state.jwt_service, &auth, &headers) {
        Ok(user_id) => user_id,
        Err(error) => {
            metrics::increment_ws_auth_failures();
            return error.into_response();
        }
    };

    let hub = state.hub.clone();
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(hub, user_id, socket)).await;
        },
    )
}

async fn handle_socket(hub: RealtimeHub, user_id: Uuid, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    let session = RealtimeSession::connect(hub, user_id, outbound_sender).await;

    // Ping every interval; give up once a full interval plus the timeout
    // window passed without a pong.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_deadline {
                    warn!(
                        user_id = %session.user_id(),
                        connection_id = %session.connection_id(),
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(outbound) = maybe_outbound else {
                    break;
                };
                if send_event(&mut socket, &outbound).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        let event = match decode_client_event(&raw_message) {
                            Ok(event) => event,
                            Err(error) => {
                                debug!(connection_id = %session.connection_id(), %error, "undecodable realtime frame");
                                metrics::record_ws_event("invalid_frame", true, 0);
                                let reply = ChatError::validation("invalid event frame").to_event(None);
                                if send_event(&mut socket, &reply).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        let started_at = Instant::now();
                        let name = event.name();
                        let conversation_id = conversation_of(&event);
                        match session.handle(event).await {
                            Ok(()) => {
                                metrics::record_ws_event(name, false, started_at.elapsed().as_millis() as u64);
                            }
                            Err(error) => {
                                metrics::record_ws_event(name, true, started_at.elapsed().as_millis() as u64);
                                if send_event(&mut socket, &error.to_event(Some(conversation_id))).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    session.disconnect().await;
}
