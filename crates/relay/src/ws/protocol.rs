use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use murmur_common::protocol::events::{encode_server_event, ServerEvent};

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 65_536;

pub async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_server_event(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

pub(crate) fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

pub(crate) async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
                .into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::is_frame_size_violation;

    #[test]
    fn recognizes_capacity_errors() {
        let error = axum::Error::new("Space limit exceeded: Message too long: 70000 > 65536");
        assert!(is_frame_size_violation(&error));

        let error = axum::Error::new("Connection reset without closing handshake");
        assert!(!is_frame_size_violation(&error));
    }
}
