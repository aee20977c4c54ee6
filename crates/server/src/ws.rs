//! WebSocket endpoint: token handshake, read loop and connection teardown.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use relay_core::{ConnectionWriter, Frame, Transport};
use serde::Deserialize;
use session_auth::verify_token;
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
}

/// Outbound half of an upgraded socket, owned by the connection's writer.
struct SocketSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl Transport for SocketSink {
    async fn send(&mut self, frame: Frame) -> anyhow::Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
        };
        self.0.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.0.close().await?;
        Ok(())
    }
}

pub(crate) async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = q.token.unwrap_or_default();
    let user_id = match verify_token(&state.tokens, &token) {
        Ok(user_id) => user_id,
        Err(error) => {
            debug!(%error, "websocket handshake refused");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new(ErrorCode::Unauthorized, error.to_string())),
            )
                .into_response();
        }
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| serve_connection(state, socket, user_id)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn serve_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (sink, mut stream) = socket.split();
    let (writer, writer_task) = ConnectionWriter::spawn(SocketSink(sink), state.writer.clone());
    let connection_id = writer.connection_id();
    let registry = state.relay.registry();
    registry.register(user_id, writer.clone()).await;

    loop {
        tokio::select! {
            _ = writer.closed() => {
                debug!(%user_id, %connection_id, "connection writer stopped");
                break;
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => state.relay.handle_text(user_id, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    debug!(%user_id, "ignoring binary frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(error)) => {
                    warn!(%user_id, %connection_id, %error, "websocket read failed");
                    break;
                }
            },
        }
    }

    registry.unregister(user_id, connection_id).await;
    writer.close();
    if let Err(error) = writer_task.await {
        warn!(%user_id, %connection_id, %error, "connection writer task failed");
    }
    info!(%user_id, %connection_id, "connection closed");
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
