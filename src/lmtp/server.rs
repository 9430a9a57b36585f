//! Websocket endpoint exposing a [`TokenSession`] per connection.
//!
//! Frames travel as text messages in the `"<TYPE> <json>"` form. Outbound
//! frames go through a per-connection queue drained by a dumper task, so
//! concurrent streams never interleave partial writes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::lmtp::message::Frame;
use crate::lmtp::model::LocalModel;
use crate::lmtp::session::TokenSession;

/// The websocket router; mount at `/` or nest as needed.
pub fn router(model: Arc<dyn LocalModel>) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(model)
}

/// Serve the model on `addr` until the task is cancelled.
pub async fn serve(addr: SocketAddr, model: Arc<dyn LocalModel>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "lmtp websocket server listening");
    axum::serve(listener, router(model)).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(model): State<Arc<dyn LocalModel>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, model))
}

async fn handle_socket(socket: WebSocket, model: Arc<dyn LocalModel>) {
    let (mut ws_sink, mut ws_source) = socket.split();

    let (out, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let dumper = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_sink
                .send(Message::Text(frame.to_ws_text().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let session = TokenSession::new(model, out);
    while let Some(message) = ws_source.next().await {
        match message {
            Ok(Message::Text(text)) => match Frame::from_ws_text(&text) {
                Some(frame) => session.handle(frame).await,
                None => tracing::warn!(%text, "skipping undecodable websocket frame"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    // transport closed: cancel in-flight streams
    session.close();
    dumper.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmtp::model::MockModel;

    #[tokio::test]
    async fn test_router_builds() {
        let _router = router(Arc::new(MockModel::new(16, 7)));
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let model: Arc<dyn LocalModel> = Arc::new(MockModel::new(16, 7));
        let server = tokio::spawn(async move {
            axum::serve(listener, router(model)).await.ok();
        });
        assert_ne!(addr.port(), 0);
        server.abort();
    }
}
