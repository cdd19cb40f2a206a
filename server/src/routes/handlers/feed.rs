use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::feed::MailFeed;

/// Events buffered per client before new ones are dropped.
const CLIENT_BUFFER: usize = 256;

/// # GET /ws
///
/// Streams every indexed and classified record as JSON until the client
/// disconnects.
pub async fn feed_ws(ws: WebSocketUpgrade, State(feed): State<MailFeed>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_feed_socket(socket, feed))
}

async fn handle_feed_socket(socket: WebSocket, feed: MailFeed) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_BUFFER);

    let _subscription = feed.subscribe(move |event| match serde_json::to_string(event) {
        Ok(json) => {
            if tx.try_send(json).is_err() {
                tracing::warn!("Feed client is not keeping up, dropping event");
            }
        }
        Err(e) => tracing::error!("Could not serialize feed event: {:?}", e),
    });
    tracing::info!("Feed client connected");

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(json) = outgoing else { break };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    tracing::debug!("Failed to send feed event: {:?}", e);
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {:?}", e);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    tracing::info!("Feed client disconnected");
}
