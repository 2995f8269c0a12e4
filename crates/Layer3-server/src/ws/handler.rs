//! WebSocket handler for client connections.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use labterm_foundation::ServerEvent;
use labterm_session::{Reply, SessionChannel};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::AppState;

/// GET /ws
///
/// A missing owner header is not refused here; the first subscribe gets a
/// typed error and the connection is closed.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let owner_id = state.owner_from(&headers);
    info!("WebSocket upgrade request from owner {:?}", owner_id);
    ws.on_upgrade(move |socket| handle_connection(socket, state, owner_id))
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Send the direct reply; `false` when the connection should end
async fn send_reply(sender: &mut SplitSink<WebSocket, Message>, reply: Reply) -> bool {
    for event in &reply.events {
        if !send_event(sender, event).await {
            return false;
        }
    }
    !reply.close
}

async fn handle_connection(socket: WebSocket, state: AppState, owner_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut channel: SessionChannel = state.engine.channel(owner_id.clone());

    let ping_secs = state.engine.config().server.ping_interval_secs.max(1);
    let mut ping = tokio::time::interval(Duration::from_secs(ping_secs));
    ping.tick().await;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let keep_going = match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = channel.handle_text(text.as_str()).await;
                        send_reply(&mut sender, reply).await
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            let reply = channel.handle_text(text).await;
                            send_reply(&mut sender, reply).await
                        }
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame");
                            true
                        }
                    },
                    Some(Ok(Message::Ping(data))) => sender.send(Message::Pong(data)).await.is_ok(),
                    Some(Ok(Message::Pong(_))) => true,
                    Some(Ok(Message::Close(_))) | None => false,
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        false
                    }
                };
                if !keep_going {
                    break;
                }
            }

            event = channel.next_event() => {
                match event {
                    Some(event) => {
                        if !send_event(&mut sender, &event.payload).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // disconnect is an implicit unsubscribe
    channel.close().await;
    let _ = sender.close().await;
    info!("WebSocket connection closed for owner {:?}", owner_id);
}
