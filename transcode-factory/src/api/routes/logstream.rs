//! Live update WebSocket.
//!
//! Streams hub messages as JSON text frames. The server pings on a fixed
//! heartbeat and closes connections that miss a pong.

use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::api::server::AppState;
use crate::hub::HubMessage;

/// Heartbeat ping interval in seconds.
const HEARTBEAT_INTERVAL_SECS: u64 = 27;

/// What to do when the heartbeat interval ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatAction {
    Ping,
    Close,
}

/// Ping/pong bookkeeping of one connection.
#[derive(Debug, Default)]
struct Heartbeat {
    awaiting_pong: bool,
}

impl Heartbeat {
    /// A connection still owing a pong from the previous tick is closed.
    fn on_tick(&mut self) -> HeartbeatAction {
        if self.awaiting_pong {
            return HeartbeatAction::Close;
        }
        self.awaiting_pong = true;
        HeartbeatAction::Ping
    }

    fn on_pong(&mut self) {
        self.awaiting_pong = false;
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/logstream", get(logstream_ws))
}

async fn logstream_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn encode(message: &HubMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            debug!("Failed to encode hub message: {}", e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.ctx.hub.subscribe();
    debug!(subscriber = subscription.id(), "Log stream connected");

    // Clients render the current status before the first change arrives.
    if let Some(frame) = encode(&HubMessage::refresh())
        && sender.send(frame).await.is_err()
    {
        return;
    }

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    let mut heartbeat = Heartbeat::default();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => heartbeat.on_pong(),
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    // Clients only listen.
                    Some(Ok(_)) => {}
                }
            }

            message = subscription.recv() => {
                // None: the hub dropped this subscriber or stopped.
                let Some(message) = message else { break };
                if let Some(frame) = encode(&message)
                    && sender.send(frame).await.is_err()
                {
                    break;
                }
            }

            _ = heartbeat_interval.tick() => match heartbeat.on_tick() {
                HeartbeatAction::Close => {
                    debug!("Client failed to respond to Ping, closing connection");
                    break;
                }
                HeartbeatAction::Ping => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    let _ = sender.close().await;
    debug!(subscriber = subscription.id(), "Log stream closed");
}
