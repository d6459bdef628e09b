//! WebSocket endpoint of the realtime fan-out.
//!
//! The channel is server to client only. Text frames sent by the browser
//! are ignored; the connection ends on close, on a failed send, or when the
//! server shuts the fan-out down.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::time::{Duration, interval};
use tracing::debug;

use crate::api::AppState;

/// Interval of keep-alive pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // Unregistered when dropped, on every exit path below.
    let mut subscription = state.fanout.on_connect();
    let (mut sender, mut receiver) = socket.split();

    let mut ping = interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                let Some(frame) = frame else {
                    debug!("Fan-out closed, ending WebSocket");
                    break;
                };
                if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                    debug!("WebSocket send failed, client gone");
                    break;
                }
            }

            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    debug!("Ping failed, client gone");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
