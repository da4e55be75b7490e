//! WebSocket event fan-out.
//!
//! `/ws?token=...` authenticates the token from the query (browsers
//! cannot set headers on WebSocket handshakes), subscribes the socket to
//! the event bus, and forwards every event as a `{type, payload}` frame.
//! A periodic ping keeps intermediaries from closing idle links.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::{authorize_token, ApiError, ApiState};
use crate::config::Role;
use crate::error::JupiterError;

const KEEPALIVE: Duration = Duration::from_secs(25);
/// Socket-side buffer; a slow client drops frames rather than stalling
/// the bus.
const FRAME_BUFFER: usize = 256;

pub async fn upgrade(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let token = params
        .get("token")
        .ok_or_else(|| ApiError(JupiterError::Auth("token query parameter required".to_string())))?;
    {
        let config = state.config.read().await;
        authorize_token(&config, token, Role::Viewer)?;
    }
    Ok(upgrade.on_upgrade(move |socket| handle(socket, state)))
}

async fn handle(socket: WebSocket, state: Arc<ApiState>) {
    state.counters.ws_clients.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();

    // Bus events land in a bounded channel; the subscription callback
    // never blocks the bus.
    let (frames_tx, mut frames_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let subscription = state.bus.subscribe_all(Arc::new(move |event| {
        let frame = serde_json::json!({
            "type": event.topic.as_str(),
            "payload": event.payload,
        });
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = frames_tx.try_send(text);
        }
    }));

    let mut keepalive = tokio::time::interval(KEEPALIVE);
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Client frames other than close are ignored; the
                    // socket is broadcast-only.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.bus.unsubscribe(subscription);
    state.counters.ws_clients.fetch_sub(1, Ordering::Relaxed);
    debug!("websocket client disconnected");
}
