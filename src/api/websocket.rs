//! WebSocket stream of round events
//!
//! Each client receives every [`RoundEvent`] published by the engine as JSON,
//! optionally filtered to a single round with `?round_id=`.

use super::handlers::AppState;
use crate::{engine::CrashEngine, events::RoundEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// WebSocket query parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub round_id: Option<String>,
}

impl WsQuery {
    fn matches(&self, event: &RoundEvent) -> bool {
        match &self.round_id {
            Some(round_id) => event.round_id() == *round_id,
            None => true,
        }
    }
}

#[derive(Clone)]
pub struct WebSocketManager {
    engine: Arc<CrashEngine>,
    client_count: Arc<AtomicU64>,
}

impl WebSocketManager {
    pub fn new(engine: Arc<CrashEngine>) -> Self {
        Self {
            engine,
            client_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn client_count(&self) -> u64 {
        self.client_count.load(Ordering::SeqCst)
    }

    pub fn handle_upgrade(&self, ws: WebSocketUpgrade, query: WsQuery) -> Response {
        let manager = self.clone();
        ws.on_upgrade(move |socket| async move { manager.handle_connection(socket, query).await })
    }

    async fn handle_connection(&self, socket: WebSocket, query: WsQuery) {
        let total = self.client_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(round_filter = ?query.round_id, clients = total, "WebSocket client connected");

        let (mut sender, mut receiver) = socket.split();
        let mut events = self.engine.subscribe();

        let receive_task = tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
        });

        let send_task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagged; skipped {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !query.matches(&event) {
                    continue;
                }

                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize round event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let (mut receive_task, mut send_task) = (receive_task, send_task);
        tokio::select! {
            _ = &mut receive_task => {
                debug!("WebSocket receive side closed");
                send_task.abort();
            }
            _ = &mut send_task => {
                debug!("WebSocket send side closed");
                receive_task.abort();
            }
        }

        let remaining = self.client_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(clients = remaining, "WebSocket client disconnected");
    }
}

/// GET /ws[?round_id=...]
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    state.websocket_manager.handle_upgrade(ws, query)
}
