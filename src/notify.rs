//! WebSocket notifier
//!
//! Serves the operator status channel: one `/websocket` route accepting any
//! client, a roster message on connect listing the monitored lines, and a
//! periodic keep-alive push. Connected clients live in a registry and every
//! push is broadcast; a client that stops accepting writes is dropped. There
//! is no acknowledgment or replay, a reconnecting client simply starts fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry of connected clients keyed by connection id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Message>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: Uuid, tx: mpsc::UnboundedSender<Message>) {
        self.clients.write().await.insert(id, tx);
    }

    pub async fn unregister(&self, id: &Uuid) {
        self.clients.write().await.remove(id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Send a text message to every connected client, pruning any whose
    /// channel has gone away. Returns the number of live clients afterwards.
    pub async fn broadcast(&self, text: &str) -> usize {
        let mut clients = self.clients.write().await;
        let mut dead = Vec::new();
        for (id, tx) in clients.iter() {
            if tx.send(Message::Text(text.to_owned().into())).is_err() {
                dead.push(*id);
            }
        }
        for id in &dead {
            clients.remove(id);
            warn!(client = %id, "dropping unreachable websocket client");
        }
        clients.len()
    }
}

/// Shared state for the websocket route.
#[derive(Clone)]
pub struct NotifyState {
    pub registry: Arc<ClientRegistry>,
    pub roster: String,
}

/// Roster text pushed to a client on connect: each monitored DN prefixed
/// with `#`.
pub fn roster_message(lines: &[String]) -> String {
    let mut roster = String::from("Shared Lines: ");
    for dn in lines {
        roster.push('#');
        roster.push_str(dn);
    }
    roster
}

/// Build the notification router.
pub fn create_router(state: NotifyState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_headers(Any);

    Router::new()
        .route("/websocket", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<NotifyState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: NotifyState) {
    let id = Uuid::new_v4();
    info!(client = %id, "websocket connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Queue the roster before the client is visible to broadcasts so it is
    // the first message on the wire.
    let _ = tx.send(Message::Text(state.roster.clone().into()));
    state.registry.register(id, tx).await;

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are drained and ignored; the channel is push-only.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.registry.unregister(&id).await;
    info!(client = %id, "websocket disconnected");
}

/// Push the keep-alive payload to all clients on a fixed interval until
/// cancelled.
pub fn spawn_keepalive(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("keep-alive task stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            let clients = registry.broadcast("KeepAlive").await;
            debug!(clients, "keep alive sent");
        }
    })
}
