// =============================================================================
// PushHub — authenticated WebSocket server for signal delivery and control
// =============================================================================
//
// Bound to a configured host/port. Each accepted connection starts Unauthed
// and is promoted to Authed by a successful `auth` command. Authed
// connections accept the full command set (get_config, set_config,
// get_allowed_filters, get_top, metrics, ping) and are fanout targets for
// `broadcast`/`send_to_user`.
//
// Per connection: one task owns the socket's write half exclusively (reading
// from an mpsc channel so sends are always serialized); a second future
// reads the socket's read half and reacts to incoming frames, pushing
// responses into that same channel. The registry is a single RwLock over a
// HashMap, matching the "snapshot-for-broadcast, send outside the lock"
// policy.
// =============================================================================

pub mod protocol;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::time::now_secs;
use crate::user_store::UserStore;
use protocol::{ClientMessage, ServerMessage, TopItem};

/// Future returned by an injected `get_top` provider.
pub type TopFuture = Pin<Box<dyn Future<Output = Vec<TopItem>> + Send>>;
/// `(mode, n) -> top items`, injected by the engine (typically backed by the
/// universe fetcher's cached snapshot).
pub type TopProvider = Arc<dyn Fn(String, usize) -> TopFuture + Send + Sync>;
/// `(client_id, event, data)`, invoked for the `metrics` command. Optional.
pub type MetricsSink = Arc<dyn Fn(String, Option<String>, Option<Value>) + Send + Sync>;

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<Message>,
    authed: bool,
    user_id: Option<String>,
}

/// Shared server state: the connection registry plus injected collaborators.
pub struct PushHub {
    connections: RwLock<HashMap<u64, ConnectionEntry>>,
    next_id: AtomicU64,
    user_store: Arc<UserStore>,
    top_provider: TopProvider,
    metrics_sink: Option<MetricsSink>,
}

impl PushHub {
    pub fn new(user_store: Arc<UserStore>, top_provider: TopProvider, metrics_sink: Option<MetricsSink>) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            user_store,
            top_provider,
            metrics_sink,
        })
    }

    /// Build the Axum router exposing `/ws`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    /// Bind and serve until the process is signalled to stop. Mirrors the
    /// teacher's plain `axum::serve` startup.
    pub async fn serve(self: &Arc<Self>, host: &str, port: u16) -> anyhow::Result<()> {
        let addr = format!("{host}:{port}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "push hub listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    fn snapshot_authed(&self) -> Vec<(u64, mpsc::UnboundedSender<Message>)> {
        self.connections
            .read()
            .iter()
            .filter(|(_, c)| c.authed)
            .map(|(id, c)| (*id, c.tx.clone()))
            .collect()
    }

    fn snapshot_user(&self, user_id: &str) -> Vec<(u64, mpsc::UnboundedSender<Message>)> {
        self.connections
            .read()
            .iter()
            .filter(|(_, c)| c.authed && c.user_id.as_deref() == Some(user_id))
            .map(|(id, c)| (*id, c.tx.clone()))
            .collect()
    }

    fn reap(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        let mut map = self.connections.write();
        for id in ids {
            map.remove(id);
        }
    }

    /// Serialize once, send to every Authed connection; dead sends are
    /// reaped.
    pub fn broadcast(&self, payload: &ServerMessage) {
        let targets = self.snapshot_authed();
        if targets.is_empty() {
            debug!("push hub broadcast: no authed clients");
            return;
        }
        let text = match serde_json::to_string(payload) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to serialise broadcast payload");
                return;
            }
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(Message::Text(text.clone())).is_err() {
                dead.push(id);
            }
        }
        self.reap(&dead);
    }

    /// Serialize once, send to every Authed connection for `user_id`; dead
    /// sends are reaped.
    pub fn send_to_user(&self, user_id: &str, payload: &ServerMessage) {
        let targets = self.snapshot_user(user_id);
        if targets.is_empty() {
            debug!(user_id, "push hub send_to_user: no authed clients");
            return;
        }
        let text = match serde_json::to_string(payload) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to serialise send_to_user payload");
                return;
            }
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(Message::Text(text.clone())).is_err() {
                dead.push(id);
            }
        }
        self.reap(&dead);
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<PushHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, hub))
}

async fn handle_connection(socket: WebSocket, hub: Arc<PushHub>) {
    use futures_util::{SinkExt, StreamExt};

    let id = hub.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    hub.connections.write().insert(
        id,
        ConnectionEntry {
            tx: tx.clone(),
            authed: false,
            user_id: None,
        },
    );

    let (mut sink, mut stream) = socket.split();

    // The write half is owned exclusively by this forwarder: every outbound
    // message — replies and fanout alike — funnels through `tx`, so sends on
    // this connection are always serialized.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if text == "ping" {
                    let _ = tx.send(Message::Text("pong".to_string()));
                    continue;
                }
                handle_frame(&hub, id, &text, &tx).await;
            }
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(Message::Ping(data))) => {
                let _ = tx.send(Message::Pong(data));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, conn = id, "push hub connection read error");
                break;
            }
            None => break,
        }

        if should_close(&hub, id) {
            break;
        }
    }

    let user_id = hub.connections.read().get(&id).and_then(|c| c.user_id.clone());
    if let Some(uid) = user_id {
        info!(user_id = %uid, conn = id, "push hub client disconnected");
    }
    hub.connections.write().remove(&id);
    drop(tx);
    writer.abort();
}

fn should_close(hub: &Arc<PushHub>, id: u64) -> bool {
    // A failed auth closes the connection immediately; `handle_frame` signals
    // this by removing the entry outright rather than just flipping authed.
    !hub.connections.read().contains_key(&id)
}

async fn handle_frame(hub: &Arc<PushHub>, conn_id: u64, text: &str, tx: &mpsc::UnboundedSender<Message>) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            let _ = send_json(tx, &ServerMessage::error("bad_json"));
            return;
        }
    };

    let msg: ClientMessage = match serde_json::from_value(raw) {
        Ok(m) => m,
        Err(_) => {
            let _ = send_json(tx, &ServerMessage::error("unknown_type"));
            return;
        }
    };

    let (authed, user_id) = {
        let map = hub.connections.read();
        let entry = map.get(&conn_id);
        (
            entry.map(|e| e.authed).unwrap_or(false),
            entry.and_then(|e| e.user_id.clone()),
        )
    };

    match msg {
        ClientMessage::Auth { token, .. } => {
            match hub.user_store.resolve_token(&token) {
                Some(uid) => {
                    if let Some(entry) = hub.connections.write().get_mut(&conn_id) {
                        entry.authed = true;
                        entry.user_id = Some(uid.clone());
                    }
                    info!(user_id = %uid, conn = conn_id, "push hub client authenticated");
                    let _ = send_json(
                        tx,
                        &ServerMessage::Ok {
                            ts: Some(now_secs()),
                            user_id: Some(uid),
                        },
                    );
                }
                None => {
                    let _ = send_json(tx, &ServerMessage::error("unauthorized"));
                    hub.connections.write().remove(&conn_id);
                }
            }
            return;
        }
        _ => {}
    }

    if !authed || user_id.is_none() {
        let _ = send_json(tx, &ServerMessage::error("unauthorized"));
        return;
    }
    let user_id = user_id.unwrap();

    match msg {
        ClientMessage::GetConfig => {
            let data = Value::Object(hub.user_store.get_user_cfg(&user_id));
            let _ = send_json(tx, &ServerMessage::Config { data });
        }
        ClientMessage::SetConfig { patch } => {
            let patch_obj = patch.as_object().cloned().unwrap_or_default();
            match hub.user_store.patch_user_cfg(&user_id, &patch_obj, now_secs()) {
                Ok(merged) => {
                    let _ = send_json(tx, &ServerMessage::Config { data: Value::Object(merged) });
                }
                Err(e) => {
                    warn!(error = %e, user_id = %user_id, "set_config failed to persist");
                    let _ = send_json(tx, &ServerMessage::error("persist_failed"));
                }
            }
        }
        ClientMessage::GetAllowedFilters => {
            let _ = send_json(
                tx,
                &ServerMessage::AllowedFilters {
                    data: crate::user_store::allowed_filters_json(),
                },
            );
        }
        ClientMessage::GetTop { mode, n } => {
            let items = (hub.top_provider)(mode.clone(), n).await;
            let _ = send_json(tx, &ServerMessage::Top { mode, items });
        }
        ClientMessage::Metrics { event, data } => {
            if let Some(sink) = &hub.metrics_sink {
                sink(format!("conn-{conn_id}"), event, data);
            }
            let _ = send_json(
                tx,
                &ServerMessage::Ok {
                    ts: None,
                    user_id: None,
                },
            );
        }
        ClientMessage::Ping => {
            let _ = send_json(tx, &ServerMessage::Pong);
        }
        ClientMessage::Auth { .. } => unreachable!("handled above"),
    }
}

fn send_json(tx: &mpsc::UnboundedSender<Message>, payload: &ServerMessage) -> Result<(), ()> {
    match serde_json::to_string(payload) {
        Ok(text) => tx.send(Message::Text(text)).map_err(|_| ()),
        Err(_) => Err(()),
    }
}
