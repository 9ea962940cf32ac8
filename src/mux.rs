// =============================================================================
// SubscriptionMux — two upstream WebSocket sessions with diff-based (un)sub
// =============================================================================
//
// Owns two independent long-lived upstream connections (trades, mark prices).
// Each session tracks a desired-set (from `set_symbols`) and a confirmed-set
// (from ack frames), reconciles the two by diff on connect and whenever the
// desired-set changes, and reconnects with exponential backoff + jitter on
// any disconnect or error.
//
// The tick-handler call path (into `on_trade`/`on_mark`) must stay
// non-suspending and must never call back into the network layer — it only
// mutates in-memory state (spec.md §5).
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde_json::json;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const BASE_WS_URL: &str = "wss://fstream.binance.com/ws";
const HEARTBEAT_SECS: u64 = 20;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const READ_TIMEOUT_SECS: u64 = 60;
const BATCH_SIZE: usize = 80;
const BATCH_PAUSE: Duration = Duration::from_millis(50);
const MAX_BACKOFF_SECS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Trade,
    MarkPrice,
}

impl StreamKind {
    fn name(self) -> &'static str {
        match self {
            StreamKind::Trade => "aggTrade",
            StreamKind::MarkPrice => "markPrice",
        }
    }

    fn event_type(self) -> &'static str {
        match self {
            StreamKind::Trade => "aggTrade",
            StreamKind::MarkPrice => "markPriceUpdate",
        }
    }

    fn stream_suffix(self, symbol: &str) -> String {
        match self {
            StreamKind::Trade => format!("{symbol}@aggTrade"),
            StreamKind::MarkPrice => format!("{symbol}@markPrice@1s"),
        }
    }
}

/// Callback invoked for each trade tick: `(symbol, price, quantity)`.
pub type TradeHandler = Arc<dyn Fn(&str, f64, f64) + Send + Sync>;
/// Callback invoked for each mark-price update: `(symbol, price)`.
pub type MarkHandler = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Diff two symbol sets into (to_add, to_del), sorted for deterministic
/// batching.
fn diff_sets(desired: &HashSet<String>, confirmed: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut to_add: Vec<String> = desired.difference(confirmed).cloned().collect();
    let mut to_del: Vec<String> = confirmed.difference(desired).cloned().collect();
    to_add.sort();
    to_del.sort();
    (to_add, to_del)
}

/// `min(2^k, 30) + uniform(0, 0.3)` seconds, k doubling on each failure.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 2f64.powi(attempt as i32).min(MAX_BACKOFF_SECS);
    let jitter = rand::thread_rng().gen_range(0.0..0.3);
    Duration::from_secs_f64(base + jitter)
}

struct Session {
    kind: StreamKind,
    desired: RwLock<HashSet<String>>,
    notify: Notify,
    cmd_id: AtomicU64,
}

impl Session {
    fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            desired: RwLock::new(HashSet::new()),
            notify: Notify::new(),
            cmd_id: AtomicU64::new(0),
        }
    }

    fn set_desired(&self, symbols: &HashSet<String>) {
        *self.desired.write() = symbols.clone();
        self.notify.notify_one();
    }

    fn next_id(&self) -> u64 {
        self.cmd_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Two independent upstream sessions (trades, mark prices) with live
/// subscription reconciliation and reconnect-with-backoff.
pub struct SubscriptionMux {
    trade: Arc<Session>,
    mark: Arc<Session>,
    shutdown: Arc<Notify>,
    reconnect_attempts: AtomicU32,
}

impl SubscriptionMux {
    pub fn new() -> Self {
        Self {
            trade: Arc::new(Session::new(StreamKind::Trade)),
            mark: Arc::new(Session::new(StreamKind::MarkPrice)),
            shutdown: Arc::new(Notify::new()),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    /// Update the desired symbol set for both sessions. Symbols are
    /// lowercased as the venue's stream names require. Applies immediately
    /// if a session is connected, else is picked up on next connect.
    pub fn set_symbols(&self, symbols: &[String]) {
        let lowered: HashSet<String> = symbols.iter().map(|s| s.to_lowercase()).collect();
        self.trade.set_desired(&lowered);
        self.mark.set_desired(&lowered);
    }

    /// Spawn both session loops; returns once both tasks have been started
    /// (the loops themselves run until `shutdown` is signalled).
    pub fn start(self: &Arc<Self>, on_trade: TradeHandler, on_mark: MarkHandler) {
        let mux = self.clone();
        let session = self.trade.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_session_loop(session, shutdown, move |symbol, data| {
                if let (Some(p), Some(q)) = (parse_f64_field(&data, "p"), parse_f64_field(&data, "q")) {
                    (on_trade)(&symbol, p, q);
                }
            })
            .await;
            let _ = &mux;
        });

        let mux = self.clone();
        let session = self.mark.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_session_loop(session, shutdown, move |symbol, data| {
                if let Some(p) = parse_f64_field(&data, "p") {
                    (on_mark)(&symbol, p);
                }
            })
            .await;
            let _ = &mux;
        });
    }

    /// Signal both session loops to exit; they drain within a bounded
    /// interval (spec.md §5).
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Default for SubscriptionMux {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_f64_field(v: &serde_json::Value, field: &str) -> Option<f64> {
    v.get(field)?.as_str()?.parse::<f64>().ok()
}

async fn run_session_loop(
    session: Arc<Session>,
    shutdown: Arc<Notify>,
    dispatch: impl Fn(String, serde_json::Value) + Send + Sync + 'static,
) {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!(session = session.kind.name(), "subscription session shutting down");
                return;
            }
            result = connect_and_run(&session, &shutdown, &dispatch) => {
                match result {
                    Ok(()) => {
                        info!(session = session.kind.name(), "subscription session closed cleanly");
                    }
                    Err(e) => {
                        error!(session = session.kind.name(), error = %e, "subscription session error, reconnecting");
                    }
                }
            }
        }

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(session = session.kind.name(), delay = ?delay, "backing off before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.notified() => return,
        }
    }
}

async fn connect_and_run(
    session: &Arc<Session>,
    shutdown: &Arc<Notify>,
    dispatch: &(impl Fn(String, serde_json::Value) + Send + Sync),
) -> anyhow::Result<()> {
    let connect_fut = connect_async(BASE_WS_URL);
    let (ws_stream, _) = tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect_fut)
        .await
        .map_err(|_| anyhow::anyhow!("connect timed out"))??;

    info!(session = session.kind.name(), "upstream session connected");

    let (mut write, mut read) = ws_stream.split();
    let mut confirmed: HashSet<String> = HashSet::new();

    reconcile(session, &mut write, &mut confirmed).await?;

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = shutdown.notified() => return Ok(()),

            _ = session.notify.notified() => {
                reconcile(session, &mut write, &mut confirmed).await?;
            }

            _ = heartbeat.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    return Err(anyhow::anyhow!("heartbeat ping failed"));
                }
            }

            msg = tokio::time::timeout(Duration::from_secs(READ_TIMEOUT_SECS), read.next()) => {
                let msg = msg.map_err(|_| anyhow::anyhow!("read timed out"))?;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(session, &text, dispatch);
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
        }
    }
}

fn handle_frame(
    session: &Arc<Session>,
    text: &str,
    dispatch: &(impl Fn(String, serde_json::Value) + Send + Sync),
) {
    let data: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(session = session.kind.name(), error = %e, "malformed upstream frame");
            return;
        }
    };

    // Ack frame: {"result": null, "id": N} — nothing to dispatch.
    if data.get("id").is_some() && data.get("result").is_some() {
        return;
    }

    let event_type = data.get("e").and_then(|v| v.as_str()).unwrap_or_default();
    if event_type != session.kind.event_type() {
        return;
    }

    let symbol = data
        .get("s")
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();
    if symbol.is_empty() {
        return;
    }

    dispatch(symbol, data);
}

async fn reconcile<S>(
    session: &Arc<Session>,
    write: &mut S,
    confirmed: &mut HashSet<String>,
) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let desired = session.desired.read().clone();
    let (to_add, to_del) = diff_sets(&desired, confirmed);

    send_batched(session, write, "UNSUBSCRIBE", &to_del).await?;
    for s in &to_del {
        confirmed.remove(s);
    }

    send_batched(session, write, "SUBSCRIBE", &to_add).await?;
    for s in &to_add {
        confirmed.insert(s.clone());
    }

    Ok(())
}

async fn send_batched<S>(
    session: &Arc<Session>,
    write: &mut S,
    method: &str,
    symbols: &[String],
) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    if symbols.is_empty() {
        return Ok(());
    }

    for chunk in symbols.chunks(BATCH_SIZE) {
        let params: Vec<String> = chunk.iter().map(|s| session.kind.stream_suffix(s)).collect();
        let id = session.next_id();
        let payload = json!({ "method": method, "params": params, "id": id });
        write.send(Message::Text(payload.to_string())).await?;
        tokio::time::sleep(BATCH_PAUSE).await;
    }

    Ok(())
}
