// =============================================================================
// ScreenerEngine — composition root: routing, detection, and delivery
// =============================================================================
//
// Wires tick ingestion into ClusterStore/ATRAccumulator, runs a small worker
// pool draining a bounded detector queue, and on each impulse fans it out to
// PushHub (per-user, filtered) and the chat sink (admin + per-user).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::atr::ATRAccumulator;
use crate::chat_sink::{ChatSink, ChatTarget};
use crate::cluster_store::ClusterStore;
use crate::config::ScreenerConfig;
use crate::detector::{AlertState, ImpulseDetector, ImpulseEvent};
use crate::mux::SubscriptionMux;
use crate::push_hub::protocol::{ImpulsePush, ServerMessage};
use crate::push_hub::PushHub;
use crate::time::now_secs;
use crate::universe::{UniverseFetcher, UniverseSnapshot};
use crate::user_store::UserStore;

/// One pending detector-check job: the symbol and the most recently
/// finalized cluster id to check against.
type DetectorJob = (String, i64);

/// Composition root for the screener pipeline.
pub struct ScreenerEngine {
    config: ScreenerConfig,
    cluster_store: Arc<ClusterStore>,
    atr_accumulator: Arc<ATRAccumulator>,
    alert_state: Arc<AlertState>,
    detector: Arc<ImpulseDetector>,
    mux: Arc<SubscriptionMux>,
    push_hub: Arc<PushHub>,
    user_store: Arc<UserStore>,
    chat_sink: Arc<dyn ChatSink>,
    universe: RwLock<UniverseSnapshot>,
    detector_tx: mpsc::Sender<DetectorJob>,
    detector_rx: parking_lot::Mutex<Option<mpsc::Receiver<DetectorJob>>>,
}

impl ScreenerEngine {
    pub fn new(
        config: ScreenerConfig,
        push_hub: Arc<PushHub>,
        user_store: Arc<UserStore>,
        chat_sink: Arc<dyn ChatSink>,
    ) -> Arc<Self> {
        let (detector_tx, detector_rx) = mpsc::channel(config.detector_queue_capacity);

        let detector = Arc::new(ImpulseDetector {
            atr_multiplier: config.atr_multiplier,
            impulse_min_clusters: config.impulse_min_clusters,
            impulse_min_trades: config.impulse_min_trades,
            impulse_max_clusters: config.max_clusters,
            anti_spam_per_symbol: config.anti_spam_per_symbol,
            anti_spam_burst_count: config.anti_spam_burst_count,
            anti_spam_burst_window: config.anti_spam_burst_window,
            anti_spam_silence: config.anti_spam_silence,
        });

        Arc::new(Self {
            cluster_store: Arc::new(ClusterStore::new(config.cluster_interval, config.max_clusters)),
            atr_accumulator: Arc::new(ATRAccumulator::new(config.candle_timeframe_sec, config.atr_period)),
            alert_state: Arc::new(AlertState::new()),
            detector,
            mux: Arc::new(SubscriptionMux::new()),
            push_hub,
            user_store,
            chat_sink,
            universe: RwLock::new(UniverseSnapshot::default()),
            detector_tx,
            detector_rx: parking_lot::Mutex::new(Some(detector_rx)),
            config,
        })
    }

    /// Start the subscription mux, detector worker pool, and universe
    /// refresh loop. Does not start the PushHub's Axum listener — the
    /// caller does that separately (it owns the bind lifecycle).
    pub fn start(self: &Arc<Self>, universe_fetcher: Arc<dyn UniverseFetcher>) {
        self.spawn_tick_handlers();
        self.spawn_detector_workers();
        self.spawn_universe_refresh(universe_fetcher);
    }

    fn spawn_tick_handlers(self: &Arc<Self>) {
        let engine = self.clone();
        let on_trade = Arc::new(move |symbol: &str, price: f64, qty: f64| {
            engine.on_trade_tick(symbol, price, qty);
        });

        // Mark-price ticks are consumed for future use (e.g. mark-delta
        // filters) but do not drive cluster aggregation.
        let on_mark = Arc::new(move |_symbol: &str, _price: f64| {});

        self.mux.start(on_trade, on_mark);
    }

    /// Non-suspending tick handler: mutates ClusterStore/ATRAccumulator only
    /// and offers a detector job, never touching the network layer.
    fn on_trade_tick(&self, symbol: &str, price: f64, qty: f64) {
        let ts = now_secs();
        let finalized = self.cluster_store.add_tick(symbol, ts, price, qty);
        if finalized.is_empty() {
            return;
        }

        let mut last_bucket: Option<i64> = None;
        for &cid in &finalized {
            let close_ts = (cid + 1) as f64 * self.config.cluster_interval;
            let bucket = (close_ts / self.config.candle_timeframe_sec as f64).floor() as i64;
            if last_bucket != Some(bucket) {
                if let Some(cluster) = self.cluster_store.get_cluster(symbol, cid) {
                    self.atr_accumulator.on_cluster_close(symbol, &cluster, close_ts);
                }
                last_bucket = Some(bucket);
            }
        }

        let last_cid = *finalized.last().unwrap();
        if self.detector_tx.try_send((symbol.to_string(), last_cid)).is_err() {
            warn!(symbol, "detector queue full, dropping check");
        }
    }

    fn spawn_detector_workers(self: &Arc<Self>) {
        let rx = self
            .detector_rx
            .lock()
            .take()
            .expect("detector workers already started");
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..self.config.detector_workers {
            let engine = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some((symbol, last_cid)) = job else {
                        info!(worker_id, "detector worker exiting: queue closed");
                        return;
                    };
                    engine.run_detector_check(&symbol, last_cid);
                }
            });
        }
    }

    fn run_detector_check(&self, symbol: &str, last_cid: i64) {
        let threshold = {
            let universe = self.universe.read();
            universe.threshold_for(symbol, self.config.impulse_fixed_threshold_pct)
        };

        let event = self.detector.check(
            symbol,
            last_cid,
            &self.cluster_store,
            &self.atr_accumulator,
            &self.alert_state,
            threshold,
            now_secs(),
        );

        if let Some(event) = event {
            self.deliver(event);
        }
    }

    fn deliver(&self, event: ImpulseEvent) {
        self.log_impulse(&event);

        let universe = self.universe.read();
        let thresholds_view = serde_json::json!({
            "volume_threshold": universe.volumes.get(&event.symbol).copied().unwrap_or(0.0),
            "min_trades_24h": universe.trades_24h.get(&event.symbol).copied().unwrap_or(0),
            "orderbook_min_bid": universe.orderbook.get(&event.symbol).map(|o| o.bid).unwrap_or(0.0),
            "orderbook_min_ask": universe.orderbook.get(&event.symbol).map(|o| o.ask).unwrap_or(0.0),
        });
        drop(universe);

        let push = ImpulsePush::new(
            event.symbol.clone(),
            event.impulse_trades,
            event.timestamp,
            &thresholds_view,
        );

        self.chat_sink.send(ChatTarget::Admin, format_admin_message(&event));

        for user in self.user_store.all_users() {
            if !filter_passes(&user.filters, &thresholds_view, &push) {
                continue;
            }
            self.push_hub
                .send_to_user(&user.user_id, &ServerMessage::Impulse(push.clone()));
            if let Some(chat_id) = user.chat_id {
                self.chat_sink
                    .send(ChatTarget::Chat(chat_id), format_admin_message(&event));
            }
        }
    }

    /// Current top-N symbols by 24h quote volume, for the `get_top` wire
    /// command.
    pub fn top_by_volume(&self, n: usize) -> Vec<(String, f64)> {
        let universe = self.universe.read();
        let mut items: Vec<(String, f64)> = universe.volumes.iter().map(|(s, v)| (s.clone(), *v)).collect();
        items.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        items.truncate(n);
        items
    }

    fn log_impulse(&self, event: &ImpulseEvent) {
        let Some(path) = &self.config.impulse_log_path else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialise impulse event for logging");
                return;
            }
        };
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(error = %e, path, "failed to append impulse log entry");
        }
    }

    fn spawn_universe_refresh(self: &Arc<Self>, fetcher: Arc<dyn UniverseFetcher>) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match fetcher.fetch().await {
                    Ok(snapshot) => {
                        let symbols = if engine.config.symbols.is_empty() {
                            snapshot.symbols()
                        } else {
                            engine.config.symbols.clone()
                        };
                        info!(count = symbols.len(), "universe refreshed");
                        engine.mux.set_symbols(&symbols);
                        *engine.universe.write() = snapshot;
                    }
                    Err(e) => {
                        warn!(error = %e, "universe fetch failed, keeping previous snapshot");
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
        });
    }
}

/// Per-user allow-list filter predicate (spec.md §6): an event passes if,
/// for every allow-listed key, the corresponding wire field meets the
/// user's configured floor.
fn filter_passes(user_cfg: &Map<String, Value>, thresholds: &Value, push: &ImpulsePush) -> bool {
    let fields: HashMap<&str, f64> = HashMap::from([
        ("volume_threshold", thresholds.get("volume_threshold").and_then(|v| v.as_f64()).unwrap_or(0.0)),
        ("min_trades_24h", thresholds.get("min_trades_24h").and_then(|v| v.as_f64()).unwrap_or(0.0)),
        (
            "orderbook_min_bid",
            thresholds.get("orderbook_min_bid").and_then(|v| v.as_f64()).unwrap_or(0.0),
        ),
        (
            "orderbook_min_ask",
            thresholds.get("orderbook_min_ask").and_then(|v| v.as_f64()).unwrap_or(0.0),
        ),
        ("impulse_trades", push.impulse_trades as f64),
    ]);

    for (key, value) in &fields {
        let floor = user_cfg.get(*key).and_then(|v| v.as_f64()).unwrap_or(0.0);
        if *value < floor {
            return false;
        }
    }
    true
}

fn format_admin_message(event: &ImpulseEvent) -> String {
    let direction = if event.trigger_price >= event.ref_price {
        "pump"
    } else {
        "dump"
    };
    format!(
        "{} {} — {:.2}% from {} to {} ({} trades, {:.2} ATR)",
        event.symbol.to_uppercase(),
        direction,
        event.change_percent_from_start,
        event.ref_price,
        event.trigger_price,
        event.impulse_trades,
        event.atr_from_start,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_passes_requires_every_key_above_floor() {
        let mut cfg = Map::new();
        cfg.insert("volume_threshold".to_string(), serde_json::json!(10e6));
        cfg.insert("min_trades_24h".to_string(), serde_json::json!(10_000));
        cfg.insert("orderbook_min_bid".to_string(), serde_json::json!(20_000));
        cfg.insert("orderbook_min_ask".to_string(), serde_json::json!(20_000));
        cfg.insert("impulse_trades".to_string(), serde_json::json!(1000));

        let thresholds = serde_json::json!({
            "volume_threshold": 20e6,
            "min_trades_24h": 15000,
            "orderbook_min_bid": 25000,
            "orderbook_min_ask": 25000,
        });
        let push = ImpulsePush::new("btcusdt".to_string(), 1200, 1.0, &thresholds);

        assert!(filter_passes(&cfg, &thresholds, &push));
    }

    #[test]
    fn filter_blocks_when_one_key_is_below_floor() {
        let mut cfg = Map::new();
        cfg.insert("volume_threshold".to_string(), serde_json::json!(100e6));
        cfg.insert("min_trades_24h".to_string(), serde_json::json!(10_000));
        cfg.insert("orderbook_min_bid".to_string(), serde_json::json!(20_000));
        cfg.insert("orderbook_min_ask".to_string(), serde_json::json!(20_000));
        cfg.insert("impulse_trades".to_string(), serde_json::json!(1000));

        let thresholds = serde_json::json!({
            "volume_threshold": 20e6,
            "min_trades_24h": 15000,
            "orderbook_min_bid": 25000,
            "orderbook_min_ask": 25000,
        });
        let push = ImpulsePush::new("btcusdt".to_string(), 1200, 1.0, &thresholds);

        assert!(!filter_passes(&cfg, &thresholds, &push));
    }

    #[test]
    fn admin_message_labels_pump_and_dump() {
        let base = ImpulseEvent {
            symbol: "ethusdt".to_string(),
            ref_price: 100.0,
            trigger_price: 105.0,
            max_delta_price: 105.0,
            change_percent_from_start: 5.0,
            change_percent_max_delta: 5.0,
            atr_from_start: 2.0,
            atr_max_delta: 2.0,
            impulse_trades: 1200,
            impulse_volume_quote: 1000.0,
            reason: vec!["atr", "threshold", "trades"],
            timestamp: 1.0,
        };
        assert!(format_admin_message(&base).contains("pump"));

        let mut dump = base;
        dump.trigger_price = 95.0;
        assert!(format_admin_message(&dump).contains("dump"));
    }
}
