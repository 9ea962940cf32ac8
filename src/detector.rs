// =============================================================================
// ImpulseDetector — ATR- and percentage-gated price excursion detector
// =============================================================================
//
// On each finalized cluster, scans recent clusters backwards from the most
// recent to locate the earliest (in walk order, i.e. closest in time to now)
// reference price whose delta to the current price clears both an
// ATR-multiple and a percentage threshold, subject to a minimum trade count
// and per-symbol/global anti-spam gates.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::cluster_store::ClusterStore;
use crate::atr::ATRAccumulator;

/// A detected price excursion, ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct ImpulseEvent {
    pub symbol: String,
    pub ref_price: f64,
    pub trigger_price: f64,
    pub max_delta_price: f64,
    pub change_percent_from_start: f64,
    pub change_percent_max_delta: f64,
    pub atr_from_start: f64,
    pub atr_max_delta: f64,
    pub impulse_trades: u64,
    pub impulse_volume_quote: f64,
    pub reason: Vec<&'static str>,
    pub timestamp: f64,
}

struct AlertStateInner {
    last_alert_time: HashMap<String, f64>,
    recent_alert_times: VecDeque<f64>,
    silence_until: f64,
}

/// Per-engine anti-spam bookkeeping: per-symbol cooldown plus a global burst
/// silence shared across all symbols.
pub struct AlertState {
    inner: Mutex<AlertStateInner>,
}

impl AlertState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AlertStateInner {
                last_alert_time: HashMap::new(),
                recent_alert_times: VecDeque::new(),
                silence_until: 0.0,
            }),
        }
    }
}

impl Default for AlertState {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration consumed by [`ImpulseDetector::check`]; owned by the caller
/// (the screener engine) and shared across detector workers.
pub struct ImpulseDetector {
    pub atr_multiplier: f64,
    pub impulse_min_clusters: usize,
    pub impulse_min_trades: u64,
    pub impulse_max_clusters: usize,
    pub anti_spam_per_symbol: f64,
    pub anti_spam_burst_count: usize,
    pub anti_spam_burst_window: f64,
    pub anti_spam_silence: f64,
}

impl ImpulseDetector {
    /// Run the detector for `symbol` given the cluster(s) most recently
    /// finalized up through `last_closed_cid`.
    pub fn check(
        &self,
        symbol: &str,
        last_closed_cid: i64,
        cluster_store: &ClusterStore,
        atr_accumulator: &ATRAccumulator,
        alert_state: &AlertState,
        symbol_threshold_pct: f64,
        now: f64,
    ) -> Option<ImpulseEvent> {
        let cur_price = cluster_store.get_last_price(symbol)?;
        let atr = atr_accumulator.get_atr(symbol)?;

        let clusters = cluster_store.iter_recent(symbol, last_closed_cid, self.impulse_max_clusters);

        let mut ref_price: Option<f64> = None;
        let mut ref_cid: Option<i64> = None;
        let mut max_delta = 0.0_f64;
        let mut max_delta_price = cur_price;

        for (visited_index, cluster) in clusters.iter().enumerate() {
            let visited_count = visited_index + 1;

            for &p in &[cluster.p_min, cluster.p_max] {
                let delta_abs = (cur_price - p).abs();
                if delta_abs > max_delta {
                    max_delta = delta_abs;
                    max_delta_price = p;
                }

                if ref_price.is_none() && visited_count >= self.impulse_min_clusters {
                    let delta_pct = if p != 0.0 { delta_abs / p * 100.0 } else { 0.0 };
                    if delta_abs >= self.atr_multiplier * atr && delta_pct >= symbol_threshold_pct {
                        ref_price = Some(p);
                        ref_cid = Some(cluster.cid);
                    }
                }
            }
        }

        let (ref_price, ref_cid) = match (ref_price, ref_cid) {
            (Some(p), Some(c)) => (p, c),
            _ => return None,
        };

        // Second bounded iteration: sum trades/volume across [ref_cid, last_closed_cid].
        let span = (last_closed_cid - ref_cid + 1).max(0) as usize;
        let window = cluster_store.iter_recent(symbol, last_closed_cid, span);
        let mut impulse_trades: u64 = 0;
        let mut impulse_volume_quote: f64 = 0.0;
        for cluster in &window {
            if cluster.cid >= ref_cid {
                impulse_trades += cluster.trades;
                impulse_volume_quote += cluster.volume_quote;
            }
        }

        if impulse_trades < self.impulse_min_trades {
            return None;
        }

        // Anti-spam gates, evaluated and mutated atomically.
        {
            let mut state = alert_state.inner.lock();

            let last_alert = *state.last_alert_time.get(symbol).unwrap_or(&f64::NEG_INFINITY);
            if now - last_alert < self.anti_spam_per_symbol {
                return None;
            }
            if now < state.silence_until {
                return None;
            }

            state.recent_alert_times.push_back(now);
            let cutoff = now - self.anti_spam_burst_window;
            while let Some(&front) = state.recent_alert_times.front() {
                if front < cutoff {
                    state.recent_alert_times.pop_front();
                } else {
                    break;
                }
            }
            if state.recent_alert_times.len() >= self.anti_spam_burst_count {
                state.silence_until = now + self.anti_spam_silence;
                return None;
            }

            state.last_alert_time.insert(symbol.to_string(), now);
        }

        Some(ImpulseEvent {
            symbol: symbol.to_string(),
            ref_price,
            trigger_price: cur_price,
            max_delta_price,
            change_percent_from_start: (cur_price - ref_price) / ref_price * 100.0,
            change_percent_max_delta: if max_delta_price != 0.0 {
                max_delta / max_delta_price * 100.0
            } else {
                0.0
            },
            atr_from_start: (cur_price - ref_price).abs() / atr,
            atr_max_delta: max_delta / atr,
            impulse_trades,
            impulse_volume_quote,
            reason: vec!["atr", "threshold", "trades"],
            timestamp: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ImpulseDetector {
        ImpulseDetector {
            atr_multiplier: 2.0,
            impulse_min_clusters: 1,
            impulse_min_trades: 1,
            impulse_max_clusters: 150,
            anti_spam_per_symbol: 180.0,
            anti_spam_burst_count: 5,
            anti_spam_burst_window: 30.0,
            anti_spam_silence: 30.0,
        }
    }

    #[test]
    fn missing_price_or_atr_returns_none() {
        let store = ClusterStore::new(0.1, 150);
        let acc = ATRAccumulator::new(60, 14);
        let alerts = AlertState::new();
        let det = detector();
        assert!(det
            .check("btcusdt", 10, &store, &acc, &alerts, 1.0, 1000.0)
            .is_none());
    }

    #[test]
    fn threshold_trigger_fires_with_expected_fields() {
        let store = ClusterStore::new(0.1, 150);
        let acc = ATRAccumulator::new(60, 14);
        let alerts = AlertState::new();
        let mut det = detector();
        det.atr_multiplier = 2.0;
        det.impulse_min_trades = 1;

        // Seed a ref cluster at 100, then drift up to 105 with enough
        // clusters/trades in between.
        for i in 0..3 {
            store.add_tick("btcusdt", i as f64 * 0.1, 100.0, 1.0);
        }
        for i in 3..6 {
            store.add_tick("btcusdt", i as f64 * 0.1, 105.0, 1.0);
        }
        // Feed two closed bars so ATR = 0.5 deterministically via direct
        // bar seeding instead of depending on cluster timing.
        acc.on_cluster_close(
            "btcusdt",
            &crate::cluster_store::Cluster {
                cid: 0,
                p_min: 100.0,
                p_max: 100.5,
                volume_quote: 0.0,
                trades: 0,
            },
            0.0,
        );
        acc.on_cluster_close(
            "btcusdt",
            &crate::cluster_store::Cluster {
                cid: 1,
                p_min: 100.0,
                p_max: 100.0,
                volume_quote: 0.0,
                trades: 0,
            },
            60.0,
        );
        assert_eq!(acc.get_atr("btcusdt"), Some(0.5));

        let last_cid = 5;
        let event = det
            .check("btcusdt", last_cid, &store, &acc, &alerts, 1.0, 1000.0)
            .expect("expected impulse");
        assert_eq!(event.ref_price, 100.0);
        assert!((event.change_percent_from_start - 5.0).abs() < 1e-9);
        assert_eq!(event.reason, vec!["atr", "threshold", "trades"]);
    }

    #[test]
    fn cooldown_blocks_second_trigger_within_window() {
        let store = ClusterStore::new(0.1, 150);
        let acc = ATRAccumulator::new(60, 14);
        let alerts = AlertState::new();
        let det = detector();

        for i in 0..6 {
            let price = if i < 3 { 100.0 } else { 105.0 };
            store.add_tick("btcusdt", i as f64 * 0.1, price, 1.0);
        }
        acc.on_cluster_close(
            "btcusdt",
            &crate::cluster_store::Cluster {
                cid: 0,
                p_min: 100.0,
                p_max: 100.5,
                volume_quote: 0.0,
                trades: 0,
            },
            0.0,
        );
        acc.on_cluster_close(
            "btcusdt",
            &crate::cluster_store::Cluster {
                cid: 1,
                p_min: 100.0,
                p_max: 100.0,
                volume_quote: 0.0,
                trades: 0,
            },
            60.0,
        );

        let last_cid = 5;
        let first = det.check("btcusdt", last_cid, &store, &acc, &alerts, 1.0, 1000.0);
        assert!(first.is_some());

        let second = det.check(
            "btcusdt",
            last_cid,
            &store,
            &acc,
            &alerts,
            1.0,
            1000.0 + det.anti_spam_per_symbol - 1.0,
        );
        assert!(second.is_none());

        let third = det.check(
            "btcusdt",
            last_cid,
            &store,
            &acc,
            &alerts,
            1.0,
            1000.0 + det.anti_spam_per_symbol + 1.0,
        );
        assert!(third.is_some());
    }

    #[test]
    fn burst_silence_blocks_further_triggers() {
        let store = ClusterStore::new(0.1, 150);
        let acc = ATRAccumulator::new(60, 14);
        let alerts = AlertState::new();
        let mut det = detector();
        det.anti_spam_per_symbol = 0.0;
        det.anti_spam_burst_count = 3;
        det.anti_spam_burst_window = 30.0;
        det.anti_spam_silence = 30.0;

        acc.on_cluster_close(
            "btcusdt",
            &crate::cluster_store::Cluster {
                cid: 0,
                p_min: 100.0,
                p_max: 100.5,
                volume_quote: 0.0,
                trades: 0,
            },
            0.0,
        );
        acc.on_cluster_close(
            "btcusdt",
            &crate::cluster_store::Cluster {
                cid: 1,
                p_min: 100.0,
                p_max: 100.0,
                volume_quote: 0.0,
                trades: 0,
            },
            60.0,
        );

        let symbols = ["a", "b", "c", "d"];
        for (i, sym) in symbols.iter().enumerate() {
            for t in 0..6 {
                let price = if t < 3 { 100.0 } else { 105.0 };
                store.add_tick(sym, t as f64 * 0.1, price, 1.0);
            }
            acc.on_cluster_close(
                sym,
                &crate::cluster_store::Cluster {
                    cid: 0,
                    p_min: 100.0,
                    p_max: 100.5,
                    volume_quote: 0.0,
                    trades: 0,
                },
                0.0,
            );
            acc.on_cluster_close(
                sym,
                &crate::cluster_store::Cluster {
                    cid: 1,
                    p_min: 100.0,
                    p_max: 100.0,
                    volume_quote: 0.0,
                    trades: 0,
                },
                60.0,
            );
            let result = det.check(sym, 5, &store, &acc, &alerts, 1.0, 1000.0 + i as f64);
            if i < 2 {
                assert!(result.is_some(), "expected trigger for {sym}");
            } else {
                assert!(result.is_none(), "expected silence for {sym}");
            }
        }
    }
}
