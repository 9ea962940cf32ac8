// =============================================================================
// ATRAccumulator — mean-range volatility estimate from closed minute bars
// =============================================================================
//
// Deliberately uses range-only True Range (high - low), not classic Wilder TR
// (which also considers the gap to the previous close). This is a calibrated
// simplification the detector's ATR_MULTIPLIER is tuned against; preserve it
// bit-for-bit rather than "fixing" it to classic TR.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::cluster_store::Cluster;

/// One minute-bucket high/low range, accumulated from closed clusters.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bar {
    bucket: i64,
    high: f64,
    low: f64,
}

impl Bar {
    fn range(&self) -> f64 {
        self.high - self.low
    }
}

struct AtrState {
    current_bar: Option<Bar>,
    closed_bars: VecDeque<Bar>,
    atr: Option<f64>,
    period: usize,
}

impl AtrState {
    fn new(period: usize) -> Self {
        Self {
            current_bar: None,
            closed_bars: VecDeque::with_capacity(period),
            atr: None,
            period,
        }
    }

    fn recompute_atr(&mut self) {
        if self.closed_bars.is_empty() {
            self.atr = None;
            return;
        }
        let sum: f64 = self.closed_bars.iter().map(Bar::range).sum();
        self.atr = Some(sum / self.closed_bars.len() as f64);
    }
}

/// Consumes finalized clusters and maintains a bounded FIFO of one-minute
/// bars per symbol, exposing the current ATR (mean range of closed bars).
pub struct ATRAccumulator {
    candle_timeframe_sec: i64,
    period: usize,
    states: RwLock<HashMap<String, AtrState>>,
}

impl ATRAccumulator {
    pub fn new(candle_timeframe_sec: i64, period: usize) -> Self {
        Self {
            candle_timeframe_sec,
            period,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a finalized cluster's extremes into the current bar for its
    /// minute bucket. Call at most once per distinct bucket represented by a
    /// batch of finalized clusters (the latest cluster of that bucket).
    pub fn on_cluster_close(&self, symbol: &str, cluster: &Cluster, close_ts: f64) {
        let bucket = (close_ts / self.candle_timeframe_sec as f64).floor() as i64;

        let mut map = self.states.write();
        let state = map
            .entry(symbol.to_string())
            .or_insert_with(|| AtrState::new(self.period));

        match &mut state.current_bar {
            Some(bar) if bar.bucket == bucket => {
                bar.high = bar.high.max(cluster.p_max);
                bar.low = bar.low.min(cluster.p_min);
            }
            Some(bar) => {
                let closed = *bar;
                state.closed_bars.push_back(closed);
                while state.closed_bars.len() > state.period {
                    state.closed_bars.pop_front();
                }
                state.recompute_atr();
                state.current_bar = Some(Bar {
                    bucket,
                    high: cluster.p_max,
                    low: cluster.p_min,
                });
            }
            None => {
                state.current_bar = Some(Bar {
                    bucket,
                    high: cluster.p_max,
                    low: cluster.p_min,
                });
            }
        }
    }

    /// Current ATR for `symbol`: the mean range over closed bars, or `None`
    /// if no bar has closed yet.
    pub fn get_atr(&self, symbol: &str) -> Option<f64> {
        let map = self.states.read();
        map.get(symbol).and_then(|s| s.atr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(p_min: f64, p_max: f64) -> Cluster {
        Cluster {
            cid: 0,
            p_min,
            p_max,
            volume_quote: 0.0,
            trades: 1,
        }
    }

    #[test]
    fn no_atr_until_a_bar_closes() {
        let acc = ATRAccumulator::new(60, 14);
        acc.on_cluster_close("btcusdt", &cluster(99.0, 101.0), 0.0);
        assert!(acc.get_atr("btcusdt").is_none());
    }

    #[test]
    fn atr_is_mean_of_closed_bar_ranges() {
        let acc = ATRAccumulator::new(60, 14);
        // Bar 0: range 2 (closes when bar 1 opens).
        acc.on_cluster_close("btcusdt", &cluster(99.0, 101.0), 0.0);
        acc.on_cluster_close("btcusdt", &cluster(100.0, 104.0), 60.0);
        assert_eq!(acc.get_atr("btcusdt"), Some(2.0));

        // Bar 1: range 4 (closes when bar 2 opens) -> mean of [2,4] = 3.
        acc.on_cluster_close("btcusdt", &cluster(100.0, 100.0), 120.0);
        assert_eq!(acc.get_atr("btcusdt"), Some(3.0));
    }

    #[test]
    fn intra_bar_updates_never_change_atr() {
        let acc = ATRAccumulator::new(60, 14);
        acc.on_cluster_close("btcusdt", &cluster(99.0, 101.0), 0.0);
        acc.on_cluster_close("btcusdt", &cluster(98.0, 102.0), 30.0); // same bucket
        assert!(acc.get_atr("btcusdt").is_none());
        acc.on_cluster_close("btcusdt", &cluster(100.0, 100.0), 60.0); // closes bar 0
        // Widened bar 0 range is 102 - 98 = 4.
        assert_eq!(acc.get_atr("btcusdt"), Some(4.0));
    }

    #[test]
    fn fifo_evicts_beyond_period() {
        let acc = ATRAccumulator::new(60, 2);
        for i in 0..5 {
            acc.on_cluster_close("btcusdt", &cluster(100.0, 100.0 + i as f64), (i * 60) as f64);
        }
        // Only the last 2 closed bars contribute; ranges close out as
        // [0,1,2,3] once bar 4 opens (bar 4 itself stays current/open).
        let atr = acc.get_atr("btcusdt").unwrap();
        assert_eq!(atr, 2.5); // mean of ranges 2 and 3
    }

    #[test]
    fn atr_is_per_symbol() {
        let acc = ATRAccumulator::new(60, 14);
        acc.on_cluster_close("btcusdt", &cluster(99.0, 101.0), 0.0);
        acc.on_cluster_close("btcusdt", &cluster(100.0, 100.0), 60.0);
        assert!(acc.get_atr("ethusdt").is_none());
    }
}
