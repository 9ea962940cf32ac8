// =============================================================================
// ClusterStore — fixed-duration price/volume cluster ring per symbol
// =============================================================================
//
// Ticks are aggregated into fixed-duration clusters (buckets of
// `cluster_interval` seconds) and stored in a fixed-capacity ring indexed by
// `cid mod capacity`. This bounds memory at
// `symbols * max_clusters * sizeof(Cluster)` regardless of tick rate,
// replacing a naive growing hash map of buffered ticks.
//
// A slot whose stored cid differs from the queried cid is treated as absent
// — this is how the ring silently drops clusters once they age past
// `max_clusters` buckets without any explicit eviction bookkeeping.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

/// A finalized or in-progress price/volume aggregate for one time bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cluster {
    pub cid: i64,
    pub p_min: f64,
    pub p_max: f64,
    pub volume_quote: f64,
    pub trades: u64,
}

impl Cluster {
    fn opened(cid: i64, seed_price: f64) -> Self {
        Self {
            cid,
            p_min: seed_price,
            p_max: seed_price,
            volume_quote: 0.0,
            trades: 0,
        }
    }
}

/// Per-symbol ring of clusters plus last-seen bookkeeping.
struct SymbolState {
    ring: Vec<Option<Cluster>>,
    capacity: i64,
    /// Last bucket touched, or -1 if unseeded.
    last_cid: i64,
    /// Most recent observed price, carried forward to seed empty clusters.
    last_price: f64,
}

impl SymbolState {
    fn new(capacity: usize) -> Self {
        Self {
            ring: vec![None; capacity],
            capacity: capacity as i64,
            last_cid: -1,
            last_price: 0.0,
        }
    }

    fn slot_index(&self, cid: i64) -> usize {
        cid.rem_euclid(self.capacity) as usize
    }

    fn open_slot(&mut self, cid: i64, seed_price: f64) {
        let idx = self.slot_index(cid);
        self.ring[idx] = Some(Cluster::opened(cid, seed_price));
    }

    fn update_slot(&mut self, cid: i64, price: f64, qty: f64) {
        let idx = self.slot_index(cid);
        if let Some(cluster) = &mut self.ring[idx] {
            if cluster.cid == cid {
                cluster.p_min = cluster.p_min.min(price);
                cluster.p_max = cluster.p_max.max(price);
                cluster.volume_quote += price * qty;
                cluster.trades += 1;
            }
        }
    }

    fn get(&self, cid: i64) -> Option<Cluster> {
        let idx = self.slot_index(cid);
        match &self.ring[idx] {
            Some(cluster) if cluster.cid == cid => Some(*cluster),
            _ => None,
        }
    }
}

/// Constant-time tick aggregation into fixed-duration clusters, partitioned
/// by symbol.
pub struct ClusterStore {
    cluster_interval: f64,
    capacity: usize,
    symbols: RwLock<HashMap<String, SymbolState>>,
}

impl ClusterStore {
    pub fn new(cluster_interval: f64, capacity: usize) -> Self {
        Self {
            cluster_interval,
            capacity,
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Aggregate one tick into the cluster for its bucket, returning the cids
    /// of any clusters that became finalized as a result (strictly ascending,
    /// possibly empty).
    pub fn add_tick(&self, symbol: &str, ts: f64, price: f64, qty: f64) -> Vec<i64> {
        let cid = (ts / self.cluster_interval).floor() as i64;

        let mut map = self.symbols.write();
        let state = map
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(self.capacity));

        state.last_price = price;

        let mut finalized = Vec::new();

        if state.last_cid < 0 {
            state.open_slot(cid, price);
            state.last_cid = cid;
        } else if cid > state.last_cid {
            finalized.push(state.last_cid);
            for intermediate in (state.last_cid + 1)..cid {
                state.open_slot(intermediate, price);
                finalized.push(intermediate);
            }
            state.open_slot(cid, price);
            state.last_cid = cid;
        }

        state.update_slot(cid, price, qty);

        finalized
    }

    /// O(1) lookup honoring the cid-match rule: a stale or empty slot reads
    /// as absent.
    pub fn get_cluster(&self, symbol: &str, cid: i64) -> Option<Cluster> {
        let map = self.symbols.read();
        map.get(symbol).and_then(|s| s.get(cid))
    }

    /// Most recently observed price for `symbol`, if any tick has arrived.
    pub fn get_last_price(&self, symbol: &str) -> Option<f64> {
        let map = self.symbols.read();
        map.get(symbol).and_then(|s| {
            if s.last_cid < 0 {
                None
            } else {
                Some(s.last_price)
            }
        })
    }

    /// Walk `from_cid, from_cid-1, ...`, stopping at the first ring gap or
    /// after `max_count` clusters, whichever comes first. Returned order is
    /// newest-first (matching the walk direction).
    pub fn iter_recent(&self, symbol: &str, from_cid: i64, max_count: usize) -> Vec<Cluster> {
        let map = self.symbols.read();
        let Some(state) = map.get(symbol) else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(max_count.min(state.capacity as usize));
        let mut cid = from_cid;
        while out.len() < max_count {
            match state.get(cid) {
                Some(cluster) => out.push(cluster),
                None => break,
            }
            cid -= 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_silent_gap_backfills_and_finalizes() {
        let store = ClusterStore::new(0.05, 150);

        let first = store.add_tick("btcusdt", 0.00, 100.0, 1.0);
        assert!(first.is_empty());

        let second = store.add_tick("btcusdt", 0.40, 100.0, 1.0);
        assert_eq!(second, vec![0, 1, 2, 3, 4, 5, 6, 7]);

        // Clusters 0 (seeded by the first tick) through 8 (the still-open
        // current cluster, seeded by the second tick) are all contiguous, so
        // the walk covers all nine before hitting the gap at cid -1.
        let recent = store.iter_recent("btcusdt", 8, 10);
        assert_eq!(recent.len(), 9);
        for cluster in &recent {
            assert_eq!(cluster.p_min, 100.0);
            assert_eq!(cluster.p_max, 100.0);
        }
        // Newest-first: index 0 is cid 8, index 8 is cid 0.
        assert_eq!(recent[0].cid, 8);
        assert_eq!(recent[0].trades, 1);
        assert_eq!(recent[8].cid, 0);
        assert_eq!(recent[8].trades, 1);
        for cluster in &recent[1..8] {
            assert_eq!(cluster.trades, 0);
        }
    }

    #[test]
    fn add_tick_returns_strictly_ascending_cids() {
        let store = ClusterStore::new(0.05, 150);
        store.add_tick("ethusdt", 0.0, 100.0, 1.0);
        let finalized = store.add_tick("ethusdt", 1.0, 101.0, 1.0);
        for w in finalized.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn get_cluster_honors_cid_match_rule() {
        let store = ClusterStore::new(0.05, 4);
        store.add_tick("btcusdt", 0.0, 100.0, 1.0);
        // Advance far enough to wrap the ring past capacity; cid 0's slot
        // gets reused by a later cid and must read as absent.
        store.add_tick("btcusdt", 1.0, 100.0, 1.0); // cid 20, capacity 4 -> wraps many times
        assert!(store.get_cluster("btcusdt", 0).is_none());
    }

    #[test]
    fn iter_recent_stops_at_gap() {
        let store = ClusterStore::new(0.05, 150);
        // No ticks at all for this symbol.
        assert!(store.iter_recent("xrpusdt", 10, 5).is_empty());
    }

    #[test]
    fn same_cluster_accumulates_multiple_trades() {
        let store = ClusterStore::new(0.05, 150);
        store.add_tick("btcusdt", 0.0, 100.0, 1.0);
        store.add_tick("btcusdt", 0.01, 102.0, 2.0);
        store.add_tick("btcusdt", 0.02, 98.0, 1.0);

        let cluster = store.get_cluster("btcusdt", 0).unwrap();
        assert_eq!(cluster.trades, 3);
        assert_eq!(cluster.p_min, 98.0);
        assert_eq!(cluster.p_max, 102.0);
        assert_eq!(cluster.volume_quote, 100.0 * 1.0 + 102.0 * 2.0 + 98.0 * 1.0);
    }

    #[test]
    fn last_price_tracks_latest_tick() {
        let store = ClusterStore::new(0.05, 150);
        assert!(store.get_last_price("btcusdt").is_none());
        store.add_tick("btcusdt", 0.0, 100.0, 1.0);
        assert_eq!(store.get_last_price("btcusdt"), Some(100.0));
        store.add_tick("btcusdt", 0.01, 105.0, 1.0);
        assert_eq!(store.get_last_price("btcusdt"), Some(105.0));
    }
}
