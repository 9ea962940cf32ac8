// =============================================================================
// UniverseFetcher — perpetual-futures symbol universe from venue REST
// =============================================================================
//
// Produces the periodic snapshot the engine reconciles SubscriptionMux
// against: active USDT perpetuals above a volume/trade-count/orderbook-depth
// floor, each with a per-symbol impulse threshold (fixed percentage, or
// volume-scaled when dynamic thresholding is enabled).
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

const EXCHANGE_INFO_URL: &str = "https://fapi.binance.com/fapi/v1/exchangeInfo";
const TICKER_24HR_URL: &str = "https://fapi.binance.com/fapi/v1/ticker/24hr";
const DEPTH_URL: &str = "https://fapi.binance.com/fapi/v1/depth";

const IMPULSE_VOL_MIN: f64 = 20e6;
const IMPULSE_VOL_MAX: f64 = 1e9;
const IMPULSE_P_MIN: f64 = 0.5;
const IMPULSE_P_MAX: f64 = 3.0;
const IMPULSE_EXPONENT: f64 = 1.0;

/// Per-symbol orderbook top-depth volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderbookDepth {
    pub bid: f64,
    pub ask: f64,
}

/// One refreshed view of the tradeable universe.
#[derive(Debug, Clone, Default)]
pub struct UniverseSnapshot {
    pub volumes: HashMap<String, f64>,
    pub thresholds: HashMap<String, f64>,
    pub trades_24h: HashMap<String, u64>,
    pub orderbook: HashMap<String, OrderbookDepth>,
}

impl UniverseSnapshot {
    pub fn symbols(&self) -> Vec<String> {
        self.volumes.keys().cloned().collect()
    }

    pub fn threshold_for(&self, symbol: &str, fallback: f64) -> f64 {
        self.thresholds.get(symbol).copied().unwrap_or(fallback)
    }
}

/// Volume-scaled impulse threshold: log-interpolates between
/// `IMPULSE_P_MAX` (low volume, twitchy) and `IMPULSE_P_MIN` (high volume,
/// calmer) across `[IMPULSE_VOL_MIN, IMPULSE_VOL_MAX]`.
pub fn dynamic_impulse_threshold(volume: f64) -> f64 {
    let x = volume.clamp(IMPULSE_VOL_MIN, IMPULSE_VOL_MAX);
    let norm = (x.log10() - IMPULSE_VOL_MIN.log10()) / (IMPULSE_VOL_MAX.log10() - IMPULSE_VOL_MIN.log10());
    let factor = norm.powf(IMPULSE_EXPONENT);
    let percent = IMPULSE_P_MAX - (IMPULSE_P_MAX - IMPULSE_P_MIN) * factor;
    (percent * 1000.0).round() / 1000.0
}

/// Produces a fresh [`UniverseSnapshot`], typically called hourly by the
/// engine.
#[async_trait::async_trait]
pub trait UniverseFetcher: Send + Sync {
    async fn fetch(&self) -> Result<UniverseSnapshot>;
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    #[serde(rename = "contractType")]
    contract_type: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
struct Ticker24hr {
    symbol: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
    count: u64,
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// Configuration mirroring the original's filter/threshold tunables.
#[derive(Debug, Clone)]
pub struct UniverseFetcherConfig {
    pub exclude_symbols: Vec<String>,
    pub volume_threshold: f64,
    pub min_trades: u64,
    pub orderbook_min_bid: f64,
    pub orderbook_min_ask: f64,
    pub enable_dynamic_threshold: bool,
    pub impulse_fixed_threshold_pct: f64,
}

/// Fetches the live Binance USDT-perpetual universe over REST.
pub struct BinanceUniverseFetcher {
    client: Client,
    config: UniverseFetcherConfig,
}

impl BinanceUniverseFetcher {
    pub fn new(config: UniverseFetcherConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            config,
        }
    }

    fn sum_top_depth(levels: &[[String; 2]]) -> f64 {
        levels
            .iter()
            .filter_map(|[price, qty]| {
                let p: f64 = price.parse().ok()?;
                let q: f64 = qty.parse().ok()?;
                Some(p * q)
            })
            .sum()
    }

    async fn fetch_depth(&self, symbol: &str) -> Result<OrderbookDepth> {
        let url = format!("{DEPTH_URL}?symbol={}&limit=20", symbol.to_uppercase());
        let resp: DepthResponse = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("depth request failed for {symbol}"))?
            .json()
            .await
            .with_context(|| format!("depth response parse failed for {symbol}"))?;
        Ok(OrderbookDepth {
            bid: Self::sum_top_depth(&resp.bids),
            ask: Self::sum_top_depth(&resp.asks),
        })
    }
}

#[async_trait::async_trait]
impl UniverseFetcher for BinanceUniverseFetcher {
    async fn fetch(&self) -> Result<UniverseSnapshot> {
        let info: ExchangeInfoResponse = self
            .client
            .get(EXCHANGE_INFO_URL)
            .send()
            .await
            .context("exchangeInfo request failed")?
            .json()
            .await
            .context("exchangeInfo response parse failed")?;

        let active: std::collections::HashSet<String> = info
            .symbols
            .into_iter()
            .filter(|s| {
                s.contract_type == "PERPETUAL"
                    && s.quote_asset == "USDT"
                    && s.status == "TRADING"
                    && !self.config.exclude_symbols.iter().any(|e| e == &s.symbol)
            })
            .map(|s| s.symbol)
            .collect();

        info!(count = active.len(), "active USDT perpetuals discovered");

        let tickers: Vec<Ticker24hr> = self
            .client
            .get(TICKER_24HR_URL)
            .send()
            .await
            .context("24hr ticker request failed")?
            .json()
            .await
            .context("24hr ticker response parse failed")?;

        let mut candidates: Vec<(String, f64, u64)> = tickers
            .into_iter()
            .filter(|t| active.contains(&t.symbol))
            .filter_map(|t| {
                let volume: f64 = t.quote_volume.parse().ok()?;
                if volume < self.config.volume_threshold || t.count < self.config.min_trades {
                    return None;
                }
                Some((t.symbol.to_lowercase(), volume, t.count))
            })
            .collect();

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut snapshot = UniverseSnapshot::default();

        for (symbol, volume, trades) in candidates {
            let depth = match self.fetch_depth(&symbol).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "orderbook depth fetch failed, excluding symbol");
                    continue;
                }
            };
            if depth.bid < self.config.orderbook_min_bid || depth.ask < self.config.orderbook_min_ask {
                continue;
            }

            let threshold = if self.config.enable_dynamic_threshold {
                dynamic_impulse_threshold(volume)
            } else {
                self.config.impulse_fixed_threshold_pct
            };

            snapshot.volumes.insert(symbol.clone(), volume);
            snapshot.thresholds.insert(symbol.clone(), threshold);
            snapshot.trades_24h.insert(symbol.clone(), trades);
            snapshot.orderbook.insert(symbol, depth);
        }

        info!(count = snapshot.volumes.len(), "universe snapshot built");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_threshold_is_higher_for_low_volume() {
        let low = dynamic_impulse_threshold(IMPULSE_VOL_MIN);
        let high = dynamic_impulse_threshold(IMPULSE_VOL_MAX);
        assert!((low - IMPULSE_P_MAX).abs() < 1e-6);
        assert!((high - IMPULSE_P_MIN).abs() < 1e-6);
        assert!(low > high);
    }

    #[test]
    fn dynamic_threshold_clamps_outside_range() {
        assert_eq!(dynamic_impulse_threshold(0.0), dynamic_impulse_threshold(IMPULSE_VOL_MIN));
        assert_eq!(dynamic_impulse_threshold(1e12), dynamic_impulse_threshold(IMPULSE_VOL_MAX));
    }

    #[test]
    fn snapshot_threshold_for_falls_back_when_symbol_absent() {
        let snapshot = UniverseSnapshot::default();
        assert_eq!(snapshot.threshold_for("btcusdt", 1.5), 1.5);
    }

    #[test]
    fn sum_top_depth_computes_quote_value() {
        let levels = vec![
            ["100.0".to_string(), "2.0".to_string()],
            ["99.0".to_string(), "1.0".to_string()],
        ];
        let total = BinanceUniverseFetcher::sum_top_depth(&levels);
        assert!((total - 299.0).abs() < 1e-9);
    }
}
