// =============================================================================
// impulse-screener — composition root
// =============================================================================
//
// Wires ScreenerConfig, UserStore, the chat sink, PushHub, and ScreenerEngine
// together, then blocks on PushHub's Axum listener. PushHub needs a
// `top_provider` closure before ScreenerEngine exists to hand it one, so the
// closure reads the engine out of a slot filled immediately after
// construction.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use impulse_screener::chat_sink::{ChatSink, HttpChatSink, NullChatSink};
use impulse_screener::config::ScreenerConfig;
use impulse_screener::engine::ScreenerEngine;
use impulse_screener::push_hub::protocol::TopItem;
use impulse_screener::push_hub::{PushHub, TopProvider};
use impulse_screener::universe::{BinanceUniverseFetcher, UniverseFetcher, UniverseFetcherConfig};
use impulse_screener::user_store::UserStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("impulse-screener starting up");

    let config = ScreenerConfig::load_or_default("screener_config.json");
    info!(
        host = %config.host,
        port = config.port,
        dynamic_threshold = config.enable_dynamic_threshold,
        "screener config loaded"
    );

    let user_store = Arc::new(UserStore::load("users.json")?);

    let chat_sink: Arc<dyn ChatSink> = match std::env::var("TELEGRAM_BOT_TOKEN") {
        Ok(token) if !token.is_empty() => {
            let admin_chat_id = std::env::var("TELEGRAM_ADMIN_CHAT_ID").ok();
            info!(admin_chat_configured = admin_chat_id.is_some(), "telegram chat sink enabled");
            HttpChatSink::spawn(token, admin_chat_id, config.chat_queue_capacity)
        }
        _ => {
            warn!("TELEGRAM_BOT_TOKEN not set, chat notifications disabled");
            Arc::new(NullChatSink)
        }
    };

    // Filled with the engine right after it's built; the `get_top` wire
    // command reads through this slot.
    let engine_slot: Arc<RwLock<Option<Arc<ScreenerEngine>>>> = Arc::new(RwLock::new(None));
    let top_provider: TopProvider = {
        let engine_slot = engine_slot.clone();
        Arc::new(move |mode: String, n: usize| {
            let engine_slot = engine_slot.clone();
            Box::pin(async move {
                let engine = engine_slot.read().clone();
                match engine {
                    // Only one ranking mode is implemented today; unknown
                    // modes fall back to it rather than erroring the client.
                    Some(engine) => {
                        let _ = &mode;
                        engine
                            .top_by_volume(n)
                            .into_iter()
                            .map(|(symbol, value)| TopItem { symbol, value })
                            .collect()
                    }
                    None => Vec::new(),
                }
            })
        })
    };

    let push_hub = PushHub::new(user_store.clone(), top_provider, None);

    let engine = ScreenerEngine::new(config.clone(), push_hub.clone(), user_store.clone(), chat_sink);
    *engine_slot.write() = Some(engine.clone());

    let universe_fetcher: Arc<dyn UniverseFetcher> = Arc::new(BinanceUniverseFetcher::new(UniverseFetcherConfig {
        exclude_symbols: Vec::new(),
        volume_threshold: 20e6,
        min_trades: 10_000,
        orderbook_min_bid: 20_000.0,
        orderbook_min_ask: 20_000.0,
        enable_dynamic_threshold: config.enable_dynamic_threshold,
        impulse_fixed_threshold_pct: config.impulse_fixed_threshold_pct,
    }));

    engine.start(universe_fetcher);
    info!("screener pipeline started");

    push_hub.serve(&config.host, config.port).await?;

    Ok(())
}
