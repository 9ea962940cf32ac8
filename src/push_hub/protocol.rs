// =============================================================================
// PushHub wire protocol — client/server JSON message shapes
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages accepted from clients once JSON-parsed (the literal text
/// `"ping"` is handled upstream of this type, before JSON decoding).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
        #[serde(default)]
        client_id: Option<String>,
    },
    GetConfig,
    SetConfig {
        #[serde(default)]
        patch: Value,
    },
    GetAllowedFilters,
    GetTop {
        #[serde(default = "default_top_mode")]
        mode: String,
        #[serde(default = "default_top_n")]
        n: usize,
    },
    Metrics {
        event: Option<String>,
        data: Option<Value>,
    },
    Ping,
}

fn default_top_mode() -> String {
    "volume24h".to_string()
}

fn default_top_n() -> usize {
    5
}

/// One `{symbol, value}` entry in a `get_top` response.
#[derive(Debug, Clone, Serialize)]
pub struct TopItem {
    pub symbol: String,
    pub value: f64,
}

/// The canonical impulse payload pushed to clients, per the venue wire
/// protocol (distinct from the internal `ImpulseEvent` the detector
/// produces — this view adds the universe-derived threshold context a
/// subscribing client uses to render the alert).
#[derive(Debug, Clone, Serialize)]
pub struct ImpulsePush {
    pub exchange: &'static str,
    pub market: &'static str,
    pub symbol: String,
    pub volume_threshold: f64,
    pub min_trades_24h: f64,
    pub orderbook_min_bid: f64,
    pub orderbook_min_ask: f64,
    pub impulse_trades: u64,
    pub ts: f64,
}

impl ImpulsePush {
    pub fn new(symbol: String, impulse_trades: u64, ts: f64, thresholds: &Value) -> Self {
        let get = |key: &str| thresholds.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
        Self {
            exchange: "BINANCE-FUT",
            market: "FUTURES",
            symbol,
            volume_threshold: get("volume_threshold"),
            min_trades_24h: get("min_trades_24h"),
            orderbook_min_bid: get("orderbook_min_bid"),
            orderbook_min_ask: get("orderbook_min_ask"),
            impulse_trades,
            ts,
        }
    }
}

/// Messages sent to clients. Serializes with a `type` discriminant matching
/// the wire protocol's documented shapes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Error {
        error: String,
    },
    Config {
        data: Value,
    },
    AllowedFilters {
        data: Value,
    },
    Top {
        mode: String,
        items: Vec<TopItem>,
    },
    Pong,
    Impulse(ImpulsePush),
}

impl ServerMessage {
    pub fn error(msg: impl Into<String>) -> Self {
        ServerMessage::Error { error: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_parses() {
        let json = r#"{"type":"auth","token":"abc","client_id":"cli-1"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        matches!(msg, ClientMessage::Auth { .. });
    }

    #[test]
    fn get_top_defaults_apply() {
        let json = r#"{"type":"get_top"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::GetTop { mode, n } => {
                assert_eq!(mode, "volume24h");
                assert_eq!(n, 5);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let json = r#"{"type":"not_a_real_command"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn server_message_serializes_tagged() {
        let msg = ServerMessage::Ok {
            ts: Some(1.0),
            user_id: Some("u1".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ok\""));
        assert!(json.contains("\"user_id\":\"u1\""));
    }

    #[test]
    fn impulse_push_pulls_thresholds_from_universe_value() {
        let thresholds = serde_json::json!({
            "volume_threshold": 20e6,
            "min_trades_24h": 10000.0,
            "orderbook_min_bid": 20000.0,
            "orderbook_min_ask": 20000.0,
        });
        let push = ImpulsePush::new("btcusdt".to_string(), 1500, 1000.0, &thresholds);
        assert_eq!(push.volume_threshold, 20e6);
        assert_eq!(push.exchange, "BINANCE-FUT");
    }
}
