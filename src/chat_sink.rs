// =============================================================================
// ChatSink — bounded-queue Telegram delivery with a background worker
// =============================================================================
//
// `send` never blocks the caller on network I/O: messages are pushed onto a
// bounded mpsc queue and a single background task drains it sequentially,
// posting to the Telegram Bot API. A full queue drops the message (spec.md
// §5 backpressure: losing a notification is preferred to unbounded lag).
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Where to deliver a chat message: the configured admin chat, or a specific
/// per-user chat id.
#[derive(Debug, Clone)]
pub enum ChatTarget {
    Admin,
    Chat(String),
}

/// Fire-and-forget text delivery to an external chat surface.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Enqueue `text` for delivery to `target`. Returns immediately; drops
    /// silently (with a warning) if the internal queue is full.
    fn send(&self, target: ChatTarget, text: String);
}

struct QueuedMessage {
    target: ChatTarget,
    text: String,
}

/// Telegram Bot API chat sink. Owns an unbounded-blocking-free worker loop
/// draining a bounded queue.
pub struct HttpChatSink {
    tx: mpsc::Sender<QueuedMessage>,
}

impl HttpChatSink {
    /// Spawn the background worker and return a handle. `token` is the
    /// Telegram bot token; `admin_chat_id` is the default destination for
    /// [`ChatTarget::Admin`].
    pub fn spawn(token: String, admin_chat_id: Option<String>, queue_capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(8))
            .build()
            .expect("failed to build reqwest client");

        tokio::spawn(worker_loop(client, token, admin_chat_id, rx));

        Arc::new(Self { tx })
    }
}

#[async_trait]
impl ChatSink for HttpChatSink {
    fn send(&self, target: ChatTarget, text: String) {
        match self.tx.try_send(QueuedMessage { target, text }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("chat sink queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("chat sink worker gone, dropping message");
            }
        }
    }
}

async fn worker_loop(
    client: Client,
    token: String,
    admin_chat_id: Option<String>,
    mut rx: mpsc::Receiver<QueuedMessage>,
) {
    let url = format!("https://api.telegram.org/bot{token}/sendMessage");

    while let Some(msg) = rx.recv().await {
        let chat_id = match msg.target {
            ChatTarget::Admin => match &admin_chat_id {
                Some(id) => id.clone(),
                None => continue,
            },
            ChatTarget::Chat(id) => id,
        };

        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": msg.text,
            "parse_mode": "HTML",
        });

        match client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(chat_id = %chat_id, "chat message delivered");
            }
            Ok(resp) => {
                warn!(chat_id = %chat_id, status = %resp.status(), "chat delivery rejected");
            }
            Err(e) => {
                error!(chat_id = %chat_id, error = %e, "chat delivery failed");
            }
        }
    }
}

/// No-op sink for tests and for running without chat credentials configured.
pub struct NullChatSink;

#[async_trait]
impl ChatSink for NullChatSink {
    fn send(&self, _target: ChatTarget, _text: String) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_accepts_and_discards() {
        let sink = NullChatSink;
        sink.send(ChatTarget::Admin, "hello".to_string());
    }

    #[tokio::test]
    async fn full_queue_drops_without_panicking() {
        let sink = HttpChatSink::spawn("dummy-token".to_string(), None, 1);
        for _ in 0..50 {
            sink.send(ChatTarget::Admin, "spam".to_string());
        }
    }
}
