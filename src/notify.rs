// ===============================
// src/notify.rs
// ===============================
//
// Admin notifications. Delivery failures are logged and swallowed: a firing
// must never abort because a chat message could not be sent.
//
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::Event;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str);
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
}

/// Telegram Bot API `sendMessage` to every admin chat.
pub struct TelegramNotifier {
    http: reqwest::Client,
    api_url: String,
    token: String,
    admin_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(api_url: String, token: String, admin_ids: Vec<i64>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, api_url, token, admin_ids }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) {
        let url = format!("{}/bot{}/sendMessage", self.api_url.trim_end_matches('/'), self.token);
        for &chat_id in &self.admin_ids {
            let body = SendMessage { chat_id, text, parse_mode: "HTML" };
            match self.http.post(&url).json(&body).send().await {
                Ok(rsp) if rsp.status().is_success() => {}
                Ok(rsp) => warn!(chat_id, status = %rsp.status(), "telegram send rejected"),
                Err(e) => warn!(chat_id, ?e, "telegram send failed"),
            }
        }
    }
}

/// Used when no bot token is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) {
        info!(%text, "notification");
    }
}

/// Keeps messages in memory (dry runs, tests).
#[derive(Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, text: &str) {
        if let Ok(mut m) = self.messages.lock() {
            m.push(text.to_string());
        }
    }
}

/// Forwards to another notifier and journals each message as a note.
pub struct Journaled {
    inner: Arc<dyn Notifier>,
    journal: mpsc::Sender<Event>,
}

impl Journaled {
    pub fn new(inner: Arc<dyn Notifier>, journal: mpsc::Sender<Event>) -> Self {
        Self { inner, journal }
    }
}

#[async_trait]
impl Notifier for Journaled {
    async fn notify(&self, text: &str) {
        let _ = self.journal.try_send(Event::Note(text.to_string()));
        self.inner.notify(text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn journaled_messages_reach_both_sides() {
        let memory = Arc::new(MemoryNotifier::default());
        let (tx, mut rx) = mpsc::channel(4);
        let n = Journaled::new(memory.clone(), tx);
        n.notify("coupon paid").await;
        assert_eq!(memory.messages(), vec!["coupon paid".to_string()]);
        assert!(matches!(rx.try_recv(), Ok(Event::Note(t)) if t == "coupon paid"));
    }
}
