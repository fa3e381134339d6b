use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::watcher::message::ForwardableEmail;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram rejected the message: {0}")]
    Api(String),
}

/// Outbound delivery capability. Implementations surface failures to the
/// caller and never retry on their own.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, formatted: &str) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Sends messages to a Telegram channel through the Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    token: String,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Deserialize)]
struct SendMessageResponse {
    #[allow(dead_code)]
    ok: bool,
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            chat_id,
        }
    }
}

impl NotificationSink for TelegramNotifier {
    async fn notify(&self, formatted: &str) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let response = self
            .client
            .post(&url)
            .json(&SendMessageRequest {
                chat_id: &self.chat_id,
                text: formatted,
                parse_mode: "HTML",
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let description = response
                .json::<SendMessageResponse>()
                .await
                .ok()
                .and_then(|body| body.description)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(NotifyError::Api(description));
        }
        Ok(())
    }
}

/// Composes the display string for one forwarded message. Every field that
/// came from the mail is escaped so it cannot be read as Telegram markup.
pub fn format_message(email: &ForwardableEmail) -> String {
    format!(
        "<b>{}</b>\n\u{1F4E9} {}\n({})\n\n<blockquote expandable>{}</blockquote>",
        escape_html(&email.subject),
        escape_html(&email.recipient),
        email.date.format("%Y-%m-%d %H:%M:%S"),
        escape_html(&email.content),
    )
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
