use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Ack, Delivery, DeliveryError, TELEGRAM_MAX_CHARS};
use crate::dedup::Category;

const API_BASE: &str = "https://api.telegram.org";

/// Telegram Bot API delivery with per-category chat routing.
#[derive(Clone)]
pub struct TelegramDelivery {
    token: String,
    api_base: String,
    chats: HashMap<Category, String>,
    default_chat: Option<String>,
    client: Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub ok: bool,
    pub result: Option<ApiMessage>,
    pub description: Option<String>,
    pub parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ApiParameters {
    pub retry_after: Option<u64>,
}

impl TelegramDelivery {
    pub fn new(token: String, client: Client) -> Self {
        Self {
            token,
            api_base: API_BASE.to_string(),
            chats: HashMap::new(),
            default_chat: None,
            client,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_default_chat(mut self, chat_id: Option<String>) -> Self {
        self.default_chat = chat_id.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_chat(mut self, category: Category, chat_id: impl Into<String>) -> Self {
        let chat_id = chat_id.into();
        if !chat_id.trim().is_empty() {
            self.chats.insert(category, chat_id);
        }
        self
    }

    pub fn chat_for(&self, category: Category) -> Option<&str> {
        self.chats
            .get(&category)
            .or(self.default_chat.as_ref())
            .map(String::as_str)
    }
}

/// Map a non-2xx Bot API answer to a delivery error.
pub fn classify_failure(status: u16, body: &str) -> DeliveryError {
    let parsed: Option<ApiResponse> = serde_json::from_str(body).ok();
    let description = parsed
        .as_ref()
        .and_then(|r| r.description.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());
    match status {
        429 => DeliveryError::Throttled {
            retry_after: parsed
                .and_then(|r| r.parameters)
                .and_then(|p| p.retry_after)
                .map(|s| Duration::from_secs(s.min(3_600))),
        },
        400..=499 => DeliveryError::Rejected(format!("{status}: {description}")),
        _ => DeliveryError::Transport(format!("{status}: {description}")),
    }
}

#[async_trait]
impl Delivery for TelegramDelivery {
    async fn send(&self, category: Category, text: &str) -> Result<Ack, DeliveryError> {
        let Some(chat_id) = self.chat_for(category) else {
            return Err(DeliveryError::Rejected(format!(
                "no chat configured for {category}"
            )));
        };

        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.token
        );
        let payload = SendMessage {
            chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let rsp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    // The url carries the bot token; keep it out of logs.
                    DeliveryError::Transport(e.without_url().to_string())
                }
            })?;

        let status = rsp.status();
        let body = rsp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &body));
        }

        let parsed: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| DeliveryError::Transport(format!("decode: {e}")))?;
        if !parsed.ok {
            return Err(DeliveryError::Rejected(
                parsed.description.unwrap_or_else(|| "ok=false".into()),
            ));
        }
        Ok(Ack {
            message_id: parsed.result.map(|m| m.message_id),
        })
    }

    fn accepts(&self, category: Category) -> bool {
        !self.token.is_empty() && self.chat_for(category).is_some()
    }

    fn max_message_chars(&self) -> usize {
        TELEGRAM_MAX_CHARS
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}
