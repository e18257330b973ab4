//! Anthropic Messages API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    classify_status, map_reqwest_err, retry_after_header, system_prompt, user_message,
    SummarizeError, Summarizer, SummarizerResponse, SummaryItem, TokenUsage,
};
use crate::config::ai::AiConfig;
use crate::dedup::Category;

const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicSummarizer {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    language: String,
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Msg<'a>>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl MessagesResponse {
    pub fn into_response(self) -> SummarizerResponse {
        let text = self
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n");
        SummarizerResponse {
            text: text.trim().to_string(),
            usage: TokenUsage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
            },
        }
    }
}

impl AnthropicSummarizer {
    pub fn new(config: &AiConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            api_key: config.api_key.clone(),
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| API_BASE.to_string()),
            model: config.model.clone(),
            max_tokens: config.max_output_tokens,
            language: config.language.clone(),
        }
    }
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    async fn summarize(
        &self,
        category: Category,
        items: &[SummaryItem],
    ) -> Result<SummarizerResponse, SummarizeError> {
        if items.is_empty() {
            return Err(SummarizeError::InvalidInput("empty batch".into()));
        }
        let system = system_prompt(&self.language);
        let user = user_message(category, items);
        let req = Req {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &system,
            messages: vec![Msg {
                role: "user",
                content: &user,
            }],
        };

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.api_base.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&req)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after_header(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, model = %self.model, "anthropic api error");
            return Err(classify_status(status, retry_after, &body));
        }

        let body: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| SummarizeError::Provider(format!("decode: {e}")))?;
        Ok(body.into_response())
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn max_output_tokens(&self) -> u32 {
        self.max_tokens
    }
}
