//! OpenAI Chat Completions API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    classify_status, map_reqwest_err, retry_after_header, system_prompt, user_message,
    SummarizeError, Summarizer, SummarizerResponse, SummaryItem, TokenUsage,
};
use crate::config::ai::AiConfig;
use crate::dedup::Category;

const API_BASE: &str = "https://api.openai.com";

pub struct OpenAiSummarizer {
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
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ChoiceMsg,
}

#[derive(Debug, Deserialize)]
pub struct ChoiceMsg {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl ChatResponse {
    pub fn into_response(self) -> SummarizerResponse {
        let usage = self
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        let text = self
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        SummarizerResponse {
            text: text.trim().to_string(),
            usage,
        }
    }
}

impl OpenAiSummarizer {
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
impl Summarizer for OpenAiSummarizer {
    async fn summarize(
        &self,
        category: Category,
        items: &[SummaryItem],
    ) -> Result<SummarizerResponse, SummarizeError> {
        if items.is_empty() {
            return Err(SummarizeError::InvalidInput("empty batch".into()));
        }
        let sys = system_prompt(&self.language);
        let user = user_message(category, items);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &sys,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.3,
            max_tokens: self.max_tokens,
        };

        let resp = self
            .http
            .post(format!(
                "{}/v1/chat/completions",
                self.api_base.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after_header(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, model = %self.model, "openai api error");
            return Err(classify_status(status, retry_after, &body));
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| SummarizeError::Provider(format!("decode: {e}")))?;
        Ok(body.into_response())
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn max_output_tokens(&self) -> u32 {
        self.max_tokens
    }
}
