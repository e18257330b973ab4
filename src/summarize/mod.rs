//! Summarizer abstraction + concrete providers.
//!
//! A summarizer turns one batch (a category and its ordered items) into digest
//! text plus token usage. Cost is derived from the usage by [`pricing`].

pub mod anthropic;
pub mod local;
pub mod openai;
pub mod pricing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ai::AiConfig;
use crate::dedup::Category;

pub use anthropic::AnthropicSummarizer;
pub use local::{FallbackSummarizer, MockSummarizer};
pub use openai::OpenAiSummarizer;

/// What the summarizer sees of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryItem {
    pub source: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizerResponse {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SummarizeError {
    #[error("summarizer rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("summarizer call timed out")]
    Timeout,
    #[error("summarizer rejected input: {0}")]
    InvalidInput(String),
    #[error("summarizer provider error: {0}")]
    Provider(String),
}

impl SummarizeError {
    /// Worth another attempt with backoff. Rate limits go back to the queue instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SummarizeError::Timeout | SummarizeError::Provider(_))
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        category: Category,
        items: &[SummaryItem],
    ) -> Result<SummarizerResponse, SummarizeError>;

    /// Model id used for pricing.
    fn model(&self) -> &str;

    fn name(&self) -> &'static str;

    /// Upper bound on output tokens per call, used for pre-call estimates.
    fn max_output_tokens(&self) -> u32 {
        1024
    }
}

pub type SharedSummarizer = Arc<dyn Summarizer>;

/// Answer the model gives when nothing in the batch is worth sending.
pub const SKIP_MARKER: &str = "SKIP";

pub fn is_skip(text: &str) -> bool {
    let t = text.trim().trim_matches(|c: char| c == '.' || c == '"' || c == '`');
    t.eq_ignore_ascii_case(SKIP_MARKER)
}

/// Max body chars per item sent to the model.
const ITEM_BODY_CHARS: usize = 600;

pub fn system_prompt(language: &str) -> String {
    format!(
        "You are a financial news editor. Write a concise digest of the news items below in {language}.\n\
         Rules:\n\
         1. One or two sentences per story, straight to the point; merge items that report the same event.\n\
         2. Keep concrete figures (%, rates, prices, index levels).\n\
         3. No emojis, no headings, no category labels.\n\
         4. Keep only news with value to investors: policy changes, large price moves, economic data, earnings, M&A, IPOs.\n\
         5. Reply with exactly {SKIP_MARKER} if no item qualifies (ads, minor events, opinion, generic content without figures)."
    )
}

pub fn user_message(category: Category, items: &[SummaryItem]) -> String {
    let mut out = format!("Category: {}\n", category.label());
    for (i, it) in items.iter().enumerate() {
        let body: String = it.body.chars().take(ITEM_BODY_CHARS).collect();
        out.push_str(&format!(
            "\n[{}] Source: {}\nTitle: {}\n",
            i + 1,
            it.source,
            it.title
        ));
        if !body.is_empty() {
            out.push_str(&format!("Content: {body}\n"));
        }
    }
    out
}

/// Rough pre-call token estimate: prompt chars / 4 plus the output cap.
pub fn estimate_tokens(category: Category, items: &[SummaryItem], max_output_tokens: u32) -> u64 {
    let chars = system_prompt("English").len() + user_message(category, items).len();
    (chars as u64).div_ceil(4) + max_output_tokens as u64
}

/// Longest provider-requested pause honored; larger hints are clamped.
pub(crate) const MAX_RETRY_AFTER: Duration = Duration::from_secs(3_600);

/// Parse a `Retry-After` header given in seconds, clamped to [`MAX_RETRY_AFTER`].
pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(|s| {
            Duration::try_from_secs_f64(s)
                .unwrap_or(MAX_RETRY_AFTER)
                .min(MAX_RETRY_AFTER)
        })
}

/// Map an HTTP failure status to the summarizer error taxonomy.
pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> SummarizeError {
    let snippet: String = body.chars().take(300).collect();
    match status.as_u16() {
        429 => SummarizeError::RateLimited { retry_after },
        400 | 413 | 422 => SummarizeError::InvalidInput(format!("{status}: {snippet}")),
        408 | 504 => SummarizeError::Timeout,
        _ => SummarizeError::Provider(format!("{status}: {snippet}")),
    }
}

pub(crate) fn map_reqwest_err(e: reqwest::Error) -> SummarizeError {
    if e.is_timeout() {
        SummarizeError::Timeout
    } else {
        SummarizeError::Provider(e.to_string())
    }
}

pub(crate) fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .user_agent(concat!("finnews-digest/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(5))
        .timeout(timeout)
        .build()
        .context("building summarizer http client")
}

/// Factory: build a summarizer according to config and environment variables.
///
/// * `AI_TEST_MODE=mock` returns a deterministic mock.
/// * `enabled == false` returns the zero-cost headline fallback.
/// * Otherwise the configured hosted provider.
pub fn build_summarizer(config: &AiConfig) -> anyhow::Result<SharedSummarizer> {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Ok(Arc::new(MockSummarizer::new("Digest (mock)")));
    }

    if !config.enabled {
        return Ok(Arc::new(FallbackSummarizer));
    }

    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    match config.provider.as_str() {
        "anthropic" | "claude" => Ok(Arc::new(AnthropicSummarizer::new(config, http_client(timeout)?))),
        "openai" => Ok(Arc::new(OpenAiSummarizer::new(config, http_client(timeout)?))),
        other => anyhow::bail!("unsupported summarizer provider `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_detection_is_lenient_about_punctuation() {
        assert!(is_skip("SKIP"));
        assert!(is_skip("  skip.\n"));
        assert!(is_skip("\"SKIP\""));
        assert!(!is_skip("Skipper reports record profit"));
    }

    #[test]
    fn user_message_numbers_items_and_caps_bodies() {
        let items = vec![
            SummaryItem {
                source: "Reuters".into(),
                title: "Fed holds".into(),
                body: "x".repeat(2_000),
            },
            SummaryItem {
                source: "@WSJ".into(),
                title: "Yields rise".into(),
                body: String::new(),
            },
        ];
        let msg = user_message(Category::Macro, &items);
        assert!(msg.starts_with("Category: Macro\n"));
        assert!(msg.contains("[1] Source: Reuters"));
        assert!(msg.contains("[2] Source: @WSJ\nTitle: Yields rise\n"));
        assert!(!msg.contains(&"x".repeat(ITEM_BODY_CHARS + 1)));
        assert!(estimate_tokens(Category::Macro, &items, 500) > 500);
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), ""),
            SummarizeError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "bad"),
            SummarizeError::InvalidInput(_)
        ));
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, None, "").is_retryable());
    }

    fn retry_after(value: &str) -> Option<Duration> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_str(value).unwrap(),
        );
        retry_after_header(&headers)
    }

    #[test]
    fn retry_after_parses_seconds_and_clamps_huge_values() {
        assert_eq!(retry_after("2.5"), Some(Duration::from_millis(2_500)));
        assert_eq!(retry_after("1e30"), Some(MAX_RETRY_AFTER));
        assert_eq!(retry_after("86400"), Some(MAX_RETRY_AFTER));
        assert_eq!(retry_after("-1"), None);
        assert_eq!(retry_after("NaN"), None);
        assert_eq!(retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(retry_after_header(&reqwest::header::HeaderMap::new()), None);
    }
}
