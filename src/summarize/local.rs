//! Summarizers that never leave the process.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{SummarizeError, Summarizer, SummarizerResponse, SummaryItem, TokenUsage};
use crate::dedup::Category;

const FALLBACK_BODY_CHARS: usize = 200;

/// Deterministic summarizer for tests and local runs (`AI_TEST_MODE=mock`).
pub struct MockSummarizer {
    fixed: String,
    calls: AtomicUsize,
}

impl MockSummarizer {
    pub fn new(fixed: impl Into<String>) -> Self {
        Self {
            fixed: fixed.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(
        &self,
        category: Category,
        items: &[SummaryItem],
    ) -> Result<SummarizerResponse, SummarizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SummarizerResponse {
            text: format!("{} [{}: {} items]", self.fixed, category.label(), items.len()),
            usage: TokenUsage {
                input_tokens: 100 * items.len() as u64,
                output_tokens: 50,
            },
        })
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Used when AI is disabled: one line per item, title plus the start of the body.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackSummarizer;

#[async_trait]
impl Summarizer for FallbackSummarizer {
    async fn summarize(
        &self,
        _category: Category,
        items: &[SummaryItem],
    ) -> Result<SummarizerResponse, SummarizeError> {
        let lines: Vec<String> = items
            .iter()
            .map(|it| {
                let mut body: String = it.body.chars().take(FALLBACK_BODY_CHARS).collect();
                if it.body.chars().count() > FALLBACK_BODY_CHARS {
                    body.push_str("...");
                }
                if body.is_empty() {
                    format!("- {}", it.title)
                } else {
                    format!("- {}. {}", it.title.trim_end_matches('.'), body)
                }
            })
            .collect();
        Ok(SummarizerResponse {
            text: lines.join("\n"),
            usage: TokenUsage::default(),
        })
    }

    fn model(&self) -> &str {
        "fallback"
    }

    fn name(&self) -> &'static str {
        "fallback"
    }

    fn max_output_tokens(&self) -> u32 {
        0
    }
}
