//! Delivery of digests (Telegram) and operator-facing alerts.

pub mod antiflutter;
pub mod email;
pub mod operator;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::dedup::Category;

pub use operator::{LogSink, OperatorEvent, OperatorMux, OperatorSink};
pub use telegram::TelegramDelivery;

/// Telegram's hard limit for one `sendMessage` text.
pub const TELEGRAM_MAX_CHARS: usize = 4096;

/// Delivery receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery throttled (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    /// The channel refused this message; resending it will not help.
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("delivery transport error: {0}")]
    Transport(String),
    #[error("delivery timed out")]
    Timeout,
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Rejected(_))
    }
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, category: Category, text: &str) -> Result<Ack, DeliveryError>;

    /// Whether a destination is configured for `category`.
    fn accepts(&self, _category: Category) -> bool {
        true
    }

    fn max_message_chars(&self) -> usize {
        TELEGRAM_MAX_CHARS
    }

    fn name(&self) -> &'static str;
}

pub type SharedDelivery = Arc<dyn Delivery>;

/// A link shown under a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLink {
    pub source: String,
    pub url: String,
}

/// Render one digest as Telegram HTML: header, escaped summary, numbered source links.
pub fn format_digest(category: Category, summary: &str, links: &[SourceLink]) -> String {
    let mut out = format!("<b>{} digest</b>\n\n", category.label());
    out.push_str(html_escape::encode_text(summary.trim()).as_ref());

    let links: Vec<&SourceLink> = links.iter().filter(|l| !l.url.is_empty()).collect();
    if !links.is_empty() {
        out.push_str("\n\n<b>Sources</b>");
        for (i, l) in links.iter().enumerate() {
            out.push_str(&format!(
                "\n{}. <a href=\"{}\">{}</a>",
                i + 1,
                html_escape::encode_double_quoted_attribute(&l.url),
                html_escape::encode_text(&l.source)
            ));
        }
    }
    out
}

/// Split `text` into parts of at most `max_chars` chars, preferring line breaks.
///
/// A single line longer than the limit is cut at its last space before the
/// limit, or hard at the limit when it has none.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max = max_chars.max(1);
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let mut rest: &str = line;
        loop {
            let rest_len = rest.chars().count();
            let sep = usize::from(current_len > 0);
            if current_len + sep + rest_len <= max {
                if sep == 1 {
                    current.push('\n');
                }
                current.push_str(rest);
                current_len += sep + rest_len;
                break;
            }
            if current_len > 0 {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
                continue;
            }
            // Line alone is too long: cut it.
            let hard = rest
                .char_indices()
                .nth(max)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let cut = rest[..hard]
                .rfind(' ')
                .filter(|&i| i > 0)
                .unwrap_or_else(|| entity_safe_cut(rest, hard));
            parts.push(rest[..cut].to_string());
            rest = rest[cut..].trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts.retain(|p| !p.trim().is_empty());
    parts
}

/// Longest HTML entity the digest escaping emits, e.g. `&quot;` or a numeric `&#128200;`.
const MAX_ENTITY_CHARS: usize = 10;

/// Move a hard cut back to before an escaped entity it would split.
fn entity_safe_cut(s: &str, cut: usize) -> usize {
    let head = &s[..cut];
    match head.rfind('&') {
        Some(amp) if amp > 0 && !head[amp..].contains(';') && cut - amp < MAX_ENTITY_CHARS => {
            let tail = &s[amp..];
            let closes = tail
                .char_indices()
                .take(MAX_ENTITY_CHARS)
                .any(|(_, c)| c == ';');
            if closes {
                amp
            } else {
                cut
            }
        }
        _ => cut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_escapes_text_and_links() {
        let out = format_digest(
            Category::Equities,
            "S&P 500 <up> 1%",
            &[
                SourceLink {
                    source: "Reuters".into(),
                    url: "https://example.com/a?x=1&y=\"2\"".into(),
                },
                SourceLink {
                    source: "No link".into(),
                    url: String::new(),
                },
            ],
        );
        assert!(out.starts_with("<b>Equities digest</b>\n\nS&amp;P 500 &lt;up&gt; 1%"));
        assert!(out.contains("1. <a href=\"https://example.com/a?x=1&amp;y=&quot;2&quot;\">Reuters</a>"));
        assert!(!out.contains("No link"));
    }

    #[test]
    fn hard_cut_never_splits_an_entity() {
        // No spaces: the 10-char cut would land inside `&amp;`.
        let text = format!("{}&amp;{}", "a".repeat(8), "b".repeat(8));
        let parts = split_message(&text, 10);
        assert_eq!(parts[0], "a".repeat(8));
        assert!(parts[1].starts_with("&amp;"));
        assert_eq!(parts.concat(), text);
        for p in &parts {
            assert!(p.chars().count() <= 10);
        }
    }

    #[test]
    fn bare_ampersand_does_not_move_the_cut() {
        let text = format!("{}&{}", "a".repeat(8), "b".repeat(8));
        let parts = split_message(&text, 10);
        assert_eq!(parts[0].chars().count(), 10);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn short_text_is_one_part() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
    }

    #[test]
    fn split_prefers_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(split_message(text, 9), vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn overlong_line_is_cut_at_spaces() {
        let text = "one two three four";
        let parts = split_message(text, 8);
        assert_eq!(parts, vec!["one two", "three", "four"]);
        for p in &parts {
            assert!(p.chars().count() <= 8);
        }
    }

    #[test]
    fn every_part_respects_limit() {
        let text = (0..500)
            .map(|i| format!("line {i} with some words"))
            .collect::<Vec<_>>()
            .join("\n");
        let parts = split_message(&text, TELEGRAM_MAX_CHARS);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.chars().count() <= TELEGRAM_MAX_CHARS));
        assert_eq!(parts.join("\n"), text);
    }
}
