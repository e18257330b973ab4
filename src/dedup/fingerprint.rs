//! Deterministic item identity.
//!
//! Preference order, most reliable first:
//! 1. `(source_kind, external_id)`
//! 2. normalized title, or `body[..CONTENT_PREFIX_CHARS]` when the title is empty
//! 3. canonical url
//!
//! Each basis hashes under its own prefix, so an id-based fingerprint can never
//! collide with a content-based one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ingest::collapse_whitespace;
use crate::ingest::types::RawItem;

/// Number of body chars hashed for untitled items.
pub const CONTENT_PREFIX_CHARS: usize = 280;

/// Query parameters that only carry campaign tracking.
const TRACKING_PARAMS: &[&str] = &[
    "_dt",
    "fbclid",
    "gclid",
    "dclid",
    "igshid",
    "modal",
    "ref",
    "ref_src",
    "mc_cid",
    "mc_eid",
    "cmpid",
    "ncid",
    "taid",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already computed hex digest (e.g. read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which identity signal produced a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Basis {
    ExternalId,
    Content,
    Url,
}

impl Basis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Basis::ExternalId => "external_id",
            Basis::Content => "content",
            Basis::Url => "url",
        }
    }
}

fn digest(parts: &[&str]) -> Fingerprint {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        // Unit separator keeps ("ab","c") and ("a","bc") apart.
        hasher.update([0x1f]);
    }
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// Whitespace-collapsed, lowercased form. Only ever used for hashing.
pub fn hash_form(s: &str) -> String {
    collapse_whitespace(s).to_lowercase()
}

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.starts_with("utm_") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Display form of a link: tracking params removed, everything else as given.
pub fn strip_tracking(raw: &str) -> String {
    let raw = raw.trim();
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };
    if parsed.query().is_none() {
        return raw.to_string();
    }

    let clean: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if clean.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(clean);
    }
    parsed.to_string()
}

/// Canonical form of a link: tracking params, fragment, scheme, `www.` and the
/// trailing slash are dropped; remaining query pairs are sorted.
///
/// Returns `None` for an empty url. Strings that do not parse as absolute URLs
/// fall back to their hash form.
pub fn canonical_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let Ok(parsed) = url::Url::parse(raw) else {
        return Some(hash_form(raw));
    };
    let Some(host) = parsed.host_str() else {
        return Some(hash_form(raw));
    };

    let host = host.trim_start_matches("www.").to_ascii_lowercase();
    let mut out = host;
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }

    let path = parsed.path().trim_end_matches('/');
    out.push_str(path);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        let mut q = url::form_urlencoded::Serializer::new(String::new());
        q.extend_pairs(pairs);
        out.push('?');
        out.push_str(&q.finish());
    }
    Some(out)
}

/// Compute the fingerprint of an item, or `None` when it carries no identity at all.
pub fn compute(item: &RawItem) -> Option<(Fingerprint, Basis)> {
    if let Some(id) = item.external_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return Some((
            digest(&["id", item.source_kind.as_str(), id]),
            Basis::ExternalId,
        ));
    }

    // Outlets rewrite descriptions freely, so the headline alone is the story.
    let title = hash_form(&item.title);
    if !title.is_empty() {
        return Some((digest(&["title", &title]), Basis::Content));
    }
    let body: String = hash_form(&item.body).chars().take(CONTENT_PREFIX_CHARS).collect();
    if !body.is_empty() {
        return Some((digest(&["body", &body]), Basis::Content));
    }

    canonical_url(&item.url).map(|u| (digest(&["url", &u]), Basis::Url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::SourceKind;
    use chrono::Utc;

    fn item(kind: SourceKind, ext: Option<&str>, url: &str, title: &str, body: &str) -> RawItem {
        RawItem {
            source_kind: kind,
            source_id: "feed".into(),
            external_id: ext.map(str::to_string),
            url: url.into(),
            title: title.into(),
            body: body.into(),
            published_at: None,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn external_id_wins_and_is_scoped_by_kind() {
        let a = item(SourceKind::Twitter, Some("42"), "", "A", "");
        let b = item(SourceKind::Twitter, Some("42"), "https://x", "Different", "text");
        let c = item(SourceKind::Facebook, Some("42"), "", "A", "");
        let (fa, basis) = compute(&a).unwrap();
        assert_eq!(basis, Basis::ExternalId);
        assert_eq!(fa, compute(&b).unwrap().0);
        assert_ne!(fa, compute(&c).unwrap().0);
    }

    #[test]
    fn content_hash_ignores_case_and_whitespace() {
        let a = item(SourceKind::Rss, None, "", "Fed Holds  Rates", "Statement\nat 2pm");
        let b = item(SourceKind::Rss, None, "", "fed holds rates", "statement at 2pm");
        assert_eq!(compute(&a), compute(&b));
        assert_eq!(compute(&a).unwrap().1, Basis::Content);
    }

    #[test]
    fn same_headline_with_different_descriptions_is_one_story() {
        let a = item(SourceKind::Rss, None, "https://a.com/1", "Fed holds rates steady", "Policy unchanged.");
        let b = item(SourceKind::Rss, None, "https://b.com/9", "Fed  holds rates STEADY", "Powell says data-dependent.");
        assert_eq!(compute(&a), compute(&b));
        let c = item(SourceKind::Rss, None, "", "Fed cuts rates", "Policy unchanged.");
        assert_ne!(compute(&a).unwrap().0, compute(&c).unwrap().0);
    }

    #[test]
    fn untitled_items_hash_the_body_prefix() {
        let base = "x".repeat(CONTENT_PREFIX_CHARS);
        let a = item(SourceKind::Facebook, None, "", "", &format!("{base} tail one"));
        let b = item(SourceKind::Facebook, None, "", "", &format!("{base} tail two"));
        assert_eq!(compute(&a), compute(&b));
        assert_eq!(compute(&a).unwrap().1, Basis::Content);
        let c = item(SourceKind::Facebook, None, "", "", "y");
        assert_ne!(compute(&a).unwrap().0, compute(&c).unwrap().0);
    }

    #[test]
    fn url_is_last_resort_and_none_without_identity() {
        let a = item(SourceKind::Rss, None, "https://www.example.com/a/?utm_source=x#top", "", "");
        let b = item(SourceKind::Rss, None, "http://example.com/a", "", "");
        assert_eq!(compute(&a).unwrap().1, Basis::Url);
        assert_eq!(compute(&a), compute(&b));
        assert!(compute(&item(SourceKind::Rss, None, "  ", " ", "")).is_none());
    }

    #[test]
    fn canonical_url_strips_tracking_and_sorts() {
        assert_eq!(
            canonical_url("https://www.Example.com/news/1/?b=2&utm_medium=rss&a=1&fbclid=zz#frag")
                .as_deref(),
            Some("example.com/news/1?a=1&b=2")
        );
        assert_eq!(canonical_url("https://example.com/").as_deref(), Some("example.com"));
        assert_eq!(canonical_url("not a url").as_deref(), Some("not a url"));
        assert!(canonical_url("").is_none());
    }

    #[test]
    fn strip_tracking_keeps_real_params() {
        assert_eq!(
            strip_tracking("https://example.com/page?id=123&utm_source=twitter&fbclid=abc"),
            "https://example.com/page?id=123"
        );
        assert_eq!(
            strip_tracking("https://example.com/page?utm_source=rss"),
            "https://example.com/page"
        );
        assert_eq!(strip_tracking("https://example.com/page"), "https://example.com/page");
    }
}
