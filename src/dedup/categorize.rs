//! Topic categories and the keyword-tier categorizer.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ingest::types::RawItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Macro,
    Equities,
    Currency,
    Commodities,
    Corporate,
    Crypto,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Macro,
        Category::Equities,
        Category::Currency,
        Category::Commodities,
        Category::Corporate,
        Category::Crypto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Macro => "macro",
            Category::Equities => "equities",
            Category::Currency => "currency",
            Category::Commodities => "commodities",
            Category::Corporate => "corporate",
            Category::Crypto => "crypto",
        }
    }

    /// Human label used in digest headers.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Macro => "Macro",
            Category::Equities => "Equities",
            Category::Currency => "Currency",
            Category::Commodities => "Commodities",
            Category::Corporate => "Corporate",
            Category::Crypto => "Crypto",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category `{name}`{}", .suggestion.as_ref().map(|s| format!(" (did you mean `{s}`?)")).unwrap_or_default())]
pub struct UnknownCategory {
    pub name: String,
    pub suggestion: Option<String>,
}

const SUGGESTION_THRESHOLD: f64 = 0.75;

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        if let Some(c) = Category::ALL.iter().find(|c| c.as_str() == key) {
            return Ok(*c);
        }

        let mut best_score = SUGGESTION_THRESHOLD;
        let mut suggestion = None;
        for c in Category::ALL {
            let score = strsim::jaro_winkler(&key, c.as_str());
            if score > best_score {
                best_score = score;
                suggestion = Some(c.as_str().to_string());
            }
        }
        Err(UnknownCategory {
            name: s.to_string(),
            suggestion,
        })
    }
}

// ---------------------------------------------------------------------------
// Keyword tiers
// ---------------------------------------------------------------------------

const CRYPTO_SOURCES: &[&str] = &[
    "coindesk",
    "cointelegraph",
    "the block",
    "decrypt",
    "bitcoin magazine",
    "wublockchain",
];
const COMMODITY_SOURCES: &[&str] = &["kitco", "oilprice"];
const CURRENCY_SOURCES: &[&str] = &["fxstreet", "forexlive", "dailyfx"];

const CRYPTO_STRONG: &[&str] = &[
    "bitcoin", "btc", "ethereum", "eth", "crypto", "cryptocurrency", "blockchain", "defi",
    "nft", "web3", "altcoin", "stablecoin", "binance", "coinbase", "solana", "xrp", "ripple",
    "dogecoin", "tether", "usdt", "usdc", "halving", "memecoin", "spot etf",
];
const COMMODITY_STRONG: &[&str] = &[
    "gold price", "xauusd", "xau/usd", "gold futures", "comex", "bullion", "brent", "wti",
    "crude oil", "opec", "natural gas", "copper", "silver price", "wheat futures",
    "precious metals",
];
const CURRENCY_STRONG: &[&str] = &[
    "forex", "eur/usd", "usd/jpy", "gbp/usd", "usd/cny", "dollar index", "dxy", "yuan",
    "exchange rate", "fx market", "currency intervention",
];
const MACRO_STRONG: &[&str] = &[
    "federal reserve", "fed", "fomc", "ecb", "boj", "bank of england", "central bank",
    "interest rate", "rate cut", "rate hike", "inflation", "cpi", "pce", "gdp", "payrolls",
    "unemployment", "treasury yields", "recession", "tariff", "tariffs",
];
const CORPORATE_STRONG: &[&str] = &[
    "earnings", "quarterly results", "revenue", "guidance", "merger", "acquisition",
    "acquires", "buyback", "dividend", "ipo", "ceo", "layoffs", "bankruptcy",
];
const EQUITIES_STRONG: &[&str] = &[
    "s&p 500", "nasdaq", "dow jones", "dow", "stoxx", "nikkei", "ftse", "dax", "hang seng",
    "wall street", "stock market", "russell 2000",
];

const EQUITIES_MEDIUM: &[&str] = &[
    "stocks", "shares", "index", "rally", "selloff", "sell-off", "bull", "bear", "futures",
    "investors", "equities",
];
const COMMODITY_MEDIUM: &[&str] = &["gold", "oil", "metal", "barrel", "ounce", "mining", "energy"];
const CURRENCY_MEDIUM: &[&str] = &["dollar", "euro", "yen", "pound", "currency", "sterling"];
const CORPORATE_MEDIUM: &[&str] = &["company", "profit", "sales", "quarter", "deal", "board"];

/// Lowercase, turn every non-alphanumeric char into a space, pad with spaces.
/// Keywords go through the same transform, so matching is on token boundaries.
fn tokenize(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    format!(" {} ", crate::ingest::collapse_whitespace(&mapped))
}

fn count_matches(text: &str, keywords: &[&str], threshold: usize) -> bool {
    let mut count = 0;
    for kw in keywords {
        let needle = tokenize(kw);
        if needle.trim().is_empty() {
            continue;
        }
        if text.contains(&needle) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }
    false
}

fn source_matches(source: &str, list: &[&str]) -> bool {
    list.iter().any(|s| source.contains(s))
}

/// Assign a category from source routing, then strong keywords (one hit),
/// then medium keywords (two hits). Falls back to `Macro`.
pub fn categorize(item: &RawItem) -> Category {
    let source = item.source_id.to_lowercase();
    if source_matches(&source, CRYPTO_SOURCES) {
        return Category::Crypto;
    }
    if source_matches(&source, COMMODITY_SOURCES) {
        return Category::Commodities;
    }
    if source_matches(&source, CURRENCY_SOURCES) {
        return Category::Currency;
    }

    let text = tokenize(&format!("{} {}", item.title, item.body));

    let strong: [(&[&str], Category); 6] = [
        (CRYPTO_STRONG, Category::Crypto),
        (COMMODITY_STRONG, Category::Commodities),
        (CURRENCY_STRONG, Category::Currency),
        (MACRO_STRONG, Category::Macro),
        (CORPORATE_STRONG, Category::Corporate),
        (EQUITIES_STRONG, Category::Equities),
    ];
    for (kws, cat) in strong {
        if count_matches(&text, kws, 1) {
            return cat;
        }
    }

    let medium: [(&[&str], Category); 4] = [
        (EQUITIES_MEDIUM, Category::Equities),
        (COMMODITY_MEDIUM, Category::Commodities),
        (CURRENCY_MEDIUM, Category::Currency),
        (CORPORATE_MEDIUM, Category::Corporate),
    ];
    for (kws, cat) in medium {
        if count_matches(&text, kws, 2) {
            return cat;
        }
    }

    Category::Macro
}
