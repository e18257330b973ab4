//! Per-model prices in USD per million tokens.
//!
//! Matching is by model-family substring. Unknown models are priced at the
//! mid-tier rate so spend is never under-counted against the daily ceiling.

use super::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

const FREE: ModelPricing = ModelPricing {
    input_per_mtok: 0.0,
    output_per_mtok: 0.0,
};

const MID_TIER: ModelPricing = ModelPricing {
    input_per_mtok: 3.0,
    output_per_mtok: 15.0,
};

/// Checked in order; first substring hit wins.
const TABLE: &[(&str, ModelPricing)] = &[
    ("mock", FREE),
    ("fallback", FREE),
    ("haiku", ModelPricing { input_per_mtok: 0.80, output_per_mtok: 4.0 }),
    ("sonnet", MID_TIER),
    ("opus", ModelPricing { input_per_mtok: 15.0, output_per_mtok: 75.0 }),
    ("gpt-4o-mini", ModelPricing { input_per_mtok: 0.15, output_per_mtok: 0.60 }),
    ("gpt-4.1-mini", ModelPricing { input_per_mtok: 0.40, output_per_mtok: 1.60 }),
    ("gpt-4o", ModelPricing { input_per_mtok: 2.50, output_per_mtok: 10.0 }),
];

pub fn pricing_for(model: &str) -> ModelPricing {
    let m = model.to_ascii_lowercase();
    TABLE
        .iter()
        .find(|(needle, _)| m.contains(needle))
        .map(|(_, p)| *p)
        .unwrap_or(MID_TIER)
}

pub fn cost_usd(model: &str, usage: &TokenUsage) -> f64 {
    let p = pricing_for(model);
    usage.input_tokens as f64 / 1_000_000.0 * p.input_per_mtok
        + usage.output_tokens as f64 / 1_000_000.0 * p.output_per_mtok
}
