//! Pricing lookup keyed by (provider, model). When no row is active for a
//! pair, cost estimation returns nothing rather than guessing.

use atelier_types::{RunCost, RunUsage};

pub const PRICING_VERSION: &str = "2025-08";
pub const PRICING_CURRENCY: &str = "USD";

#[derive(Debug, Clone, Copy)]
pub struct PricingRow {
    pub provider: &'static str,
    pub model: &'static str,
    /// USD per million tokens.
    pub input_per_million: f64,
    pub cached_input_per_million: f64,
    pub output_per_million: f64,
}

const PRICING_TABLE: &[PricingRow] = &[
    PricingRow {
        provider: "openai",
        model: "gpt-4.1",
        input_per_million: 2.0,
        cached_input_per_million: 0.5,
        output_per_million: 8.0,
    },
    PricingRow {
        provider: "openai",
        model: "gpt-4.1-mini",
        input_per_million: 0.4,
        cached_input_per_million: 0.1,
        output_per_million: 1.6,
    },
    PricingRow {
        provider: "openai",
        model: "o4-mini",
        input_per_million: 1.1,
        cached_input_per_million: 0.275,
        output_per_million: 4.4,
    },
    PricingRow {
        provider: "anthropic",
        model: "claude-sonnet-4-20250514",
        input_per_million: 3.0,
        cached_input_per_million: 0.3,
        output_per_million: 15.0,
    },
    PricingRow {
        provider: "anthropic",
        model: "claude-3-5-haiku-20241022",
        input_per_million: 0.8,
        cached_input_per_million: 0.08,
        output_per_million: 4.0,
    },
];

pub fn lookup(provider: &str, model: &str) -> Option<&'static PricingRow> {
    PRICING_TABLE
        .iter()
        .find(|row| row.provider == provider && row.model == model)
}

/// Estimates cost for accumulated usage against an active pricing row.
/// Cached input tokens are billed at the cache-read rate instead of the
/// full input rate.
pub fn estimate_cost(usage: &RunUsage, row: &PricingRow) -> RunCost {
    let fresh_input = usage.input_tokens.saturating_sub(usage.cached_input_tokens);
    let usd = (fresh_input as f64 * row.input_per_million
        + usage.cached_input_tokens as f64 * row.cached_input_per_million
        + usage.output_tokens as f64 * row.output_per_million)
        / 1_000_000.0;
    RunCost {
        currency: Some(PRICING_CURRENCY.to_string()),
        estimated_usd: Some(usd),
        pricing_version: Some(PRICING_VERSION.to_string()),
    }
}
