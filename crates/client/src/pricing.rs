//! Model pricing table for usage-report normalization.
//!
//! Rates are USD per million tokens. Unknown models fall back to the
//! mid-tier row so reports stay conservative rather than absent.

use serde::Deserialize;

use happy_protocol::messages::{CostTotals, TokenTotals};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

const OPUS: ModelPricing = ModelPricing {
    input: 15.0,
    output: 75.0,
    cache_read: 1.5,
    cache_write: 18.75,
};

const SONNET: ModelPricing = ModelPricing {
    input: 3.0,
    output: 15.0,
    cache_read: 0.3,
    cache_write: 3.75,
};

const HAIKU: ModelPricing = ModelPricing {
    input: 0.8,
    output: 4.0,
    cache_read: 0.08,
    cache_write: 1.0,
};

/// Rates for a model id, by family substring. Unknown models price as the
/// mid tier.
pub fn pricing_for(model: &str) -> ModelPricing {
    let model = model.to_ascii_lowercase();
    if model.contains("opus") {
        OPUS
    } else if model.contains("haiku") {
        HAIKU
    } else {
        SONNET
    }
}

/// Usage numbers as agents report them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Normalizes raw usage into the wire `{tokens, cost}` envelope.
pub fn normalize(model: Option<&str>, usage: &RawUsage) -> (TokenTotals, CostTotals) {
    let rates = pricing_for(model.unwrap_or(""));
    let tokens = TokenTotals {
        input: usage.input_tokens,
        output: usage.output_tokens,
        cache_read: usage.cache_read_input_tokens,
        cache_write: usage.cache_creation_input_tokens,
        total: usage.input_tokens
            + usage.output_tokens
            + usage.cache_read_input_tokens
            + usage.cache_creation_input_tokens,
    };
    let input_cost = (tokens.input as f64 * rates.input
        + tokens.cache_read as f64 * rates.cache_read
        + tokens.cache_write as f64 * rates.cache_write)
        / 1_000_000.0;
    let output_cost = tokens.output as f64 * rates.output / 1_000_000.0;
    let cost = CostTotals {
        input: input_cost,
        output: output_cost,
        total: input_cost + output_cost,
    };
    (tokens, cost)
}
