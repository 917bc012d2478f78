use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use spaceduck_types::TokenUsage;

/// Per-model price schedule, in USD per million tokens. Cache rates are
/// expressed as multipliers on the input rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRates {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    /// Multiplier on the input rate for cache-read tokens, in [0, 1].
    pub cache_read_discount: f64,
    /// Multiplier on the input rate for cache-write tokens, >= 0.
    pub cache_write_multiplier: f64,
}

const FALLBACK_RATES: ModelRates = ModelRates {
    input_per_1m: 1.0,
    output_per_1m: 5.0,
    cache_read_discount: 1.0,
    cache_write_multiplier: 0.0,
};

fn default_rates() -> HashMap<String, ModelRates> {
    let mut rates = HashMap::new();
    let mut add = |id: &str, input: f64, output: f64, read: f64, write: f64| {
        rates.insert(
            id.to_string(),
            ModelRates {
                input_per_1m: input,
                output_per_1m: output,
                cache_read_discount: read,
                cache_write_multiplier: write,
            },
        );
    };
    add("claude-3-5-sonnet-latest", 3.0, 15.0, 0.1, 1.25);
    add("claude-3-5-haiku-latest", 0.8, 4.0, 0.1, 1.25);
    add("gpt-4o", 2.5, 10.0, 0.5, 0.0);
    add("gpt-4o-mini", 0.15, 0.6, 0.5, 0.0);
    add("llama-3.1-8b-instant", 0.05, 0.08, 1.0, 0.0);
    add("mistral-small-latest", 0.2, 0.6, 1.0, 0.0);
    rates
}

/// Model price table with user overrides shadowing the defaults. Unknown
/// models fall back to a flat rate and warn once per model id for the
/// lifetime of the process.
pub struct PricingLookup {
    rates: HashMap<String, ModelRates>,
    warned: Mutex<HashSet<String>>,
}

impl PricingLookup {
    pub fn new() -> Self {
        Self::with_overrides(HashMap::new())
    }

    pub fn with_overrides(overrides: HashMap<String, ModelRates>) -> Self {
        let mut rates = default_rates();
        rates.extend(overrides);
        Self {
            rates,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn rates_for(&self, model: &str) -> ModelRates {
        if let Some(rates) = self.rates.get(model) {
            return *rates;
        }
        let mut warned = self.warned.lock().expect("pricing warned set poisoned");
        if warned.insert(model.to_string()) {
            tracing::warn!(
                model,
                "no price schedule for model, using fallback rates"
            );
        }
        FALLBACK_RATES
    }

    /// Estimate the cost of one completion from exact token usage. Absent
    /// cache fields reduce to the naive input/output formula.
    pub fn estimate(&self, model: &str, usage: &TokenUsage) -> f64 {
        let rates = self.rates_for(model);
        let cache_read = usage.cache_read_tokens.unwrap_or(0);
        let cache_write = usage.cache_write_tokens.unwrap_or(0);
        let uncached_input = usage.input_tokens.saturating_sub(cache_read);
        uncached_input as f64 / 1e6 * rates.input_per_1m
            + cache_read as f64 / 1e6 * rates.input_per_1m * rates.cache_read_discount
            + cache_write as f64 / 1e6 * rates.input_per_1m * rates.cache_write_multiplier
            + usage.output_tokens as f64 / 1e6 * rates.output_per_1m
    }
}

impl Default for PricingLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            cache_read_tokens: None,
            cache_write_tokens: None,
        }
    }

    #[test]
    fn naive_formula_without_cache_fields() {
        let pricing = PricingLookup::new();
        let cost = pricing.estimate("gpt-4o", &usage(1_000_000, 1_000_000));
        assert!((cost - 12.5).abs() < 1e-9);
    }

    #[test]
    fn zero_cache_read_equals_absent_cache_fields() {
        let pricing = PricingLookup::new();
        let mut with_cache = usage(200_000, 50_000);
        with_cache.cache_read_tokens = Some(0);
        with_cache.cache_write_tokens = Some(0);
        let plain = pricing.estimate("claude-3-5-sonnet-latest", &usage(200_000, 50_000));
        let cached = pricing.estimate("claude-3-5-sonnet-latest", &with_cache);
        assert!((plain - cached).abs() < 1e-12);
    }

    #[test]
    fn cache_reads_are_discounted_against_input_rate() {
        let pricing = PricingLookup::new();
        let mut u = usage(1_000_000, 0);
        u.cache_read_tokens = Some(1_000_000);
        // All input served from cache: 3.0 * 0.1
        let cost = pricing.estimate("claude-3-5-sonnet-latest", &u);
        assert!((cost - 0.3).abs() < 1e-9);
    }

    #[test]
    fn cache_writes_are_charged_on_top() {
        let pricing = PricingLookup::new();
        let mut u = usage(1_000_000, 0);
        u.cache_write_tokens = Some(1_000_000);
        // 3.0 uncached input + 3.0 * 1.25 cache write
        let cost = pricing.estimate("claude-3-5-sonnet-latest", &u);
        assert!((cost - 6.75).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_fallback_rates() {
        let pricing = PricingLookup::new();
        let cost = pricing.estimate("mystery-model", &usage(1_000_000, 1_000_000));
        assert!((cost - 6.0).abs() < 1e-9);
        // Second lookup takes the already-warned path and stays consistent.
        let again = pricing.estimate("mystery-model", &usage(1_000_000, 1_000_000));
        assert!((cost - again).abs() < 1e-12);
    }

    #[test]
    fn overrides_shadow_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "gpt-4o".to_string(),
            ModelRates {
                input_per_1m: 1.0,
                output_per_1m: 1.0,
                cache_read_discount: 1.0,
                cache_write_multiplier: 0.0,
            },
        );
        let pricing = PricingLookup::with_overrides(overrides);
        let cost = pricing.estimate("gpt-4o", &usage(1_000_000, 1_000_000));
        assert!((cost - 2.0).abs() < 1e-9);
    }
}
