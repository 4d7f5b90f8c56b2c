//! Model rate table.
//!
//! Rates are in USD per 1M tokens, input and output priced independently,
//! nested as `provider -> model -> rates`. Every provider carries a
//! `"default"` entry used for models it does not list, and unknown providers
//! fall back to the `"gemini"` provider's default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Model key holding a provider's fallback rate.
pub const DEFAULT_MODEL: &str = "default";

/// Provider whose default rate applies to unrecognized providers.
pub const GLOBAL_DEFAULT_PROVIDER: &str = "gemini";

/// Last-resort rate if the global default provider has no `"default"` entry.
pub const GENERIC_RATES: Rates = Rates {
    input_per_million: 0.10,
    output_per_million: 0.40,
};

// MARK: - Types

/// Per-million token rates for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Rates {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// A configurable rate entry (used for config overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Provider identifier (e.g., "claude", "gemini").
    pub provider: String,
    /// Model identifier, or `"default"` for the provider fallback.
    pub model: String,
    /// Cost per 1M input tokens in USD.
    pub input_cost_per_million: f64,
    /// Cost per 1M output tokens in USD.
    pub output_cost_per_million: f64,
}

/// Which level of the table produced a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSource {
    /// The provider lists this exact model.
    Model,
    /// Known provider, unknown model: the provider's `"default"` entry.
    ProviderDefault,
    /// Unknown provider: the global default provider's `"default"` entry.
    GlobalDefault,
    /// Nothing matched at all; [`GENERIC_RATES`].
    Generic,
}

impl RateSource {
    pub fn is_fallback(self) -> bool {
        !matches!(self, Self::Model)
    }
}

/// A rate together with where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRate {
    pub rates: Rates,
    pub source: RateSource,
}

/// Nested provider/model rate table.
#[derive(Debug, Clone)]
pub struct RateTable {
    providers: HashMap<String, HashMap<String, Rates>>,
}

// MARK: - Implementation

impl RateTable {
    /// Create a rate table with the built-in provider rates.
    pub fn new() -> Self {
        let mut table = Self::empty();

        // Claude (Anthropic)
        table.insert("claude", "claude-3-5-sonnet-latest", Rates::new(3.00, 15.00));
        table.insert("claude", "claude-3-5-sonnet-20241022", Rates::new(3.00, 15.00));
        table.insert("claude", "claude-3-5-haiku-latest", Rates::new(0.80, 4.00));
        table.insert("claude", "claude-3-5-haiku-20241022", Rates::new(0.80, 4.00));
        table.insert("claude", "claude-3-opus-latest", Rates::new(15.00, 75.00));
        table.insert("claude", "claude-sonnet-4-20250514", Rates::new(3.00, 15.00));
        table.insert("claude", "claude-opus-4-20250514", Rates::new(15.00, 75.00));
        table.insert("claude", DEFAULT_MODEL, Rates::new(3.00, 15.00));

        // Gemini (Google)
        table.insert("gemini", "gemini-2.0-flash", Rates::new(0.10, 0.40));
        table.insert("gemini", "gemini-1.5-flash", Rates::new(0.075, 0.30));
        table.insert("gemini", "gemini-1.5-pro", Rates::new(1.25, 5.00));
        table.insert("gemini", "gemini-2.5-flash", Rates::new(0.30, 2.50));
        table.insert("gemini", "gemini-2.5-pro", Rates::new(1.25, 10.00));
        table.insert("gemini", DEFAULT_MODEL, Rates::new(0.10, 0.40));

        // Perplexity
        table.insert("perplexity", "sonar", Rates::new(1.00, 1.00));
        table.insert("perplexity", "sonar-pro", Rates::new(3.00, 15.00));
        table.insert("perplexity", DEFAULT_MODEL, Rates::new(1.00, 1.00));

        table
    }

    /// A table with no entries; every lookup resolves to [`GENERIC_RATES`].
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Insert or replace the rate for a provider/model pair.
    pub fn insert(&mut self, provider: &str, model: &str, rates: Rates) {
        self.providers
            .entry(normalize(provider))
            .or_default()
            .insert(normalize(model), rates);
    }

    /// Layer config-supplied entries over the table. Entries with negative or
    /// non-finite rates are ignored.
    pub fn apply_overrides(&mut self, overrides: &[ModelPricing]) {
        for entry in overrides {
            let valid = [entry.input_cost_per_million, entry.output_cost_per_million]
                .iter()
                .all(|r| r.is_finite() && *r >= 0.0);
            if !valid {
                tracing::warn!(
                    provider = %entry.provider,
                    model = %entry.model,
                    "Ignoring pricing override with invalid rate"
                );
                continue;
            }
            self.insert(
                &entry.provider,
                &entry.model,
                Rates::new(entry.input_cost_per_million, entry.output_cost_per_million),
            );
        }
    }

    /// Resolve the rate for a provider/model pair, falling back to the
    /// provider default, then the global default provider, then
    /// [`GENERIC_RATES`].
    pub fn resolve(&self, provider: &str, model: &str) -> ResolvedRate {
        let provider = normalize(provider);
        let model = normalize(model);

        if let Some(models) = self.providers.get(&provider) {
            if let Some(rates) = models.get(&model) {
                return ResolvedRate {
                    rates: *rates,
                    source: RateSource::Model,
                };
            }
            if let Some(rates) = models.get(DEFAULT_MODEL) {
                return ResolvedRate {
                    rates: *rates,
                    source: RateSource::ProviderDefault,
                };
            }
        }

        match self
            .providers
            .get(GLOBAL_DEFAULT_PROVIDER)
            .and_then(|models| models.get(DEFAULT_MODEL))
        {
            Some(rates) => ResolvedRate {
                rates: *rates,
                source: RateSource::GlobalDefault,
            },
            None => ResolvedRate {
                rates: GENERIC_RATES,
                source: RateSource::Generic,
            },
        }
    }

    /// Check if a provider lists this exact model.
    pub fn has_model(&self, provider: &str, model: &str) -> bool {
        self.providers
            .get(&normalize(provider))
            .is_some_and(|models| models.contains_key(&normalize(model)))
    }

    /// All entries, sorted by provider then model.
    pub fn all(&self) -> Vec<ModelPricing> {
        let mut out: Vec<ModelPricing> = self
            .providers
            .iter()
            .flat_map(|(provider, models)| {
                models.iter().map(move |(model, rates)| ModelPricing {
                    provider: provider.clone(),
                    model: model.clone(),
                    input_cost_per_million: rates.input_per_million,
                    output_cost_per_million: rates.output_per_million,
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        out
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

// MARK: - Tests
