//! Model registry, usage counters, and cost computation.
//!
//! Estimates here use the `len/4` heuristic and exist only for display and
//! budget fitting; billing always records the counters reported by the
//! provider.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Cache read tokens bill at one tenth of the input price.
pub const CACHE_READ_MULTIPLIER: f64 = 0.10;
/// Cache write multiplier for the 5-minute ephemeral TTL.
pub const CACHE_WRITE_MULTIPLIER_5M: f64 = 1.25;
/// Cache write multiplier for the 1-hour ephemeral TTL.
pub const CACHE_WRITE_MULTIPLIER_1H: f64 = 2.0;

/// Default model for new projects.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
/// Fixed summariser model: compression always runs on the cheapest tier.
pub const COMPRESS_MODEL: &str = "claude-haiku-4-5-20251001";
/// Pricing fallback tier for unknown model ids.
pub const FALLBACK_MODEL: &str = "claude-sonnet-4-5-20250929";

/// A Claude model with its pricing and window.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_id: &'static str,
    pub display_name: &'static str,
    /// USD per million input tokens.
    pub input_price: f64,
    /// USD per million output tokens.
    pub output_price: f64,
    pub context_window: usize,
    pub supports_thinking: bool,
}

static MODELS: LazyLock<HashMap<&'static str, ModelInfo>> = LazyLock::new(|| {
    let mut m = HashMap::new();

    m.insert(
        "claude-opus-4-6",
        ModelInfo {
            model_id: "claude-opus-4-6",
            display_name: "Claude Opus 4.6 (Latest)",
            input_price: 5.00,
            output_price: 25.00,
            context_window: 200_000,
            supports_thinking: true,
        },
    );
    m.insert(
        "claude-opus-4-5-20251101",
        ModelInfo {
            model_id: "claude-opus-4-5-20251101",
            display_name: "Claude Opus 4.5",
            input_price: 5.00,
            output_price: 25.00,
            context_window: 200_000,
            supports_thinking: true,
        },
    );
    m.insert(
        "claude-sonnet-4-5-20250929",
        ModelInfo {
            model_id: "claude-sonnet-4-5-20250929",
            display_name: "Claude Sonnet 4.5",
            input_price: 3.00,
            output_price: 15.00,
            context_window: 200_000,
            supports_thinking: true,
        },
    );
    m.insert(
        "claude-haiku-4-5-20251001",
        ModelInfo {
            model_id: "claude-haiku-4-5-20251001",
            display_name: "Claude Haiku 4.5",
            input_price: 1.00,
            output_price: 5.00,
            context_window: 200_000,
            supports_thinking: true,
        },
    );

    m
});

/// Look up a model, falling back to the Sonnet tier for unknown ids.
/// Pricing never fails a turn.
pub fn model_info(model_id: &str) -> &'static ModelInfo {
    MODELS.get(model_id).unwrap_or_else(|| {
        warn!("Unknown model '{}', using {} pricing", model_id, FALLBACK_MODEL);
        &MODELS[FALLBACK_MODEL]
    })
}

/// Whether a model id is in the registry.
pub fn is_known_model(model_id: &str) -> bool {
    MODELS.contains_key(model_id)
}

/// All registered model ids.
pub fn all_model_ids() -> Vec<&'static str> {
    MODELS.keys().copied().collect()
}

/// Ephemeral cache TTL selection for the Layer-1/Layer-2 markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTtl {
    #[default]
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl CacheTtl {
    pub fn write_multiplier(self) -> f64 {
        match self {
            CacheTtl::FiveMinutes => CACHE_WRITE_MULTIPLIER_5M,
            CacheTtl::OneHour => CACHE_WRITE_MULTIPLIER_1H,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheTtl::FiveMinutes => "5m",
            CacheTtl::OneHour => "1h",
        }
    }
}

/// Token counters from a single API response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl Usage {
    /// Total input-side tokens the provider processed.
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// Display colour hint for a cost figure. Advisory metadata, not a UI
/// concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostColor {
    Green,
    Yellow,
    Red,
}

/// Pre-send cost estimate for one turn, cache-awareness included.
#[derive(Debug, Clone, Default)]
pub struct CostEstimate {
    pub estimated_input_tokens: usize,
    pub estimated_input_cost: f64,
    pub cached_tokens: usize,
    pub savings_percent: f64,
}

/// Computes costs from observed usage counters.
pub struct TokenTracker {
    cache_ttl: CacheTtl,
}

impl TokenTracker {
    pub fn new(cache_ttl: CacheTtl) -> Self {
        Self { cache_ttl }
    }

    pub fn cache_ttl(&self) -> CacheTtl {
        self.cache_ttl
    }

    /// Cost in USD for a single API response.
    pub fn calculate_cost(&self, model_id: &str, usage: &Usage) -> f64 {
        let model = model_info(model_id);
        let inp = model.input_price / 1_000_000.0;
        let out = model.output_price / 1_000_000.0;
        let write_mult = self.cache_ttl.write_multiplier();

        let cost = usage.input_tokens as f64 * inp
            + usage.output_tokens as f64 * out
            + usage.cache_creation_tokens as f64 * inp * write_mult
            + usage.cache_read_tokens as f64 * inp * CACHE_READ_MULTIPLIER;

        debug!(
            "Cost [{}]: {} in + {} out + {} cache_write ({:.2}x) + {} cache_read = ${:.6}",
            model_id,
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_creation_tokens,
            write_mult,
            usage.cache_read_tokens,
            cost,
        );
        round6(cost)
    }

    /// Pre-send input-cost estimate. `cached_tokens` is the portion behind
    /// cache breakpoints; on a predicted hit it bills at the read rate.
    pub fn estimate_cost_with_cache(
        &self,
        model_id: &str,
        cached_tokens: usize,
        uncached_tokens: usize,
        likely_cache_hit: bool,
    ) -> CostEstimate {
        let model = model_info(model_id);
        let inp = model.input_price / 1_000_000.0;
        let total_tokens = cached_tokens + uncached_tokens;

        if likely_cache_hit && cached_tokens > 0 {
            let cost =
                cached_tokens as f64 * inp * CACHE_READ_MULTIPLIER + uncached_tokens as f64 * inp;
            let full = total_tokens as f64 * inp;
            let savings = if full > 0.0 { (1.0 - cost / full) * 100.0 } else { 0.0 };
            CostEstimate {
                estimated_input_tokens: total_tokens,
                estimated_input_cost: round6(cost),
                cached_tokens,
                savings_percent: (savings * 10.0).round() / 10.0,
            }
        } else {
            CostEstimate {
                estimated_input_tokens: total_tokens,
                estimated_input_cost: round6(total_tokens as f64 * inp),
                cached_tokens: 0,
                savings_percent: 0.0,
            }
        }
    }

    /// Flat input-price estimate, no cache assumptions.
    pub fn estimate_input_cost(&self, model_id: &str, token_count: usize) -> f64 {
        let model = model_info(model_id);
        round6(token_count as f64 * model.input_price / 1_000_000.0)
    }

    /// Rough compression-call cost: batch input plus ~30% of it back out,
    /// at summariser-tier pricing.
    pub fn estimate_compression_cost(&self, input_tokens: usize) -> f64 {
        let model = model_info(COMPRESS_MODEL);
        let estimated_output = input_tokens as f64 * 0.3;
        let cost = input_tokens as f64 * model.input_price / 1_000_000.0
            + estimated_output * model.output_price / 1_000_000.0;
        (cost * 10_000.0).round() / 10_000.0
    }
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self::new(CacheTtl::default())
    }
}

/// Short display string for a USD amount.
pub fn format_cost(cost_usd: f64) -> String {
    if cost_usd < 0.001 {
        format!("${cost_usd:.4}")
    } else if cost_usd < 0.10 {
        format!("${cost_usd:.3}")
    } else {
        format!("${cost_usd:.2}")
    }
}

/// Colour hint for a USD amount: green < $0.01, yellow < $0.10, red above.
pub fn cost_color(cost_usd: f64) -> CostColor {
    if cost_usd < 0.01 {
        CostColor::Green
    } else if cost_usd < 0.10 {
        CostColor::Yellow
    } else {
        CostColor::Red
    }
}

/// Local token estimate: ~4 bytes per token. Diverges from the provider's
/// tokeniser; callers only rely on the bounded-overshoot contract.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Registry Tests =====

    #[test]
    fn test_known_models_present() {
        assert!(is_known_model("claude-opus-4-6"));
        assert!(is_known_model("claude-sonnet-4-5-20250929"));
        assert!(is_known_model(COMPRESS_MODEL));
        assert!(!is_known_model("gpt-5"));
    }

    #[test]
    fn test_unknown_model_falls_back_to_sonnet() {
        let model = model_info("claude-nonexistent");
        assert_eq!(model.model_id, FALLBACK_MODEL);
        assert_eq!(model.input_price, 3.00);
    }

    #[test]
    fn test_all_models_have_200k_window() {
        for id in all_model_ids() {
            assert_eq!(model_info(id).context_window, 200_000, "{id}");
        }
    }

    // ===== Cost Formula Tests =====

    #[test]
    fn test_cost_plain_input_output() {
        let tracker = TokenTracker::new(CacheTtl::FiveMinutes);
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            ..Usage::default()
        };
        let cost = tracker.calculate_cost("claude-sonnet-4-5-20250929", &usage);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_cache_write_5m() {
        let tracker = TokenTracker::new(CacheTtl::FiveMinutes);
        let usage = Usage {
            cache_creation_tokens: 1_000_000,
            ..Usage::default()
        };
        // 3.00 * 1.25
        let cost = tracker.calculate_cost("claude-sonnet-4-5-20250929", &usage);
        assert!((cost - 3.75).abs() < 1e-9);
    }

    #[test]
    fn test_cost_cache_write_1h() {
        let tracker = TokenTracker::new(CacheTtl::OneHour);
        let usage = Usage {
            cache_creation_tokens: 1_000_000,
            ..Usage::default()
        };
        // 3.00 * 2.0
        let cost = tracker.calculate_cost("claude-sonnet-4-5-20250929", &usage);
        assert!((cost - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_cache_read_is_tenth() {
        let tracker = TokenTracker::default();
        let usage = Usage {
            cache_read_tokens: 1_000_000,
            ..Usage::default()
        };
        let cost = tracker.calculate_cost("claude-sonnet-4-5-20250929", &usage);
        assert!((cost - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_cost_unknown_model_still_computes() {
        let tracker = TokenTracker::default();
        let usage = Usage {
            input_tokens: 100,
            ..Usage::default()
        };
        let cost = tracker.calculate_cost("some-future-model", &usage);
        assert!(cost > 0.0);
    }

    // ===== Estimate Tests =====

    #[test]
    fn test_estimate_with_cache_hit_saves() {
        let tracker = TokenTracker::default();
        let est = tracker.estimate_cost_with_cache("claude-sonnet-4-5-20250929", 50_000, 1_000, true);
        assert_eq!(est.cached_tokens, 50_000);
        assert!(est.savings_percent > 80.0);

        let miss = tracker.estimate_cost_with_cache("claude-sonnet-4-5-20250929", 50_000, 1_000, false);
        assert_eq!(miss.cached_tokens, 0);
        assert!(miss.estimated_input_cost > est.estimated_input_cost);
    }

    #[test]
    fn test_estimate_zero_tokens() {
        let tracker = TokenTracker::default();
        let est = tracker.estimate_cost_with_cache("claude-sonnet-4-5-20250929", 0, 0, true);
        assert_eq!(est.estimated_input_cost, 0.0);
        assert_eq!(est.savings_percent, 0.0);
    }

    #[test]
    fn test_estimate_tokens_heuristic() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(4000)), 1000);
    }

    // ===== Formatting Tests =====

    #[test]
    fn test_format_cost_brackets() {
        assert_eq!(format_cost(0.0004), "$0.0004");
        assert_eq!(format_cost(0.042), "$0.042");
        assert_eq!(format_cost(1.5), "$1.50");
    }

    #[test]
    fn test_cost_color_thresholds() {
        assert_eq!(cost_color(0.005), CostColor::Green);
        assert_eq!(cost_color(0.05), CostColor::Yellow);
        assert_eq!(cost_color(0.50), CostColor::Red);
    }

    // ===== Usage Tests =====

    #[test]
    fn test_usage_total_input() {
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 99,
            cache_creation_tokens: 20,
            cache_read_tokens: 30,
        };
        assert_eq!(usage.total_input(), 60);
    }

    #[test]
    fn test_cache_ttl_serde_names() {
        assert_eq!(serde_json::to_string(&CacheTtl::FiveMinutes).unwrap(), "\"5m\"");
        assert_eq!(serde_json::to_string(&CacheTtl::OneHour).unwrap(), "\"1h\"");
        let ttl: CacheTtl = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(ttl, CacheTtl::OneHour);
    }
}
