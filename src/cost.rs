//! Token cost calculation and aggregation.
//!
//! Costs are computed from per-million-token rates and summed repeatedly
//! across many calls, so all arithmetic uses arbitrary-precision decimals
//! ([`rust_decimal::Decimal`]) rather than binary floating point.
//! Cumulative float error is unacceptable for financial reporting; the
//! aggregated total must equal the sum of the per-agent totals exactly.
//!
//! Missing or invalid numeric inputs degrade to `None` ("cost unknown,
//! skip recording"), never to an error.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::TokenUsage;
use crate::state::SharedState;

/// Fixed fractional precision for cost arithmetic.
const COST_SCALE: u32 = 10;

/// Namespace prefix for per-agent cost entries in shared state.
const COST_KEY_PREFIX: &str = "__cost:";

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per 1M prompt tokens.
    pub prompt_cost_per_1m: f64,
    /// USD per 1M completion tokens.
    pub completion_cost_per_1m: f64,
}

impl ModelPricing {
    /// Create a pricing entry.
    pub fn new(prompt_cost_per_1m: f64, completion_cost_per_1m: f64) -> Self {
        Self {
            prompt_cost_per_1m,
            completion_cost_per_1m,
        }
    }
}

/// Pricing lookup boundary.
///
/// Absent or invalid pricing must degrade to `None` ("cost unknown"),
/// never panic or error.
pub trait PricingLookup: Send + Sync {
    /// Pricing for a model identifier, if known.
    fn pricing_for(&self, model: &str) -> Option<ModelPricing>;
}

/// Known per-million-token prices for common models.
pub fn model_pricing_table() -> HashMap<&'static str, ModelPricing> {
    let mut m = HashMap::new();
    // OpenAI
    m.insert("gpt-4o", ModelPricing::new(2.5, 10.0));
    m.insert("gpt-4o-mini", ModelPricing::new(0.15, 0.6));
    m.insert("gpt-4.1", ModelPricing::new(2.0, 8.0));
    m.insert("gpt-4.1-mini", ModelPricing::new(0.4, 1.6));
    m.insert("gpt-4.1-nano", ModelPricing::new(0.1, 0.4));
    m.insert("o3-mini", ModelPricing::new(1.1, 4.4));
    m.insert("o4-mini", ModelPricing::new(1.1, 4.4));
    // Anthropic
    m.insert("claude-3-5-haiku-latest", ModelPricing::new(0.8, 4.0));
    m.insert("claude-sonnet-4-20250514", ModelPricing::new(3.0, 15.0));
    m.insert("claude-opus-4-20250514", ModelPricing::new(15.0, 75.0));
    // Google
    m.insert("gemini-2.0-flash", ModelPricing::new(0.1, 0.4));
    m.insert("gemini-1.5-pro", ModelPricing::new(1.25, 5.0));
    m.insert("gemini-1.5-flash", ModelPricing::new(0.075, 0.3));
    // Mistral
    m.insert("mistral-small-latest", ModelPricing::new(0.1, 0.3));
    m.insert("mistral-large-latest", ModelPricing::new(2.0, 6.0));
    m
}

/// [`PricingLookup`] backed by the built-in table.
#[derive(Debug, Default)]
pub struct StaticPricing;

impl PricingLookup for StaticPricing {
    fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        model_pricing_table().get(model).copied()
    }
}

// ---------------------------------------------------------------------------
// UsageCost
// ---------------------------------------------------------------------------

/// Exact decimal cost of one or more model calls, plus token counts.
///
/// Decimal fields serialize as decimal strings (e.g., `"0.005"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCost {
    /// Cost of prompt tokens, USD.
    pub prompt_cost: Decimal,
    /// Cost of completion tokens, USD.
    pub completion_cost: Decimal,
    /// Total cost, USD.
    pub total_cost: Decimal,
    /// Prompt token count.
    pub prompt_tokens: i64,
    /// Completion token count.
    pub completion_tokens: i64,
    /// Total token count.
    pub total_tokens: i64,
}

impl UsageCost {
    /// Merge another cost into this one. Addition is associative and
    /// commutative, so merge order never affects the result.
    pub fn add(&mut self, other: &UsageCost) {
        self.prompt_cost = (self.prompt_cost + other.prompt_cost).normalize();
        self.completion_cost = (self.completion_cost + other.completion_cost).normalize();
        self.total_cost = (self.total_cost + other.total_cost).normalize();
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Compute the cost of a single call from token counts and pricing.
///
/// Returns `None` when a required numeric input is missing or not a
/// number; callers treat that as "cost unknown, skip recording".
pub fn calculate_cost(usage: &TokenUsage, pricing: &ModelPricing) -> Option<UsageCost> {
    let prompt_tokens = usage.prompt_tokens?;
    let completion_tokens = usage.completion_tokens?;
    if prompt_tokens < 0 || completion_tokens < 0 {
        return None;
    }

    let prompt_rate = decimal_from_f64(pricing.prompt_cost_per_1m)?;
    let completion_rate = decimal_from_f64(pricing.completion_cost_per_1m)?;
    let million = Decimal::from(1_000_000u32);

    let prompt_cost = (Decimal::from(prompt_tokens) * prompt_rate / million)
        .round_dp(COST_SCALE)
        .normalize();
    let completion_cost = (Decimal::from(completion_tokens) * completion_rate / million)
        .round_dp(COST_SCALE)
        .normalize();
    let total_cost = (prompt_cost + completion_cost).normalize();

    Some(UsageCost {
        prompt_cost,
        completion_cost,
        total_cost,
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    })
}

fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Decimal::try_from(value).ok()
}

// ---------------------------------------------------------------------------
// State-backed aggregation
// ---------------------------------------------------------------------------

/// Aggregated cost view across all agents in a crew.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedCosts {
    /// Sum over all agents. Exactly equals the decimal sum of every entry
    /// in `by_agent`.
    pub total: UsageCost,
    /// Per-agent breakdown.
    pub by_agent: HashMap<String, UsageCost>,
}

fn cost_key(agent_name: &str) -> String {
    format!("{}{}", COST_KEY_PREFIX, agent_name)
}

/// Merge a new cost into the agent's record in shared state.
///
/// No-op when `cost` is `None` (cost unknown). The merge is additive across
/// both cost and token fields.
pub fn track_cost_in_state(agent_name: &str, cost: Option<&UsageCost>, state: &SharedState) {
    let Some(cost) = cost else {
        return;
    };

    let key = cost_key(agent_name);
    let mut merged = state
        .get(&key)
        .and_then(|v| serde_json::from_value::<UsageCost>(v).ok())
        .unwrap_or_default();
    merged.add(cost);

    match serde_json::to_value(&merged) {
        Ok(value) => state.set(key, value),
        Err(e) => log::warn!("Failed to serialize cost record for '{}': {}", agent_name, e),
    }
}

/// Scan all namespaced cost entries and sum them.
pub fn aggregated_costs(state: &SharedState) -> AggregatedCosts {
    let mut aggregated = AggregatedCosts::default();
    for (key, value) in state.get_all() {
        let Some(agent_name) = key.strip_prefix(COST_KEY_PREFIX) else {
            continue;
        };
        let Ok(cost) = serde_json::from_value::<UsageCost>(value) else {
            log::warn!("Skipping malformed cost entry under '{}'", key);
            continue;
        };
        aggregated.total.add(&cost);
        aggregated.by_agent.insert(agent_name.to_string(), cost);
    }
    aggregated
}

/// Clear all namespaced cost entries, leaving other state keys untouched.
pub fn reset_costs(state: &SharedState) {
    for key in state.keys() {
        if key.starts_with(COST_KEY_PREFIX) {
            state.remove(&key);
        }
    }
}

/// Fetch the recorded cost for one agent, if any.
pub fn agent_cost(agent_name: &str, state: &SharedState) -> Option<UsageCost> {
    state
        .get(&cost_key(agent_name))
        .and_then(|v| serde_json::from_value::<UsageCost>(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn usage(prompt: i64, completion: i64) -> TokenUsage {
        TokenUsage {
            prompt_tokens: Some(prompt),
            completion_tokens: Some(completion),
        }
    }

    #[test]
    fn test_calculate_cost_exact() {
        let pricing = ModelPricing::new(2.0, 6.0);
        let cost = calculate_cost(&usage(1000, 500), &pricing).unwrap();

        assert_eq!(cost.prompt_cost.to_string(), "0.002");
        assert_eq!(cost.completion_cost.to_string(), "0.003");
        assert_eq!(cost.total_cost.to_string(), "0.005");
        assert_eq!(cost.total_tokens, 1500);
    }

    #[test]
    fn test_calculate_cost_missing_inputs() {
        let pricing = ModelPricing::new(2.0, 6.0);
        let missing = TokenUsage {
            prompt_tokens: None,
            completion_tokens: Some(10),
        };
        assert!(calculate_cost(&missing, &pricing).is_none());

        let nan_pricing = ModelPricing::new(f64::NAN, 6.0);
        assert!(calculate_cost(&usage(10, 10), &nan_pricing).is_none());

        let negative = ModelPricing::new(-1.0, 6.0);
        assert!(calculate_cost(&usage(10, 10), &negative).is_none());
    }

    #[test]
    fn test_calculate_cost_zero_tokens() {
        let pricing = ModelPricing::new(2.0, 6.0);
        let cost = calculate_cost(&usage(0, 0), &pricing).unwrap();
        assert_eq!(cost.total_cost, Decimal::ZERO);
        assert_eq!(cost.total_tokens, 0);
    }

    #[test]
    fn test_track_cost_is_additive() {
        let state = SharedState::new();
        let pricing = ModelPricing::new(2.0, 6.0);
        let cost = calculate_cost(&usage(1000, 500), &pricing).unwrap();

        track_cost_in_state("writer", Some(&cost), &state);
        track_cost_in_state("writer", Some(&cost), &state);

        let recorded = agent_cost("writer", &state).unwrap();
        assert_eq!(recorded.total_cost, dec!(0.01));
        assert_eq!(recorded.total_cost.to_string(), "0.01");
        assert_eq!(recorded.prompt_tokens, 2000);
        assert_eq!(recorded.completion_tokens, 1000);
    }

    #[test]
    fn test_track_none_is_noop() {
        let state = SharedState::new();
        track_cost_in_state("writer", None, &state);
        assert!(agent_cost("writer", &state).is_none());
        assert!(state.get_all().is_empty());
    }

    #[test]
    fn test_aggregated_total_equals_sum_of_agents() {
        let state = SharedState::new();
        let pricing = ModelPricing::new(2.0, 6.0);

        track_cost_in_state(
            "a",
            calculate_cost(&usage(1000, 500), &pricing).as_ref(),
            &state,
        );
        track_cost_in_state(
            "b",
            calculate_cost(&usage(3000, 1500), &pricing).as_ref(),
            &state,
        );
        track_cost_in_state(
            "b",
            calculate_cost(&usage(1000, 500), &pricing).as_ref(),
            &state,
        );

        let aggregated = aggregated_costs(&state);
        let mut expected = Decimal::ZERO;
        for cost in aggregated.by_agent.values() {
            expected += cost.total_cost;
        }
        // Exact decimal equality, not approximate.
        assert_eq!(aggregated.total.total_cost, expected.normalize());
        assert_eq!(aggregated.total.total_cost, dec!(0.025));
        assert_eq!(aggregated.by_agent.len(), 2);
    }

    #[test]
    fn test_reset_costs_leaves_other_keys() {
        let state = SharedState::new();
        let pricing = ModelPricing::new(2.0, 6.0);
        state.set("task_context", json!("keep me"));
        track_cost_in_state(
            "a",
            calculate_cost(&usage(100, 100), &pricing).as_ref(),
            &state,
        );

        reset_costs(&state);

        let aggregated = aggregated_costs(&state);
        assert_eq!(aggregated.total.total_cost.to_string(), "0");
        assert!(aggregated.by_agent.is_empty());
        assert_eq!(state.get("task_context").unwrap(), "keep me");
    }

    #[test]
    fn test_merge_is_commutative() {
        let pricing = ModelPricing::new(0.15, 0.6);
        let x = calculate_cost(&usage(123, 456), &pricing).unwrap();
        let y = calculate_cost(&usage(789, 12), &pricing).unwrap();

        let mut xy = x.clone();
        xy.add(&y);
        let mut yx = y.clone();
        yx.add(&x);
        assert_eq!(xy, yx);
    }

    #[test]
    fn test_static_pricing_lookup() {
        let lookup = StaticPricing;
        assert!(lookup.pricing_for("gpt-4o-mini").is_some());
        assert!(lookup.pricing_for("unknown-model").is_none());
    }

    #[test]
    fn test_usage_cost_serializes_as_strings() {
        let pricing = ModelPricing::new(2.0, 6.0);
        let cost = calculate_cost(&usage(1000, 500), &pricing).unwrap();
        let value = serde_json::to_value(&cost).unwrap();
        assert_eq!(value["total_cost"], json!("0.005"));
    }
}
