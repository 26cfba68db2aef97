//! Metrics registry for crews and agents.
//!
//! Counters are keyed by a composite label tuple (crew id, agent name,
//! provider, model). An agent that switches provider or model mid-run gets
//! a fresh bucket per distinct tuple; buckets are never merged implicitly.
//!
//! The registry is an explicit injectable service (constructor-injected
//! into the orchestrator) rather than a module-level singleton, so tests
//! and multi-crew hosts stay isolated. A process-wide default handle is
//! available through [`default_metrics`].

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::TokenUsage;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Composite label tuple identifying one counter bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricsLabels {
    /// Crew id; empty when not applicable.
    pub crew_id: String,
    /// Agent name; empty when not applicable.
    pub agent_name: String,
    /// Provider identity; empty when not applicable.
    pub provider: String,
    /// Model identifier; empty when not applicable.
    pub model: String,
}

impl MetricsLabels {
    /// Labels for an agent within a crew.
    pub fn new(crew_id: &str, agent_name: &str, provider: &str, model: &str) -> Self {
        Self {
            crew_id: crew_id.to_string(),
            agent_name: agent_name.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }

    /// Lookup key: the four fields concatenated, empty string for absent
    /// fields.
    pub fn key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.crew_id, self.agent_name, self.provider, self.model
        )
    }

    fn crew_prefix(crew_id: &str) -> String {
        format!("{}\u{1f}", crew_id)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Per-function-name call statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallStats {
    /// Call count.
    pub calls: u64,
    /// Cumulative latency in milliseconds.
    pub latency_ms_sum: f64,
}

/// Point-in-time view of one bucket (or a sum over buckets).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Request count.
    pub requests: u64,
    /// Error count.
    pub errors: u64,
    /// Derived: `errors / requests`, 0 when `requests` is 0.
    pub error_rate: f64,
    /// Streaming-request count (included in `requests`).
    pub streaming_requests: u64,
    /// Cumulative request duration in milliseconds.
    pub duration_ms_sum: f64,
    /// Number of duration observations.
    pub duration_count: u64,
    /// Cumulative prompt tokens.
    pub prompt_tokens: i64,
    /// Cumulative completion tokens.
    pub completion_tokens: i64,
    /// Cumulative total tokens.
    pub total_tokens: i64,
    /// Cumulative estimated cost in USD (exact decimal).
    pub estimated_cost: Decimal,
    /// Aggregate function-call count.
    pub function_calls: u64,
    /// Per-function-name breakdown.
    pub function_breakdown: HashMap<String, FunctionCallStats>,
}

impl MetricsSnapshot {
    fn merge(&mut self, other: &MetricsSnapshot) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.streaming_requests += other.streaming_requests;
        self.duration_ms_sum += other.duration_ms_sum;
        self.duration_count += other.duration_count;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.estimated_cost = (self.estimated_cost + other.estimated_cost).normalize();
        self.function_calls += other.function_calls;
        for (name, stats) in &other.function_breakdown {
            let entry = self.function_breakdown.entry(name.clone()).or_default();
            entry.calls += stats.calls;
            entry.latency_ms_sum += stats.latency_ms_sum;
        }
        self.error_rate = derived_error_rate(self.errors, self.requests);
    }
}

fn derived_error_rate(errors: u64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        errors as f64 / requests as f64
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Bucket {
    snapshot: MetricsSnapshot,
}

/// Concurrent counter registry keyed by [`MetricsLabels`].
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    buckets: DashMap<String, Bucket>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bucket(&self, labels: &MetricsLabels, f: impl FnOnce(&mut MetricsSnapshot)) {
        let mut entry = self.buckets.entry(labels.key()).or_default();
        f(&mut entry.snapshot);
    }

    /// Record one completed request and its duration.
    pub fn record_request(&self, labels: &MetricsLabels, is_streaming: bool, duration_ms: f64) {
        self.with_bucket(labels, |s| {
            s.requests += 1;
            if is_streaming {
                s.streaming_requests += 1;
            }
            s.duration_ms_sum += duration_ms;
            s.duration_count += 1;
        });
    }

    /// Record one failed request.
    pub fn record_error(&self, labels: &MetricsLabels) {
        self.with_bucket(labels, |s| s.errors += 1);
    }

    /// Record token usage. Missing counts are skipped, not zeroed.
    pub fn record_tokens(&self, labels: &MetricsLabels, usage: &TokenUsage) {
        self.with_bucket(labels, |s| {
            if let Some(prompt) = usage.prompt_tokens {
                s.prompt_tokens += prompt;
            }
            if let Some(completion) = usage.completion_tokens {
                s.completion_tokens += completion;
            }
            if let Some(total) = usage.total() {
                s.total_tokens += total;
            }
        });
    }

    /// Add to the cumulative estimated cost (exact decimal addition).
    pub fn record_estimated_cost(&self, labels: &MetricsLabels, usd: Decimal) {
        self.with_bucket(labels, |s| {
            s.estimated_cost = (s.estimated_cost + usd).normalize();
        });
    }

    /// Record a function call: bumps the aggregate counter and, when a name
    /// is given, the per-function-name breakdown.
    pub fn record_function_call(
        &self,
        labels: &MetricsLabels,
        latency_ms: f64,
        function_name: Option<&str>,
    ) {
        self.with_bucket(labels, |s| {
            s.function_calls += 1;
            if let Some(name) = function_name {
                let entry = s.function_breakdown.entry(name.to_string()).or_default();
                entry.calls += 1;
                entry.latency_ms_sum += latency_ms;
            }
        });
    }

    /// Snapshot of one bucket. An unknown label tuple yields an empty
    /// snapshot.
    pub fn snapshot(&self, labels: &MetricsLabels) -> MetricsSnapshot {
        let mut snapshot = self
            .buckets
            .get(&labels.key())
            .map(|b| b.snapshot.clone())
            .unwrap_or_default();
        snapshot.error_rate = derived_error_rate(snapshot.errors, snapshot.requests);
        snapshot
    }

    /// Sum over every bucket belonging to the crew id.
    pub fn snapshot_crew(&self, crew_id: &str) -> MetricsSnapshot {
        let prefix = MetricsLabels::crew_prefix(crew_id);
        let mut total = MetricsSnapshot::default();
        for entry in self.buckets.iter() {
            if entry.key().starts_with(&prefix) {
                total.merge(&entry.value().snapshot);
            }
        }
        total
    }

    /// Clear one bucket, or the entire registry when `labels` is `None`.
    pub fn reset(&self, labels: Option<&MetricsLabels>) {
        match labels {
            Some(labels) => {
                self.buckets.remove(&labels.key());
            }
            None => self.buckets.clear(),
        }
    }

    /// Clear every bucket belonging to the crew id.
    pub fn reset_crew(&self, crew_id: &str) {
        let prefix = MetricsLabels::crew_prefix(crew_id);
        self.buckets.retain(|key, _| !key.starts_with(&prefix));
    }
}

static DEFAULT_METRICS: Lazy<Arc<MetricsRegistry>> = Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Process-wide default metrics registry.
pub fn default_metrics() -> Arc<MetricsRegistry> {
    DEFAULT_METRICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn labels() -> MetricsLabels {
        MetricsLabels::new("crew-1", "writer", "openai", "gpt-4o-mini")
    }

    #[test]
    fn test_request_durations_accumulate() {
        let registry = MetricsRegistry::new();
        let durations = [12.0, 40.5, 7.5];
        for d in durations {
            registry.record_request(&labels(), false, d);
        }

        let snapshot = registry.snapshot(&labels());
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.duration_count, 3);
        assert_eq!(snapshot.duration_ms_sum, 60.0);
        assert_eq!(snapshot.streaming_requests, 0);
    }

    #[test]
    fn test_error_rate_zero_without_requests() {
        let registry = MetricsRegistry::new();
        let snapshot = registry.snapshot(&labels());
        assert_eq!(snapshot.error_rate, 0.0);
        assert!(!snapshot.error_rate.is_nan());
    }

    #[test]
    fn test_error_rate_derived() {
        let registry = MetricsRegistry::new();
        registry.record_request(&labels(), false, 1.0);
        registry.record_request(&labels(), false, 1.0);
        registry.record_error(&labels());

        let snapshot = registry.snapshot(&labels());
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.error_rate, 0.5);
    }

    #[test]
    fn test_distinct_tuples_get_distinct_buckets() {
        let registry = MetricsRegistry::new();
        registry.record_request(&labels(), false, 1.0);

        let switched = MetricsLabels::new("crew-1", "writer", "openai", "gpt-4o");
        registry.record_request(&switched, false, 1.0);

        assert_eq!(registry.snapshot(&labels()).requests, 1);
        assert_eq!(registry.snapshot(&switched).requests, 1);
        // The crew-level view sums both.
        assert_eq!(registry.snapshot_crew("crew-1").requests, 2);
    }

    #[test]
    fn test_crew_prefix_does_not_match_similar_ids() {
        let registry = MetricsRegistry::new();
        registry.record_request(&MetricsLabels::new("crew-1", "a", "p", "m"), false, 1.0);
        registry.record_request(&MetricsLabels::new("crew-10", "a", "p", "m"), false, 1.0);

        assert_eq!(registry.snapshot_crew("crew-1").requests, 1);
    }

    #[test]
    fn test_tokens_and_cost() {
        let registry = MetricsRegistry::new();
        registry.record_tokens(&labels(), &TokenUsage::new(100, 50));
        registry.record_tokens(&labels(), &TokenUsage::new(10, 5));
        registry.record_estimated_cost(&labels(), dec!(0.005));
        registry.record_estimated_cost(&labels(), dec!(0.005));

        let snapshot = registry.snapshot(&labels());
        assert_eq!(snapshot.prompt_tokens, 110);
        assert_eq!(snapshot.completion_tokens, 55);
        assert_eq!(snapshot.total_tokens, 165);
        assert_eq!(snapshot.estimated_cost, dec!(0.01));
    }

    #[test]
    fn test_function_call_breakdown() {
        let registry = MetricsRegistry::new();
        registry.record_function_call(&labels(), 3.0, Some("search"));
        registry.record_function_call(&labels(), 5.0, Some("search"));
        registry.record_function_call(&labels(), 1.0, None);

        let snapshot = registry.snapshot(&labels());
        assert_eq!(snapshot.function_calls, 3);
        let search = snapshot.function_breakdown.get("search").unwrap();
        assert_eq!(search.calls, 2);
        assert_eq!(search.latency_ms_sum, 8.0);
        assert_eq!(snapshot.function_breakdown.len(), 1);
    }

    #[test]
    fn test_reset_one_bucket_and_all() {
        let registry = MetricsRegistry::new();
        let other = MetricsLabels::new("crew-2", "a", "p", "m");
        registry.record_request(&labels(), false, 1.0);
        registry.record_request(&other, false, 1.0);

        registry.reset(Some(&labels()));
        assert_eq!(registry.snapshot(&labels()).requests, 0);
        assert_eq!(registry.snapshot(&other).requests, 1);

        registry.reset(None);
        assert_eq!(registry.snapshot(&other).requests, 0);
    }

    #[test]
    fn test_reset_crew_scoped() {
        let registry = MetricsRegistry::new();
        registry.record_request(&labels(), false, 1.0);
        let other = MetricsLabels::new("crew-2", "a", "p", "m");
        registry.record_request(&other, false, 1.0);

        registry.reset_crew("crew-1");
        assert_eq!(registry.snapshot_crew("crew-1").requests, 0);
        assert_eq!(registry.snapshot(&other).requests, 1);
    }
}
