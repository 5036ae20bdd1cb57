//! Usage accounting: lock-free counters for the live dashboard, per-model
//! pricing, and the record stream handed to the persistence collaborator.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use polymux_protocol::Usage;

/// Real-time counters, updated on every completed request. Historical data
/// is the persistence backend's concern; these seed the dashboard instantly.
#[derive(Debug, Default)]
pub struct Counters {
    total_requests: AtomicI64,
    success_count: AtomicI64,
    failure_count: AtomicI64,
    total_tokens: AtomicI64,
    cached_tokens: AtomicI64,
    reasoning_tokens: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total_requests: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, failed: bool, usage: &Usage) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_tokens.fetch_add(usage.total(), Ordering::Relaxed);
        self.cached_tokens
            .fetch_add(usage.cached_tokens, Ordering::Relaxed);
        self.reasoning_tokens
            .fetch_add(usage.reasoning_tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            cached_tokens: self.cached_tokens.load(Ordering::Relaxed),
            reasoning_tokens: self.reasoning_tokens.load(Ordering::Relaxed),
        }
    }

    /// Seed from aggregated history at startup.
    pub fn bootstrap(&self, snapshot: CounterSnapshot) {
        self.total_requests
            .store(snapshot.total_requests, Ordering::Relaxed);
        self.success_count
            .store(snapshot.success_count, Ordering::Relaxed);
        self.failure_count
            .store(snapshot.failure_count, Ordering::Relaxed);
        self.total_tokens
            .store(snapshot.total_tokens, Ordering::Relaxed);
        self.cached_tokens
            .store(snapshot.cached_tokens, Ordering::Relaxed);
        self.reasoning_tokens
            .store(snapshot.reasoning_tokens, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.bootstrap(CounterSnapshot::default());
    }
}

/// One record per completed request, emitted to every registered sink.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: i64,
    pub trace_id: String,
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub success: bool,
    pub cost_usd: f64,
}

pub trait UsageSink: Send + Sync {
    fn write(&self, record: &UsageRecord);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    pub cached_per_1m: f64,
}

const fn pricing(input: f64, output: f64, cached: f64) -> ModelPricing {
    ModelPricing {
        input_per_1m: input,
        output_per_1m: output,
        cached_per_1m: cached,
    }
}

static MODEL_PRICING: &[(&str, ModelPricing)] = &[
    ("claude-3-5-haiku-20241022", pricing(0.80, 4.00, 0.08)),
    ("claude-3-7-sonnet-20250219", pricing(3.00, 15.00, 0.30)),
    ("claude-haiku-4-5-20251001", pricing(0.80, 4.00, 0.08)),
    ("claude-opus-4-1-20250805", pricing(15.00, 75.00, 1.50)),
    ("claude-opus-4-20250514", pricing(15.00, 75.00, 1.50)),
    ("claude-opus-4-5-20251101", pricing(15.00, 75.00, 1.50)),
    ("claude-sonnet-4-20250514", pricing(3.00, 15.00, 0.30)),
    ("claude-sonnet-4-5-20250929", pricing(3.00, 15.00, 0.30)),
    ("gpt-4o", pricing(2.50, 10.00, 1.25)),
    ("gpt-4o-mini", pricing(0.15, 0.60, 0.075)),
    ("gpt-4-turbo", pricing(10.00, 30.00, 0.0)),
    ("gpt-4", pricing(30.00, 60.00, 0.0)),
    ("gpt-3.5-turbo", pricing(0.50, 1.50, 0.0)),
    ("o1", pricing(15.00, 60.00, 7.50)),
    ("o1-mini", pricing(1.10, 4.40, 0.55)),
    ("o1-pro", pricing(150.00, 600.00, 0.0)),
    ("o3", pricing(10.00, 40.00, 2.50)),
    ("o3-mini", pricing(1.10, 4.40, 0.275)),
    ("o4-mini", pricing(1.10, 4.40, 0.275)),
    ("gemini-2.0-flash", pricing(0.10, 0.40, 0.0)),
    ("gemini-2.0-flash-lite", pricing(0.075, 0.30, 0.0)),
    ("gemini-2.5-flash", pricing(0.15, 0.60, 0.0)),
    ("gemini-2.5-pro", pricing(1.25, 10.00, 0.0)),
    ("gemini-1.5-flash", pricing(0.075, 0.30, 0.0)),
    ("gemini-1.5-pro", pricing(1.25, 5.00, 0.0)),
];

// Longest prefixes first so e.g. gpt-4o-mini wins over gpt-4o.
static PREFIX_PRICING: &[(&str, ModelPricing)] = &[
    ("claude-3-5-haiku", pricing(0.80, 4.00, 0.08)),
    ("claude-3-7-sonnet", pricing(3.00, 15.00, 0.30)),
    ("claude-haiku-4", pricing(0.80, 4.00, 0.08)),
    ("claude-opus-4", pricing(15.00, 75.00, 1.50)),
    ("claude-sonnet-4", pricing(3.00, 15.00, 0.30)),
    ("gpt-4o-mini", pricing(0.15, 0.60, 0.075)),
    ("gpt-4o", pricing(2.50, 10.00, 1.25)),
    ("gpt-4-turbo", pricing(10.00, 30.00, 0.0)),
    ("gpt-4", pricing(30.00, 60.00, 0.0)),
    ("gpt-3.5", pricing(0.50, 1.50, 0.0)),
    ("o1-mini", pricing(1.10, 4.40, 0.55)),
    ("o1-pro", pricing(150.00, 600.00, 0.0)),
    ("o1", pricing(15.00, 60.00, 7.50)),
    ("o3-mini", pricing(1.10, 4.40, 0.275)),
    ("o3", pricing(10.00, 40.00, 2.50)),
    ("o4-mini", pricing(1.10, 4.40, 0.275)),
    ("gemini-2.5-pro", pricing(1.25, 10.00, 0.0)),
    ("gemini-2.5-flash", pricing(0.15, 0.60, 0.0)),
    ("gemini-2.0-flash", pricing(0.10, 0.40, 0.0)),
    ("gemini-1.5-pro", pricing(1.25, 5.00, 0.0)),
    ("gemini-1.5-flash", pricing(0.075, 0.30, 0.0)),
];

pub fn model_pricing(model: &str) -> Option<ModelPricing> {
    for (name, pricing) in MODEL_PRICING {
        if *name == model {
            return Some(*pricing);
        }
    }
    for (prefix, pricing) in PREFIX_PRICING {
        if model.starts_with(prefix) {
            return Some(*pricing);
        }
    }
    None
}

pub fn cost_usd(model: &str, input_tokens: i64, output_tokens: i64, cached_tokens: i64) -> f64 {
    let Some(pricing) = model_pricing(model) else {
        return 0.0;
    };
    let input = input_tokens as f64 * pricing.input_per_1m / 1_000_000.0;
    let output = output_tokens as f64 * pricing.output_per_1m / 1_000_000.0;
    let cached = cached_tokens as f64 * pricing.cached_per_1m / 1_000_000.0;
    input + output + cached
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_record_and_snapshot() {
        let counters = Counters::new();
        counters.record(
            false,
            &Usage {
                input_tokens: 100,
                output_tokens: 50,
                cached_tokens: 20,
                reasoning_tokens: 5,
            },
        );
        counters.record(true, &Usage::default());

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.total_tokens, 150);
        assert_eq!(snapshot.cached_tokens, 20);

        counters.reset();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn exact_pricing_beats_prefix() {
        let exact = model_pricing("claude-sonnet-4-5-20250929").unwrap();
        assert_eq!(exact.input_per_1m, 3.00);
        // Unknown date suffix falls back to the family prefix.
        let by_prefix = model_pricing("claude-sonnet-4-7-20990101").unwrap();
        assert_eq!(by_prefix.input_per_1m, 3.00);
        assert!(model_pricing("totally-unknown").is_none());
    }

    #[test]
    fn prefix_order_prefers_longer_match() {
        let mini = model_pricing("gpt-4o-mini-2024").unwrap();
        assert_eq!(mini.input_per_1m, 0.15);
        let full = model_pricing("gpt-4o-2024").unwrap();
        assert_eq!(full.input_per_1m, 2.50);
    }

    #[test]
    fn cost_combines_all_token_classes() {
        let cost = cost_usd("gpt-4o", 1_000_000, 1_000_000, 1_000_000);
        assert!((cost - (2.50 + 10.00 + 1.25)).abs() < 1e-9);
        assert_eq!(cost_usd("unknown-model", 1000, 1000, 0), 0.0);
    }
}
