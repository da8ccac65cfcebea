// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Provider routing with per-provider circuit breakers and cost tracking.
//!
//! The router scores completion adapters by quality, cost, and latency,
//! honors rule-based short-circuits, and guards every provider with a
//! circuit breaker: after more than `failure_threshold` consecutive
//! failures the circuit opens and calls fail fast with `CircuitOpen`; once
//! `reset_timeout_ms` elapses a single half-open probe is allowed, closing
//! the circuit on success and re-opening it on failure. A rolling one-hour
//! cost window enforces the optional hourly budget.
//!
//! These are consumers of the memory core's heaps and events, not a novel
//! algorithm; the contract lives in the scoring weights and the breaker's
//! state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};
use dashmem::types::now_ms;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast until the reset timeout elapses.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures beyond which the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays open before allowing a half-open probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: i64,
}

/// Per-provider circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: 0,
            }),
        }
    }

    /// Current state (transitions Open -> HalfOpen lazily on inspection).
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::Open
            && now_ms() - inner.opened_at >= self.config.reset_timeout_ms as i64
        {
            inner.state = CircuitState::HalfOpen;
        }
        inner.state
    }

    /// Ask to place a call. `Err` carries the remaining wait; `Ok` means
    /// proceed (including the half-open probe).
    pub fn try_acquire(&self, provider: &str) -> ProviderResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = now_ms() - inner.opened_at;
                let reset = self.config.reset_timeout_ms as i64;
                if elapsed >= reset {
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(ProviderError::CircuitOpen {
                        provider: provider.to_string(),
                        retry_after_ms: (reset - elapsed).max(0) as u64,
                    })
                }
            }
        }
    }

    /// Record a successful call: failures reset, the circuit closes.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
    }

    /// Record a failed call. Opens the circuit once consecutive failures
    /// exceed the threshold, and re-opens immediately on a failed half-open
    /// probe.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        let failed_probe = inner.state == CircuitState::HalfOpen;
        if failed_probe || inner.consecutive_failures > self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = now_ms();
        }
    }
}

/// A completed provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Provider output.
    pub text: String,
    /// Provider that served the call.
    pub provider: String,
    /// Cost of this call in USD.
    pub cost_usd: f64,
}

/// An LLM-provider adapter. The core only ever sees this contract; request
/// timeouts are the adapter's concern.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stable provider name.
    fn name(&self) -> &str;

    /// Place a completion call.
    async fn complete(&self, prompt: &str) -> ProviderResult<Completion>;

    /// Approximate cost per call in USD, used for scoring and budgeting.
    fn cost_per_call_usd(&self) -> f64 {
        0.0
    }

    /// Quality figure in [0, 1], used for scoring.
    fn quality(&self) -> f64 {
        0.5
    }

    /// Typical latency in ms, used for scoring.
    fn avg_latency_ms(&self) -> u64 {
        1_000
    }
}

/// A rule-based short-circuit: prompts matching `pattern` go straight to
/// `provider`.
pub struct RouteRule {
    /// Prompt pattern.
    pub pattern: Regex,
    /// Target provider name.
    pub provider: String,
}

/// Router configuration.
#[derive(Debug, Clone, Default)]
pub struct ProviderRouterConfig {
    /// Breaker tuning shared by all providers.
    pub breaker: CircuitBreakerConfig,
    /// Rolling hourly budget in USD; `None` disables budget enforcement.
    pub hourly_budget_usd: Option<f64>,
}

/// Scores providers, applies rules, guards with breakers, tracks spend.
pub struct ProviderRouter {
    providers: Vec<std::sync::Arc<dyn CompletionProvider>>,
    breakers: HashMap<String, CircuitBreaker>,
    rules: Vec<RouteRule>,
    config: ProviderRouterConfig,
    /// (timestamp_ms, cost_usd) samples within the last hour.
    cost_window: Mutex<VecDeque<(i64, f64)>>,
}

impl ProviderRouter {
    /// Create a router over a fixed provider set.
    #[must_use]
    pub fn new(
        providers: Vec<std::sync::Arc<dyn CompletionProvider>>,
        config: ProviderRouterConfig,
    ) -> Self {
        let breakers = providers
            .iter()
            .map(|p| {
                (
                    p.name().to_string(),
                    CircuitBreaker::new(config.breaker.clone()),
                )
            })
            .collect();
        Self {
            providers,
            breakers,
            rules: Vec::new(),
            config,
            cost_window: Mutex::new(VecDeque::new()),
        }
    }

    /// Add a rule-based short-circuit.
    #[must_use]
    pub fn with_rule(mut self, pattern: Regex, provider: impl Into<String>) -> Self {
        self.rules.push(RouteRule {
            pattern,
            provider: provider.into(),
        });
        self
    }

    /// Rolling spend over the trailing hour.
    #[must_use]
    pub fn hourly_spend_usd(&self) -> f64 {
        let mut window = self.cost_window.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now_ms() - Duration::from_secs(3600).as_millis() as i64;
        while window.front().is_some_and(|(ts, _)| *ts < cutoff) {
            window.pop_front();
        }
        window.iter().map(|(_, cost)| cost).sum()
    }

    fn record_cost(&self, cost_usd: f64) {
        if cost_usd > 0.0 {
            let mut window = self.cost_window.lock().unwrap_or_else(|e| e.into_inner());
            window.push_back((now_ms(), cost_usd));
        }
    }

    fn check_budget(&self) -> ProviderResult<()> {
        if let Some(budget) = self.config.hourly_budget_usd {
            let spent = self.hourly_spend_usd();
            if spent >= budget {
                return Err(ProviderError::BudgetExceeded {
                    spent_usd: spent,
                    budget_usd: budget,
                });
            }
        }
        Ok(())
    }

    /// The breaker guarding a provider.
    #[must_use]
    pub fn breaker(&self, provider: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(provider)
    }

    /// Cheaper, faster, better providers score higher.
    fn score(provider: &dyn CompletionProvider) -> f64 {
        let quality = provider.quality().clamp(0.0, 1.0);
        let cost = 1.0 / (1.0 + provider.cost_per_call_usd() * 100.0);
        let latency = 1.0 / (1.0 + provider.avg_latency_ms() as f64 / 1_000.0);
        0.5 * quality + 0.3 * cost + 0.2 * latency
    }

    fn candidate_order(&self, prompt: &str) -> Vec<std::sync::Arc<dyn CompletionProvider>> {
        // Rule short-circuit: the matching provider is the only candidate.
        for rule in &self.rules {
            if rule.pattern.is_match(prompt) {
                if let Some(provider) =
                    self.providers.iter().find(|p| p.name() == rule.provider)
                {
                    return vec![std::sync::Arc::clone(provider)];
                }
            }
        }
        let mut ordered = self.providers.clone();
        ordered.sort_by(|a, b| {
            Self::score(b.as_ref())
                .partial_cmp(&Self::score(a.as_ref()))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name().cmp(b.name()))
        });
        ordered
    }

    /// Call a specific provider through its breaker.
    pub async fn complete_with(
        &self,
        provider_name: &str,
        prompt: &str,
    ) -> ProviderResult<Completion> {
        self.check_budget()?;
        let Some(provider) = self
            .providers
            .iter()
            .find(|p| p.name() == provider_name)
            .cloned()
        else {
            return Err(ProviderError::NoProviderAvailable);
        };
        let Some(breaker) = self.breakers.get(provider_name) else {
            return Err(ProviderError::NoProviderAvailable);
        };
        breaker.try_acquire(provider_name)?;
        match provider.complete(prompt).await {
            Ok(completion) => {
                breaker.record_success();
                self.record_cost(completion.cost_usd);
                Ok(completion)
            }
            Err(err) => {
                breaker.record_failure();
                Err(err)
            }
        }
    }

    /// Route a completion across all providers: rules first, then score
    /// order, skipping open circuits, falling through on failure.
    pub async fn complete(&self, prompt: &str) -> ProviderResult<Completion> {
        self.check_budget()?;
        let candidates = self.candidate_order(prompt);
        let mut last_error = ProviderError::NoProviderAvailable;
        for provider in candidates {
            let name = provider.name().to_string();
            let Some(breaker) = self.breakers.get(&name) else {
                continue;
            };
            match breaker.try_acquire(&name) {
                Ok(()) => {}
                Err(err) => {
                    last_error = err;
                    continue;
                }
            }
            match provider.complete(prompt).await {
                Ok(completion) => {
                    breaker.record_success();
                    self.record_cost(completion.cost_usd);
                    return Ok(completion);
                }
                Err(err) => {
                    breaker.record_failure();
                    tracing::warn!(provider = %name, error = %err, "provider call failed, falling through");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// A provider that fails its first `failures` calls, then succeeds.
    struct ScriptedProvider {
        name: String,
        failures: AtomicU32,
        calls: AtomicU32,
        cost: f64,
        quality: f64,
    }

    impl ScriptedProvider {
        fn new(name: &str, failures: u32) -> Self {
            Self {
                name: name.to_string(),
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                cost: 0.001,
                quality: 0.8,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, prompt: &str) -> ProviderResult<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::Upstream {
                    provider: self.name.clone(),
                    reason: "scripted failure".to_string(),
                });
            }
            Ok(Completion {
                text: format!("echo: {prompt}"),
                provider: self.name.clone(),
                cost_usd: self.cost,
            })
        }

        fn cost_per_call_usd(&self) -> f64 {
            self.cost
        }

        fn quality(&self) -> f64 {
            self.quality
        }
    }

    fn router_with(
        provider: Arc<ScriptedProvider>,
        breaker: CircuitBreakerConfig,
    ) -> ProviderRouter {
        ProviderRouter::new(
            vec![provider as Arc<dyn CompletionProvider>],
            ProviderRouterConfig {
                breaker,
                hourly_budget_usd: None,
            },
        )
    }

    /// Spec scenario: threshold 3, reset 50ms. Four consecutive failures
    /// reach the provider; the fifth call fails CircuitOpen without
    /// contacting it. After 60ms the half-open probe runs and a success
    /// closes the circuit.
    #[tokio::test]
    async fn test_circuit_breaker_scenario() {
        let provider = Arc::new(ScriptedProvider::new("p", 4));
        let router = router_with(
            Arc::clone(&provider),
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout_ms: 50,
            },
        );

        for _ in 0..4 {
            let err = router.complete_with("p", "hi").await.unwrap_err();
            assert!(matches!(err, ProviderError::Upstream { .. }));
        }
        assert_eq!(provider.calls(), 4);

        // Fifth call: circuit is open, provider is never contacted.
        let err = router.complete_with("p", "hi").await.unwrap_err();
        assert!(matches!(err, ProviderError::CircuitOpen { .. }));
        assert_eq!(provider.calls(), 4);

        // After the reset window a half-open probe is attempted; the
        // scripted failures are exhausted, so it succeeds and closes.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let completion = router.complete_with("p", "hi").await.unwrap();
        assert_eq!(completion.provider, "p");
        assert_eq!(provider.calls(), 5);
        assert_eq!(router.breaker("p").unwrap().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let provider = Arc::new(ScriptedProvider::new("p", 10));
        let router = router_with(
            Arc::clone(&provider),
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout_ms: 10,
            },
        );
        // Two failures open the circuit (failures > threshold).
        for _ in 0..2 {
            let _ = router.complete_with("p", "x").await;
        }
        assert!(matches!(
            router.complete_with("p", "x").await.unwrap_err(),
            ProviderError::CircuitOpen { .. }
        ));

        tokio::time::sleep(Duration::from_millis(15)).await;
        // Probe runs and fails: circuit re-opens immediately.
        let err = router.complete_with("p", "x").await.unwrap_err();
        assert!(matches!(err, ProviderError::Upstream { .. }));
        assert!(matches!(
            router.complete_with("p", "x").await.unwrap_err(),
            ProviderError::CircuitOpen { .. }
        ));
    }

    #[tokio::test]
    async fn test_fallthrough_to_next_provider() {
        let bad = Arc::new(ScriptedProvider::new("bad", u32::MAX));
        let good = Arc::new(ScriptedProvider::new("good", 0));
        let router = ProviderRouter::new(
            vec![
                Arc::clone(&bad) as Arc<dyn CompletionProvider>,
                Arc::clone(&good) as Arc<dyn CompletionProvider>,
            ],
            ProviderRouterConfig::default(),
        );
        let completion = router.complete("hello").await.unwrap();
        assert_eq!(completion.provider, "good");
    }

    #[tokio::test]
    async fn test_rule_short_circuit() {
        let general = Arc::new(ScriptedProvider::new("general", 0));
        let coder = Arc::new(ScriptedProvider::new("coder", 0));
        let router = ProviderRouter::new(
            vec![
                Arc::clone(&general) as Arc<dyn CompletionProvider>,
                Arc::clone(&coder) as Arc<dyn CompletionProvider>,
            ],
            ProviderRouterConfig::default(),
        )
        .with_rule(Regex::new(r"(?i)\bcode\b").unwrap(), "coder");

        let completion = router.complete("write some code please").await.unwrap();
        assert_eq!(completion.provider, "coder");
        assert_eq!(general.calls(), 0);
    }

    #[tokio::test]
    async fn test_budget_enforced() {
        let provider = Arc::new(ScriptedProvider::new("p", 0));
        let router = ProviderRouter::new(
            vec![Arc::clone(&provider) as Arc<dyn CompletionProvider>],
            ProviderRouterConfig {
                breaker: CircuitBreakerConfig::default(),
                hourly_budget_usd: Some(0.0025),
            },
        );
        // Each call costs 0.001; the third crosses the 0.0025 budget.
        router.complete("1").await.unwrap();
        router.complete("2").await.unwrap();
        router.complete("3").await.unwrap();
        let err = router.complete("4").await.unwrap_err();
        assert!(matches!(err, ProviderError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn test_scoring_prefers_quality() {
        let mut cheap = ScriptedProvider::new("cheap", 0);
        cheap.quality = 0.2;
        let mut premium = ScriptedProvider::new("premium", 0);
        premium.quality = 0.95;
        premium.cost = 0.002;
        let router = ProviderRouter::new(
            vec![
                Arc::new(cheap) as Arc<dyn CompletionProvider>,
                Arc::new(premium) as Arc<dyn CompletionProvider>,
            ],
            ProviderRouterConfig::default(),
        );
        let completion = router.complete("anything").await.unwrap();
        assert_eq!(completion.provider, "premium");
    }

    #[tokio::test]
    async fn test_no_provider_available() {
        let router = ProviderRouter::new(Vec::new(), ProviderRouterConfig::default());
        let err = router.complete("hello").await.unwrap_err();
        assert!(matches!(err, ProviderError::NoProviderAvailable));
    }
}
