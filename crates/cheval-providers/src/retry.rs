//! Retry orchestration for a single provider.
//!
//! Exponential backoff with jitter on rate limits, a global attempt
//! budget, circuit-breaker gating before each attempt, and budget hook
//! integration. The orchestrator never switches models itself: on
//! `PROVIDER_UNAVAILABLE` it returns to the caller, whose chain walker
//! selects a fallback; on budget `DOWNGRADE` it logs and continues, and
//! the caller applies the downgrade on the next invocation.

use std::time::Duration;

use cheval_config::HounfourConfig;
use cheval_core::{ChevalError, ChevalResult, CompletionRequest, CompletionResult, ErrorKind};
use cheval_metering::{BudgetDecision, BudgetEnforcer};
use cheval_routing::{BreakerState, CircuitBreaker};
use rand::Rng;
use tracing::{info, warn};

use crate::adapter::ProviderAdapter;

/// Pre/post call budget hook consulted by the retry loop.
pub trait BudgetHook: Send {
    /// Pre-call check; `Block` aborts the invocation.
    fn pre_call(&mut self, request: &CompletionRequest) -> BudgetDecision;

    /// Post-call cost reconciliation. Best-effort.
    fn post_call(&mut self, result: &CompletionResult);
}

/// Default hook: always allow, record nothing.
#[derive(Debug, Default)]
pub struct NoopBudgetHook;

impl BudgetHook for NoopBudgetHook {
    fn pre_call(&mut self, _request: &CompletionRequest) -> BudgetDecision {
        BudgetDecision::Allow
    }

    fn post_call(&mut self, _result: &CompletionResult) {}
}

impl BudgetHook for BudgetEnforcer {
    fn pre_call(&mut self, _request: &CompletionRequest) -> BudgetDecision {
        Self::pre_call(self)
    }

    fn post_call(&mut self, result: &CompletionResult) {
        Self::post_call(self, result);
    }
}

/// Attempt metrics hook.
pub trait MetricsHook: Send {
    /// Record one attempt's outcome and latency.
    fn record_attempt(&mut self, provider: &str, success: bool, latency_ms: u64);
}

/// Default metrics hook: record nothing.
#[derive(Debug, Default)]
pub struct NoopMetricsHook;

impl MetricsHook for NoopMetricsHook {
    fn record_attempt(&mut self, _provider: &str, _success: bool, _latency_ms: u64) {}
}

fn backoff_delay(base_seconds: f64, attempt: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base_seconds * f64::from(1u32 << attempt.min(16)) + jitter)
}

/// Invoke an adapter with retry, breaker gating, and budget hooks.
///
/// # Errors
///
/// - `BUDGET_EXCEEDED` when the budget hook blocks.
/// - `PROVIDER_UNAVAILABLE` when the breaker is open or the provider
///   fails hard; the caller's chain walker may fall back.
/// - `RETRIES_EXHAUSTED` when the attempt budget runs out.
/// - Non-retryable adapter errors propagate unchanged.
pub async fn invoke_with_retry(
    adapter: &dyn ProviderAdapter,
    request: &CompletionRequest,
    config: &HounfourConfig,
    breaker: &CircuitBreaker,
    budget_hook: &mut dyn BudgetHook,
    metrics_hook: &mut dyn MetricsHook,
) -> ChevalResult<CompletionResult> {
    let retry = &config.retry;
    let provider = adapter.provider();

    let mut total_attempts: u32 = 0;
    let mut last_error: Option<String> = None;

    for attempt in 0..=retry.max_retries {
        total_attempts += 1;
        if total_attempts > retry.max_total_attempts {
            return Err(ChevalError::retries_exhausted(
                total_attempts - 1,
                Some(&format!(
                    "global attempt limit ({}) reached. Last error: {}",
                    retry.max_total_attempts,
                    last_error.as_deref().unwrap_or("none")
                )),
            ));
        }

        match budget_hook.pre_call(request) {
            BudgetDecision::Block => {
                return Err(ChevalError::new(
                    ErrorKind::BudgetExceeded,
                    "daily budget exceeded under block policy",
                ));
            },
            BudgetDecision::Downgrade => {
                // The chain walker applies the downgrade on the next
                // invocation; this attempt proceeds on the current model.
                warn!(provider, "budget downgrade signalled, continuing with current model");
            },
            BudgetDecision::Warn | BudgetDecision::Allow => {},
        }

        let breaker_state = breaker.check_state(provider);
        if breaker_state == BreakerState::Open {
            info!(provider, "circuit breaker open, skipping provider");
            return Err(ChevalError::provider_unavailable(
                provider,
                "circuit breaker open",
            ));
        }
        if breaker_state == BreakerState::HalfOpen {
            breaker.increment_probe(provider);
        }

        let start = std::time::Instant::now();
        match adapter.complete(request).await {
            Ok(result) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                budget_hook.post_call(&result);
                metrics_hook.record_attempt(provider, true, latency_ms);
                breaker.record_success(provider);
                return Ok(result);
            },
            Err(e) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                match e.kind {
                    ErrorKind::RateLimited => {
                        metrics_hook.record_attempt(provider, false, latency_ms);
                        breaker.record_failure(provider);
                        last_error = Some(e.to_string());

                        let delay = backoff_delay(retry.base_delay_seconds, attempt);
                        info!(
                            provider,
                            attempt = attempt + 1,
                            of = retry.max_retries + 1,
                            delay_s = delay.as_secs_f64(),
                            "rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    },
                    ErrorKind::ProviderUnavailable => {
                        metrics_hook.record_attempt(provider, false, latency_ms);
                        breaker.record_failure(provider);
                        warn!(
                            provider,
                            attempt = attempt + 1,
                            error = %e,
                            "provider unavailable, abandoning provider"
                        );
                        // No retry on the same provider; the chain
                        // walker may fall back.
                        return Err(e);
                    },
                    ErrorKind::ApiError => {
                        metrics_hook.record_attempt(provider, false, latency_ms);
                        breaker.record_failure(provider);
                        last_error = Some(e.to_string());
                        warn!(
                            provider,
                            attempt = attempt + 1,
                            error = %e,
                            "unexpected provider error"
                        );
                        // One bounded retry with backoff.
                        if attempt < retry.max_retries {
                            tokio::time::sleep(backoff_delay(retry.base_delay_seconds, attempt))
                                .await;
                        }
                    },
                    // Non-retryable errors short-circuit the pipeline.
                    _ => return Err(e),
                }
            },
        }
    }

    Err(ChevalError::retries_exhausted(
        total_attempts,
        last_error.as_deref(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cheval_config::{BreakerSettings, RetryConfig};
    use cheval_core::{Message, Usage};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Adapter that fails a set number of times before succeeding.
    struct FlakyAdapter {
        calls: AtomicU32,
        failures: u32,
        kind: ErrorKind,
    }

    impl FlakyAdapter {
        fn new(failures: u32, kind: ErrorKind) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                kind,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn provider(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, request: &CompletionRequest) -> ChevalResult<CompletionResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ChevalError::new(self.kind, "induced failure"));
            }
            Ok(CompletionResult {
                content: "ok".to_owned(),
                tool_calls: None,
                thinking: None,
                usage: Usage::actual(10, 5, 0),
                model: request.model.clone(),
                latency_ms: 1,
                provider: "flaky".to_owned(),
                interaction_id: None,
            })
        }

        fn validate_config(&self) -> Vec<String> {
            Vec::new()
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    struct BlockingHook;
    impl BudgetHook for BlockingHook {
        fn pre_call(&mut self, _request: &CompletionRequest) -> BudgetDecision {
            BudgetDecision::Block
        }
        fn post_call(&mut self, _result: &CompletionResult) {}
    }

    struct CountingHook {
        pre: u32,
        post: u32,
    }
    impl BudgetHook for CountingHook {
        fn pre_call(&mut self, _request: &CompletionRequest) -> BudgetDecision {
            self.pre += 1;
            BudgetDecision::Allow
        }
        fn post_call(&mut self, _result: &CompletionResult) {
            self.post += 1;
        }
    }

    fn fast_config() -> HounfourConfig {
        let mut config = HounfourConfig::default();
        config.retry = RetryConfig {
            max_retries: 3,
            max_total_attempts: 6,
            max_provider_switches: 2,
            base_delay_seconds: 0.01,
        };
        config
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![Message::user("hi")], "test-model")
    }

    fn breaker(dir: &std::path::Path) -> CircuitBreaker {
        CircuitBreaker::new(dir, BreakerSettings::default())
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FlakyAdapter::new(0, ErrorKind::RateLimited);
        let mut hook = CountingHook { pre: 0, post: 0 };

        let result = invoke_with_retry(
            &adapter,
            &request(),
            &fast_config(),
            &breaker(dir.path()),
            &mut hook,
            &mut NoopMetricsHook,
        )
        .await
        .unwrap();

        assert_eq!(result.content, "ok");
        assert_eq!(hook.pre, 1);
        assert_eq!(hook.post, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FlakyAdapter::new(2, ErrorKind::RateLimited);

        let result = invoke_with_retry(
            &adapter,
            &request(),
            &fast_config(),
            &breaker(dir.path()),
            &mut NoopBudgetHook,
            &mut NoopMetricsHook,
        )
        .await
        .unwrap();

        assert_eq!(result.content, "ok");
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FlakyAdapter::new(100, ErrorKind::RateLimited);

        let err = invoke_with_retry(
            &adapter,
            &request(),
            &fast_config(),
            &breaker(dir.path()),
            &mut NoopBudgetHook,
            &mut NoopMetricsHook,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RetriesExhausted);
        assert_eq!(adapter.calls(), 4); // max_retries + 1
    }

    #[tokio::test]
    async fn test_provider_unavailable_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FlakyAdapter::new(100, ErrorKind::ProviderUnavailable);

        let err = invoke_with_retry(
            &adapter,
            &request(),
            &fast_config(),
            &breaker(dir.path()),
            &mut NoopBudgetHook,
            &mut NoopMetricsHook,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FlakyAdapter::new(100, ErrorKind::InvalidInput);

        let err = invoke_with_retry(
            &adapter,
            &request(),
            &fast_config(),
            &breaker(dir.path()),
            &mut NoopBudgetHook,
            &mut NoopMetricsHook,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_budget_block_aborts_before_call() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FlakyAdapter::new(0, ErrorKind::RateLimited);

        let err = invoke_with_retry(
            &adapter,
            &request(),
            &fast_config(),
            &breaker(dir.path()),
            &mut BlockingHook,
            &mut NoopMetricsHook,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::BudgetExceeded);
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_provider() {
        let dir = tempfile::tempdir().unwrap();
        let cb = CircuitBreaker::new(
            dir.path(),
            BreakerSettings {
                failure_threshold: 1,
                ..BreakerSettings::default()
            },
        );
        cb.record_failure("flaky");
        assert_eq!(cb.check_state("flaky"), BreakerState::Open);

        let adapter = FlakyAdapter::new(0, ErrorKind::RateLimited);
        let err = invoke_with_retry(
            &adapter,
            &request(),
            &fast_config(),
            &cb,
            &mut NoopBudgetHook,
            &mut NoopMetricsHook,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
        assert!(err.message.contains("circuit breaker open"));
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_feed_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let cb = CircuitBreaker::new(
            dir.path(),
            BreakerSettings {
                failure_threshold: 2,
                ..BreakerSettings::default()
            },
        );

        let adapter = FlakyAdapter::new(100, ErrorKind::RateLimited);
        let _ = invoke_with_retry(
            &adapter,
            &request(),
            &fast_config(),
            &cb,
            &mut NoopBudgetHook,
            &mut NoopMetricsHook,
        )
        .await;

        // Two rate-limit failures tripped the breaker mid-loop.
        assert_eq!(cb.check_state("flaky"), BreakerState::Open);
    }
}
