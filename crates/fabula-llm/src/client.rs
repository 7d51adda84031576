//! Generation client wrapping a backend with transparent rate-limit retry
//! and token-usage accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fabula_types::{FabulaError, Result};

use crate::{BackoffPolicy, GenerationRequest, GenerationResponse, StoryModel, Usage};

/// Default number of attempts per call (the first try plus retries).
pub const DEFAULT_MAX_ATTEMPTS: usize = 4;

/// Client for issuing generation calls.
///
/// Rate limits are absorbed here so callers never see them; every other
/// backend failure is fatal to the calling task and propagates unchanged.
pub struct GenerationClient {
    backend: Arc<dyn StoryModel>,
    policy: BackoffPolicy,
    max_attempts: usize,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn StoryModel>) -> Self {
        Self {
            backend,
            policy: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Total token usage accumulated across all calls so far.
    pub fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }

    /// Issue one generation call, retrying on rate limits with the server's
    /// retry-after hint or the backoff policy, whichever is longer.
    pub async fn invoke(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let task = request.kind.label();
        for attempt in 0..self.max_attempts {
            match self.backend.invoke(request).await {
                Ok(response) => {
                    self.input_tokens
                        .fetch_add(response.usage.input_tokens, Ordering::Relaxed);
                    self.output_tokens
                        .fetch_add(response.usage.output_tokens, Ordering::Relaxed);
                    tracing::debug!(
                        task = %task,
                        model = %response.model,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "Generation call completed"
                    );
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let hint = match &e {
                        FabulaError::RateLimited { retry_after_ms } => {
                            Some(Duration::from_millis(*retry_after_ms))
                        }
                        _ => None,
                    };
                    let delay = self.policy.delay_with_hint(attempt, hint);
                    tracing::warn!(
                        task = %task,
                        attempt,
                        delay_ms = %delay.as_millis(),
                        "Rate limited, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(task = %task, error = %e, "Generation call failed");
                    return Err(e);
                }
            }
        }
        // max_attempts >= 1, so the loop always returns; this is only here
        // to satisfy the type checker.
        Err(FabulaError::Other(format!(
            "generation attempts exhausted for {task}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskKind;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Backend that fails with rate limits for the first `fail_count` calls,
    /// then succeeds.
    struct FlakyModel {
        fail_count: usize,
        calls: AtomicUsize,
    }

    impl FlakyModel {
        fn new(fail_count: usize) -> Self {
            Self {
                fail_count,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StoryModel for FlakyModel {
        async fn invoke(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_count {
                Err(FabulaError::RateLimited { retry_after_ms: 0 })
            } else {
                Ok(GenerationResponse {
                    json: serde_json::json!({ "ok": true }),
                    model: "flaky".into(),
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                    },
                })
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    /// Backend that always fails with a non-retryable error.
    struct BrokenModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StoryModel for BrokenModel {
        async fn invoke(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FabulaError::MalformedOutput {
                message: "not json".into(),
            })
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(TaskKind::Summary, "sys", "prompt")
    }

    // 1. Rate limit is retried until the backend recovers
    #[tokio::test]
    async fn retries_rate_limit_then_succeeds() {
        let backend = Arc::new(FlakyModel::new(2));
        let client = GenerationClient::new(backend.clone()).with_policy(BackoffPolicy::None);

        let response = client.invoke(&request()).await.unwrap();
        assert_eq!(response.json["ok"], true);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    // 2. Non-retryable errors propagate after a single call
    #[tokio::test]
    async fn malformed_output_is_not_retried() {
        let backend = Arc::new(BrokenModel {
            calls: AtomicUsize::new(0),
        });
        let client = GenerationClient::new(backend.clone()).with_policy(BackoffPolicy::None);

        let err = client.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, FabulaError::MalformedOutput { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    // 3. A persistent rate limit exhausts the attempt budget
    #[tokio::test]
    async fn persistent_rate_limit_exhausts_attempts() {
        let backend = Arc::new(FlakyModel::new(usize::MAX));
        let client = GenerationClient::new(backend.clone())
            .with_policy(BackoffPolicy::None)
            .with_max_attempts(3);

        let err = client.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, FabulaError::RateLimited { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    // 4. Usage accumulates across calls
    #[tokio::test]
    async fn usage_accumulates_across_calls() {
        let backend = Arc::new(FlakyModel::new(0));
        let client = GenerationClient::new(backend).with_policy(BackoffPolicy::None);

        client.invoke(&request()).await.unwrap();
        client.invoke(&request()).await.unwrap();

        let usage = client.usage();
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.output_tokens, 10);
    }

    // 5. Backend name is exposed for logs
    #[tokio::test]
    async fn backend_name_passthrough() {
        let client = GenerationClient::new(Arc::new(FlakyModel::new(0)));
        assert_eq!(client.backend_name(), "flaky");
    }
}
