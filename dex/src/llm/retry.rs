//! Centralized retry policy for chat calls
//!
//! Backoff lives here, not in the session engine: exponential from 1 s with
//! factor 2, capped at 30 s, at most 5 attempts, ±20 % jitter. Rate limits
//! honor the server's retry-after when present. Billing and auth errors are
//! never retried.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::{ChatRequest, ChatResponse, LlmClient, LlmError};

/// Bounded retry policy for chat calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Upper bound on total attempts, including the initial request
    pub max_attempts: u32,
    /// Base delay used for exponential backoff
    pub initial_backoff: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Maximum allowed delay between attempts
    pub max_backoff: Duration,
    /// Jitter fraction applied symmetrically (0.2 = ±20 %)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Decide whether another attempt should be scheduled
    pub fn should_retry(&self, err: &LlmError, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts && err.is_retryable()
    }

    /// Compute the delay before the given retry attempt (0-based)
    ///
    /// A server-provided retry-after wins over the computed backoff.
    pub fn delay_for(&self, attempt: u32, err: &LlmError) -> Duration {
        if let Some(after) = err.retry_after() {
            return after;
        }
        let base = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jittered = capped * jitter_factor(self.jitter);
        Duration::from_secs_f64(jittered)
    }

    /// The delay bounds for an attempt, ignoring retry-after (used by tests)
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        (
            Duration::from_secs_f64(capped * (1.0 - self.jitter)),
            Duration::from_secs_f64(capped * (1.0 + self.jitter)),
        )
    }
}

fn jitter_factor(jitter: f64) -> f64 {
    if jitter <= 0.0 {
        return 1.0;
    }
    rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter))
}

/// Run one chat call under the retry policy
pub async fn chat_with_retry(
    client: &dyn LlmClient,
    request: ChatRequest,
    policy: &RetryPolicy,
) -> Result<ChatResponse, LlmError> {
    let mut attempt = 0u32;
    loop {
        match client.chat(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                if !policy.should_retry(&err, attempt) {
                    if err.is_retryable() {
                        warn!(attempts = attempt + 1, error = %err, "Chat retries exhausted");
                    }
                    return Err(err);
                }
                let delay = policy.delay_for(attempt, &err);
                debug!(attempt, ?delay, error = %err, "Retrying chat call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;

    fn request() -> ChatRequest {
        ChatRequest {
            system_prompt: "test".to_string(),
            messages: vec![],
            max_tokens: 1000,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_default_policy_shape() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert!((policy.jitter - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        let err = LlmError::Network("reset".to_string());
        assert_eq!(policy.delay_for(0, &err), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, &err), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, &err), Duration::from_secs(16));
        // 2^5 = 32 > cap
        assert_eq!(policy.delay_for(5, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        let err = LlmError::Network("reset".to_string());
        for attempt in 0..6 {
            let (lo, hi) = policy.delay_bounds(attempt);
            for _ in 0..20 {
                let delay = policy.delay_for(attempt, &err);
                assert!(delay >= lo && delay <= hi, "attempt {}: {:?} not in [{:?}, {:?}]", attempt, delay, lo, hi);
            }
        }
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let policy = RetryPolicy::default();
        let err = LlmError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(policy.delay_for(0, &err), Duration::from_secs(7));
    }

    #[test]
    fn test_should_retry_respects_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&LlmError::Network("x".into()), 0));
        assert!(policy.should_retry(&LlmError::RateLimited { retry_after: None }, 3));
        assert!(!policy.should_retry(&LlmError::RateLimited { retry_after: None }, 4));
        assert!(!policy.should_retry(&LlmError::Auth("bad key".into()), 0));
        assert!(!policy.should_retry(&LlmError::Billing("no credit".into()), 0));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let client = MockLlmClient::new(vec![]);
        client.push_error(LlmError::Network("reset".to_string()));
        client.push_error(LlmError::Api {
            status: 503,
            message: "overloaded".to_string(),
        });
        client.push_reply(ChatResponse::text("done"));

        let response = chat_with_retry(&client, request(), &fast_policy()).await.unwrap();
        assert_eq!(response.reply.as_deref(), Some("done"));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_auth_error_fails_immediately() {
        let client = MockLlmClient::new(vec![]);
        client.push_error(LlmError::Auth("bad key".to_string()));
        client.push_reply(ChatResponse::text("never seen"));

        let err = chat_with_retry(&client, request(), &fast_policy()).await.unwrap_err();
        assert!(matches!(err, LlmError::Auth(_)));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded() {
        let client = MockLlmClient::new(vec![]);
        for _ in 0..10 {
            client.push_error(LlmError::Network("reset".to_string()));
        }

        let err = chat_with_retry(&client, request(), &fast_policy()).await.unwrap_err();
        assert!(matches!(err, LlmError::Network(_)));
        assert_eq!(client.call_count(), 3);
    }
}
