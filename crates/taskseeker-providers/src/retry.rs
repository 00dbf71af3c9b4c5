use std::{future::Future, time::Duration};

use taskseeker_observability::safe_eprintln;
use tokio_util::sync::CancellationToken;

use crate::llm::LlmError;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Exponential backoff for establishing a request. Applies to connection
/// setup only; once a response body is streaming nothing is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub max_delay: Duration,
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_delay: DEFAULT_MAX_DELAY,
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// `min(2^attempt + 1, max_delay)` seconds, `attempt` starting at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = 2u64.saturating_pow(attempt).saturating_add(1);
        Duration::from_secs(secs).min(self.max_delay)
    }

    pub fn should_retry(&self, e: &LlmError) -> bool {
        match e.code.as_str() {
            "E_LLM_RATE_LIMIT" | "E_LLM_TRANSPORT" => true,
            _ => e.status.map(|s| self.retry_statuses.contains(&s)).unwrap_or(false),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. Both the attempt and the backoff sleep observe `token`.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let res = tokio::select! {
            _ = token.cancelled() => return Err(LlmError::cancelled()),
            r = op() => r,
        };
        let e = match res {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !policy.should_retry(&e) {
            return Err(e);
        }
        if attempt >= max_attempts {
            return Err(LlmError::new(
                "E_LLM_RETRY_EXHAUSTED",
                format!("failed after {attempt} attempts: {}", e.message),
            ));
        }
        let delay = policy.backoff(attempt);
        safe_eprintln!(
            "llm: attempt {attempt} failed ({}: {}), retrying in {:.1}s",
            e.code,
            e.message,
            delay.as_secs_f64()
        );
        tokio::select! {
            _ = token.cancelled() => return Err(LlmError::cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn backoff_grows_then_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_secs(3));
        assert_eq!(p.backoff(2), Duration::from_secs(5));
        assert_eq!(p.backoff(3), Duration::from_secs(9));
        assert_eq!(p.backoff(10), Duration::from_secs(30));
        assert_eq!(p.backoff(200), Duration::from_secs(30));
    }

    #[test]
    fn retryable_classification() {
        let p = RetryPolicy::default();
        assert!(p.should_retry(&LlmError::from_status(503, "")));
        assert!(p.should_retry(&LlmError::from_status(429, "")));
        assert!(!p.should_retry(&LlmError::from_status(401, "")));
        assert!(!p.should_retry(&LlmError::from_status(400, "bad")));
        assert!(!p.should_retry(&LlmError::from_status(501, "")));
        assert!(p.should_retry(&LlmError::new("E_LLM_TRANSPORT", "reset")));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let r = run_with_retry(&fast_policy(3), &CancellationToken::new(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LlmError::from_status(502, "bad gateway"))
            } else {
                Ok("ok")
            }
        })
        .await;
        assert_eq!(r.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_with_attempt_count() {
        let calls = AtomicU32::new(0);
        let r: Result<(), _> = run_with_retry(&fast_policy(2), &CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::from_status(429, ""))
        })
        .await;
        let e = r.unwrap_err();
        assert_eq!(e.code, "E_LLM_RETRY_EXHAUSTED");
        assert!(e.message.contains("after 2 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let r: Result<(), _> = run_with_retry(&fast_policy(5), &CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::from_status(401, ""))
        })
        .await;
        assert_eq!(r.unwrap_err().code, "E_LLM_AUTH");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let r: Result<(), _> = run_with_retry(&fast_policy(3), &token, || async {
            std::future::pending::<Result<(), LlmError>>().await
        })
        .await;
        assert_eq!(r.unwrap_err().code, "E_CANCELLED");
    }
}
