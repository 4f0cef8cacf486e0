//! Transient error classification and retry with exponential backoff.
//!
//! Every remote call site shares one combinator, [`call_with_retry`],
//! parameterized by a [`RetryPolicy`]. Whether a failure is worth repeating
//! is decided by [`classify`], a plain signature table.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RpcError;
use crate::topup::is_resource_exhausted;

/// Whether a failed call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

/// Signatures meaning the call can never succeed as attempted.
/// Checked first, so they win over any transient signature in the same text.
const PERMANENT_SIGNATURES: &[&str] = &["IC0536", "has no update method", "has no query method"];

/// Signatures of failures that typically clear up on their own.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "Failed query call",
    "CanisterError",
    "IC0508",
    "IC0503",
    "timeout",
    "Timeout",
    "timed out",
    "tcp connect error",
    "connection refused",
    "Connection refused",
    "temporarily unavailable",
    "error sending request",
    "client error (Connect)",
];

/// Map raw error text to a retry class. Unknown errors are permanent.
///
/// Resource exhaustion is permanent here even when the reject code looks
/// transient; [`with_top_up`](crate::topup::with_top_up) handles it.
pub fn classify(error_text: &str) -> ErrorClass {
    if is_resource_exhausted(error_text) {
        return ErrorClass::Permanent;
    }
    if PERMANENT_SIGNATURES
        .iter()
        .any(|sig| error_text.contains(sig))
    {
        return ErrorClass::Permanent;
    }
    if TRANSIENT_SIGNATURES
        .iter()
        .any(|sig| error_text.contains(sig))
    {
        return ErrorClass::Retryable;
    }
    ErrorClass::Permanent
}

/// Attempt budget and backoff base for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay_secs: f64) -> Self {
        Self {
            max_attempts,
            base_delay_secs,
        }
    }

    /// A single attempt, no retry.
    pub const fn once() -> Self {
        Self::new(1, 0.0)
    }

    /// Delay slept after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Duration::from_secs_f64(self.base_delay_secs * f64::from(factor))
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// Only errors classified [`ErrorClass::Retryable`] are retried. The last
/// error is returned unchanged.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err.text());
                if class == ErrorClass::Permanent || attempt >= max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_after(attempt);
                warn!(
                    call = label,
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn failed(stderr: &str) -> RpcError {
        RpcError::Failed {
            command: "dfx canister call abc health".into(),
            stderr: stderr.into(),
            stdout: String::new(),
        }
    }

    #[test]
    fn transient_signatures_are_retryable() {
        for text in [
            "Error: IC0508: Canister abc is stopped",
            "IC0503: canister trapped",
            "request timed out",
            "tcp connect error: Connection refused (os error 111)",
            "error sending request for url",
            "service temporarily unavailable",
        ] {
            assert_eq!(classify(text), ErrorClass::Retryable, "{text}");
        }
    }

    #[test]
    fn permanent_signature_wins_over_transient() {
        let text = "Failed query call: IC0536: Canister has no query method 'getMaintenanceFlag'";
        assert_eq!(classify(text), ErrorClass::Permanent);
    }

    #[test]
    fn out_of_cycles_is_left_to_the_top_up_handler() {
        let text = "Error: Failed update call.\nCaused by: The replica returned a rejection error: \
            reject code CanisterError, reject message IC0207: Canister a-cai is out of cycles";
        assert_eq!(classify(text), ErrorClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_cycles_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(&RetryPolicy::new(5, 10.0), "deploy", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(failed("reject code CanisterError, reject message IC0207: out of cycles")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_errors_are_permanent() {
        assert_eq!(classify("something odd happened"), ErrorClass::Permanent);
        assert_eq!(classify(""), ErrorClass::Permanent);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::new(5, 2.0);
        let delays: Vec<u64> = (1..=4).map(|a| policy.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_exhausts_budget_with_exponential_delays() {
        let stamps = Mutex::new(Vec::new());
        let start = Instant::now();
        let policy = RetryPolicy::new(5, 2.0);

        let result: Result<(), _> = call_with_retry(&policy, "health", || {
            stamps.lock().unwrap().push(start.elapsed());
            async { Err(failed("IC0508: canister stopped")) }
        })
        .await;

        assert!(result.is_err());
        let stamps = stamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 5);
        let gaps: Vec<u64> = stamps.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![2, 4, 8, 16]);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_attempted_once() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result: Result<(), _> = call_with_retry(&RetryPolicy::new(10, 5.0), "toggle", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(failed("IC0536: has no update method 'toggleMaintenanceFlagAdmin'")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = call_with_retry(&RetryPolicy::new(3, 1.0), "status", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(failed("connection refused"))
                } else {
                    Ok("Status: Running")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "Status: Running");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempt_policy_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = call_with_retry(&RetryPolicy::new(0, 1.0), "noop", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RpcError>(()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
