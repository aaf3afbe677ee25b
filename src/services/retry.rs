//! Bounded timeouts and retries around store calls

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::DispatchSettings;
use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound of a single attempt
    pub timeout: Duration,
    /// Extra attempts after a transient failure
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            timeout: settings.store_timeout,
            max_retries: settings.store_max_retries,
            backoff: settings.retry_backoff,
        }
    }
}

/// Run `call` with a per-attempt timeout, retrying transient failures.
///
/// A timed out attempt counts as a transient `Store` failure. Every other
/// error is returned as is on the first occurrence.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T, DispatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DispatchError>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Store(format!(
                "{} timed out after {} ms",
                operation,
                policy.timeout.as_millis()
            ))),
        };

        match outcome {
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = jittered(policy.backoff, attempt);
                warn!(operation, attempt, error = %e, "Transient store failure, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

fn jittered(base: Duration, attempt: u32) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor * attempt as f64)
}
