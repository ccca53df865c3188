//! Retry policy with exponential backoff and jitter

use crate::error::{QueryError, Result};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decides whether an error is worth another attempt
pub type RetryClassifier = Arc<dyn Fn(&QueryError) -> bool + Send + Sync>;

/// Exponential backoff policy
///
/// The delay before retry `n` (0-based) is `min(base_delay * 2^n, max_delay)`,
/// moved by up to `jitter` of itself in either direction and clamped to
/// `[0, max_delay]`.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Jitter fraction (0.0 - 1.0)
    pub jitter: f64,

    classifier: Option<RetryClassifier>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
            classifier: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("custom_classifier", &self.classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Single attempt, never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Default backoff with a different attempt cap
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the default classifier ([`QueryError::is_retryable`])
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&QueryError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(QueryError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.base_delay > self.max_delay {
            return Err(QueryError::Config(
                "base_delay must not exceed max_delay".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(QueryError::Config(
                "jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// This policy if it validates, otherwise `fallback()`
    pub(crate) fn or_valid<F>(self, fallback: F, context: &str) -> RetryPolicy
    where
        F: FnOnce() -> RetryPolicy,
    {
        match self.validate() {
            Ok(()) => self,
            Err(error) => {
                warn!("Ignoring retry policy for {}: {}", context, error);
                fallback()
            }
        }
    }

    /// Whether `error` is retryable by this policy's classifier
    pub fn is_retryable(&self, error: &QueryError) -> bool {
        if error.is_fatal() {
            return false;
        }

        match &self.classifier {
            Some(classifier) => classifier(error),
            None => error.is_retryable(),
        }
    }

    /// Whether another attempt should follow `attempts_made` failed ones
    pub fn should_retry(&self, error: &QueryError, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts && self.is_retryable(error)
    }

    /// Backoff before retry `attempt` (0-based), without jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Backoff before retry `attempt` (0-based), jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter.is_finite() || self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let secs = delay.as_secs_f64();
        let spread = secs * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (secs + offset).clamp(0.0, self.max_delay.as_secs_f64());

        Duration::from_secs_f64(jittered)
    }
}

/// Timeout error for one attempt; limits past `u64::MAX` ms saturate
fn timed_out(limit: Duration, context: &str) -> QueryError {
    QueryError::Timeout {
        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        context: context.to_string(),
    }
}

/// Final result of a retried operation
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,

    /// Attempts actually made, the first one included
    pub attempts: u32,
}

/// Run `op` until it succeeds, the policy gives up or `keep_going` says stop
///
/// `timeout` bounds every attempt separately; an attempt that runs over
/// fails with [`QueryError::Timeout`], which the default classifier retries.
/// `keep_going` is consulted before each backoff sleep.
pub async fn execute_with_retry<T, F, Fut, K>(
    mut op: F,
    policy: &RetryPolicy,
    timeout: Option<Duration>,
    context: &str,
    keep_going: K,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    K: Fn() -> bool,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(timed_out(limit, context)),
            },
            None => op().await,
        };

        let error = match result {
            Ok(value) => {
                if attempts > 1 {
                    info!("{} succeeded after {} attempts", context, attempts);
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(error) => error,
        };

        if !policy.should_retry(&error, attempts) {
            debug!("{} failed after {} attempts: {}", context, attempts, error);
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }

        if !keep_going() {
            debug!("Abandoning retries for {}: no subscribers left", context);
            return RetryOutcome {
                result: Err(error),
                attempts,
            };
        }

        let delay = policy.delay_for(attempts - 1);
        warn!(
            "{} failed (attempt {}/{}): {}, retrying after {:?}",
            context, attempts, policy.max_attempts, error, delay
        );
        tokio::time::sleep(delay).await;
    }
}
