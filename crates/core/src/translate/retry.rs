//! Retry and backoff around a [`Translator`].
//!
//! Every logical request walks `Attempting -> {Success, RetryableFailure,
//! FatalFailure}`. Retryable failures sleep `base * 2^(n-1)` plus jitter,
//! capped at the configured maximum, and present the next client identity on
//! the following attempt. After `max_retries` retryable failures the caller
//! gets [`RetryError::RateLimitExhausted`].

use super::{TranslateRequest, Translator};
use crate::error::{RetryError, TranslateError};
use crate::model::{TranslationResult, TranslationUnit};
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// User agents rotated across attempts.
pub const DEFAULT_IDENTITIES: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/96.0.4664.110 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:94.0) Gecko/20100101 Firefox/94.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/96.0.4664.45 Safari/537.36",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per logical request before giving up.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random jitter as a fraction of the exponential delay.
    pub jitter_ratio: f64,
    /// Budget for one outbound request; elapsing counts as retryable.
    pub request_timeout: Duration,
}

impl RetryPolicy {
    /// Exponential part of the delay before retry number `retry` (1-based).
    fn exponential(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Delay before retry `retry` given a jitter drawn for it.
    ///
    /// The jitter is at most the exponential part, so consecutive delays never
    /// shrink even before the cap.
    pub fn delay(&self, retry: u32, jitter: Duration) -> Duration {
        let exp = self.exponential(retry);
        exp.saturating_add(jitter.min(exp)).min(self.max_delay)
    }

    fn max_jitter(&self, retry: u32) -> Duration {
        self.exponential(retry)
            .mul_f64(self.jitter_ratio.clamp(0.0, 1.0))
    }
}

/// Source of waiting, injectable so tests do not sleep for real.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Source of backoff jitter.
pub trait JitterSource: Send + Sync {
    /// A duration in `[0, max]`.
    fn jitter(&self, max: Duration) -> Duration;
}

/// Uniform jitter from the thread rng.
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, max: Duration) -> Duration {
        let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::rng().random_range(0..=nanos))
    }
}

/// Classified outcome of one attempt.
enum Attempt {
    Success(Vec<TranslationResult>),
    RetryableFailure(TranslateError),
    FatalFailure(TranslateError),
}

/// Wraps a [`Translator`] with bounded retries, backoff and identity rotation.
pub struct RetryingTranslator<T> {
    inner: T,
    policy: RetryPolicy,
    identities: Vec<String>,
    cursor: AtomicUsize,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
    cancel: CancellationToken,
}

impl<T: Translator> RetryingTranslator<T> {
    pub fn new(inner: T, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            identities: DEFAULT_IDENTITIES.iter().map(|s| s.to_string()).collect(),
            cursor: AtomicUsize::new(0),
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(RandomJitter),
            cancel,
        }
    }

    /// Replace the backoff sleeper.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replace the jitter source; tests pass a fixed one.
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the identity pool; an empty pool keeps the current one.
    pub fn with_identities(mut self, identities: Vec<String>) -> Self {
        if !identities.is_empty() {
            self.identities = identities;
        }
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn next_identity(&self) -> &str {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.identities[n % self.identities.len()]
    }

    /// Translate the units of `units` whose id is not in `completed`.
    ///
    /// Returns results for the units actually sent, in order. Cancellation is
    /// checked before each request and during backoff; a request already on
    /// the wire is allowed to finish so its results are not lost.
    pub async fn translate(
        &self,
        units: &[TranslationUnit],
        src_lang: &str,
        target_lang: &str,
        completed: &BTreeSet<String>,
    ) -> Result<Vec<TranslationResult>, RetryError> {
        self.translate_until(units, src_lang, target_lang, completed, &self.cancel)
            .await
    }

    /// Like [`translate`](Self::translate) but stops on `stop` instead of the
    /// translator's own token. Pass a child of [`cancel_token`](Self::cancel_token)
    /// to observe both.
    pub async fn translate_until(
        &self,
        units: &[TranslationUnit],
        src_lang: &str,
        target_lang: &str,
        completed: &BTreeSet<String>,
        stop: &CancellationToken,
    ) -> Result<Vec<TranslationResult>, RetryError> {
        let pending: Vec<TranslationUnit> = units
            .iter()
            .filter(|u| !completed.contains(&u.id))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut attempt = 0;
        loop {
            if stop.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;
            let request = TranslateRequest {
                units: &pending,
                src_lang,
                target_lang,
                identity: self.next_identity(),
            };
            match self.attempt(request).await {
                Attempt::Success(results) => {
                    debug!("request succeeded on attempt {attempt}");
                    return Ok(results);
                }
                Attempt::FatalFailure(err) => {
                    error!("backend rejected request: {err}");
                    return Err(RetryError::Fatal(err));
                }
                Attempt::RetryableFailure(err) if attempt >= self.policy.max_retries => {
                    error!("giving up after {attempt} attempts: {err}");
                    return Err(RetryError::RateLimitExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Attempt::RetryableFailure(err) => {
                    let jitter = self.jitter.jitter(self.policy.max_jitter(attempt));
                    let delay = self.policy.delay(attempt, jitter);
                    warn!(
                        "{err}; retry {}/{} after {:.2}s backoff",
                        attempt + 1,
                        self.policy.max_retries,
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = stop.cancelled() => return Err(RetryError::Cancelled),
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(&self, request: TranslateRequest<'_>) -> Attempt {
        let timeout = self.policy.request_timeout;
        match tokio::time::timeout(timeout, self.inner.translate(request)).await {
            Ok(Ok(results)) => Attempt::Success(results),
            Ok(Err(err)) if err.is_retryable() => Attempt::RetryableFailure(err),
            Ok(Err(err)) => Attempt::FatalFailure(err),
            Err(_) => Attempt::RetryableFailure(TranslateError::retryable(format!(
                "no answer within {} ms",
                timeout.as_millis()
            ))),
        }
    }
}
