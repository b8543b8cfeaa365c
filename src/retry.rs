//! # Retry with Exponential Backoff and Deadline Accounting
//!
//! This module provides the retrying decorator: it re-issues an inner call
//! on classifiable transient failures, under an overall deadline, with an
//! exponential backoff schedule for both the between-attempt delay and the
//! per-attempt RPC timeout.
//!
//! ## Core Components
//!
//! - **[`RetrySettings`]**: immutable configuration of the backoff schedule
//!   and the total deadline, built through [`RetrySettings::builder`].
//! - **[`RetryingCallable`]**: the decorator itself. It never reads wall
//!   time or sleeps directly; it consults the injected
//!   [`Clock`](crate::scheduler::Clock) and defers through the injected
//!   [`Scheduler`](crate::scheduler::Scheduler), which makes the whole
//!   engine deterministic under test.
//!
//! ## Classification
//!
//! A failure's status code is recovered from its error chain; failures with
//! no recognized code classify as `UNKNOWN`, so declaring `UNKNOWN`
//! retryable retries bare transport errors. `DEADLINE_EXCEEDED` is special:
//! it is always retry-eligible, but skips the computed backoff and sleeps
//! for the zero-duration sentinel [`DEADLINE_SLEEP_DURATION`] — the attempt
//! itself already consumed its share of the budget.
//!
//! On exhaustion the surfaced [`ApiError`] carries the code of the last
//! failing attempt.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::callable::FutureCallable;
use crate::context::CallContext;
use crate::error::{find_status_code, ApiError, BoxError, Error, Result, StatusCode};
use crate::scheduler::{Clock, Scheduler};

/// Sentinel sleep used after a `DEADLINE_EXCEEDED` failure: re-attempt
/// immediately instead of backing off.
pub const DEADLINE_SLEEP_DURATION: Duration = Duration::ZERO;

/// Immutable configuration of the retry schedule.
///
/// All durations are non-negative and the multipliers are at least 1;
/// `total_timeout` bounds total elapsed time including every attempt and
/// every backoff sleep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    initial_retry_delay: Duration,
    retry_delay_multiplier: f64,
    max_retry_delay: Duration,
    initial_rpc_timeout: Duration,
    rpc_timeout_multiplier: f64,
    max_rpc_timeout: Duration,
    total_timeout: Duration,
    jittered: bool,
}

impl RetrySettings {
    pub fn builder() -> RetrySettingsBuilder {
        RetrySettingsBuilder::default()
    }

    pub fn initial_retry_delay(&self) -> Duration {
        self.initial_retry_delay
    }

    pub fn retry_delay_multiplier(&self) -> f64 {
        self.retry_delay_multiplier
    }

    pub fn max_retry_delay(&self) -> Duration {
        self.max_retry_delay
    }

    pub fn initial_rpc_timeout(&self) -> Duration {
        self.initial_rpc_timeout
    }

    pub fn rpc_timeout_multiplier(&self) -> f64 {
        self.rpc_timeout_multiplier
    }

    pub fn max_rpc_timeout(&self) -> Duration {
        self.max_rpc_timeout
    }

    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    pub fn jittered(&self) -> bool {
        self.jittered
    }
}

/// Fluent builder for [`RetrySettings`].
#[derive(Debug, Clone)]
pub struct RetrySettingsBuilder {
    initial_retry_delay: Duration,
    retry_delay_multiplier: f64,
    max_retry_delay: Duration,
    initial_rpc_timeout: Duration,
    rpc_timeout_multiplier: f64,
    max_rpc_timeout: Duration,
    total_timeout: Duration,
    jittered: bool,
}

impl Default for RetrySettingsBuilder {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_millis(100),
            retry_delay_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(10),
            initial_rpc_timeout: Duration::from_secs(30),
            rpc_timeout_multiplier: 1.0,
            max_rpc_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(600),
            jittered: false,
        }
    }
}

impl RetrySettingsBuilder {
    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    pub fn retry_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_delay_multiplier = multiplier;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    pub fn initial_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.initial_rpc_timeout = timeout;
        self
    }

    pub fn rpc_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.rpc_timeout_multiplier = multiplier;
        self
    }

    pub fn max_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.max_rpc_timeout = timeout;
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn jittered(mut self, enabled: bool) -> Self {
        self.jittered = enabled;
        self
    }

    pub fn build(self) -> Result<RetrySettings> {
        if self.retry_delay_multiplier < 1.0 {
            return Err(Error::validation(format!(
                "retry delay multiplier must be >= 1, got {}",
                self.retry_delay_multiplier
            )));
        }
        if self.rpc_timeout_multiplier < 1.0 {
            return Err(Error::validation(format!(
                "rpc timeout multiplier must be >= 1, got {}",
                self.rpc_timeout_multiplier
            )));
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(Error::validation(
                "initial retry delay exceeds max retry delay",
            ));
        }
        if self.initial_rpc_timeout > self.max_rpc_timeout {
            return Err(Error::validation(
                "initial rpc timeout exceeds max rpc timeout",
            ));
        }
        Ok(RetrySettings {
            initial_retry_delay: self.initial_retry_delay,
            retry_delay_multiplier: self.retry_delay_multiplier,
            max_retry_delay: self.max_retry_delay,
            initial_rpc_timeout: self.initial_rpc_timeout,
            rpc_timeout_multiplier: self.rpc_timeout_multiplier,
            max_rpc_timeout: self.max_rpc_timeout,
            total_timeout: self.total_timeout,
            jittered: self.jittered,
        })
    }
}

/// The retrying decorator.
///
/// Attempts are strictly sequential; dropping the outer future prevents any
/// further attempt from being scheduled. Cancellation of an in-flight
/// attempt is delegated to the transport.
pub struct RetryingCallable<Req, Resp> {
    inner: Arc<dyn FutureCallable<Req, Resp>>,
    settings: RetrySettings,
    retryable_codes: Arc<BTreeSet<StatusCode>>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
}

impl<Req, Resp> RetryingCallable<Req, Resp> {
    pub fn new(
        inner: Arc<dyn FutureCallable<Req, Resp>>,
        settings: RetrySettings,
        retryable_codes: Arc<BTreeSet<StatusCode>>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            settings,
            retryable_codes,
            scheduler,
            clock,
        }
    }
}

fn apply_jitter(delay: Duration, jittered: bool) -> Duration {
    if !jittered || delay.is_zero() {
        return delay;
    }
    use rand::Rng;
    let mut rng = rand::thread_rng();
    delay.mul_f64(1.0 + rng.gen_range(0.0..0.3))
}

impl<Req, Resp> FutureCallable<Req, Resp> for RetryingCallable<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn future_call(
        &self,
        request: Req,
        context: CallContext,
    ) -> BoxFuture<'static, std::result::Result<Resp, BoxError>> {
        let inner = self.inner.clone();
        let settings = self.settings;
        let retryable_codes = self.retryable_codes.clone();
        let scheduler = self.scheduler.clone();
        let clock = self.clock.clone();

        Box::pin(async move {
            let total_deadline = clock.now() + settings.total_timeout();
            let mut delay = settings.initial_retry_delay();
            let mut rpc_timeout = settings.initial_rpc_timeout();
            let mut attempts: usize = 0;

            loop {
                attempts += 1;
                let attempt_deadline =
                    std::cmp::min(clock.now() + rpc_timeout, total_deadline);
                let attempt_context = context.with_deadline(attempt_deadline);

                match inner.future_call(request.clone(), attempt_context).await {
                    Ok(response) => {
                        if attempts > 1 {
                            debug!(attempts, "call succeeded after retries");
                        }
                        return Ok(response);
                    }
                    Err(error) => {
                        let code =
                            find_status_code(error.as_ref()).unwrap_or(StatusCode::Unknown);
                        let deadline_exceeded = code == StatusCode::DeadlineExceeded;

                        if !deadline_exceeded && !retryable_codes.contains(&code) {
                            debug!(%code, "non-retryable failure");
                            return Err(Box::new(ApiError::from_error(error)) as BoxError);
                        }

                        let sleep = if deadline_exceeded {
                            DEADLINE_SLEEP_DURATION
                        } else {
                            apply_jitter(delay, settings.jittered())
                        };

                        if clock.now() + sleep >= total_deadline {
                            warn!(attempts, %code, "retry budget exhausted");
                            return Err(Box::new(ApiError::from_error(error)) as BoxError);
                        }

                        debug!(attempts, %code, ?sleep, "attempt failed, backing off");
                        scheduler.sleep(sleep).await;

                        delay = std::cmp::min(
                            delay.mul_f64(settings.retry_delay_multiplier()),
                            settings.max_retry_delay(),
                        );
                        rpc_timeout = std::cmp::min(
                            rpc_timeout.mul_f64(settings.rpc_timeout_multiplier()),
                            settings.max_rpc_timeout(),
                        );
                    }
                }
            }
        })
    }
}
