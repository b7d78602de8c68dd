use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngExt;

use crate::error::{ErrorKind, SdkError};
use crate::util::lock_unpoisoned;

pub const DEFAULT_QUOTA_CAPACITY: usize = 500;
pub const DEFAULT_LEGACY_MAX_ATTEMPTS: usize = 11;
pub const DEFAULT_STANDARD_MAX_ATTEMPTS: usize = 3;
const DEFAULT_LEGACY_BASE_BACKOFF: Duration = Duration::from_millis(25);
const DEFAULT_STANDARD_BASE_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryMode {
    Legacy,
    Standard,
}

impl RetryMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Standard => "standard",
        }
    }

    pub const fn default_max_attempts(self) -> usize {
        match self {
            Self::Legacy => DEFAULT_LEGACY_MAX_ATTEMPTS,
            Self::Standard => DEFAULT_STANDARD_MAX_ATTEMPTS,
        }
    }
}

impl FromStr for RetryMode {
    type Err = SdkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "standard" => Ok(Self::Standard),
            other => Err(SdkError::configuration(format!(
                "unknown retry mode {other:?}, expected \"legacy\" or \"standard\""
            ))),
        }
    }
}

impl std::fmt::Display for RetryMode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    Retry,
    Stop,
    /// Retryable, but admission control refused it.
    Denied(ErrorKind),
}

/// Token bucket shared by every request of a client (or of several clients).
#[derive(Debug)]
pub struct RetryQuota {
    capacity: usize,
    available: Mutex<usize>,
}

impl RetryQuota {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *lock_unpoisoned(&self.available)
    }

    /// Debits `cost` tokens if that many are available. All or nothing.
    pub fn try_acquire(&self, cost: usize) -> bool {
        let mut available = lock_unpoisoned(&self.available);
        if *available < cost {
            return false;
        }
        *available -= cost;
        true
    }

    pub fn release(&self, amount: usize) {
        let mut available = lock_unpoisoned(&self.available);
        *available = available.saturating_add(amount).min(self.capacity);
    }
}

impl Default for RetryQuota {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA_CAPACITY)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryCosts {
    timeout: usize,
    throttling: usize,
    retry: usize,
    no_retry_increment: usize,
}

impl RetryCosts {
    pub const fn standard() -> Self {
        Self {
            timeout: 10,
            throttling: 5,
            retry: 5,
            no_retry_increment: 1,
        }
    }

    pub const fn timeout(mut self, cost: usize) -> Self {
        self.timeout = cost;
        self
    }

    pub const fn throttling(mut self, cost: usize) -> Self {
        self.throttling = cost;
        self
    }

    pub const fn retry(mut self, cost: usize) -> Self {
        self.retry = cost;
        self
    }

    pub const fn no_retry_increment(mut self, amount: usize) -> Self {
        self.no_retry_increment = amount;
        self
    }

    pub fn cost_for(&self, error: &SdkError) -> usize {
        self.cost_for_kind(error.kind())
    }

    pub fn cost_for_kind(&self, kind: ErrorKind) -> usize {
        match kind {
            ErrorKind::RequestTimeout => self.timeout,
            ErrorKind::Throttling => self.throttling,
            _ => self.retry,
        }
    }
}

impl Default for RetryCosts {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    None,
    /// Uniform in `[0, delay]`.
    Full,
}

#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Jitter,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: Jitter::Full,
        }
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// `min(max, base * 2^(attempt - 1))` before jitter.
    pub fn ceiling_for_attempt(&self, attempt: usize) -> Duration {
        let capped_exponent = attempt.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base.as_millis();
        let max_ms = self.max.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Delay before retrying after `attempt` failed with `error`.
    ///
    /// A server-provided `Retry-After` wins over the computed delay but never
    /// exceeds `max`.
    pub fn delay_for(&self, error: &SdkError, attempt: usize) -> Duration {
        if let Some(retry_after) = error.retry_after() {
            return retry_after.min(self.max);
        }

        let ceiling = self.ceiling_for_attempt(attempt);
        match self.jitter {
            Jitter::None => ceiling,
            Jitter::Full => {
                let ceiling_ms = ceiling.as_millis().min(u64::MAX as u128) as u64;
                if ceiling_ms == 0 {
                    return Duration::ZERO;
                }
                let mut rng = rand::rng();
                Duration::from_millis(rng.random_range(0..=ceiling_ms))
            }
        }
    }
}

pub trait RetryStrategy: Send + Sync {
    fn max_attempts(&self) -> usize;

    /// `attempt` is the 1-based number of the attempt that just failed.
    fn should_retry(&self, error: &SdkError, attempt: usize) -> RetryVerdict;

    fn compute_delay(&self, error: &SdkError, attempt: usize) -> Duration;

    /// Called once per logical request that ends in success. `retried_kind`
    /// is the kind of the last failure this strategy approved a retry for.
    fn record_success(&self, _retried_kind: Option<ErrorKind>) {}

    fn quota(&self) -> Option<&Arc<RetryQuota>> {
        None
    }

    fn mode(&self) -> Option<RetryMode> {
        None
    }
}

/// Exponential backoff with a generous attempt count and no admission
/// control.
#[derive(Clone, Debug)]
pub struct LegacyRetryStrategy {
    max_attempts: usize,
    backoff: Backoff,
}

impl LegacyRetryStrategy {
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_LEGACY_MAX_ATTEMPTS,
            backoff: Backoff::new(DEFAULT_LEGACY_BASE_BACKOFF, DEFAULT_MAX_BACKOFF),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for LegacyRetryStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryStrategy for LegacyRetryStrategy {
    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn should_retry(&self, error: &SdkError, attempt: usize) -> RetryVerdict {
        if attempt >= self.max_attempts || !error.is_retryable() {
            return RetryVerdict::Stop;
        }
        RetryVerdict::Retry
    }

    fn compute_delay(&self, error: &SdkError, attempt: usize) -> Duration {
        self.backoff.delay_for(error, attempt)
    }

    fn mode(&self) -> Option<RetryMode> {
        Some(RetryMode::Legacy)
    }
}

/// Exponential backoff gated by a shared [`RetryQuota`].
#[derive(Clone, Debug)]
pub struct StandardRetryStrategy {
    max_attempts: usize,
    backoff: Backoff,
    costs: RetryCosts,
    quota: Arc<RetryQuota>,
}

impl StandardRetryStrategy {
    pub fn new(quota: Arc<RetryQuota>) -> Self {
        Self {
            max_attempts: DEFAULT_STANDARD_MAX_ATTEMPTS,
            backoff: Backoff::new(DEFAULT_STANDARD_BASE_BACKOFF, DEFAULT_MAX_BACKOFF),
            costs: RetryCosts::standard(),
            quota,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn costs(mut self, costs: RetryCosts) -> Self {
        self.costs = costs;
        self
    }
}

impl Default for StandardRetryStrategy {
    fn default() -> Self {
        Self::new(Arc::new(RetryQuota::default()))
    }
}

impl RetryStrategy for StandardRetryStrategy {
    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn should_retry(&self, error: &SdkError, attempt: usize) -> RetryVerdict {
        if attempt >= self.max_attempts || !error.is_retryable() {
            return RetryVerdict::Stop;
        }
        if !self.quota.try_acquire(self.costs.cost_for(error)) {
            return RetryVerdict::Denied(ErrorKind::QuotaExhausted);
        }
        RetryVerdict::Retry
    }

    fn compute_delay(&self, error: &SdkError, attempt: usize) -> Duration {
        self.backoff.delay_for(error, attempt)
    }

    fn record_success(&self, retried_kind: Option<ErrorKind>) {
        let credit = retried_kind.map_or(self.costs.no_retry_increment, |kind| {
            self.costs.cost_for_kind(kind)
        });
        self.quota.release(credit);
    }

    fn quota(&self) -> Option<&Arc<RetryQuota>> {
        Some(&self.quota)
    }

    fn mode(&self) -> Option<RetryMode> {
        Some(RetryMode::Standard)
    }
}

/// Builds the strategy for `mode`. `max_attempts` of `None` keeps the mode's
/// default.
pub fn strategy_for_mode(
    mode: RetryMode,
    max_attempts: Option<usize>,
    quota: Arc<RetryQuota>,
) -> Arc<dyn RetryStrategy> {
    let max_attempts = max_attempts.unwrap_or_else(|| mode.default_max_attempts());
    match mode {
        RetryMode::Legacy => Arc::new(LegacyRetryStrategy::new().with_max_attempts(max_attempts)),
        RetryMode::Standard => {
            Arc::new(StandardRetryStrategy::new(quota).with_max_attempts(max_attempts))
        }
    }
}
