use std::time::Duration;

use http::HeaderMap;
use http::header::HeaderValue;

use crate::Outcome;
use crate::clock_skew::DEFAULT_SKEW_THRESHOLD;
use crate::error::SdkError;
use crate::retry::RetryMode;

pub const RETRY_MODE_ENV: &str = "REQCORE_RETRY_MODE";
pub const MAX_ATTEMPTS_ENV: &str = "REQCORE_MAX_ATTEMPTS";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = concat!("reqcore/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    Standard,
    LowLatency,
    HighThroughput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileDefaults {
    pub request_timeout: Duration,
    pub total_timeout: Option<Duration>,
    pub retry: RetryConfig,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Standard => ProfileDefaults {
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                total_timeout: None,
                retry: RetryConfig::new(RetryMode::Standard),
            },
            Self::LowLatency => ProfileDefaults {
                request_timeout: Duration::from_secs(2),
                total_timeout: Some(Duration::from_secs(5)),
                retry: RetryConfig::new(RetryMode::Standard).max_attempts(2),
            },
            Self::HighThroughput => ProfileDefaults {
                request_timeout: Duration::from_secs(20),
                total_timeout: Some(Duration::from_secs(60)),
                retry: RetryConfig::new(RetryMode::Standard).max_attempts(4),
            },
        }
    }
}

/// Retry mode and attempt count, resolved before the client is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub mode: RetryMode,
    pub max_attempts: Option<usize>,
}

impl RetryConfig {
    pub const fn new(mode: RetryMode) -> Self {
        Self {
            mode,
            max_attempts: None,
        }
    }

    pub const fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn effective_max_attempts(&self) -> usize {
        self.max_attempts
            .unwrap_or_else(|| self.mode.default_max_attempts())
            .max(1)
    }

    /// Reads `REQCORE_RETRY_MODE` and `REQCORE_MAX_ATTEMPTS`, falling back
    /// to `fallback` for whichever is unset.
    pub fn from_env(fallback: Self) -> Outcome<Self> {
        Self::from_lookup(fallback, |name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(fallback: Self, lookup: F) -> Outcome<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = fallback;
        if let Some(mode) = lookup(RETRY_MODE_ENV).filter(|value| !value.trim().is_empty()) {
            config.mode = mode.parse()?;
        }
        if let Some(raw) = lookup(MAX_ATTEMPTS_ENV).filter(|value| !value.trim().is_empty()) {
            let max_attempts: usize = raw.trim().parse().map_err(|source| {
                SdkError::configuration(format!("{MAX_ATTEMPTS_ENV} must be a positive integer"))
                    .with_source(source)
            })?;
            if max_attempts == 0 {
                return Err(SdkError::configuration(format!(
                    "{MAX_ATTEMPTS_ENV} must be at least 1"
                )));
            }
            config.max_attempts = Some(max_attempts);
        }
        Ok(config)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(RetryMode::Standard)
    }
}

/// Immutable per-client settings shared by every attempt.
#[derive(Clone, Debug)]
pub struct ClientDefaults {
    user_agent: HeaderValue,
    default_headers: HeaderMap,
    request_timeout: Duration,
    total_timeout: Option<Duration>,
    host_prefix_injection: bool,
    clock_skew_adjustment: bool,
    skew_threshold: Duration,
}

impl ClientDefaults {
    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }

    pub fn host_prefix_injection_enabled(&self) -> bool {
        self.host_prefix_injection
    }

    pub fn clock_skew_adjustment_enabled(&self) -> bool {
        self.clock_skew_adjustment
    }

    pub fn skew_threshold(&self) -> Duration {
        self.skew_threshold
    }

    pub(crate) fn with_user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub(crate) fn with_default_headers(mut self, default_headers: HeaderMap) -> Self {
        self.default_headers = default_headers;
        self
    }

    pub(crate) fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub(crate) fn with_total_timeout(mut self, total_timeout: Option<Duration>) -> Self {
        self.total_timeout = total_timeout;
        self
    }

    pub(crate) fn host_prefix_injection(mut self, enabled: bool) -> Self {
        self.host_prefix_injection = enabled;
        self
    }

    pub(crate) fn clock_skew_adjustment(mut self, enabled: bool) -> Self {
        self.clock_skew_adjustment = enabled;
        self
    }

    pub(crate) fn with_skew_threshold(mut self, skew_threshold: Duration) -> Self {
        self.skew_threshold = skew_threshold;
        self
    }
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            total_timeout: None,
            host_prefix_injection: true,
            clock_skew_adjustment: true,
            skew_threshold: DEFAULT_SKEW_THRESHOLD,
        }
    }
}
