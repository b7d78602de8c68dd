use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock_skew::ClockOffset;
use crate::error::{ErrorKind, SdkError};

pub const INVOCATION_ID_HEADER: &str = "sdk-invocation-id";
pub const REQUEST_INFO_HEADER: &str = "sdk-request";

const TTL_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Per logical request bookkeeping threaded through every attempt.
#[derive(Debug)]
pub struct AttemptContext {
    invocation_id: Uuid,
    attempt: usize,
    max_attempts: usize,
    ttl: Option<SystemTime>,
    skew_offset: ClockOffset,
    skew_retry_used: bool,
    retried_kind: Option<ErrorKind>,
    last_error: Option<SdkError>,
}

impl AttemptContext {
    pub fn new(max_attempts: usize) -> Self {
        Self::with_invocation_id(Uuid::new_v4(), max_attempts)
    }

    pub fn with_invocation_id(invocation_id: Uuid, max_attempts: usize) -> Self {
        Self {
            invocation_id,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            ttl: None,
            skew_offset: ClockOffset::ZERO,
            skew_retry_used: false,
            retried_kind: None,
            last_error: None,
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// 1-based.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn ttl(&self) -> Option<SystemTime> {
        self.ttl
    }

    pub fn skew_offset(&self) -> ClockOffset {
        self.skew_offset
    }

    pub fn skew_retry_used(&self) -> bool {
        self.skew_retry_used
    }

    /// Kind of the last failure the retry strategy approved a retry for.
    /// Clock-skew retries leave it untouched.
    pub fn retried_kind(&self) -> Option<ErrorKind> {
        self.retried_kind
    }

    pub fn last_error(&self) -> Option<&SdkError> {
        self.last_error.as_ref()
    }

    /// Freezes the clock offset used by the builder and the signer for the
    /// attempt about to start.
    pub(crate) fn snapshot_skew(&mut self, offset: ClockOffset) {
        self.skew_offset = offset;
    }

    /// Returns `true` the first time it is called for this logical request.
    pub(crate) fn claim_skew_retry(&mut self) -> bool {
        if self.skew_retry_used {
            return false;
        }
        self.skew_retry_used = true;
        true
    }

    pub(crate) fn has_next_attempt(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Moves to the next attempt with a deadline of `reference + timeout`.
    pub(crate) fn advance(&mut self, reference: SystemTime, attempt_timeout: Duration) {
        self.attempt += 1;
        self.ttl = Some(reference.checked_add(attempt_timeout).unwrap_or(reference));
    }

    pub(crate) fn record_strategy_retry(&mut self, kind: ErrorKind) {
        self.retried_kind = Some(kind);
    }

    pub(crate) fn record_error(&mut self, error: SdkError) {
        self.last_error = Some(error);
    }

    /// `attempt=N; max=M` plus `; ttl=YYYYMMDDTHHMMSSZ` once a deadline is
    /// known.
    pub fn request_info(&self) -> String {
        let mut value = format!("attempt={}; max={}", self.attempt, self.max_attempts);
        if let Some(ttl) = self.ttl {
            value.push_str("; ttl=");
            value.push_str(&format_ttl(ttl));
        }
        value
    }
}

pub fn format_ttl(ttl: SystemTime) -> String {
    DateTime::<Utc>::from(ttl).format(TTL_FORMAT).to_string()
}

/// Parses one `key=value` field out of an `sdk-request` header value.
pub fn request_info_field<'a>(header_value: &'a str, key: &str) -> Option<&'a str> {
    header_value.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name == key).then_some(value)
    })
}

pub fn parse_ttl(value: &str) -> Option<SystemTime> {
    let parsed = chrono::NaiveDateTime::parse_from_str(value, TTL_FORMAT).ok()?;
    Some(parsed.and_utc().into())
}
