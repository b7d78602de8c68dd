use std::time::Duration;

use http::StatusCode;

use crate::attempt::AttemptContext;
use crate::clock_skew::SkewCorrection;
use crate::error::{ErrorKind, SdkError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestSummary {
    pub attempts: usize,
    pub status: Option<StatusCode>,
    /// `None` on success.
    pub error_kind: Option<ErrorKind>,
    pub elapsed: Duration,
}

pub trait Observer: Send + Sync {
    fn on_attempt_start(&self, _operation: &str, _context: &AttemptContext) {}

    fn on_retry_scheduled(
        &self,
        _operation: &str,
        _context: &AttemptContext,
        _error: &SdkError,
        _delay: Duration,
    ) {
    }

    fn on_clock_skew_corrected(&self, _operation: &str, _correction: &SkewCorrection) {}

    fn on_request_finished(&self, _operation: &str, _summary: &RequestSummary) {}
}

#[derive(Debug, Default)]
pub(crate) struct NoopObserver;

impl Observer for NoopObserver {}
