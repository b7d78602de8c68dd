use std::time::{Duration, SystemTime};

use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::util::parse_date_header;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Closed failure taxonomy for one logical request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    NetworkConnection,
    RequestTimeout,
    TransportUnknown,
    ServerFault,
    Throttling,
    ClientFault,
    SignatureOrClockSkew,
    QuotaExhausted,
    Cancelled,
    Configuration,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkConnection => "network_connection",
            Self::RequestTimeout => "request_timeout",
            Self::TransportUnknown => "transport_unknown",
            Self::ServerFault => "server_fault",
            Self::Throttling => "throttling",
            Self::ClientFault => "client_fault",
            Self::SignatureOrClockSkew => "signature_or_clock_skew",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
        }
    }

    /// Whether the normal retry path may retry this kind.
    pub const fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            Self::NetworkConnection
                | Self::RequestTimeout
                | Self::TransportUnknown
                | Self::ServerFault
                | Self::Throttling
        )
    }

    /// Kinds that end a logical request without consulting any retry logic.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Configuration)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    Other,
}

impl TransportErrorKind {
    pub const fn error_kind(self) -> ErrorKind {
        match self {
            Self::Dns | Self::Connect | Self::Tls => ErrorKind::NetworkConnection,
            Self::Timeout => ErrorKind::RequestTimeout,
            Self::Other => ErrorKind::TransportUnknown,
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Failure of a logical request.
///
/// `retryable` is decided once, when the raw transport result is classified,
/// and is never recomputed by the retry machinery. `attempts` is filled in by
/// the execution loop before the error is returned to the caller.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct SdkError {
    kind: ErrorKind,
    http_status: Option<StatusCode>,
    message: String,
    retryable: bool,
    retry_after: Option<Duration>,
    service_code: Option<String>,
    response_headers: Option<Box<HeaderMap>>,
    attempts: Option<usize>,
    retry_denial: Option<ErrorKind>,
    #[source]
    source: Option<BoxError>,
}

impl SdkError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: None,
            message: message.into(),
            retryable: kind.is_retryable_by_default(),
            retry_after: None,
            service_code: None,
            response_headers: None,
            attempts: None,
            retry_denial: None,
            source: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request was cancelled by the caller")
    }

    /// Every transport failure, including a reset handshake or a body that
    /// stopped mid-read, may succeed on a fresh connection.
    pub(crate) fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind.error_kind(), message)
    }

    pub(crate) fn with_status(mut self, status: StatusCode) -> Self {
        self.http_status = Some(status);
        self
    }

    pub(crate) fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub(crate) fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub(crate) fn with_service_code(mut self, service_code: Option<String>) -> Self {
        self.service_code = service_code;
        self
    }

    pub(crate) fn with_response_headers(mut self, headers: HeaderMap) -> Self {
        self.response_headers = Some(Box::new(headers));
        self
    }

    pub(crate) fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub(crate) fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Fills in the attempt count unless one was already recorded.
    pub(crate) fn or_attempts(mut self, attempts: usize) -> Self {
        self.attempts.get_or_insert(attempts);
        self
    }

    pub(crate) fn with_retry_denial(mut self, reason: ErrorKind) -> Self {
        self.retry_denial = Some(reason);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn http_status(&self) -> Option<StatusCode> {
        self.http_status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn service_code(&self) -> Option<&str> {
        self.service_code.as_deref()
    }

    pub fn response_headers(&self) -> Option<&HeaderMap> {
        self.response_headers.as_deref()
    }

    /// Number of attempts made before this error was surfaced.
    pub fn attempts(&self) -> usize {
        self.attempts.unwrap_or_default()
    }

    /// Set when a retry was refused by admission control rather than by
    /// classification, e.g. `Some(ErrorKind::QuotaExhausted)`.
    pub fn retry_denial(&self) -> Option<ErrorKind> {
        self.retry_denial
    }

    /// Services report expired or future-dated signatures either as an
    /// auth failure or as a plain 400.
    pub fn is_clock_skew_candidate(&self) -> bool {
        match self.kind {
            ErrorKind::SignatureOrClockSkew => true,
            ErrorKind::ClientFault => self.http_status == Some(StatusCode::BAD_REQUEST),
            _ => false,
        }
    }

    /// The server's `Date` header, when the failure carried a response.
    pub fn server_date(&self) -> Option<SystemTime> {
        self.response_headers
            .as_deref()
            .and_then(parse_date_header)
    }
}
