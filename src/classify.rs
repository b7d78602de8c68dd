use std::collections::BTreeSet;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, StatusCode};

use crate::error::{ErrorKind, SdkError};
use crate::transport::{TransportError, WireResponse};
use crate::util::{parse_retry_after, truncate_body};

pub const DEFAULT_ERROR_CODE_HEADER: &str = "x-error-code";

/// Service-specific knowledge needed to classify a failed response.
pub trait ErrorClassifier: Send + Sync {
    fn service_error_code(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Option<String>;

    fn is_throttling_code(&self, code: &str) -> bool;

    fn is_clock_skew_code(&self, code: &str) -> bool;
}

/// Reads the service error code from a single response header.
#[derive(Clone, Debug)]
pub struct StandardErrorClassifier {
    code_header: HeaderName,
    throttling_codes: BTreeSet<String>,
    clock_skew_codes: BTreeSet<String>,
}

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self {
            code_header: HeaderName::from_static(DEFAULT_ERROR_CODE_HEADER),
            throttling_codes: default_throttling_codes(),
            clock_skew_codes: default_clock_skew_codes(),
        }
    }

    pub fn code_header(mut self, code_header: HeaderName) -> Self {
        self.code_header = code_header;
        self
    }

    pub fn throttling_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.throttling_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn clock_skew_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clock_skew_codes = codes.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for StandardErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn service_error_code(
        &self,
        _status: StatusCode,
        headers: &HeaderMap,
        _body: &Bytes,
    ) -> Option<String> {
        let raw = headers.get(&self.code_header)?.to_str().ok()?.trim();
        // Some services append a namespace or message after a colon.
        let code = raw.split(':').next().unwrap_or(raw).trim();
        (!code.is_empty()).then(|| code.to_owned())
    }

    fn is_throttling_code(&self, code: &str) -> bool {
        self.throttling_codes.contains(code)
    }

    fn is_clock_skew_code(&self, code: &str) -> bool {
        self.clock_skew_codes.contains(code)
    }
}

fn default_throttling_codes() -> BTreeSet<String> {
    [
        "Throttling",
        "ThrottlingException",
        "ThrottledException",
        "RequestThrottledException",
        "TooManyRequestsException",
        "ProvisionedThroughputExceededException",
        "TransactionInProgressException",
        "RequestLimitExceeded",
        "BandwidthLimitExceeded",
        "LimitExceededException",
        "RequestThrottled",
        "SlowDown",
        "PriorRequestNotComplete",
        "EC2ThrottledException",
    ]
    .into_iter()
    .map(ToOwned::to_owned)
    .collect()
}

fn default_clock_skew_codes() -> BTreeSet<String> {
    [
        "RequestTimeTooSkewed",
        "RequestExpired",
        "RequestInTheFuture",
        "InvalidSignatureException",
        "SignatureDoesNotMatch",
        "AuthFailure",
    ]
    .into_iter()
    .map(ToOwned::to_owned)
    .collect()
}

/// Turns a raw response into success or a classified `SdkError`.
pub(crate) fn classify_response(
    classifier: &dyn ErrorClassifier,
    response: WireResponse,
    now: SystemTime,
) -> Result<WireResponse, SdkError> {
    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return Ok(response);
    }

    let (status, headers, body) = response.into_parts();
    let service_code = classifier.service_error_code(status, &headers, &body);
    let kind = classify_status(classifier, status, service_code.as_deref());
    let retry_after = match kind {
        ErrorKind::Throttling | ErrorKind::ServerFault => parse_retry_after(&headers, now),
        _ => None,
    };
    let message = match &service_code {
        Some(code) => format!("http status {} ({code}): {}", status.as_u16(), truncate_body(&body)),
        None => format!("http status {}: {}", status.as_u16(), truncate_body(&body)),
    };

    Err(SdkError::new(kind, message)
        .with_status(status)
        .with_service_code(service_code)
        .with_retry_after(retry_after)
        .with_response_headers(headers))
}

pub(crate) fn classify_status(
    classifier: &dyn ErrorClassifier,
    status: StatusCode,
    service_code: Option<&str>,
) -> ErrorKind {
    if let Some(code) = service_code {
        if classifier.is_clock_skew_code(code) {
            return ErrorKind::SignatureOrClockSkew;
        }
        if classifier.is_throttling_code(code) {
            return ErrorKind::Throttling;
        }
    }

    match status.as_u16() {
        429 | 503 | 509 => ErrorKind::Throttling,
        401 | 403 => ErrorKind::SignatureOrClockSkew,
        code if (500..600).contains(&code) => ErrorKind::ServerFault,
        _ => ErrorKind::ClientFault,
    }
}

pub(crate) fn classify_transport_error(error: TransportError) -> SdkError {
    error.into_sdk_error()
}
