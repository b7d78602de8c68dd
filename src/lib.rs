//! `reqcore` is the request-execution core shared by web-service SDK clients:
//! it builds a wire request from a service-agnostic description, signs it,
//! sends it, classifies the outcome, and retries with clock-skew correction
//! and a shared retry quota.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use reqcore::prelude::{Credentials, RetryMode, ServiceClient, ServiceRequest, SigV4Signer};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct GetItemOutput {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let signer = SigV4Signer::new(
//!         Credentials::new("AKIDEXAMPLE", "secret"),
//!         "us-east-1",
//!         "items",
//!     );
//!     let client = ServiceClient::builder()
//!         .client_name("items-sdk")
//!         .endpoint("https://items.us-east-1.example.com")
//!         .signer(Arc::new(signer))
//!         .retry_mode(RetryMode::Standard)
//!         .request_timeout(Duration::from_secs(10))
//!         .try_build()?;
//!
//!     let request = ServiceRequest::get("/items/42").operation("GetItem");
//!     let item: GetItemOutput = client.execute_json(&request).await?;
//!     println!("fetched id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Use `RetryMode::Standard` so retries draw from a shared quota.
//! - Share one `ServiceClient` (it is cheap to clone) so the clock-skew
//!   offset learned by one request benefits the next.
//! - Pass a `CancellationToken` through `execute_with_cancellation` when the
//!   caller may give up early.

mod attempt;
mod build;
mod classify;
mod client;
mod clock_skew;
mod config;
mod digest;
mod error;
mod extensions;
mod metrics;
mod observe;
mod request;
mod retry;
mod signer;
mod transport;
mod util;

pub use crate::attempt::{
    AttemptContext, INVOCATION_ID_HEADER, REQUEST_INFO_HEADER, format_ttl, parse_ttl,
    request_info_field,
};
pub use crate::build::build_wire_request;
pub use crate::classify::{DEFAULT_ERROR_CODE_HEADER, ErrorClassifier, StandardErrorClassifier};
pub use crate::client::{ExecutionState, ServiceClient, ServiceClientBuilder};
pub use crate::clock_skew::{
    ClockOffset, ClockSkewCorrector, ClockSkewState, DEFAULT_SKEW_THRESHOLD, SkewCorrection,
};
pub use crate::config::{
    ClientDefaults, ClientProfile, DEFAULT_REQUEST_TIMEOUT, MAX_ATTEMPTS_ENV, ProfileDefaults,
    RETRY_MODE_ENV, RetryConfig,
};
pub use crate::digest::{CONTENT_MD5_HEADER, CONTENT_SHA256_HEADER, ContentDigestAlgorithm};
pub use crate::error::{ErrorKind, SdkError, TransportErrorKind};
pub use crate::extensions::{
    Clock, EndpointResolver, ManualClock, RoundRobinEndpointResolver, StaticEndpoint,
    SystemClock,
};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::observe::{Observer, RequestSummary};
pub use crate::request::ServiceRequest;
pub use crate::retry::{
    Backoff, DEFAULT_QUOTA_CAPACITY, Jitter, LegacyRetryStrategy, RetryCosts, RetryMode,
    RetryQuota, RetryStrategy, RetryVerdict, StandardRetryStrategy, strategy_for_mode,
};
pub use crate::signer::{
    BearerTokenSigner, Credentials, NullSigner, RequestSigner, SigV4Signer, SignerRegistry,
};
pub use crate::transport::{
    HyperTransport, HyperTransportOptions, Transport, TransportError, WireRequest, WireResponse,
};
pub use tokio_util::sync::CancellationToken;

/// Result of one logical request.
pub type Outcome<T> = std::result::Result<T, SdkError>;

pub mod prelude {
    pub use crate::{
        BearerTokenSigner, CancellationToken, ClientProfile, ContentDigestAlgorithm, Credentials,
        ErrorKind, Outcome, RetryMode, RetryQuota, SdkError, ServiceClient, ServiceRequest,
        SigV4Signer, WireResponse,
    };
}
