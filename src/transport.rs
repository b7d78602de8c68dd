use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::timeout;

use crate::Outcome;
use crate::error::{BoxError, ErrorKind, SdkError, TransportErrorKind};
use crate::util::truncate_body;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// A fully built request for a single attempt.
#[derive(Clone, Debug)]
pub struct WireRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl WireRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Option<Bytes>) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn into_http_request(self) -> Result<Request<Full<Bytes>>, http::Error> {
        let mut builder = Request::builder().method(self.method).uri(self.uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
        }
        builder.body(Full::new(self.body.unwrap_or_default()))
    }
}

#[derive(Clone, Debug)]
pub struct WireResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl WireResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Outcome<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| {
            SdkError::new(
                ErrorKind::ClientFault,
                format!("failed to decode response json; body={}", truncate_body(&self.body)),
            )
            .with_status(self.status)
            .with_retryable(false)
            .with_source(source)
        })
    }
}

/// Failure below HTTP: nothing usable came back from the peer.
#[derive(Debug, Error)]
#[error("transport error ({kind}): {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_sdk_error(self) -> SdkError {
        let message = self.to_string();
        let kind = self.kind;
        SdkError::transport(kind, message).with_source(self.source)
    }
}

/// Sends one attempt. Implementations must honor `timeout`; dropping the
/// returned future must abort the exchange.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: WireRequest,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<WireResponse, TransportError>>;
}

#[derive(Clone, Debug)]
pub struct HyperTransportOptions {
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    http2_only: bool,
}

impl HyperTransportOptions {
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn http2_only(mut self, http2_only: bool) -> Self {
        self.http2_only = http2_only;
        self
    }
}

impl Default for HyperTransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            http2_only: false,
        }
    }
}

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Default transport: pooled hyper client with rustls (ring) and webpki roots.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn try_new(options: HyperTransportOptions) -> Outcome<Self> {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|source| {
            SdkError::configuration("failed to initialize rustls").with_source(source)
        })?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(options.connect_timeout));
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(options.pool_idle_timeout)
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .http2_only(options.http2_only)
            .build(https);
        Ok(Self { client })
    }

    async fn exchange(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let request = request
            .into_http_request()
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| TransportError::new(classify_hyper_error(&source), source))?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?
            .to_bytes();
        Ok(WireResponse::new(parts.status, parts.headers, body))
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        request: WireRequest,
        attempt_timeout: Duration,
    ) -> BoxFuture<'_, Result<WireResponse, TransportError>> {
        Box::pin(async move {
            match timeout(attempt_timeout, self.exchange(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::timeout(attempt_timeout)),
            }
        })
    }
}

pub(crate) fn classify_hyper_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let text = error.to_string().to_ascii_lowercase();
    let source_text = std::error::Error::source(error)
        .map(|source| source.to_string().to_ascii_lowercase())
        .unwrap_or_default();
    let matches_any = |needles: &[&str]| {
        needles
            .iter()
            .any(|needle| text.contains(needle) || source_text.contains(needle))
    };

    if error.is_connect() {
        if matches_any(&["dns", "name or service not known", "failed to lookup address"]) {
            return TransportErrorKind::Dns;
        }
        if matches_any(&["tls", "certificate", "handshake"]) {
            return TransportErrorKind::Tls;
        }
        if matches_any(&["timed out", "timeout"]) {
            return TransportErrorKind::Timeout;
        }
        return TransportErrorKind::Connect;
    }

    let hyper_error = std::error::Error::source(error)
        .and_then(|source| source.downcast_ref::<hyper::Error>());
    if hyper_error.is_some_and(|error| {
        error.is_incomplete_message() || error.is_closed() || error.is_canceled()
    }) {
        return TransportErrorKind::Connect;
    }

    if matches_any(&["connection reset", "broken pipe", "unexpected eof", "connection closed"]) {
        return TransportErrorKind::Connect;
    }

    TransportErrorKind::Other
}
