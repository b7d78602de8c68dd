use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, EXPECT, HOST, HeaderName, HeaderValue, USER_AGENT};
use sha2::{Digest, Sha256};

use crate::Outcome;
use crate::error::SdkError;
use crate::transport::WireRequest;

type HmacSha256 = Hmac<Sha256>;

pub const NULL_SIGNER: &str = "null";
pub const BEARER_SIGNER: &str = "bearer";
pub const SIGV4_SIGNER: &str = "sigv4";

const SIGV4_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const AMZ_DATE_HEADER: &str = "x-amz-date";
const AMZ_SECURITY_TOKEN_HEADER: &str = "x-amz-security-token";
const AMZ_CONTENT_SHA256_HEADER: &str = "x-amz-content-sha256";

/// Adds authentication to a fully built attempt.
///
/// Implementations must be deterministic: the same request and signing time
/// always produce the same output.
pub trait RequestSigner: Send + Sync {
    fn name(&self) -> &str;

    fn sign(&self, request: WireRequest, signing_time: SystemTime) -> Outcome<WireRequest>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullSigner;

impl RequestSigner for NullSigner {
    fn name(&self) -> &str {
        NULL_SIGNER
    }

    fn sign(&self, request: WireRequest, _signing_time: SystemTime) -> Outcome<WireRequest> {
        Ok(request)
    }
}

#[derive(Clone)]
pub struct BearerTokenSigner {
    token: HeaderValue,
}

impl BearerTokenSigner {
    pub fn try_new(token: &str) -> Outcome<Self> {
        let mut token = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|source| {
            SdkError::configuration("bearer token is not a valid header value").with_source(source)
        })?;
        token.set_sensitive(true);
        Ok(Self { token })
    }
}

impl std::fmt::Debug for BearerTokenSigner {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BearerTokenSigner")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl RequestSigner for BearerTokenSigner {
    fn name(&self) -> &str {
        BEARER_SIGNER
    }

    fn sign(&self, mut request: WireRequest, _signing_time: SystemTime) -> Outcome<WireRequest> {
        request.headers_mut().insert(AUTHORIZATION, self.token.clone());
        Ok(request)
    }
}

#[derive(Clone)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn session_token(mut self, session_token: impl Into<String>) -> Self {
        self.session_token = Some(session_token.into());
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// HMAC-SHA256 request signing with static credentials.
#[derive(Clone, Debug)]
pub struct SigV4Signer {
    credentials: Credentials,
    region: String,
    service: String,
    content_sha256_header: bool,
}

impl SigV4Signer {
    pub fn new(
        credentials: Credentials,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: service.into(),
            content_sha256_header: true,
        }
    }

    /// Whether to send the payload hash as `x-amz-content-sha256`.
    pub fn content_sha256_header(mut self, enabled: bool) -> Self {
        self.content_sha256_header = enabled;
        self
    }

    fn signing_key(&self, date: &str) -> Outcome<Vec<u8>> {
        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let key = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
        let key = hmac_sha256(&key, self.region.as_bytes())?;
        let key = hmac_sha256(&key, self.service.as_bytes())?;
        hmac_sha256(&key, b"aws4_request")
    }
}

impl RequestSigner for SigV4Signer {
    fn name(&self) -> &str {
        SIGV4_SIGNER
    }

    fn sign(&self, mut request: WireRequest, signing_time: SystemTime) -> Outcome<WireRequest> {
        let timestamp = DateTime::<Utc>::from(signing_time);
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date = timestamp.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(
            request.body().map(|body| body.as_ref()).unwrap_or_default(),
        ));

        let host = request
            .uri()
            .authority()
            .map(|authority| authority.as_str().to_owned())
            .ok_or_else(|| SdkError::configuration("cannot sign a request without a host"))?;
        let headers = request.headers_mut();
        headers.remove(AUTHORIZATION);
        headers.insert(HOST, signer_header_value(&host)?);
        headers.insert(
            HeaderName::from_static(AMZ_DATE_HEADER),
            signer_header_value(&amz_date)?,
        );
        if self.content_sha256_header {
            headers.insert(
                HeaderName::from_static(AMZ_CONTENT_SHA256_HEADER),
                signer_header_value(&payload_hash)?,
            );
        }
        if let Some(token) = &self.credentials.session_token {
            let mut token = signer_header_value(token)?;
            token.set_sensitive(true);
            headers.insert(HeaderName::from_static(AMZ_SECURITY_TOKEN_HEADER), token);
        }

        let (canonical_headers, signed_headers) = canonical_headers(&request);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method().as_str(),
            canonical_path(request.uri().path()),
            canonical_query(request.uri().query().unwrap_or_default()),
            canonical_headers,
            signed_headers,
            payload_hash,
        );
        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "{SIGV4_ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date)?,
            string_to_sign.as_bytes(),
        )?);

        let authorization = format!(
            "{SIGV4_ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credentials.access_key_id
        );
        let mut authorization = signer_header_value(&authorization)?;
        authorization.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, authorization);
        Ok(request)
    }
}

fn hmac_sha256(key: &[u8], payload: &[u8]) -> Outcome<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| SdkError::configuration(format!("invalid signing key: {err}")))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signer_header_value(value: &str) -> Outcome<HeaderValue> {
    HeaderValue::from_str(value).map_err(|source| {
        SdkError::configuration("signing produced an invalid header value").with_source(source)
    })
}

fn canonical_path(path: &str) -> &str {
    if path.is_empty() { "/" } else { path }
}

fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(name, value)| (uri_encode(&name), uri_encode(&value)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_headers(request: &WireRequest) -> (String, String) {
    let mut collected: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in request.headers() {
        if name == AUTHORIZATION || name == USER_AGENT || name == EXPECT {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes());
        let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
        collected.entry(name.as_str()).or_default().push(normalized);
    }

    let mut canonical = String::new();
    for (name, values) in &collected {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(&values.join(","));
        canonical.push('\n');
    }
    let signed = collected.keys().copied().collect::<Vec<_>>().join(";");
    (canonical, signed)
}

fn uri_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// Signers addressable by name, plus the one used when a request names none.
#[derive(Clone)]
pub struct SignerRegistry {
    default_signer: Arc<dyn RequestSigner>,
    named: HashMap<String, Arc<dyn RequestSigner>>,
}

impl SignerRegistry {
    pub fn new(default_signer: Arc<dyn RequestSigner>) -> Self {
        let mut named: HashMap<String, Arc<dyn RequestSigner>> = HashMap::new();
        named.insert(NULL_SIGNER.to_owned(), Arc::new(NullSigner));
        named.insert(default_signer.name().to_owned(), default_signer.clone());
        Self {
            default_signer,
            named,
        }
    }

    pub fn register(&mut self, signer: Arc<dyn RequestSigner>) {
        self.named.insert(signer.name().to_owned(), signer);
    }

    pub fn default_signer(&self) -> &Arc<dyn RequestSigner> {
        &self.default_signer
    }

    pub fn resolve(&self, name: Option<&str>) -> Outcome<Arc<dyn RequestSigner>> {
        let Some(name) = name else {
            return Ok(self.default_signer.clone());
        };
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| SdkError::configuration(format!("no signer registered as {name:?}")))
    }
}

impl Default for SignerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NullSigner))
    }
}

impl std::fmt::Debug for SignerRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.named.keys().map(String::as_str).collect();
        names.sort_unstable();
        formatter
            .debug_struct("SignerRegistry")
            .field("default_signer", &self.default_signer.name())
            .field("named", &names)
            .finish()
    }
}
