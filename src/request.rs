use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::Outcome;
use crate::digest::ContentDigestAlgorithm;
use crate::error::SdkError;
use crate::util::{parse_header_name, parse_header_value};

/// Service-agnostic description of one operation call.
///
/// The core only ever borrows it, so the same value can be executed again
/// or shared between tasks.
#[derive(Clone, Debug)]
pub struct ServiceRequest {
    operation: String,
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    host_prefix: Option<String>,
    host_prefix_fields: BTreeMap<String, String>,
    compute_content_hash: bool,
    digest_algorithm: ContentDigestAlgorithm,
    signer_name: Option<String>,
    timeout: Option<Duration>,
}

impl ServiceRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            operation: String::new(),
            method,
            path: path.into(),
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            host_prefix: None,
            host_prefix_fields: BTreeMap::new(),
            compute_content_hash: false,
            digest_algorithm: ContentDigestAlgorithm::default(),
            signer_name: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Name used in logs, metrics and endpoint resolution.
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn append_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Outcome<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> Outcome<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| {
            SdkError::configuration("failed to serialize request json").with_source(source)
        })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    /// Template such as `"{AccountId}."`, expanded from
    /// [`host_prefix_field`](Self::host_prefix_field) values and prepended to
    /// the endpoint host.
    pub fn host_prefix(mut self, template: impl Into<String>) -> Self {
        self.host_prefix = Some(template.into());
        self
    }

    pub fn host_prefix_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.host_prefix_fields.insert(name.into(), value.into());
        self
    }

    pub fn compute_content_hash(mut self, algorithm: ContentDigestAlgorithm) -> Self {
        self.compute_content_hash = true;
        self.digest_algorithm = algorithm;
        self
    }

    pub fn signer(mut self, signer_name: impl Into<String>) -> Self {
        self.signer_name = Some(signer_name.into());
        self
    }

    /// Per-attempt timeout for this request only.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn host_prefix_template(&self) -> Option<&str> {
        self.host_prefix.as_deref()
    }

    pub fn host_prefix_value(&self, name: &str) -> Option<&str> {
        self.host_prefix_fields.get(name).map(String::as_str)
    }

    pub fn content_digest(&self) -> Option<ContentDigestAlgorithm> {
        self.compute_content_hash.then_some(self.digest_algorithm)
    }

    pub fn signer_name(&self) -> Option<&str> {
        self.signer_name.as_deref()
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use http::header::CONTENT_TYPE;

    use super::ServiceRequest;
    use crate::digest::ContentDigestAlgorithm;
    use crate::error::ErrorKind;

    #[test]
    fn builder_collects_fields() {
        let request = ServiceRequest::put("/items/1")
            .operation("PutItem")
            .query_pair("versionId", "3")
            .host_prefix("{AccountId}.")
            .host_prefix_field("AccountId", "123456789012")
            .compute_content_hash(ContentDigestAlgorithm::Sha256)
            .signer("bearer")
            .body("payload");

        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.operation_name(), "PutItem");
        assert_eq!(request.query(), &[("versionId".to_owned(), "3".to_owned())]);
        assert_eq!(request.host_prefix_value("AccountId"), Some("123456789012"));
        assert_eq!(request.content_digest(), Some(ContentDigestAlgorithm::Sha256));
        assert_eq!(request.signer_name(), Some("bearer"));
        assert_eq!(request.body_bytes().map(|body| body.as_ref()), Some(&b"payload"[..]));
    }

    #[test]
    fn try_header_rejects_invalid_names() {
        let error = ServiceRequest::get("/").try_header("bad header", "x").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn json_body_sets_content_type() {
        let request = ServiceRequest::post("/items")
            .json(&serde_json::json!({"name": "widget"}))
            .unwrap();
        assert_eq!(request.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(request.content_digest(), None);
    }
}
