use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{HeaderName, HeaderValue};
use sha2::{Digest, Sha256};

pub const CONTENT_MD5_HEADER: &str = "content-md5";
pub const CONTENT_SHA256_HEADER: &str = "x-content-sha256";

/// Body digest attached when a request asks for a content hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ContentDigestAlgorithm {
    /// Base64 MD5 in `content-md5`.
    #[default]
    Md5,
    /// Lowercase hex SHA-256 in `x-content-sha256`.
    Sha256,
}

impl ContentDigestAlgorithm {
    pub const fn header_name(self) -> HeaderName {
        match self {
            Self::Md5 => HeaderName::from_static(CONTENT_MD5_HEADER),
            Self::Sha256 => HeaderName::from_static(CONTENT_SHA256_HEADER),
        }
    }

    pub fn digest(self, body: &[u8]) -> String {
        match self {
            Self::Md5 => STANDARD.encode(md5::compute(body).0),
            Self::Sha256 => hex::encode(Sha256::digest(body)),
        }
    }

    pub(crate) fn header_value(self, body: &[u8]) -> HeaderValue {
        // base64 and hex output are always visible ASCII.
        HeaderValue::from_str(&self.digest(body))
            .unwrap_or_else(|_| HeaderValue::from_static(""))
    }
}
