//! # Capability URL signing
//!
//! Capability URLs are bound to one `(method, bucket, key)` triple and an
//! absolute expiry. The URL carries an HMAC-SHA256 tag over those fields,
//! never the signing secret itself.

use axum::http::Method;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::errors::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// Longest lifetime a capability URL may be issued for (seven days).
pub const MAX_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Path prefix under which capability URLs are served.
pub const CAPABILITY_PATH_PREFIX: &str = "/storage";

#[derive(Debug, Clone)]
pub struct SignedUrlRequest {
    pub bucket: String,
    pub key: String,
    pub method: Method,
    pub ttl_seconds: u64,
}

/// Query parameters carried by a capability URL.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityQuery {
    pub expires: i64,
    pub signature: String,
}

#[derive(Clone)]
pub struct SignedUrlIssuer {
    secret: Vec<u8>,
    base_url: String,
}

impl std::fmt::Debug for SignedUrlIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedUrlIssuer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SignedUrlIssuer {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue a URL valid for `ttl_seconds` from now.
    pub fn sign(&self, request: &SignedUrlRequest) -> StorageResult<String> {
        self.sign_at(request, Utc::now())
    }

    fn sign_at(&self, request: &SignedUrlRequest, now: DateTime<Utc>) -> StorageResult<String> {
        ensure_supported(&request.method)?;
        if request.ttl_seconds == 0 || request.ttl_seconds > MAX_TTL_SECS {
            return Err(StorageError::InvalidInput(format!(
                "ttl must be between 1 and {} seconds, got {}",
                MAX_TTL_SECS, request.ttl_seconds
            )));
        }

        let expires = (now + Duration::seconds(request.ttl_seconds as i64)).timestamp();
        let signature = self.signature(&request.method, &request.bucket, &request.key, expires)?;

        Ok(format!(
            "{}{}/{}/{}?expires={}&signature={}",
            self.base_url,
            CAPABILITY_PATH_PREFIX,
            encode_path(&request.bucket),
            encode_path(&request.key),
            expires,
            signature
        ))
    }

    /// Check a presented capability against the request it arrived on.
    pub fn verify(
        &self,
        method: &Method,
        bucket: &str,
        key: &str,
        query: &CapabilityQuery,
    ) -> StorageResult<()> {
        self.verify_at(method, bucket, key, query, Utc::now())
    }

    fn verify_at(
        &self,
        method: &Method,
        bucket: &str,
        key: &str,
        query: &CapabilityQuery,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        ensure_supported(method)?;
        if now.timestamp() > query.expires {
            return Err(StorageError::Expired);
        }

        let presented = URL_SAFE_NO_PAD
            .decode(&query.signature)
            .map_err(|_| StorageError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(canonical(method, bucket, key, query.expires).as_bytes());
        mac.verify_slice(&presented)
            .map_err(|_| StorageError::InvalidSignature)
    }

    fn signature(
        &self,
        method: &Method,
        bucket: &str,
        key: &str,
        expires: i64,
    ) -> StorageResult<String> {
        let mut mac = self.mac()?;
        mac.update(canonical(method, bucket, key, expires).as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn mac(&self) -> StorageResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| StorageError::Configuration(format!("signing key: {}", err)))
    }
}

fn ensure_supported(method: &Method) -> StorageResult<()> {
    match *method {
        Method::GET | Method::PUT | Method::DELETE | Method::HEAD => Ok(()),
        _ => Err(StorageError::UnsupportedMethod(method.to_string())),
    }
}

fn canonical(method: &Method, bucket: &str, key: &str, expires: i64) -> String {
    format!("{}\n{}\n{}\n{}", method.as_str(), bucket, key, expires)
}

/// Percent-encode everything outside RFC 3986 unreserved characters,
/// keeping `/` so keys stay readable.
fn encode_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Inverse of [`encode_path`]. Returns `None` on malformed escapes or
/// non-UTF-8 results.
pub(crate) fn decode_path(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = raw.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
