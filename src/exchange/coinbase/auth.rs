//! Coinbase Advanced Trade API key authentication
//!
//! Each private request carries `CB-ACCESS-KEY`, `CB-ACCESS-TIMESTAMP` and
//! `CB-ACCESS-SIGN`, the hex HMAC-SHA256 of
//! `timestamp + method + request_path + body` keyed with the API secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Build the string Coinbase expects to be signed.
///
/// `request_path` is the path only; any query string is stripped.
pub fn prehash(timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    let path = request_path.split('?').next().unwrap_or(request_path);
    format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body)
}

/// Hex HMAC-SHA256 of `message` under `secret`
pub fn sign_request(message: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// API credentials container
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Signature header value for one request
    pub fn sign(&self, timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
        sign_request(&prehash(timestamp, method, request_path, body), &self.api_secret)
    }
}
