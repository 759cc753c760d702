//! Shared-secret request signing and response verification.
//!
//! The client MACs the request's path-and-query and sends the digest in a
//! request header; the daemon answers with a MAC over that digest string.
//! The reply must verify before any body byte is trusted.

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Request header carrying the client's MAC over the URL.
pub const URL_HASH_HEADER: &str = "x-shuffle-url-hash";
/// Response header carrying the daemon's MAC over the request hash.
pub const REPLY_HASH_HEADER: &str = "x-shuffle-reply-hash";

/// Shared shuffle secret. Key material never appears in Debug output.
#[derive(Clone)]
pub struct ShuffleSecret(Vec<u8>);

impl ShuffleSecret {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    fn mac(&self, msg: &[u8]) -> String {
        // HMAC accepts keys of any length; new_from_slice cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("hmac key");
        mac.update(msg);
        BASE64_URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// MAC sent with the request, computed over the path-and-query string.
    pub fn hash_url(&self, path_and_query: &str) -> String {
        self.mac(path_and_query.as_bytes())
    }

    /// MAC the daemon must answer with: a digest of the request hash string.
    pub fn reply_hash(&self, url_hash: &str) -> String {
        self.mac(url_hash.as_bytes())
    }

    /// Verify the daemon's reply header against the hash we sent.
    pub fn verify_reply(&self, url_hash: &str, reply: &str) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("hmac key");
        mac.update(url_hash.as_bytes());
        match BASE64_URL_SAFE_NO_PAD.decode(reply) {
            Ok(raw) => mac.verify_slice(&raw).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for ShuffleSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShuffleSecret(..)")
    }
}
