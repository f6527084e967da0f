//! Shared access signatures for read-only blob URLs.
//!
//! The signature is an HMAC-SHA256 over the canonical description of the
//! grant, keyed with the account key. Keys are base64 encoded the way storage
//! services hand them out; a key that is not valid base64 is used as raw bytes.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, StorageError};

pub const SAS_VERSION: &str = "2019-12-12";

type HmacSha256 = Hmac<Sha256>;

/// A read-only grant on a single blob.
#[derive(Debug, Clone)]
pub struct BlobReadGrant<'a> {
    pub account: &'a str,
    pub container: &'a str,
    pub blob: &'a str,
    pub expiry: DateTime<Utc>,
}

impl BlobReadGrant<'_> {
    fn string_to_sign(&self, expiry: &str) -> String {
        format!(
            "r\n\n{expiry}\n/blob/{}/{}/{}\n\n\n\n{SAS_VERSION}\nb\n\n\n\n\n",
            self.account, self.container, self.blob
        )
    }

    /// Query string (without the leading `?`) authorizing the grant.
    pub fn sign(&self, key: &str) -> Result<String> {
        let expiry = self.expiry.to_rfc3339_opts(SecondsFormat::Secs, true);
        let key_bytes = STANDARD
            .decode(key)
            .unwrap_or_else(|_| key.as_bytes().to_vec());

        let mut mac = HmacSha256::new_from_slice(&key_bytes).map_err(|_| {
            StorageError::Client {
                message: "invalid signing key".to_string(),
            }
        })?;
        mac.update(self.string_to_sign(&expiry).as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "sv={SAS_VERSION}&sr=b&sp=r&se={}&sig={}",
            percent_encode(&expiry),
            percent_encode(&signature)
        ))
    }
}

/// Percent-encode everything outside the URL unreserved set.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
