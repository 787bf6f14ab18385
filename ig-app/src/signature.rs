//! `x-hub-signature-256` payload signatures.
//!
//! Meta signs every webhook delivery with HMAC-SHA256 over the raw body,
//! keyed by the app secret, and sends it as `sha256=<hex>`.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

#[cfg(test)]
pub(crate) fn sign_payload(app_secret: &str, body: &[u8]) -> String {
    let mut mac = new_mac(app_secret);
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(headers: &HeaderMap, body: &[u8], app_secret: &str) -> bool {
    let Some(signature_header) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
    else {
        return false;
    };
    let Some(hex_digest) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = new_mac(app_secret);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn new_mac(app_secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length, so this never takes the error branch.
    match HmacSha256::new_from_slice(app_secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any size"),
    }
}

/// Compare two secrets without short-circuiting on the first mismatch.
pub fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let mut diff = left_bytes.len() ^ right_bytes.len();
    let max_len = left_bytes.len().max(right_bytes.len());
    for index in 0..max_len {
        let l = left_bytes.get(index).copied().unwrap_or(0);
        let r = right_bytes.get(index).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }
    diff == 0
}
