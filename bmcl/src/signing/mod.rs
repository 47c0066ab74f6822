//! Download URL signing.
//!
//! Clients are sent to the node with a signed URL. The signature covers
//! the hash (or the request path for measurements) and the expiry time:
//!
//! ```text
//! s = base64url(HMAC-SHA1(secret, {hash}{e}))
//! e = base36(expiry in milliseconds since the Unix epoch)
//! ```
//!
//! A request is valid if `s` matches and the current time is strictly
//! before the decoded `e`.

#[cfg(test)]
mod tests;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use displaydoc::Display;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::BmclResult;

type HmacSha1 = Hmac<Sha1>;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A signing error.
#[derive(Debug, Display, PartialEq, Eq)]
pub enum Error {
    /// The expiry "{0}" is not a valid base36 timestamp.
    InvalidExpiry(String),

    /// The signature has expired.
    Expired,

    /// The signature is not valid base64.
    MalformedSignature,

    /// The signature does not match.
    SignatureMismatch,
}

/// The query parameters of a signed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// The signature.
    pub s: String,

    /// The expiry timestamp in base36.
    pub e: String,
}

impl Signature {
    /// Returns the query string for this signature.
    pub fn to_query(&self) -> String {
        format!("s={}&e={}", self.s, self.e)
    }
}

/// Signs a hash or path, valid until `expires_at_ms`.
pub fn sign(secret: &str, subject: &str, expires_at_ms: u64) -> Signature {
    let e = to_base36(expires_at_ms);
    let mac = compute(secret, subject, &e);

    Signature {
        s: URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()),
        e,
    }
}

/// Verifies a signature at the time `now_ms`.
pub fn verify(secret: &str, subject: &str, s: &str, e: &str, now_ms: u64) -> BmclResult<()> {
    let expires_at = from_base36(e).ok_or_else(|| Error::InvalidExpiry(e.to_owned()))?;

    let tag = URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|_| Error::MalformedSignature)?;

    compute(secret, subject, e)
        .verify_slice(&tag)
        .map_err(|_| Error::SignatureMismatch)?;

    if now_ms >= expires_at {
        return Err(Error::Expired.into());
    }

    Ok(())
}

fn compute(secret: &str, subject: &str, e: &str) -> HmacSha1 {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(subject.as_bytes());
    mac.update(e.as_bytes());
    mac
}

/// Encodes an integer in lowercase base36.
pub fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36_DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    digits.iter().rev().map(|&d| d as char).collect()
}

/// Decodes a base36 integer.
///
/// Both cases are accepted. Returns `None` on invalid digits or overflow.
pub fn from_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }

    s.chars().try_fold(0u64, |acc, c| {
        let digit = c.to_digit(36)? as u64;
        acc.checked_mul(36)?.checked_add(digit)
    })
}
