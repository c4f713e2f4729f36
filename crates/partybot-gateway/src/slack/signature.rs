//! Slack request signing (`X-Slack-Signature`).

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Requests older than this are treated as replays.
const MAX_CLOCK_SKEW_SECS: i64 = 60 * 5;
const VERSION: &str = "v0";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed {0} header")]
    Malformed(&'static str),
    #[error("request timestamp outside the allowed window")]
    Stale,
    #[error("signature mismatch")]
    Mismatch,
}

fn mac_for(secret: &str, timestamp: &str, body: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac
}

/// Compute the `v0=<hex>` signature Slack would send for `body`.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mac = mac_for(secret, &timestamp.to_string(), body);
    format!("{VERSION}={}", hex::encode(mac.finalize().into_bytes()))
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or(SignatureError::MissingHeader(name))?
        .to_str()
        .map_err(|_| SignatureError::Malformed(name))
}

/// Check a request against the signing secret at time `now` (unix seconds).
pub fn verify(secret: &str, headers: &HeaderMap, body: &[u8], now: i64) -> Result<(), SignatureError> {
    let timestamp = header(headers, TIMESTAMP_HEADER)?;
    let signature = header(headers, SIGNATURE_HEADER)?;

    let sent_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::Malformed(TIMESTAMP_HEADER))?;
    if now.abs_diff(sent_at) > MAX_CLOCK_SKEW_SECS.unsigned_abs() {
        return Err(SignatureError::Stale);
    }

    let digest = signature
        .strip_prefix("v0=")
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(SignatureError::Malformed(SIGNATURE_HEADER))?;

    mac_for(secret, timestamp.trim(), body)
        .verify_slice(&digest)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
    const NOW: i64 = 1_531_420_618;

    fn signed_headers(secret: &str, timestamp: i64, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            TIMESTAMP_HEADER,
            HeaderValue::from_str(&timestamp.to_string()).unwrap(),
        );
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign(secret, timestamp, body)).unwrap(),
        );
        headers
    }

    #[test]
    fn matches_slack_documentation_example() {
        let body = b"token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J&team_domain=testteamnow&channel_id=G8PSS9T3V&channel_name=foobar&user_id=U2CERLKJA&user_name=roadrunner&command=%2Fwebhook-collect&text=&response_url=https%3A%2F%2Fhooks.slack.com%2Fcommands%2FT1DC2JH3J%2F397700885554%2F96rGlfmibIGlgcZRskXaIFfN&trigger_id=398738663015.47445629121.803a0bc887a14d10d2c447fce8b6703c";

        assert_eq!(
            sign(SECRET, NOW, body),
            "v0=a2114d57b48eac39b9ad189dd8316235a7b4a8d21a10bd27519666489c69b503"
        );
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"type":"url_verification"}"#;
        let headers = signed_headers(SECRET, NOW, body);

        assert_eq!(verify(SECRET, &headers, body, NOW + 10), Ok(()));
    }

    #[test]
    fn rejects_tampered_body() {
        let headers = signed_headers(SECRET, NOW, b"original");

        assert_eq!(
            verify(SECRET, &headers, b"tampered", NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_wrong_secret() {
        let headers = signed_headers("other-secret", NOW, b"body");

        assert_eq!(
            verify(SECRET, &headers, b"body", NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let headers = signed_headers(SECRET, NOW, b"body");

        assert_eq!(
            verify(SECRET, &headers, b"body", NOW + 301),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn extreme_timestamps_are_stale() {
        for extreme in [i64::MIN, i64::MAX] {
            let mut headers = HeaderMap::new();
            headers.insert(
                TIMESTAMP_HEADER,
                HeaderValue::from_str(&extreme.to_string()).unwrap(),
            );
            headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("v0=00"));

            assert_eq!(
                verify(SECRET, &headers, b"x", 1_700_000_000),
                Err(SignatureError::Stale)
            );
        }
    }

    #[test]
    fn rejects_missing_and_malformed_headers() {
        assert_eq!(
            verify(SECRET, &HeaderMap::new(), b"body", NOW),
            Err(SignatureError::MissingHeader(TIMESTAMP_HEADER))
        );

        let mut headers = signed_headers(SECRET, NOW, b"body");
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("v1=abc"));
        assert_eq!(
            verify(SECRET, &headers, b"body", NOW),
            Err(SignatureError::Malformed(SIGNATURE_HEADER))
        );
    }
}
