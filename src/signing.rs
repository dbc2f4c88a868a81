use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-ID";

const SIGNATURE_PREFIX: &str = "sha256=";

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(secret).expect("hmac key")
}

/// Compute the hex HMAC-SHA256 of `payload` under `secret`.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = keyed_mac(secret);
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Value of the `X-Webhook-Signature` header: `sha256=<hex>`.
pub fn format_signature_header(signature_hex: &str) -> String {
    format!("{SIGNATURE_PREFIX}{signature_hex}")
}

/// Extract the hex digest from a `sha256=<hex>` header value.
pub fn parse_signature_header(value: &str) -> Option<&str> {
    value
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .filter(|hex| !hex.is_empty())
}

/// Webhook headers pulled out of a received request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedHeaders {
    pub signature: Option<String>,
    pub event: Option<String>,
    pub delivery_id: Option<String>,
}

/// Collect the webhook headers from a list of headers, ignoring case.
pub fn parse_webhook_headers<'a, I>(headers: I) -> ParsedHeaders
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedHeaders::default();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(EVENT_HEADER) {
            parsed.event = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(DELIVERY_ID_HEADER) {
            parsed.delivery_id = Some(value.to_string());
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("signature header is not of the form sha256=<hex>")]
    MalformedSignature,
    #[error("signature does not match payload")]
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Returns the parsed headers so receivers can deduplicate on
/// `delivery_id`.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
) -> Result<ParsedHeaders, VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_webhook_headers(headers);
    let header = parsed
        .signature
        .as_deref()
        .ok_or(VerificationError::MissingSignature)?;
    let signature = parse_signature_header(header).ok_or(VerificationError::MalformedSignature)?;

    if verify_signature(secret, payload, signature) {
        Ok(parsed)
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // RFC 4231 test case 2.
        let signature = compute_signature(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verify_round_trips_for_arbitrary_bytes() {
        let secret = b"whsec_test";
        let payloads: [&[u8]; 4] = [b"", b"{}", &[0, 159, 146, 150, 255], &[7u8; 4096]];

        for payload in payloads {
            let signature = compute_signature(secret, payload);
            assert!(verify_signature(secret, payload, &signature));
            assert!(!verify_signature(b"other", payload, &signature));
        }
    }

    #[test]
    fn verify_rejects_tampered_payload_and_bad_hex() {
        let signature = compute_signature(b"k", b"payload");
        assert!(!verify_signature(b"k", b"payload!", &signature));
        assert!(!verify_signature(b"k", b"payload", "not-hex"));
        assert!(!verify_signature(b"k", b"payload", &signature[..10]));
    }

    #[test]
    fn header_format_and_parse() {
        let header = format_signature_header("abcd");
        assert_eq!(header, "sha256=abcd");
        assert_eq!(parse_signature_header(&header), Some("abcd"));
        assert_eq!(parse_signature_header("sha1=abcd"), None);
        assert_eq!(parse_signature_header("sha256="), None);
    }

    #[test]
    fn verify_webhook_request_checks_headers_case_insensitively() {
        let payload = br#"{"event":"license.sold"}"#;
        let header = format_signature_header(&compute_signature(b"secret", payload));
        let headers = vec![
            ("x-webhook-signature", header.as_str()),
            ("X-WEBHOOK-ID", "42"),
            ("x-webhook-event", "license.sold"),
        ];

        let parsed = verify_webhook_request(headers.iter().copied(), payload, b"secret").unwrap();
        assert_eq!(parsed.delivery_id.as_deref(), Some("42"));
        assert_eq!(parsed.event.as_deref(), Some("license.sold"));

        assert_eq!(
            verify_webhook_request(headers.iter().copied(), payload, b"wrong"),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn verify_webhook_request_reports_missing_and_malformed() {
        assert_eq!(
            verify_webhook_request(Vec::new(), b"{}", b"s"),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_webhook_request(vec![(SIGNATURE_HEADER, "deadbeef")], b"{}", b"s"),
            Err(VerificationError::MalformedSignature)
        );
    }
}
