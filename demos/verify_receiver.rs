use webhook_delivery::{
    compute_signature, format_signature_header, verify_webhook_request, VerificationError,
    DELIVERY_ID_HEADER, EVENT_HEADER, SIGNATURE_HEADER,
};

/// What a receiver does with an incoming webhook: check the signature over
/// the raw body before parsing it, then dedupe on the delivery id.
fn main() {
    let secret = b"whsec_supersecret";
    let payload =
        br#"{"event":"license.sold","timestamp":"2026-03-01T12:30:00Z","data":{"license_id":42}}"#;

    let signature = format_signature_header(&compute_signature(secret, payload));
    let headers = vec![
        ("content-type", "application/json".to_string()),
        (SIGNATURE_HEADER, signature),
        (EVENT_HEADER, "license.sold".to_string()),
        (DELIVERY_ID_HEADER, "1042".to_string()),
    ];

    match verify_webhook_request(
        headers.iter().map(|(k, v)| (*k, v.as_str())),
        payload,
        secret,
    ) {
        Ok(parsed) => println!(
            "verified {} (delivery {})",
            parsed.event.unwrap_or_default(),
            parsed.delivery_id.unwrap_or_default()
        ),
        Err(err) => println!("rejected: {err}"),
    }

    // A tampered body must be rejected.
    let tampered = br#"{"event":"license.sold","data":{"license_id":43}}"#;
    let result = verify_webhook_request(
        headers.iter().map(|(k, v)| (*k, v.as_str())),
        tampered,
        secret,
    );
    assert_eq!(result, Err(VerificationError::InvalidSignature));
    println!("tampered payload rejected");
}
