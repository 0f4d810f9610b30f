//! Provider webhook signature validation.
//!
//! Twilio signs callbacks with HMAC-SHA1 over the full callback URL
//! followed by the form parameters sorted by key (key immediately
//! followed by value), base64-encoded into the `X-Twilio-Signature`
//! header.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Compute the expected signature for a callback.
pub fn compute_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }

    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Check a provider-supplied signature against the canonical payload.
pub fn verify_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    provided: &str,
) -> bool {
    let expected = compute_signature(auth_token, url, params);

    // Constant-time comparison over the decoded MACs
    let (Ok(expected), Ok(provided)) = (BASE64.decode(expected), BASE64.decode(provided)) else {
        return false;
    };
    if expected.len() != provided.len() {
        return false;
    }
    expected
        .iter()
        .zip(provided.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn signature_round_trip() {
        let url = "https://dialer.example.com/webhooks/twilio/status";
        let body = params(&[("CallSid", "CA1"), ("CallStatus", "completed")]);

        let signature = compute_signature("token", url, &body);
        assert!(verify_signature("token", url, &body, &signature));
    }

    #[test]
    fn parameter_order_does_not_matter() {
        let url = "https://dialer.example.com/webhooks/twilio/amd";
        let a = params(&[("CallSid", "CA1"), ("AnsweredBy", "human")]);
        let b = params(&[("AnsweredBy", "human"), ("CallSid", "CA1")]);

        assert_eq!(
            compute_signature("token", url, &a),
            compute_signature("token", url, &b)
        );
    }

    #[test]
    fn url_is_part_of_the_payload() {
        let body = params(&[("CallSid", "CA1")]);
        let a = compute_signature("token", "https://a.example.com/webhooks/twilio/status", &body);
        let b = compute_signature("token", "https://b.example.com/webhooks/twilio/status", &body);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_tampering() {
        let url = "https://dialer.example.com/webhooks/twilio/status";
        let body = params(&[("CallSid", "CA1"), ("CallStatus", "completed")]);
        let signature = compute_signature("token", url, &body);

        let tampered = params(&[("CallSid", "CA2"), ("CallStatus", "completed")]);
        assert!(!verify_signature("token", url, &tampered, &signature));
        assert!(!verify_signature("other-token", url, &body, &signature));
        assert!(!verify_signature("token", url, &body, "not-base64!!"));
    }
}
