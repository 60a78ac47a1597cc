//! HMAC-SHA256 payload signing and subscriber-side verification.
//!
//! The signature covers the exact body bytes and is sent as
//! `X-Webhook-Signature: sha256=<hex>`.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
/// Header carrying the event type.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the delivery identifier.
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
/// Header carrying the send time as unix seconds.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";
/// Prefix of generated endpoint secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Generates a fresh endpoint secret: `whsec_` followed by 32 random bytes
/// in hex.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}{}", hex::encode(bytes))
}

fn mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeliveryError::configuration("invalid signing secret"))
}

/// Signs `body` with `secret`, returning the full header value.
///
/// # Errors
///
/// Returns `Configuration` if `secret` cannot key the MAC.
pub fn sign(body: &[u8], secret: &str) -> Result<String> {
    let mut mac = mac(secret)?;
    mac.update(body);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Verifies a signature header value against `body`.
///
/// The value must carry the `sha256=` prefix followed by hex. Comparison is
/// constant-time.
pub fn verify_signature(body: &[u8], header_value: &str, secret: &str) -> bool {
    let Some(hex_signature) = header_value.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = mac(secret) else {
        return false;
    };

    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_has_prefix_and_hex_digest() {
        let signature = sign(b"{}", "whsec_test").unwrap();
        let digest = signature.strip_prefix("sha256=").unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        let signature = sign(b"what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verify_accepts_own_signature() {
        let body = br#"{"event_id":"1"}"#;
        assert!(verify_signature(body, &sign(body, "s3cret").unwrap(), "s3cret"));
    }

    #[test]
    fn verify_rejects_wrong_secret_prefix_or_encoding() {
        let body = b"payload";
        let signature = sign(body, "right").unwrap();

        assert!(!verify_signature(body, &signature, "wrong"));
        assert!(!verify_signature(body, signature.trim_start_matches("sha256="), "right"));
        assert!(!verify_signature(body, "sha256=zz", "right"));
        assert!(!verify_signature(body, "", "right"));
    }

    #[test]
    fn any_secret_length_keys_the_mac() {
        let body = b"payload";
        for secret in [String::new(), "k".to_string(), "x".repeat(1024)] {
            let signature = sign(body, &secret).unwrap();
            assert!(verify_signature(body, &signature, &secret));
        }
    }

    #[test]
    fn secrets_are_prefixed_and_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with("whsec_"));
        assert_eq!(a.len(), "whsec_".len() + 64);
        assert_ne!(a, b);
    }
}
