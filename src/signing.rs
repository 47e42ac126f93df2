//! HMAC-SHA256 signing of payloads and verification of inbound
//! signatures.
//!
//! Signatures travel as `sha256=<lowercase hex>`. Verification recomputes
//! the expected MAC and compares in constant time; any malformed input
//! yields `false` rather than an error.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Computes the signature header value for a payload.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(payload);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a received `sha256=<hex>` signature against a payload.
///
/// A missing prefix, malformed hex or wrong digest length all return
/// `false`. The digest comparison is constant-time.
pub fn verify(payload: &[u8], received: &str, secret: &str) -> bool {
    let Some(hex_digest) = received.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(received_digest) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&received_digest).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = br#"{"k":"v"}"#;
    const SECRET: &str = "s3cr3t";

    #[test]
    fn signature_has_prefixed_hex_form() {
        let signature = sign(PAYLOAD, SECRET);
        let digest = signature.strip_prefix("sha256=").unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, digest.to_lowercase());
    }

    #[test]
    fn signing_is_deterministic_per_secret() {
        assert_eq!(sign(PAYLOAD, SECRET), sign(PAYLOAD, SECRET));
        assert_ne!(sign(PAYLOAD, SECRET), sign(PAYLOAD, "other"));
    }

    #[test]
    fn verify_accepts_own_signature() {
        let signature = sign(PAYLOAD, SECRET);
        assert!(verify(PAYLOAD, &signature, SECRET));
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let signature = sign(PAYLOAD, SECRET);
        assert!(!verify(br#"{"k":"w"}"#, &signature, SECRET));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let signature = sign(PAYLOAD, SECRET);
        assert!(!verify(PAYLOAD, &signature, "other"));
    }

    #[test]
    fn verify_rejects_malformed_signatures() {
        let digest = sign(PAYLOAD, SECRET);
        let bare = digest.strip_prefix("sha256=").unwrap();

        assert!(!verify(PAYLOAD, bare, SECRET));
        assert!(!verify(PAYLOAD, &format!("sha1={bare}"), SECRET));
        assert!(!verify(PAYLOAD, "sha256=zzzz", SECRET));
        assert!(!verify(PAYLOAD, &format!("sha256={}", &bare[..32]), SECRET));
        assert!(!verify(PAYLOAD, "", SECRET));
    }
}
