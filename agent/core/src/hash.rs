//! Stable spec digests.
//!
//! Both the platform watchers and the admission webhook hash resource specs
//! to detect no-op reconciles: when the status hash matches the freshly
//! computed one, the resource is already synced and neither side touches it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Computes the URL-safe base64 digest of a spec.
///
/// The spec is round-tripped through `serde_json::Value` so object keys
/// serialize in sorted order; manifest field order cannot change the hash.
pub fn spec_hash<T: Serialize>(spec: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(spec)?;
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);
    Ok(URL_SAFE_NO_PAD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;

    #[derive(Serialize)]
    struct Spec {
        service: String,
        port: u16,
    }

    #[test]
    fn deterministic() {
        let a = spec_hash(&Spec {
            service: "whoami".to_string(),
            port: 80,
        })
        .unwrap();
        let b = spec_hash(&Spec {
            service: "whoami".to_string(),
            port: 80,
        })
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn field_order_does_not_matter() {
        let a = spec_hash(&json!({"port": 80, "service": "whoami"})).unwrap();
        let b = spec_hash(&json!({"service": "whoami", "port": 80})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sensitive_to_values() {
        let a = spec_hash(&json!({"port": 80})).unwrap();
        let b = spec_hash(&json!({"port": 81})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn url_safe_alphabet() {
        let h = spec_hash(&json!({"key": "value"})).unwrap();
        assert!(h
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
