//! Request fingerprinting.
//!
//! A fingerprint is the cache identity of a logical request: SHA-256 over
//! the operation name and the canonicalized parameter set. Canonicalization
//! sorts object keys recursively, so two requests whose parameters differ
//! only in ordering collide to the same entry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Deterministic cache key for a `(operation, params)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether provider identity participates in the fingerprint.
///
/// With `Operation`, the same request served by different provider chains
/// shares one cache entry. With `OperationAndProviders`, the ordered
/// candidate list is hashed in, so results are cached per provider chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintScope {
    #[default]
    Operation,
    OperationAndProviders,
}

/// Compute the fingerprint of a request.
pub fn fingerprint(
    operation: &str,
    params: &JsonValue,
    providers: &[String],
    scope: FingerprintScope,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(params).to_string().as_bytes());

    if scope == FingerprintScope::OperationAndProviders {
        for provider in providers {
            hasher.update([0u8]);
            hasher.update(provider.as_bytes());
        }
    }

    let digest = hasher.finalize();
    Fingerprint(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Rebuild a JSON value with all object keys in sorted order, recursively.
fn canonical_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let sorted: BTreeMap<&String, &JsonValue> = map.iter().collect();
            JsonValue::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical_json(v)))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}
