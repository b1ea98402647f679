//! Configuration hashing for change detection.
//!
//! Hashes are deterministic: maps are walked in key order and every value is
//! prefixed with a type tag, so `"1"` and `1` never collide.

use sha2::{Digest, Sha256};

use crate::model::{Properties, Value};

use super::spec::DeployConfig;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Computes a hash of the whole declaration.
    ///
    /// Used as the plan fingerprint; execution settings are not included.
    #[must_use]
    pub fn hash_config(config: &DeployConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update([0]);
        hasher.update(config.project.environment.as_bytes());

        for resource in &config.resources {
            hasher.update([0]);
            hasher.update(resource.name.as_bytes());
            hasher.update([0]);
            hasher.update(resource.kind.as_str().as_bytes());
            feed_properties(&mut hasher, &resource.properties);
        }

        hasher.update([1]);
        feed_properties(&mut hasher, &config.outputs);

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a property map.
    #[must_use]
    pub fn hash_properties(properties: &Properties) -> String {
        let mut hasher = Sha256::new();
        feed_properties(&mut hasher, properties);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

fn feed_properties(hasher: &mut Sha256, properties: &Properties) {
    hasher.update(b"{");
    for (key, value) in properties {
        feed_str(hasher, key);
        feed_value(hasher, value);
    }
    hasher.update(b"}");
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn feed_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Bool(b) => hasher.update([b'b', u8::from(*b)]),
        Value::Integer(i) => {
            hasher.update(b"i");
            hasher.update(i.to_be_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            feed_str(hasher, s);
        }
        Value::Reference(r) => {
            hasher.update(b"r");
            feed_str(hasher, &r.to_string());
        }
        Value::List(items) => {
            hasher.update(b"[");
            for item in items {
                feed_value(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Map(map) => feed_properties(hasher, map),
    }
}
