//! Block id generation.
//!
//! Ids are `<prefix>-<hash>` where the hash suffix is hex from SHA-256 over
//! the block's identity-bearing fields plus a nonce. Collisions are resolved
//! first by lengthening the suffix, then by bumping the nonce.

use sha2::{Digest, Sha256};

/// Configuration for id generation.
#[derive(Debug, Clone, PartialEq)]
pub struct IdConfig {
    pub prefix: String,
    pub min_hash_length: usize,
    pub max_hash_length: usize,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            prefix: "mb".to_string(),
            min_hash_length: 6,
            max_hash_length: 12,
        }
    }
}

/// Full hex digest for one (block identity, nonce) pair.
fn digest_hex(node_type: &str, text: &str, created_by: &str, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_type.as_bytes());
    hasher.update([0]);
    hasher.update(text.as_bytes());
    hasher.update([0]);
    hasher.update(created_by.as_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Produce a candidate id at the given suffix length.
///
/// `length` is clamped to the config's bounds.
#[must_use]
pub fn candidate_id(
    config: &IdConfig,
    node_type: &str,
    text: &str,
    created_by: &str,
    nonce: u64,
    length: usize,
) -> String {
    let length = length.clamp(config.min_hash_length, config.max_hash_length);
    let hex = digest_hex(node_type, text, created_by, nonce);
    format!("{}-{}", config.prefix, &hex[..length])
}

/// The ordered candidate sequence for collision resolution: every length from
/// shortest to longest for nonce 0, then the same for nonce 1, and so on.
#[must_use]
pub fn candidate_sequence(
    config: &IdConfig,
    node_type: &str,
    text: &str,
    created_by: &str,
    max_nonces: u64,
) -> Vec<String> {
    let mut candidates = Vec::new();
    for nonce in 0..max_nonces {
        for length in config.min_hash_length..=config.max_hash_length {
            candidates.push(candidate_id(
                config, node_type, text, created_by, nonce, length,
            ));
        }
    }
    candidates
}
