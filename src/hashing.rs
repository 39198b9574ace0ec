//! SHA-256 helpers for content and chunk digests.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// True when `value` looks like a hex SHA-256 digest (either case).
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == SHA256_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Validate and normalize a client-supplied digest to lowercase.
pub fn normalize_sha256(value: &str) -> Option<String> {
    let trimmed = value.trim();
    is_sha256_hex(trimmed).then(|| trimmed.to_ascii_lowercase())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
