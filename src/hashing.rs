use sha2::{Digest, Sha256};

/// SHA-256 digest of the raw upload bytes, hex encoded.
///
/// Computed before any resize or re-encode so byte-identical uploads map to
/// the same key regardless of later processing.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}
