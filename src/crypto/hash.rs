//! SHA-256 helper for the modern integrity tag.

use sha2::{Digest, Sha256};

/// Computes SHA-256 of `data` as 64 lowercase hex characters.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
