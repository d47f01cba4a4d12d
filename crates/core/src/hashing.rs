//! Versioned content hashing for cache keys and obfuscation seeds.
//!
//! Values are `"{version}:{hex sha-256}"`. The version prefix changes whenever the hashed
//! representation changes, so persisted keys never silently collide across releases.

use sha2::{Digest, Sha256};

pub const HASH_VERSION: &str = "v1";

/// Hash `parts` joined by a unit separator and return a versioned hex digest.
pub fn versioned_hash<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    format!("{}:{}", HASH_VERSION, hex::encode(digest(parts)))
}

/// Raw 32-byte digest of `parts`, suitable as an RNG seed.
pub fn digest<I, S>(parts: I) -> [u8; 32]
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    hasher.update(HASH_VERSION.as_bytes());
    for part in parts {
        hasher.update([0x1f]);
        hasher.update(part.as_ref());
    }
    hasher.finalize().into()
}
