//! Name hashing.
//!
//! Types, properties, aspects, events and blackboard keys are all addressed
//! by a 64-bit hash of their name. Hashes are stable across processes (they
//! are derived from the name bytes only), so they can appear in serialized
//! data and in the changelog wire format.

/// A 64-bit name hash. `0` is reserved for "no name".
pub type NameHash = u64;

/// Hash a name to a stable 64-bit value.
///
/// The empty string hashes to `0` so that "unnamed" and "no name" coincide.
pub fn hash_name(name: &str) -> NameHash {
    if name.is_empty() {
        return 0;
    }
    let digest = blake3::hash(name.as_bytes());
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("digest is 32 bytes"))
}

/// Hash raw bytes to a stable 64-bit value (buffer content hashes).
pub fn hash_bytes(data: &[u8]) -> u64 {
    let digest = blake3::hash(data);
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("digest is 32 bytes"))
}
