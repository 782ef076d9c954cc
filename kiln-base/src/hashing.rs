use siphasher::sip128::{Hasher128, SipHasher};
use std::hash::{Hash, Hasher};

/// Default hashmap for kiln. Opts-out of more expensive secure hash.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
/// Default hashset for kiln. Opts-out of more expensive secure hash.
pub type HashSet<T> = std::collections::HashSet<T, ahash::RandomState>;

/// 128-bit content hash of anything hashable. Unlike the `ahash` maps above this is keyed with a
/// fixed key, so the result is stable across processes and can be written to disk or sent to a
/// worker.
pub fn hash_u128<T: Hash + ?Sized>(value: &T) -> u128 {
    let mut hasher = SipHasher::new();
    value.hash(&mut hasher);
    hasher.finish128().as_u128()
}

/// 128-bit content hash of raw bytes (no length prefix, so equal to hashing the concatenation)
pub fn hash_bytes_u128(bytes: &[u8]) -> u128 {
    let mut hasher = SipHasher::new();
    hasher.write(bytes);
    hasher.finish128().as_u128()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_discriminating() {
        assert_eq!(hash_u128("vertex_main"), hash_u128("vertex_main"));
        assert_ne!(hash_u128("vertex_main"), hash_u128("pixel_main"));
        assert_eq!(hash_bytes_u128(b"abc"), hash_bytes_u128(b"abc"));
        assert_ne!(hash_bytes_u128(b"abc"), hash_bytes_u128(b"abd"));
    }
}
