//! Identifiers and Key Hashing
//!
//! Parts, Blocks, primaries and replicas are all named by a 16 byte random
//! [`Id`]. Keys are mapped onto the same 16 byte space by [`hash_key`], so
//! placement can compare the two with XOR.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// Length in bytes of every identifier and key hash.
pub const ID_LEN: usize = 16;

/// Separator between a key's namespace and the rest of the key.
pub const NAMESPACE_SEPARATOR: char = '/';

/// The 16 byte fingerprint of a key.
pub type KeyHash = [u8; ID_LEN];

/// An opaque, randomly generated identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// Generates a new identifier from the thread-local CSPRNG.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds an identifier from a slice, if it has exactly [`ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; ID_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Big-endian number formed by the first 8 bytes.
    ///
    /// Used as the map key for blocks; collisions between random ids are
    /// not a practical concern at this width.
    pub fn number(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }

    /// URL-safe base64 (no padding) form, used for file names and logs.
    pub fn name(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Byte-wise XOR distance to a key hash.
    #[inline]
    pub fn distance(&self, hash: &KeyHash) -> [u8; ID_LEN] {
        let mut d = [0u8; ID_LEN];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ hash[i];
        }
        d
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.name())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Returns the namespace of a key (`ns` in `ns/name`), if it has one.
pub fn namespace(key: &str) -> Option<&str> {
    key.split_once(NAMESPACE_SEPARATOR).map(|(ns, _)| ns)
}

/// Hashes the placement portion of a key.
///
/// Keys under a namespace hash only the namespace, so every key of
/// `ns/...` lands in the same block.
pub fn hash_key(key: &str) -> KeyHash {
    let portion = namespace(key).unwrap_or(key);
    xxh3_128(portion.as_bytes()).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(Id::random(), Id::random());
    }

    #[test]
    fn test_number_is_big_endian_prefix() {
        let mut bytes = [0u8; ID_LEN];
        bytes[7] = 1;
        bytes[15] = 0xff;
        assert_eq!(Id::from_bytes(bytes).number(), 1);
    }

    #[test]
    fn test_name_is_url_safe() {
        let id = Id::from_bytes([0xfb; ID_LEN]);
        let name = id.name();
        assert!(!name.contains('+'));
        assert!(!name.contains('/'));
        assert!(!name.contains('='));
        assert_eq!(name.len(), 22);
    }

    #[test]
    fn test_from_slice_requires_exact_length() {
        assert!(Id::from_slice(&[1u8; 15]).is_none());
        assert!(Id::from_slice(&[1u8; 17]).is_none());
        assert_eq!(Id::from_slice(&[1u8; 16]), Some(Id::from_bytes([1u8; 16])));
    }

    #[test]
    fn test_distance_is_xor() {
        let mut a = [0u8; ID_LEN];
        a[0] = 0b1100;
        let mut hash = [0u8; ID_LEN];
        hash[0] = 0b1010;
        assert_eq!(Id::from_bytes(a).distance(&hash)[0], 0b0110);
        assert_eq!(Id::from_bytes(a).distance(&a), [0u8; ID_LEN]);
    }

    #[test]
    fn test_namespace() {
        assert_eq!(namespace("users/42"), Some("users"));
        assert_eq!(namespace("users/42/profile"), Some("users"));
        assert_eq!(namespace("plain"), None);
    }

    #[test]
    fn test_namespace_keys_share_hash() {
        assert_eq!(hash_key("users/1"), hash_key("users/2"));
        assert_eq!(hash_key("users/1"), hash_key("users"));
        assert_ne!(hash_key("users/1"), hash_key("orders/1"));
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_key("coffee"), hash_key("coffee"));
        assert_ne!(hash_key("coffee"), hash_key("tea"));
    }
}
