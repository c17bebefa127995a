//! DHT key module
//!
//! Fixed-width identifiers shared by node IDs and stored keys, and the XOR
//! metric over them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// Length of an identifier in bytes
pub const ID_BYTES: usize = 20;

/// Length of an identifier in bits
pub const ID_BITS: usize = ID_BYTES * 8;

/// 160-bit identifier, interpreted as a big-endian unsigned integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub [u8; ID_BYTES]);

impl Key {
    /// Create a new Key from bytes
    pub fn new(id: [u8; ID_BYTES]) -> Self {
        Self(id)
    }

    /// The all-zero key
    pub fn zero() -> Self {
        Self([0u8; ID_BYTES])
    }

    /// Generate a random Key
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut id = [0u8; ID_BYTES];
        rng.fill(&mut id);
        Self(id)
    }

    /// Derive a Key from an application-level name by hashing it with SHA-1
    pub fn from_name(name: &str) -> Self {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        let result = hasher.finalize();
        let mut id = [0u8; ID_BYTES];
        id.copy_from_slice(&result);
        Self(id)
    }

    /// Get the Key as bytes
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Get the Key as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a Key from a hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str)
            .ok()
            .and_then(|bytes| {
                if bytes.len() == ID_BYTES {
                    let mut id = [0u8; ID_BYTES];
                    id.copy_from_slice(&bytes);
                    Some(Self(id))
                } else {
                    None
                }
            })
    }

    /// XOR distance to another key
    pub fn distance(&self, other: &Key) -> Key {
        let mut distance = [0u8; ID_BYTES];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Key(distance)
    }

    /// Position of the highest set bit (1..=160), or 0 for the zero key
    pub fn bit_length(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return ID_BITS - (i * 8 + byte.leading_zeros() as usize);
            }
        }
        0
    }

    /// Produce a key whose XOR distance from `self` has bit-length exactly `n`.
    ///
    /// Bits below the leading one are random, so repeated probes of the same
    /// bucket spread over its whole range. `n` is clamped to [`ID_BITS`].
    pub fn generate_at_distance(&self, n: usize) -> Key {
        use rand::Rng;
        let n = n.min(ID_BITS);
        if n == 0 {
            return *self;
        }

        let mut distance = [0u8; ID_BYTES];
        rand::thread_rng().fill(&mut distance);

        // Bit `n - 1`, counted from the least significant end, must be the highest set bit
        let top = ID_BITS - n;
        let byte_index = top / 8;
        let bit = 0x80u8 >> (top % 8);
        for byte in distance.iter_mut().take(byte_index) {
            *byte = 0;
        }
        distance[byte_index] = bit | (distance[byte_index] & bit.wrapping_sub(1));

        self.distance(&Key(distance))
    }

    /// Compare two keys by their XOR distance to `self` (ascending = closer)
    pub fn cmp_distance(&self, a: &Key, b: &Key) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Key {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::from_hex(s).ok_or_else(|| anyhow::anyhow!("Invalid key, expected 40 hex characters: {}", s))
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        Key::from_hex(&hex_str).ok_or_else(|| serde::de::Error::custom(format!("invalid key: {}", hex_str)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_random() {
        let key1 = Key::random();
        let key2 = Key::random();
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_key_hex() {
        let key = Key::new([0xABu8; ID_BYTES]);
        let hex_str = key.to_hex();
        assert_eq!(hex_str.len(), 40);
        assert_eq!(Key::from_hex(&hex_str), Some(key));
        assert!(Key::from_hex("abcd").is_none());
        assert!(Key::from_hex(&"zz".repeat(20)).is_none());
    }

    #[test]
    fn test_from_name_is_stable() {
        assert_eq!(Key::from_name("hello"), Key::from_name("hello"));
        assert_ne!(Key::from_name("hello"), Key::from_name("world"));
        // sha1("hello")
        assert_eq!(Key::from_name("hello").to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let key = Key::random();
        assert_eq!(key.distance(&key), Key::zero());
        assert_eq!(key.distance(&key).bit_length(), 0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        for _ in 0..32 {
            let a = Key::random();
            let b = Key::random();
            assert_eq!(a.distance(&b), b.distance(&a));
        }
    }

    #[test]
    fn test_bit_length() {
        assert_eq!(Key::zero().bit_length(), 0);

        let mut id = [0u8; ID_BYTES];
        id[ID_BYTES - 1] = 1;
        assert_eq!(Key::new(id).bit_length(), 1);

        id[ID_BYTES - 1] = 0x80;
        assert_eq!(Key::new(id).bit_length(), 8);

        let mut id = [0u8; ID_BYTES];
        id[0] = 0x80;
        assert_eq!(Key::new(id).bit_length(), ID_BITS);

        let mut id = [0u8; ID_BYTES];
        id[0] = 0x01;
        assert_eq!(Key::new(id).bit_length(), ID_BITS - 7);
    }

    #[test]
    fn test_generate_at_distance() {
        let local = Key::random();
        for n in 0..=ID_BITS {
            let probe = local.generate_at_distance(n);
            assert_eq!(local.distance(&probe).bit_length(), n, "distance {}", n);
        }
    }

    #[test]
    fn test_ordering_is_numeric() {
        let mut small = [0u8; ID_BYTES];
        small[ID_BYTES - 1] = 0xFF;
        let mut large = [0u8; ID_BYTES];
        large[0] = 0x01;
        assert!(Key::new(small) < Key::new(large));
    }

    #[test]
    fn test_cmp_distance() {
        let target = Key::new([0xFFu8; ID_BYTES]);
        let near = Key::new([0xF0u8; ID_BYTES]);
        let far = Key::new([0x0Fu8; ID_BYTES]);
        assert_eq!(target.cmp_distance(&near, &far), Ordering::Less);
        assert_eq!(target.cmp_distance(&far, &near), Ordering::Greater);
        assert_eq!(target.cmp_distance(&near, &near), Ordering::Equal);
    }

    #[test]
    fn test_from_str() {
        let key: Key = "ab".repeat(20).parse().unwrap();
        assert_eq!(key, Key::new([0xABu8; ID_BYTES]));
        assert!("nope".parse::<Key>().is_err());
    }
}
