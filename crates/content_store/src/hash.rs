use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::StoreError;

/// A 32-byte SHA-256 content hash.
///
/// The hash is computed over the uncompressed blob bytes; compression is a
/// storage detail and never changes a blob's identity. Renders as lowercase
/// hex and serializes as a hex string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobHash([u8; 32]);

impl BlobHash {
    /// Computes the hash of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The shard directory name: the first two hex characters.
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobHash({})", self.to_hex())
    }
}

impl FromStr for BlobHash {
    type Err = StoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(input).map_err(|_| StoreError::InvalidHash {
            input: input.to_string(),
        })?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| StoreError::InvalidHash {
            input: input.to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for BlobHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(&raw), &"a 64-character hex string")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hash = BlobHash::of(b"hello");
        let parsed: BlobHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn shard_is_first_byte() {
        let hash = BlobHash::of(b"hello");
        assert_eq!(hash.shard(), hash.to_hex()[..2]);
    }

    #[test]
    fn rejects_short_input() {
        assert!("abcd".parse::<BlobHash>().is_err());
        assert!("zz".repeat(32).parse::<BlobHash>().is_err());
    }
}
