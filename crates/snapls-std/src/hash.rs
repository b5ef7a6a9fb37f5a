//! The hash extension module. It provides the 32-byte [`Digest`] used
//! uniformly as cache keys, identities, and summaries.

use core::fmt;
use std::hash::Hash;

use sha2::{Digest as _, Sha256};

pub(crate) type FxBuildHasher = std::hash::BuildHasherDefault<FxHasher>;
pub use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
/// A dashmap that uses the FxHasher as the underlying hasher.
pub type FxDashMap<K, V> = dashmap::DashMap<K, V, FxBuildHasher>;

/// A fixed 32-byte digest (SHA-256).
///
/// Collisions are treated as impossible in practice: every key derived from
/// canonically encoded inputs occupies its own point of a 256-bit space.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// The all-zero digest, the identity of [`Digest::xor`].
    pub const ZERO: Digest = Digest([0; 32]);

    /// Computes the digest of a byte string.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Combines two digests associatively and commutatively.
    ///
    /// Only valid when the ordering of the combined inputs is irrelevant;
    /// ordered inputs must go through a [`DigestSink`] instead.
    pub fn xor(self, other: Digest) -> Digest {
        let mut out = self.0;
        for (lhs, rhs) in out.iter_mut().zip(other.0) {
            *lhs ^= rhs;
        }
        Digest(out)
    }

    /// Returns the raw bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses a digest from its hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }

    /// Encodes the digest in hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The leading 8 bytes are enough to tell digests apart in logs.
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::string::String as serde::Deserialize>::deserialize(deserializer)?;
        Digest::from_hex(&s).ok_or_else(|| serde::de::Error::custom("malformed digest"))
    }
}

/// An incremental writer producing a [`Digest`] over canonically encoded
/// inputs.
///
/// Every variable-length field is length-prefixed, so distinct field
/// sequences can never collide by concatenation.
#[derive(Default)]
pub struct DigestSink(Sha256);

impl DigestSink {
    /// Creates a sink whose output is additionally separated by a domain
    /// label, e.g. `"typerefs"`.
    pub fn with_domain(domain: &str) -> Self {
        let mut sink = Self::default();
        sink.str(domain);
        sink
    }

    /// Writes a length-prefixed byte field.
    pub fn bytes(&mut self, bytes: &[u8]) {
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    /// Writes a length-prefixed string field.
    pub fn str(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    /// Writes a fixed-width integer field.
    pub fn u64(&mut self, value: u64) {
        self.0.update(value.to_le_bytes());
    }

    /// Writes a digest-valued field.
    pub fn digest(&mut self, digest: &Digest) {
        self.0.update(digest.0);
    }

    /// Finishes the sink and returns the accumulated digest.
    pub fn finish(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_identity() {
        let a = Digest::of(b"a");
        assert_eq!(a.xor(Digest::ZERO), a);
        assert_eq!(a.xor(a), Digest::ZERO);

        let b = Digest::of(b"b");
        let c = Digest::of(b"c");
        assert_eq!(a.xor(b).xor(c), c.xor(b).xor(a));
    }

    #[test]
    fn test_length_prefix_separates_fields() {
        let mut ab = DigestSink::default();
        ab.str("ab");
        ab.str("c");
        let mut a_bc = DigestSink::default();
        a_bc.str("a");
        a_bc.str("bc");
        assert_ne!(ab.finish(), a_bc.finish());
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = Digest::of(b"roundtrip");
        assert_eq!(Digest::from_hex(&digest.to_hex()), Some(digest));
    }
}
