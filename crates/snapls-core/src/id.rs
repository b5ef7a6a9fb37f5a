//! Package identifiers, the process-wide package interner, and compact sets
//! over interned packages.

use core::fmt;
use std::sync::OnceLock;

use ecow::EcoString;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snapls_std::hash::{Digest, FxHashMap};

macro_rules! string_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub EcoString);

        impl $name {
            /// Creates the identifier from a string.
            pub fn new(value: impl Into<EcoString>) -> Self {
                Self(value.into())
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.into())
            }
        }
    };
}

string_id!(
    /// An opaque build-system identifier of a package.
    ///
    /// Distinct from [`PackagePath`]: the relation between the two is
    /// many-to-one in both directions in pathological cases (vendoring,
    /// command-line-arguments packages, test variants).
    PackageId
);
string_id!(
    /// The linker-visible name of a package.
    PackagePath
);
string_id!(
    /// The source-visible name under which a package is imported.
    ImportPath
);
string_id!(
    /// The declared name of a package.
    PackageName
);

/// Process-wide interning of [`PackageId`] to a small integer, so that sets
/// over packages can be represented compactly.
#[derive(Default)]
pub struct PackageIndex {
    state: RwLock<IndexState>,
}

#[derive(Default)]
struct IndexState {
    ids: FxHashMap<PackageId, u32>,
    rev: Vec<PackageId>,
}

impl PackageIndex {
    /// The process-wide index instance.
    pub fn global() -> &'static PackageIndex {
        static GLOBAL: OnceLock<PackageIndex> = OnceLock::new();
        GLOBAL.get_or_init(PackageIndex::default)
    }

    /// Interns a package id, returning its compact index.
    pub fn intern(&self, id: &PackageId) -> u32 {
        if let Some(&idx) = self.state.read().ids.get(id) {
            return idx;
        }

        let mut state = self.state.write();
        if let Some(&idx) = state.ids.get(id) {
            return idx;
        }
        let idx = state.rev.len() as u32;
        state.rev.push(id.clone());
        state.ids.insert(id.clone(), idx);
        idx
    }

    /// Resolves a compact index back to its package id.
    pub fn lookup(&self, idx: u32) -> Option<PackageId> {
        self.state.read().rev.get(idx as usize).cloned()
    }
}

/// A growable bitset over interned package indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    blocks: Vec<u64>,
}

impl IdSet {
    /// Inserts an index; returns whether it was newly inserted.
    pub fn insert(&mut self, idx: u32) -> bool {
        let (block, bit) = (idx as usize / 64, idx as usize % 64);
        if block >= self.blocks.len() {
            self.blocks.resize(block + 1, 0);
        }
        let fresh = self.blocks[block] & (1 << bit) == 0;
        self.blocks[block] |= 1 << bit;
        fresh
    }

    /// Whether the index is present.
    pub fn contains(&self, idx: u32) -> bool {
        self.blocks
            .get(idx as usize / 64)
            .is_some_and(|block| block & (1 << (idx as usize % 64)) != 0)
    }

    /// Iterates present indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().enumerate().flat_map(|(bi, &block)| {
            (0..64)
                .filter(move |bit| block & (1 << bit) != 0)
                .map(move |bit| (bi * 64 + bit) as u32)
        })
    }

    /// The number of present indices.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|&b| b == 0)
    }
}

/// A bloom filter over package paths, used as a fast membership test by the
/// analysis fact importer.
///
/// It never has false negatives; false positives only cost extra
/// unsuccessful lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathBloom {
    bits: Vec<u64>,
}

/// Derived hash-function count. Three probes keep the false-positive rate
/// below 5% at ten bits per element.
const BLOOM_PROBES: u64 = 3;

impl PathBloom {
    /// Builds the filter from a set of package paths.
    pub fn new<'a>(paths: impl ExactSizeIterator<Item = &'a PackagePath>) -> Self {
        let blocks = (paths.len() * 10 / 64 + 1).next_power_of_two();
        let mut bloom = PathBloom {
            bits: vec![0; blocks],
        };
        for path in paths {
            let (h1, h2) = Self::hash_pair(path);
            for probe in 0..BLOOM_PROBES {
                bloom.set(h1.wrapping_add(probe.wrapping_mul(h2)));
            }
        }
        bloom
    }

    /// Whether the path may be in the set.
    pub fn may_contain(&self, path: &PackagePath) -> bool {
        let (h1, h2) = Self::hash_pair(path);
        (0..BLOOM_PROBES).all(|probe| self.get(h1.wrapping_add(probe.wrapping_mul(h2))))
    }

    fn hash_pair(path: &PackagePath) -> (u64, u64) {
        let digest = Digest::of(path.as_str().as_bytes());
        let h1 = u64::from_le_bytes(digest.0[..8].try_into().unwrap_or_default());
        let h2 = u64::from_le_bytes(digest.0[8..16].try_into().unwrap_or_default());
        (h1, h2 | 1)
    }

    fn set(&mut self, hash: u64) {
        let bit = hash as usize % (self.bits.len() * 64);
        self.bits[bit / 64] |= 1 << (bit % 64);
    }

    fn get(&self, hash: u64) -> bool {
        let bit = hash as usize % (self.bits.len() * 64);
        self.bits[bit / 64] & (1 << (bit % 64)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let index = PackageIndex::default();
        let id = PackageId::new("example.com/a");
        let idx = index.intern(&id);
        assert_eq!(index.intern(&id), idx);
        assert_eq!(index.lookup(idx), Some(id));
    }

    #[test]
    fn test_id_set() {
        let mut set = IdSet::default();
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.insert(130));
        assert!(set.contains(3));
        assert!(!set.contains(4));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 130]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_bloom_no_false_negatives() {
        let paths: Vec<PackagePath> = (0..64)
            .map(|i| PackagePath::new(format!("example.com/pkg{i}")))
            .collect();
        let bloom = PathBloom::new(paths.iter());
        for path in &paths {
            assert!(bloom.may_contain(path));
        }
    }
}
