//! A single-machine key-value store from `(kind, digest)` to opaque bytes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use snapls_std::error::prelude::*;
use snapls_std::hash::{Digest, FxDashMap};
use snapls_std::ImmutBytes;

/// The disjoint namespaces of the file cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    /// Export data of a type-checked package.
    Export,
    /// Symbol reference summaries.
    TypeRefs,
    /// Package symbol extraction results.
    Symbols,
    /// Analysis summaries.
    Analysis,
    /// Package diagnostics.
    Diagnostics,
    /// Cross-reference indices.
    Xrefs,
    /// Method-set indices.
    MethodSets,
    /// Test indices.
    Tests,
}

impl CacheKind {
    /// The directory name of the namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Export => "export",
            CacheKind::TypeRefs => "typerefs",
            CacheKind::Symbols => "symbols",
            CacheKind::Analysis => "analysis",
            CacheKind::Diagnostics => "diagnostics",
            CacheKind::Xrefs => "xrefs",
            CacheKind::MethodSets => "methodsets",
            CacheKind::Tests => "tests",
        }
    }
}

/// The file cache contract.
///
/// `set` is idempotent: concurrent writers may race, but values for the
/// same key are byte-equal by construction, so the last writer wins.
/// Malformed or missing entries both read as `None`; the caller recomputes.
pub trait FileCache: Send + Sync {
    /// Reads the entry, or `None` if absent.
    fn get(&self, kind: CacheKind, key: &Digest) -> Option<ImmutBytes>;

    /// Writes the entry atomically.
    fn set(&self, kind: CacheKind, key: &Digest, value: &[u8]) -> Result<()>;
}

/// The on-disk cache, shared by every process on the machine.
///
/// Entries live at `<root>/<kind>/<aa>/<digest>` where `aa` is the first
/// digest byte; writes go through a temporary file and a rename so readers
/// never observe a torn entry.
pub struct DiskCache {
    root: PathBuf,
}

static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

impl DiskCache {
    /// Opens a cache rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, kind: CacheKind, key: &Digest) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(kind.as_str()).join(&hex[..2]).join(&hex)
    }
}

impl FileCache for DiskCache {
    fn get(&self, kind: CacheKind, key: &Digest) -> Option<ImmutBytes> {
        match std::fs::read(self.entry_path(kind, key)) {
            Ok(bytes) => Some(bytes.into()),
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("file cache read failed for {kind:?}/{key:?}: {err}");
                }
                None
            }
        }
    }

    fn set(&self, kind: CacheKind, key: &Digest, value: &[u8]) -> Result<()> {
        let path = self.entry_path(kind, key);
        let parent = path.parent().ok_or_else(|| {
            snapls_std::error::prelude::_msg("DiskCache.set", "entry path has no parent".into())
        })?;
        std::fs::create_dir_all(parent).context("DiskCache.set")?;

        // A unique sibling name keeps concurrent writers off each other;
        // the rename publishes the entry atomically.
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = parent.join(format!(
            ".{}.{}.{seq}.tmp",
            key.to_hex(),
            std::process::id()
        ));
        std::fs::write(&tmp, value).context("DiskCache.set")?;
        std::fs::rename(&tmp, &path).context("DiskCache.set")?;
        Ok(())
    }
}

/// An in-memory cache for tests and cache-less operation.
#[derive(Default)]
pub struct MemCache {
    entries: FxDashMap<(CacheKind, Digest), ImmutBytes>,
    gets: AtomicU64,
    sets: AtomicU64,
}

impl MemCache {
    /// The number of reads served so far.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// The number of writes performed so far.
    pub fn set_count(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    /// The number of writes of the given kind currently stored.
    pub fn len_of(&self, kind: CacheKind) -> usize {
        self.entries.iter().filter(|e| e.key().0 == kind).count()
    }

    /// All entries, in a canonical order.
    pub fn dump(&self) -> Vec<((CacheKind, Digest), ImmutBytes)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(key, _)| *key);
        entries
    }
}

impl FileCache for MemCache {
    fn get(&self, kind: CacheKind, key: &Digest) -> Option<ImmutBytes> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.entries.get(&(kind, *key)).map(|e| e.value().clone())
    }

    fn set(&self, kind: CacheKind, key: &Digest, value: &[u8]) -> Result<()> {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.entries.insert((kind, *key), value.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let key = Digest::of(b"key");

        assert_eq!(cache.get(CacheKind::Export, &key), None);
        cache.set(CacheKind::Export, &key, b"payload").unwrap();
        assert_eq!(
            cache.get(CacheKind::Export, &key).as_deref(),
            Some(b"payload".as_slice())
        );
        // Kinds are disjoint namespaces.
        assert_eq!(cache.get(CacheKind::Analysis, &key), None);
    }

    #[test]
    fn test_set_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let key = Digest::of(b"key");
        cache.set(CacheKind::Export, &key, b"same").unwrap();
        cache.set(CacheKind::Export, &key, b"same").unwrap();
        assert_eq!(
            cache.get(CacheKind::Export, &key).as_deref(),
            Some(b"same".as_slice())
        );
    }
}
