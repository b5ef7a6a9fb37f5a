//! A bounded LRU of parsed files keyed by `(content digest, parse mode)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use snapls_std::hash::{Digest, FxHashMap};
use snapls_std::QueryRef;

use crate::frontend::{Frontend, ParseMode, ParsedFile};
use crate::vfs::FileHandle;

type ParseCell = Arc<QueryRef<Arc<ParsedFile>, ()>>;

struct ParseEntry {
    cell: ParseCell,
    last_use: u64,
}

/// A bounded LRU of parsed files.
///
/// Concurrent parses of the same `(digest, mode)` deduplicate through a
/// shared once-cell. Parsing is deterministic, so dropping an entry under
/// memory pressure is always safe.
pub struct ParseCache {
    entries: Mutex<FxHashMap<(Digest, ParseMode), ParseEntry>>,
    capacity: usize,
    clock: AtomicU64,
}

impl ParseCache {
    /// Creates a cache bounded to the given entry count.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Parses the given files, sharing cached results.
    pub fn parse(
        &self,
        frontend: &dyn Frontend,
        files: &[FileHandle],
        mode: ParseMode,
    ) -> Vec<Arc<ParsedFile>> {
        files
            .iter()
            .map(|file| self.parse_one(frontend, file, mode))
            .collect()
    }

    fn parse_one(
        &self,
        frontend: &dyn Frontend,
        file: &FileHandle,
        mode: ParseMode,
    ) -> Arc<ParsedFile> {
        let cell = self.touch(file.digest, mode);
        let parsed = cell.compute(|| Ok(frontend.parse(file, mode)));
        match parsed {
            Ok(parsed) => parsed.clone(),
            // The error type is uninhabited in spirit; parse failures are
            // diagnostics inside the file.
            Err(()) => frontend.parse(file, mode),
        }
    }

    fn touch(&self, digest: Digest, mode: ParseMode) -> ParseCell {
        let now = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&(digest, mode)) {
            entry.last_use = now;
            return entry.cell.clone();
        }

        if entries.len() >= self.capacity {
            evict_oldest(&mut entries);
        }

        let cell: ParseCell = Arc::new(QueryRef::default());
        entries.insert(
            (digest, mode),
            ParseEntry {
                cell: cell.clone(),
                last_use: now,
            },
        );
        cell
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ParseCache {
    fn default() -> Self {
        // Large enough for the working set of a sizeable workspace.
        Self::new(2048)
    }
}

fn evict_oldest(entries: &mut FxHashMap<(Digest, ParseMode), ParseEntry>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_use)
        .map(|(key, _)| *key);
    if let Some(key) = oldest {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFrontend;
    use crate::vfs::Uri;

    fn handle(text: &str) -> FileHandle {
        FileHandle::new(Uri::new("file:///a.src"), text)
    }

    #[test]
    fn test_dedup_by_digest() {
        let cache = ParseCache::new(8);
        let frontend = TestFrontend::default();
        let a = cache.parse(&frontend, &[handle("package a\n")], ParseMode::Full);
        let b = cache.parse(&frontend, &[handle("package a\n")], ParseMode::Full);
        assert!(Arc::ptr_eq(&a[0], &b[0]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_modes_are_distinct() {
        let cache = ParseCache::new(8);
        let frontend = TestFrontend::default();
        cache.parse(&frontend, &[handle("package a\n")], ParseMode::Full);
        cache.parse(&frontend, &[handle("package a\n")], ParseMode::Header);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_keeps_capacity() {
        let cache = ParseCache::new(2);
        let frontend = TestFrontend::default();
        for i in 0..4 {
            let file = FileHandle::new(Uri::new("file:///a.src"), format!("package a{i}\n"));
            cache.parse(&frontend, &[file], ParseMode::Full);
        }
        assert_eq!(cache.len(), 2);
    }
}
