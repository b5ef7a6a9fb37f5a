//! The file source contract and an in-memory implementation with overlay
//! semantics.

use core::fmt;

use ecow::EcoString;
use parking_lot::RwLock;
use rpds::RedBlackTreeMapSync;
use serde::{Deserialize, Serialize};
use snapls_std::hash::Digest;
use snapls_std::{bail, ImmutBytes};

use snapls_std::error::prelude::*;

/// A file identifier, e.g. `file:///w/a/a.src`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(pub EcoString);

impl Uri {
    /// Creates a uri from a string.
    pub fn new(value: impl Into<EcoString>) -> Self {
        Self(value.into())
    }

    /// The uri as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Uri {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

/// A content-addressed handle to one file at one instant.
#[derive(Debug, Clone)]
pub struct FileHandle {
    /// The file identifier.
    pub uri: Uri,
    /// The content digest. Two handles with equal digests have equal
    /// contents.
    pub digest: Digest,
    /// Whether the on-disk content agrees with the handle.
    pub saved: bool,
    /// Whether the file is an editor overlay.
    pub open_in_editor: bool,
    /// The file content.
    pub content: ImmutBytes,
}

impl FileHandle {
    /// Creates a saved, closed handle over the given content.
    pub fn new(uri: Uri, content: impl AsRef<[u8]>) -> Self {
        let content: ImmutBytes = content.as_ref().into();
        Self {
            digest: Digest::of(&content),
            uri,
            saved: true,
            open_in_editor: false,
            content,
        }
    }

    /// The content as text.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.content).context("FileHandle.text")
    }
}

/// Supplies content-addressed file handles.
///
/// Reads must be cheap and monotonic: the same uri returns the same digest
/// until an explicit invalidation.
pub trait FileSource: Send + Sync {
    /// Reads the file at the given uri.
    fn read_file(&self, uri: &Uri) -> Result<FileHandle>;
}

/// A file source over in-memory content, with an overlay layer shadowing
/// the base map.
///
/// [`MemoryFileSource::freeze`] takes a cheap immutable snapshot of the
/// current file map.
#[derive(Default)]
pub struct MemoryFileSource {
    files: RwLock<RedBlackTreeMapSync<Uri, FileHandle>>,
}

impl MemoryFileSource {
    /// Inserts or replaces a saved file.
    pub fn insert(&self, uri: impl Into<Uri>, content: impl AsRef<[u8]>) -> FileHandle {
        let handle = FileHandle::new(uri.into(), content);
        self.files
            .write()
            .insert_mut(handle.uri.clone(), handle.clone());
        handle
    }

    /// Shadows a file with editor-owned, possibly unsaved content.
    pub fn overlay(&self, uri: impl Into<Uri>, content: impl AsRef<[u8]>, saved: bool) -> FileHandle {
        let mut handle = FileHandle::new(uri.into(), content);
        handle.saved = saved;
        handle.open_in_editor = true;
        self.files
            .write()
            .insert_mut(handle.uri.clone(), handle.clone());
        handle
    }

    /// Removes a file.
    pub fn remove(&self, uri: &Uri) {
        self.files.write().remove_mut(uri);
    }

    /// Takes an immutable snapshot of the current file map.
    pub fn freeze(&self) -> FrozenFileSource {
        FrozenFileSource {
            files: self.files.read().clone(),
        }
    }
}

impl FileSource for MemoryFileSource {
    fn read_file(&self, uri: &Uri) -> Result<FileHandle> {
        match self.files.read().get(uri) {
            Some(handle) => Ok(handle.clone()),
            None => bail!("no such file: {uri}"),
        }
    }
}

/// An immutable view of a [`MemoryFileSource`], bound to one snapshot so
/// that reads stay monotonic while the underlying source keeps changing.
#[derive(Clone)]
pub struct FrozenFileSource {
    files: RedBlackTreeMapSync<Uri, FileHandle>,
}

impl FileSource for FrozenFileSource {
    fn read_file(&self, uri: &Uri) -> Result<FileHandle> {
        match self.files.get(uri) {
            Some(handle) => Ok(handle.clone()),
            None => bail!("no such file: {uri}"),
        }
    }
}
