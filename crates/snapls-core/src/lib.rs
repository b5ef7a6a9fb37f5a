//! The core of an incremental language-server backend: immutable snapshots
//! over a package graph, content-addressed cache keys per package, minimal
//! re-derivation on edits, and parallel bottom-up type checking and
//! modular static analysis.
//!
//! The compiler frontend, the file source, and the metadata loader are
//! external collaborators behind the [`frontend::Frontend`],
//! [`vfs::FileSource`], and [`metadata::MetadataSource`] contracts.

pub mod analysis;
pub mod batch;
pub mod cache;
pub mod config;
pub mod diag;
pub mod frontend;
pub mod handle;
pub mod id;
pub mod metadata;
pub mod snapshot;
pub mod stats;
pub mod symbols;
pub mod testing;
pub mod typerefs;
pub mod vfs;

pub use analysis::{Analyzer, AnalyzerCatalog, Pass, SourceLoc};
pub use batch::Package;
pub use cache::{CacheKind, DiskCache, FileCache, MemCache};
pub use config::EngineOpts;
pub use diag::{DiagSeverity, Diagnostic};
pub use handle::{HandleState, PackageHandle, TypeCheckInputs};
pub use id::{ImportPath, PackageId, PackageName, PackagePath};
pub use metadata::{MetadataGraph, MetadataPackage, MetadataSource};
pub use snapshot::{Snapshot, SnapshotChanges, SnapshotInputs};
pub use stats::{AnalysisStats, MetricsSink, NullMetrics};
pub use symbols::{SymbolInfo, SymbolPackage};
pub use vfs::{FileHandle, FileSource, MemoryFileSource, Uri};
