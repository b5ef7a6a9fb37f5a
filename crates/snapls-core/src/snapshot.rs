//! The immutable vantage point of one workspace instant, and the clone
//! operation deriving the next instant from a set of changes.

use std::sync::{Arc, Weak};

use ecow::EcoString;
use itertools::Itertools;
use parking_lot::Mutex;
use snapls_std::error::prelude::*;
use snapls_std::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::analysis::{AnalysisDriver, AnalysisShared, AnalyzerCatalog};
use crate::batch::{Package, TypeCheckBatch};
use crate::cache::{FileCache, ParseCache};
use crate::config::EngineOpts;
use crate::diag::Diagnostic;
use crate::frontend::Frontend;
use crate::handle::{self, EvalCtx, PackageHandle, PackageMap};
use crate::id::{IdSet, PackageId, PackageIndex};
use crate::metadata::MetadataGraph;
use crate::stats::MetricsSink;
use crate::symbols::{self, SymbolPackage};
use crate::vfs::{FileSource, Uri};

/// The changes between one snapshot and the next.
#[derive(Default)]
pub struct SnapshotChanges {
    /// Files whose content handle changed.
    pub files: Vec<Uri>,
    /// A reloaded metadata graph, if the build configuration changed.
    pub graph: Option<Arc<MetadataGraph>>,
}

impl SnapshotChanges {
    /// Changes covering edited files only.
    pub fn files(files: impl IntoIterator<Item = Uri>) -> Self {
        Self {
            files: files.into_iter().collect(),
            graph: None,
        }
    }
}

/// An immutable view of workspace, metadata, and overlays at an instant;
/// the unit of incremental evaluation.
///
/// Snapshots are reference-counted through [`Arc`]; dropping the last
/// reference cancels the snapshot's background context.
pub struct Snapshot {
    ctx: Arc<EvalCtx>,
    catalog: Arc<AnalyzerCatalog>,
    metrics: Arc<dyn MetricsSink>,
    index: &'static PackageIndex,
    analysis: Arc<AnalysisShared>,
    /// Concurrent queries share one batch, deduplicating in-flight type
    /// checks and imports; the batch dies with its last query.
    batch_slot: Mutex<Weak<TypeCheckBatch>>,
    cancel: CancellationToken,
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Everything a snapshot binds together at creation.
pub struct SnapshotInputs {
    /// The engine options.
    pub opts: Arc<EngineOpts>,
    /// The compiler frontend.
    pub frontend: Arc<dyn Frontend>,
    /// The file source.
    pub file_source: Arc<dyn FileSource>,
    /// The content-addressed blob cache.
    pub file_cache: Arc<dyn FileCache>,
    /// The metadata graph of this instant.
    pub graph: Arc<MetadataGraph>,
    /// The analyzer catalog, in user-visible order.
    pub catalog: Arc<AnalyzerCatalog>,
    /// The analysis metrics sink.
    pub metrics: Arc<dyn MetricsSink>,
}

impl Snapshot {
    /// Creates the initial snapshot of a session.
    pub fn new(inputs: SnapshotInputs) -> Arc<Self> {
        let parallelism = inputs.opts.effective_parallelism();
        let cache_writers = inputs.opts.cache_writers.max(1);
        let ctx = Arc::new(EvalCtx {
            graph: inputs.graph,
            file_source: inputs.file_source,
            frontend: inputs.frontend,
            file_cache: inputs.file_cache,
            parse_cache: Arc::new(ParseCache::default()),
            opts: inputs.opts,
            packages: Arc::new(Mutex::new(PackageMap::default())),
            cpu: Arc::new(Semaphore::new(parallelism)),
            cache_writes: Arc::new(Semaphore::new(cache_writers)),
        });
        Arc::new(Self {
            ctx,
            catalog: inputs.catalog,
            metrics: inputs.metrics,
            index: PackageIndex::global(),
            analysis: Arc::new(AnalysisShared::new()),
            batch_slot: Mutex::new(Weak::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// The metadata graph of this snapshot.
    pub fn graph(&self) -> &Arc<MetadataGraph> {
        &self.ctx.graph
    }

    /// The published handle of a package, if any query evaluated it.
    pub fn package_handle(&self, id: &PackageId) -> Option<Arc<PackageHandle>> {
        self.ctx.packages.lock().get(id).cloned()
    }

    fn acquire_batch(&self) -> Arc<TypeCheckBatch> {
        let mut slot = self.batch_slot.lock();
        if let Some(batch) = slot.upgrade() {
            return batch;
        }
        let batch = TypeCheckBatch::new(self.ctx.clone());
        *slot = Arc::downgrade(&batch);
        batch
    }

    fn check_alive(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Type-checks the given packages and returns their syntax packages,
    /// in request order.
    pub async fn type_check(
        &self,
        cancel: &CancellationToken,
        ids: &[PackageId],
    ) -> Result<Vec<Arc<Package>>> {
        self.check_alive()?;
        let handles = handle::evaluate_handles(&self.ctx, cancel, ids).await?;
        let batch = self.acquire_batch();
        batch.add_handles(&handles);

        let checks = ids
            .iter()
            .map(|id| batch.clone().get_package(cancel.clone(), id.clone()));
        futures::future::try_join_all(checks).await
    }

    /// Runs the analyzer sets over the given roots and returns the flat
    /// diagnostic list.
    pub async fn analyze(
        &self,
        cancel: &CancellationToken,
        ids: &[PackageId],
        reporter: Option<Box<dyn FnMut(usize, usize) + Send>>,
    ) -> Result<Vec<Diagnostic>> {
        self.check_alive()?;
        let handles = handle::evaluate_handles(&self.ctx, cancel, ids).await?;
        let batch = self.acquire_batch();
        batch.add_handles(&handles);

        let driver = Arc::new(AnalysisDriver {
            ctx: self.ctx.clone(),
            batch,
            shared: self.analysis.clone(),
            metrics: self.metrics.clone(),
            plan: self.catalog.plan(&self.ctx.opts),
        });
        driver.analyze(cancel, &handles, ids, reporter).await
    }

    /// Extracts package-level symbols, in request order.
    pub async fn symbols(
        &self,
        cancel: &CancellationToken,
        ids: &[PackageId],
    ) -> Result<Vec<Arc<SymbolPackage>>> {
        self.check_alive()?;
        let handles = handle::evaluate_handles(&self.ctx, cancel, ids).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let handle = handles
                .get(id)
                .ok_or_else(|| error_once!("requested package not evaluated", id: id))?;
            out.push(symbols::package_symbols(&self.ctx, handle)?);
        }
        Ok(out)
    }

    /// The glob patterns of files that, when changed, require cloning the
    /// snapshot.
    pub fn file_watching_globs(&self) -> Vec<EcoString> {
        self.ctx
            .graph
            .packages()
            .flat_map(|pkg| pkg.checked_files())
            .filter_map(|uri| uri.as_str().rsplit_once('.').map(|(_, ext)| ext))
            .sorted_unstable()
            .dedup()
            .map(|ext| ecow::eco_format!("**/*.{ext}"))
            .collect()
    }

    /// Derives the next snapshot from a set of changes.
    ///
    /// Packages whose files changed regress to `ValidMetadata`; their
    /// reverse-transitive importers and packages whose metadata changed
    /// shape regress to `ValidLocalData`, so their keys are reconsidered
    /// against the fresh dependency keys. All other handles are shared by
    /// reference, so `clone_with` of no changes is handle-for-handle
    /// pointer-equal.
    pub fn clone_with(&self, changes: SnapshotChanges) -> Arc<Snapshot> {
        let graph = changes.graph.unwrap_or_else(|| self.ctx.graph.clone());

        // The set of packages owning a changed file, as interned indices.
        let mut invalidated = IdSet::default();
        let mut queue: Vec<PackageId> = Vec::new();
        for uri in &changes.files {
            for id in graph.ids_by_uri(uri) {
                if invalidated.insert(self.index.intern(id)) {
                    queue.push(id.clone());
                }
            }
        }

        // An edited package may shift the key of everything importing it.
        let mut key_stale = IdSet::default();
        while let Some(id) = queue.pop() {
            for importer in graph.importers(&id) {
                let idx = self.index.intern(importer);
                if !invalidated.contains(idx) && key_stale.insert(idx) {
                    queue.push(importer.clone());
                }
            }
        }

        let old_packages = self.ctx.packages.lock().clone();
        let mut packages = old_packages.clone();
        let mut evicted = IdSet::default();
        for (id, handle) in old_packages.iter() {
            let Some(meta) = graph.package(id) else {
                // The package disappeared from the workspace.
                packages.remove_mut(id);
                evicted.insert(self.index.intern(id));
                continue;
            };
            let idx = self.index.intern(id);
            if invalidated.contains(idx) {
                packages.insert_mut(id.clone(), Arc::new(handle.invalidated_files(meta.clone())));
                evicted.insert(idx);
            } else if meta.as_ref() != handle.meta.as_ref() {
                packages.insert_mut(id.clone(), Arc::new(handle.invalidated_deps(meta.clone())));
                evicted.insert(idx);
            } else if key_stale.contains(idx) {
                packages.insert_mut(id.clone(), Arc::new(handle.invalidated_deps(meta.clone())));
            }
        }

        let ctx = Arc::new(EvalCtx {
            graph,
            file_source: self.ctx.file_source.clone(),
            frontend: self.ctx.frontend.clone(),
            file_cache: self.ctx.file_cache.clone(),
            parse_cache: self.ctx.parse_cache.clone(),
            opts: self.ctx.opts.clone(),
            packages: Arc::new(Mutex::new(packages)),
            cpu: self.ctx.cpu.clone(),
            cache_writes: self.ctx.cache_writes.clone(),
        });
        let index = self.index;
        let analysis = self
            .analysis
            .inherit(&|id: &PackageId| evicted.contains(index.intern(id)));

        Arc::new(Self {
            ctx,
            catalog: self.catalog.clone(),
            metrics: self.metrics.clone(),
            index,
            analysis: Arc::new(analysis),
            batch_slot: Mutex::new(Weak::new()),
            cancel: CancellationToken::new(),
        })
    }
}
