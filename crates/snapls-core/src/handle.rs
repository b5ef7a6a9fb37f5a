//! Package handles: the per-snapshot state machine carrying a package's
//! inputs, derivations, and cache key, plus the bottom-up evaluation that
//! advances handles to `ValidKey`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use ecow::EcoString;
use parking_lot::Mutex;
use rpds::RedBlackTreeMapSync;
use snapls_std::error::prelude::*;
use snapls_std::hash::{Digest, DigestSink, FxHashMap};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::Package;
use crate::cache::{CacheKind, FileCache, ParseCache};
use crate::config::EngineOpts;
use crate::diag::Diagnostic;
use crate::frontend::{Frontend, ParseMode, ParsedFile, TypesPackage};
use crate::id::{ImportPath, PackageId, PackageName, PackagePath, PathBloom};
use crate::metadata::{MetadataGraph, MetadataPackage};
use crate::typerefs::{self, PackageRefs, TransitiveRefs};
use crate::vfs::{FileHandle, FileSource, Uri};

/// Bump on any change to the canonical encoding of [`TypeCheckInputs`].
const INPUTS_GENERATION: u64 = 3;

/// How far a handle's derived data is valid.
///
/// Within a snapshot a handle only advances. Across a clone boundary it may
/// regress, but never below `ValidMetadata`; regressed handles keep their
/// stale derivations so re-evaluation can detect what actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandleState {
    /// Only the metadata reference is valid.
    ValidMetadata,
    /// Local inputs, local key, references, and load diagnostics are valid.
    ValidLocalData,
    /// The transitive cache key and reachable set are valid.
    ValidKey,
    /// Parsed files and import packages are valid; the type-checked package
    /// is not.
    ValidImports,
    /// The full type-checked package is valid.
    ValidPackage,
}

/// The full, unambiguous encoding of every input that can affect the type
/// check of one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCheckInputs {
    /// The package id.
    pub id: PackageId,
    /// The package path.
    pub pkg_path: PackagePath,
    /// The package name.
    pub name: PackageName,
    /// The compiled files, in metadata order, with content digests.
    pub compiled_files: Vec<(Uri, Digest)>,
    /// The authored files, in metadata order, with content digests.
    pub go_files: Vec<(Uri, Digest)>,
    /// Direct dependencies in canonical order.
    pub deps_by_imp_path: BTreeMap<ImportPath, PackageId>,
    /// The platform word size in bytes.
    pub word_size: u64,
    /// The platform maximum alignment in bytes.
    pub max_align: u64,
    /// The language version string.
    pub language_version: EcoString,
    /// The view-type tag of the owning snapshot.
    pub view_kind: EcoString,
    /// The diagnostic link-target template.
    pub link_target: EcoString,
    /// Whether diagnostics carry related information.
    pub related_information: bool,
}

impl TypeCheckInputs {
    /// The local cache key: a digest of the canonical encoding.
    pub fn digest(&self) -> Digest {
        let mut sink = DigestSink::with_domain("typecheck-inputs");
        sink.u64(INPUTS_GENERATION);
        sink.str(self.id.as_str());
        sink.str(self.pkg_path.as_str());
        sink.str(self.name.as_str());
        sink.u64(self.compiled_files.len() as u64);
        for (uri, digest) in &self.compiled_files {
            sink.str(uri.as_str());
            sink.digest(digest);
        }
        sink.u64(self.go_files.len() as u64);
        for (uri, digest) in &self.go_files {
            sink.str(uri.as_str());
            sink.digest(digest);
        }
        sink.u64(self.deps_by_imp_path.len() as u64);
        for (imp_path, id) in &self.deps_by_imp_path {
            sink.str(imp_path.as_str());
            sink.str(id.as_str());
        }
        sink.u64(self.word_size);
        sink.u64(self.max_align);
        sink.str(&self.language_version);
        sink.str(&self.view_kind);
        sink.str(&self.link_target);
        sink.u64(self.related_information as u64);
        sink.finish()
    }
}

/// Everything derived from the package's own files.
#[derive(Debug)]
pub struct LocalData {
    /// The type-check input record.
    pub inputs: Arc<TypeCheckInputs>,
    /// `H(inputs)`.
    pub local_key: Digest,
    /// The symbol reference summary.
    pub refs: Arc<PackageRefs>,
    /// Diagnostics reported by the loader for this package.
    pub load_diags: Arc<[Diagnostic]>,
    /// Whether any file of the package is an editor overlay.
    pub open_in_editor: bool,
    /// The file handles backing `inputs`, checked files first.
    pub files: Arc<[FileHandle]>,
}

/// Everything derived from the package's position in the graph.
#[derive(Debug)]
pub struct KeyData {
    /// The transitive cache key:
    /// `H(localKey || sorted(reachable packages' localKey))`.
    pub key: Digest,
    /// The cache key of every direct dependency at derivation time.
    pub dep_keys: Arc<BTreeMap<PackageId, Digest>>,
    /// A fast membership test over the reachable package paths.
    pub reachable: Arc<PathBloom>,
}

/// Parse and type-check results retained on a handle.
#[derive(Clone)]
pub struct PkgData {
    /// The parsed compiled files, sharing one position address space.
    pub files: Arc<[Arc<ParsedFile>]>,
    /// The resolved import packages.
    pub imports: Arc<FxHashMap<ImportPath, Arc<TypesPackage>>>,
    /// The full type-checked package; `None` leaves the handle at
    /// `ValidImports`.
    pub pkg: Option<Arc<Package>>,
}

/// A per-snapshot node carrying a package's inputs and derivations.
///
/// Immutable once published; invalidation and re-evaluation produce new
/// handles. Fields beyond `state` hold the previous snapshot's values and
/// are compared against during re-evaluation.
pub struct PackageHandle {
    /// The metadata record of the package.
    pub meta: Arc<MetadataPackage>,
    /// How far the derived fields are valid.
    pub state: HandleState,
    /// Valid at `ValidLocalData` and above.
    pub local: Option<Arc<LocalData>>,
    /// Valid at `ValidKey` and above.
    pub keyd: Option<Arc<KeyData>>,
    /// Valid at `ValidImports` and above.
    pub pkg_data: Option<PkgData>,
}

impl PackageHandle {
    /// A fresh handle carrying only metadata.
    pub fn new(meta: Arc<MetadataPackage>) -> Self {
        Self {
            meta,
            state: HandleState::ValidMetadata,
            local: None,
            keyd: None,
            pkg_data: None,
        }
    }

    /// The transitive cache key, if the handle is at `ValidKey` or above.
    pub fn key(&self) -> Option<Digest> {
        if self.state < HandleState::ValidKey {
            return None;
        }
        self.keyd.as_ref().map(|keyd| keyd.key)
    }

    /// The local cache key, if the handle is at `ValidLocalData` or above.
    pub fn local_key(&self) -> Option<Digest> {
        if self.state < HandleState::ValidLocalData {
            return None;
        }
        self.local.as_ref().map(|local| local.local_key)
    }

    /// The local data, if valid.
    pub fn local_data(&self) -> Option<&Arc<LocalData>> {
        (self.state >= HandleState::ValidLocalData)
            .then_some(self.local.as_ref())
            .flatten()
    }

    /// The key data, if valid.
    pub fn key_data(&self) -> Option<&Arc<KeyData>> {
        (self.state >= HandleState::ValidKey)
            .then_some(self.keyd.as_ref())
            .flatten()
    }

    /// The type-checked package, if the handle is at `ValidPackage`.
    pub fn package(&self) -> Option<&Arc<Package>> {
        if self.state < HandleState::ValidPackage {
            return None;
        }
        self.pkg_data.as_ref().and_then(|data| data.pkg.as_ref())
    }

    /// Regresses the handle after its files changed: derived data must be
    /// re-read, but stays around for change detection.
    pub(crate) fn invalidated_files(&self, meta: Arc<MetadataPackage>) -> Self {
        Self {
            meta,
            state: HandleState::ValidMetadata,
            local: self.local.clone(),
            keyd: self.keyd.clone(),
            pkg_data: self.pkg_data.clone(),
        }
    }

    /// Regresses the handle after its metadata changed shape: local data
    /// still good, key must be reconsidered.
    pub(crate) fn invalidated_deps(&self, meta: Arc<MetadataPackage>) -> Self {
        Self {
            meta,
            state: self.state.min(HandleState::ValidLocalData),
            local: self.local.clone(),
            keyd: self.keyd.clone(),
            pkg_data: self.pkg_data.clone(),
        }
    }
}

/// The copy-on-write package map of a snapshot.
pub(crate) type PackageMap = RedBlackTreeMapSync<PackageId, Arc<PackageHandle>>;

/// Shared references the handle evaluation needs from its snapshot.
pub(crate) struct EvalCtx {
    pub graph: Arc<MetadataGraph>,
    pub file_source: Arc<dyn FileSource>,
    pub frontend: Arc<dyn Frontend>,
    pub file_cache: Arc<dyn FileCache>,
    pub parse_cache: Arc<ParseCache>,
    pub opts: Arc<EngineOpts>,
    pub packages: Arc<Mutex<PackageMap>>,
    /// Gates CPU-bound work. Acquired inside each task, after its
    /// dependencies completed.
    pub cpu: Arc<Semaphore>,
    /// Bounds concurrent disk-cache writers.
    pub cache_writes: Arc<Semaphore>,
}

struct EvalNode {
    meta: Arc<MetadataPackage>,
    succs: Vec<Arc<EvalNode>>,
    preds: Mutex<Vec<Weak<EvalNode>>>,
    unfinished_succs: AtomicUsize,
    ph: OnceLock<Arc<PackageHandle>>,
}

impl EvalNode {
    fn id(&self) -> &PackageId {
        &self.meta.id
    }

    fn handle(&self) -> Result<&Arc<PackageHandle>> {
        self.ph
            .get()
            .ok_or_else(|| error_once!("dependency handle not evaluated", id: self.meta.id))
    }
}

/// Returns fully evaluated handles (state at least `ValidKey`) for the
/// roots and every transitive dependency, reusing prior handles where
/// still valid.
pub(crate) async fn evaluate_handles(
    ctx: &Arc<EvalCtx>,
    cancel: &CancellationToken,
    roots: &[PackageId],
) -> Result<FxHashMap<PackageId, Arc<PackageHandle>>> {
    // Pass 1: structure, in one locked section.
    let mut nodes: FxHashMap<PackageId, Arc<EvalNode>> = FxHashMap::default();
    for root in roots {
        build_node(ctx, root, &mut nodes)?;
    }
    let leaves: Vec<Arc<EvalNode>> = nodes
        .values()
        .filter(|node| node.unfinished_succs.load(Ordering::SeqCst) == 0)
        .cloned()
        .collect();

    // Pass 2: evaluate bottom-up in parallel. Every ready node is spawned
    // immediately; parallelism is gated by the CPU semaphore inside the
    // task, never by capping enqueues, which would deadlock on wide waves.
    let mut tasks: JoinSet<(Arc<EvalNode>, Result<Arc<PackageHandle>>)> = JoinSet::new();
    let spawn = |tasks: &mut JoinSet<_>, node: Arc<EvalNode>| {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let result = evaluate(&ctx, &cancel, &node).await;
            (node, result)
        });
    };
    for leaf in leaves {
        spawn(&mut tasks, leaf);
    }

    let mut first_err: Option<snapls_std::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        let (node, result) = joined.map_err(map_string_err("evaluate_handles"))?;
        match result {
            Ok(handle) => {
                let _ = node.ph.set(handle);
                if first_err.is_some() {
                    continue;
                }
                for pred in node.preds.lock().iter() {
                    let Some(pred) = pred.upgrade() else { continue };
                    if pred.unfinished_succs.fetch_sub(1, Ordering::SeqCst) == 1 {
                        spawn(&mut tasks, pred);
                    }
                }
            }
            Err(err) => {
                // Record the first failure and drain remaining tasks.
                first_err.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }

    let mut out = FxHashMap::default();
    for (id, node) in nodes {
        out.insert(id, node.handle()?.clone());
    }
    Ok(out)
}

fn build_node(
    ctx: &Arc<EvalCtx>,
    id: &PackageId,
    nodes: &mut FxHashMap<PackageId, Arc<EvalNode>>,
) -> Result<Arc<EvalNode>> {
    if let Some(node) = nodes.get(id) {
        return Ok(node.clone());
    }
    let meta = ctx
        .graph
        .package(id)
        .ok_or_else(|| error_once!("no metadata for package", id: id))?
        .clone();

    let mut succs = Vec::new();
    for dep in meta.dep_ids() {
        let dep = dep.clone();
        succs.push(build_node(ctx, &dep, nodes)?);
    }

    let node = Arc::new(EvalNode {
        unfinished_succs: AtomicUsize::new(succs.len()),
        succs,
        meta,
        preds: Mutex::new(Vec::new()),
        ph: OnceLock::new(),
    });
    for succ in &node.succs {
        succ.preds.lock().push(Arc::downgrade(&node));
    }
    nodes.insert(id.clone(), node.clone());
    Ok(node)
}

/// Advances one handle to `ValidKey` or above. All successors of the node
/// have been evaluated.
async fn evaluate(
    ctx: &Arc<EvalCtx>,
    cancel: &CancellationToken,
    node: &Arc<EvalNode>,
) -> Result<Arc<PackageHandle>> {
    if cancel.is_cancelled() {
        return Err(snapls_std::Error::cancelled());
    }
    let _permit = ctx
        .cpu
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| snapls_std::Error::cancelled())?;

    let prior = ctx.packages.lock().get(node.id()).cloned();
    if let Some(prior) = &prior {
        if prior.state >= HandleState::ValidKey {
            return Ok(prior.clone());
        }
    }

    let mut handle = match prior {
        Some(prior) => PackageHandle {
            meta: node.meta.clone(),
            state: prior.state,
            local: prior.local.clone(),
            keyd: prior.keyd.clone(),
            pkg_data: prior.pkg_data.clone(),
        },
        None => PackageHandle::new(node.meta.clone()),
    };

    // Local-data step.
    let prev_local_key = handle.local.as_ref().map(|local| local.local_key);
    if handle.state < HandleState::ValidLocalData {
        let local = compute_local_data(ctx, &handle.meta)?;
        handle.local = Some(Arc::new(local));
        handle.state = HandleState::ValidLocalData;
    }
    let local = handle
        .local
        .clone()
        .ok_or_else(|| error_once!("local data missing after evaluation", id: node.meta.id))?;
    let local_key_changed = prev_local_key != Some(local.local_key);

    // Deps-changed check against the previous key derivation.
    let prev_keyd = handle.keyd.clone();
    let deps_changed = match &prev_keyd {
        None => true,
        Some(keyd) => {
            keyd.dep_keys.len() != node.succs.len()
                || node.succs.iter().any(|succ| {
                    let succ_key = succ.ph.get().and_then(|handle| handle.key());
                    keyd.dep_keys.get(succ.id()).copied() != succ_key || succ_key.is_none()
                })
        }
    };

    let key_changed;
    if !local_key_changed && !deps_changed && handle.state >= HandleState::ValidLocalData {
        // Nothing feeding the key moved; keep it.
        key_changed = false;
        handle.state = HandleState::ValidKey;
    } else {
        let keyd = compute_key_data(ctx, node, &local)?;
        key_changed = prev_keyd.as_ref().map(|prev| prev.key) != Some(keyd.key);
        handle.keyd = Some(Arc::new(keyd));
        handle.state = HandleState::ValidKey;
    }

    // Partial validation of retained parse and type-check results.
    match handle.pkg_data.take() {
        Some(data) if !key_changed && data.pkg.is_some() => {
            handle.pkg_data = Some(data);
            handle.state = HandleState::ValidPackage;
        }
        Some(mut data) if !deps_changed => {
            data.pkg = None;
            handle.pkg_data = Some(data);
            handle.state = HandleState::ValidImports;
        }
        _ => {}
    }

    Ok(publish(ctx, Arc::new(handle)))
}

/// Publishes a handle into the snapshot's package map. If a racing worker
/// published an equal-or-higher state for the same id, adopt theirs.
pub(crate) fn publish(ctx: &EvalCtx, handle: Arc<PackageHandle>) -> Arc<PackageHandle> {
    let mut packages = ctx.packages.lock();
    let id = handle.meta.id.clone();
    if let Some(existing) = packages.get(&id) {
        if existing.state >= handle.state {
            return existing.clone();
        }
    }
    packages.insert_mut(id, handle.clone());
    handle
}

fn compute_local_data(ctx: &EvalCtx, meta: &MetadataPackage) -> Result<LocalData> {
    let mut handles: FxHashMap<Uri, FileHandle> = FxHashMap::default();
    for uri in meta.checked_files() {
        // A read failure here is fatal: the whole request fails.
        let handle = ctx.file_source.read_file(uri).map_err(wrap_err("readFile"))?;
        handles.insert(uri.clone(), handle);
    }

    let file_digests = |uris: &[Uri]| -> Vec<(Uri, Digest)> {
        uris.iter()
            .filter_map(|uri| handles.get(uri).map(|handle| (uri.clone(), handle.digest)))
            .collect()
    };
    let inputs = Arc::new(TypeCheckInputs {
        id: meta.id.clone(),
        pkg_path: meta.pkg_path.clone(),
        name: meta.name.clone(),
        compiled_files: file_digests(&meta.compiled_go_files),
        go_files: file_digests(&meta.go_files),
        deps_by_imp_path: meta.deps_by_imp_path.clone(),
        word_size: meta.types_sizes.word_size,
        max_align: meta.types_sizes.max_align,
        language_version: ctx.opts.language_version.clone(),
        view_kind: ctx.opts.view_kind.clone(),
        link_target: ctx.opts.link_target.clone(),
        related_information: ctx.opts.related_information,
    });
    let local_key = inputs.digest();

    let refs = compute_or_cached_refs(ctx, meta, &inputs.compiled_files, &handles);

    let open_in_editor = handles.values().any(|handle| handle.open_in_editor);
    let files: Vec<FileHandle> = meta
        .checked_files()
        .filter_map(|uri| handles.get(uri).cloned())
        .collect();

    Ok(LocalData {
        inputs,
        local_key,
        refs,
        load_diags: meta.errors.clone().into(),
        open_in_editor,
        files: files.into(),
    })
}

/// Computes the reference summary, going through the typerefs cache.
fn compute_or_cached_refs(
    ctx: &EvalCtx,
    meta: &MetadataPackage,
    compiled_files: &[(Uri, Digest)],
    handles: &FxHashMap<Uri, FileHandle>,
) -> Arc<PackageRefs> {
    let key = typerefs::refs_key(&ctx.graph, meta, compiled_files);
    if let Some(bytes) = ctx.file_cache.get(CacheKind::TypeRefs, &key) {
        if let Some(refs) = typerefs::decode_refs(&bytes) {
            return Arc::new(refs);
        }
        // Malformed bytes read as a miss.
        log::warn!("malformed typerefs entry for {}", meta.id);
    }

    let files: Vec<FileHandle> = compiled_files
        .iter()
        .filter_map(|(uri, _)| handles.get(uri).cloned())
        .collect();
    let parsed = ctx
        .parse_cache
        .parse(ctx.frontend.as_ref(), &files, ParseMode::Header);
    let refs = Arc::new(typerefs::compute_refs(meta, &parsed));

    let encoded = typerefs::encode_refs(&refs);
    spawn_cache_write(ctx, CacheKind::TypeRefs, key, encoded);
    refs
}

fn compute_key_data(ctx: &EvalCtx, node: &EvalNode, local: &LocalData) -> Result<KeyData> {
    // The reachable set: for each successor s, {s} plus everything
    // reachable from any exported name of s.
    let packages = ctx.packages.lock().clone();
    let refs_of = |id: &PackageId| -> Option<Arc<PackageRefs>> {
        match packages.get(id).and_then(|handle| handle.local_data()) {
            Some(local) => Some(local.refs.clone()),
            None => {
                // Inconsistent metadata; the key deliberately incorporates
                // whatever packages are present.
                log::warn!("reachable package {id} has no evaluated local data");
                None
            }
        }
    };

    let mut closure = TransitiveRefs::new(refs_of);
    let mut reachable: Vec<PackageId> = Vec::new();
    let mut dep_keys = BTreeMap::new();
    for succ in &node.succs {
        let succ_handle = succ.handle()?;
        let succ_key = succ_handle
            .key()
            .ok_or_else(|| error_once!("successor below ValidKey", id: succ.meta.id))?;
        dep_keys.insert(succ.id().clone(), succ_key);
        reachable.extend(closure.reachable_through(succ.id()));
    }
    reachable.sort();
    reachable.dedup();

    let mut sink = DigestSink::with_domain("package-key");
    sink.digest(&local.local_key);
    for id in &reachable {
        if let Some(reached_local) = packages.get(id).and_then(|handle| handle.local_key()) {
            sink.digest(&reached_local);
        }
    }
    let key = sink.finish();

    let paths = typerefs::reachable_paths(&ctx.graph, reachable.into_iter());
    let reachable = PathBloom::new(paths.iter());

    Ok(KeyData {
        key,
        dep_keys: Arc::new(dep_keys),
        reachable: Arc::new(reachable),
    })
}

/// Queues an asynchronous, bounded cache write. Only fully computed values
/// arrive here; cancellation never leaves a torn entry behind.
pub(crate) fn spawn_cache_write(ctx: &EvalCtx, kind: CacheKind, key: Digest, value: Vec<u8>) {
    let cache = ctx.file_cache.clone();
    let sem = ctx.cache_writes.clone();
    tokio::spawn(async move {
        let Ok(_permit) = sem.acquire_owned().await else {
            return;
        };
        if let Err(err) = cache.set(kind, &key, &value) {
            log::warn!("cache write failed for {kind:?}/{key:?}: {err}");
        }
    });
}
