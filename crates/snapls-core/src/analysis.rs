//! The analysis driver: a per-request DAG over the snapshot's packages,
//! running enabled analyzers on roots and facty analyzers on dependencies,
//! bottom-up, with summaries cached by content-addressed keys.

pub mod facts;
pub mod summary;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rpds::RedBlackTreeMapSync;
use snapls_std::error::prelude::*;
use snapls_std::hash::{Digest, DigestSink, FxHashMap};
use snapls_std::ImmutBytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::{Package, TypeCheckBatch};
use crate::cache::{CacheKind, FileCache as _, Flavor, FutureCache};
use crate::config::EngineOpts;
use crate::diag::Diagnostic;
use crate::handle::{self, EvalCtx, PackageHandle};
use crate::id::{PackageId, PackagePath};
use crate::stats::MetricsSink;
use crate::vfs::Uri;

pub use facts::{FactKey, FactSet};
pub use summary::{ActionSummary, AnalyzeSummary};

/// Bump on any change to the node-key derivation.
const ANALYSIS_GENERATION: u64 = 5;

/// The defining source location of an analyzer, the process-independent
/// part of its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLoc {
    /// The file declaring the analyzer.
    pub file: &'static str,
    /// The declaration line.
    pub line: u32,
}

/// Captures the current source location.
#[macro_export]
macro_rules! source_loc {
    () => {
        $crate::analysis::SourceLoc {
            file: file!(),
            line: line!(),
        }
    };
}

/// A static analyzer.
///
/// Analyzers are registered as `&'static` values; identity is by address,
/// and the [stable name](Self::stable_name) identifies an analyzer across
/// processes and shared-cache generations.
pub struct Analyzer {
    /// The short name, not necessarily unique.
    pub name: &'static str,
    /// One-line documentation.
    pub doc: &'static str,
    /// The documentation URL template.
    pub url: &'static str,
    /// Analyzers whose results this one consumes.
    pub requires: &'static [&'static Analyzer],
    /// Whether the analyzer exports facts consumed by importing packages.
    pub produces_facts: bool,
    /// Whether the analyzer runs on packages that do not compile.
    pub run_despite_errors: bool,
    /// Whether the analyzer is on unless the user disables it.
    pub enabled_by_default: bool,
    /// The defining source location.
    pub loc: SourceLoc,
    /// The analyzer body. The result is retrieved by dependents through
    /// [`Pass::result_of`]; its type is fixed per analyzer, so a mismatch
    /// is a bug in the dependent, not a runtime validation concern.
    pub run: fn(&mut Pass) -> Result<Arc<dyn Any + Send + Sync>>,
}

impl Analyzer {
    /// The process-independent identifier, unique even when two analyzers
    /// share a short name.
    pub fn stable_name(&self) -> String {
        format!("{}({}:{})", self.name, self.loc.file, self.loc.line)
    }
}

impl std::fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyzer")
            .field("name", &self.name)
            .field("loc", &self.loc)
            .finish()
    }
}

fn contains(set: &[&'static Analyzer], a: &'static Analyzer) -> bool {
    set.iter().any(|b| std::ptr::eq(*b, a))
}

/// Extends a set with the transitive `requires` closure of its members,
/// preserving order.
fn close_over_requires(mut set: Vec<&'static Analyzer>) -> Vec<&'static Analyzer> {
    let mut cursor = 0;
    while cursor < set.len() {
        let a = set[cursor];
        cursor += 1;
        for req in a.requires {
            if !contains(&set, req) {
                set.push(req);
            }
        }
    }
    set
}

/// The ordered list of analyzers known to the engine.
pub struct AnalyzerCatalog {
    analyzers: Vec<&'static Analyzer>,
}

/// The analyzer sets of one request.
pub(crate) struct AnalysisPlan {
    /// Analyzers the user actually asked for; diagnostic extraction reads
    /// only these.
    pub requested: Vec<&'static Analyzer>,
    /// `requested` plus the transitive requirements; roots run these.
    pub enabled: Vec<&'static Analyzer>,
    /// The fact-producing subset plus its requirements; dependencies run
    /// these. Always a subset of `enabled`.
    pub facty: Vec<&'static Analyzer>,
}

impl AnalyzerCatalog {
    /// Creates a catalog in user-visible order.
    pub fn new(analyzers: Vec<&'static Analyzer>) -> Self {
        Self { analyzers }
    }

    /// The analyzers of the catalog, in order.
    pub fn analyzers(&self) -> &[&'static Analyzer] {
        &self.analyzers
    }

    pub(crate) fn plan(&self, opts: &EngineOpts) -> AnalysisPlan {
        let requested: Vec<&'static Analyzer> = self
            .analyzers
            .iter()
            .copied()
            .filter(|a| {
                opts.analyzers
                    .get(a.name)
                    .copied()
                    .unwrap_or(a.enabled_by_default)
            })
            .collect();
        let enabled = close_over_requires(requested.clone());
        let facty = close_over_requires(
            enabled
                .iter()
                .copied()
                .filter(|a| a.produces_facts)
                .collect(),
        );
        AnalysisPlan {
            requested,
            enabled,
            facty,
        }
    }
}

/// The key memo of one package under one analyzer set.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyMemo {
    pub handle_key: Digest,
    pub node_key: Digest,
}

type KeyMap = RedBlackTreeMapSync<PackageId, KeyMemo>;

/// Analysis state shared by every query of one snapshot.
pub(crate) struct AnalysisShared {
    /// Deduplicates concurrent identical analyses across queries.
    /// Ephemeral: cancellations retry.
    pub futs: FutureCache<Digest, Arc<AnalyzeSummary>>,
    /// Node keys of root (full analyzer set) nodes.
    pub full_keys: Mutex<KeyMap>,
    /// Node keys of dependency (facty analyzer set) nodes.
    pub facty_keys: Mutex<KeyMap>,
}

impl AnalysisShared {
    pub fn new() -> Self {
        Self {
            futs: FutureCache::new(Flavor::Ephemeral),
            full_keys: Mutex::new(KeyMap::default()),
            facty_keys: Mutex::new(KeyMap::default()),
        }
    }

    /// A clone for a derived snapshot, evicting invalidated packages.
    pub fn inherit(&self, evict: &dyn Fn(&PackageId) -> bool) -> Self {
        let filter = |map: &Mutex<KeyMap>| {
            let mut out = map.lock().clone();
            let stale: Vec<PackageId> = out
                .keys()
                .filter(|id| evict(id))
                .cloned()
                .collect();
            for id in stale {
                out.remove_mut(&id);
            }
            out
        };
        Self {
            futs: FutureCache::new(Flavor::Ephemeral),
            full_keys: Mutex::new(filter(&self.full_keys)),
            facty_keys: Mutex::new(filter(&self.facty_keys)),
        }
    }
}

/// The API visible to one analyzer while it runs on one package.
pub struct Pass<'a> {
    analyzer: &'static Analyzer,
    pkg: &'a Arc<Package>,
    file_handles: &'a [crate::vfs::FileHandle],
    results: &'a FxHashMap<String, Arc<dyn Any + Send + Sync>>,
    facts: FactSet,
    diagnostics: Vec<Diagnostic>,
}

impl Pass<'_> {
    /// The package under analysis.
    pub fn package(&self) -> &Arc<Package> {
        self.pkg
    }

    /// Reads the raw content of a package file.
    pub fn read(&self, uri: &Uri) -> Option<ImmutBytes> {
        self.file_handles
            .iter()
            .find(|file| &file.uri == uri)
            .map(|file| file.content.clone())
    }

    /// Reports a diagnostic, attributed to this analyzer.
    pub fn report(&mut self, mut diag: Diagnostic) {
        diag.source = self.analyzer.name.into();
        if diag.code_href.is_none() && !self.analyzer.url.is_empty() {
            diag.code_href = Some(self.analyzer.url.into());
        }
        self.diagnostics.push(diag);
    }

    /// The typed result of a required analyzer on the same package.
    pub fn result_of<T: Any + Send + Sync>(&self, a: &'static Analyzer) -> Option<Arc<T>> {
        let result = self.results.get(&a.stable_name())?.clone();
        result.downcast().ok()
    }

    /// The fact set of this action.
    pub fn facts(&mut self) -> &mut FactSet {
        &mut self.facts
    }

    /// Reads facts without exporting.
    pub fn facts_ref(&self) -> &FactSet {
        &self.facts
    }
}

struct AnalysisNode {
    id: PackageId,
    pkg_path: PackagePath,
    handle: Arc<PackageHandle>,
    analyzers: Vec<&'static Analyzer>,
    is_root: bool,
    succs: Vec<Arc<AnalysisNode>>,
    preds: Mutex<Vec<Weak<AnalysisNode>>>,
    unfinished_succs: AtomicUsize,
    /// Guards summary retention; starts at `|preds| + 1` for roots so
    /// roots keep their summaries through result extraction.
    unfinished_preds: AtomicUsize,
    summary: Mutex<Option<Arc<AnalyzeSummary>>>,
    summary_hash: OnceLock<Digest>,
}

impl AnalysisNode {
    fn summary(&self) -> Option<Arc<AnalyzeSummary>> {
        self.summary.lock().clone()
    }

    fn hash(&self) -> Result<Digest> {
        self.summary_hash
            .get()
            .copied()
            .ok_or_else(|| error_once!("analysis dependency not finished", id: self.id))
    }

    /// Releases the bulk of the summary once no predecessor needs it.
    fn release(&self) {
        *self.summary.lock() = None;
    }
}

/// One analysis request.
pub(crate) struct AnalysisDriver {
    pub ctx: Arc<EvalCtx>,
    pub batch: Arc<TypeCheckBatch>,
    pub shared: Arc<AnalysisShared>,
    pub metrics: Arc<dyn MetricsSink>,
    pub plan: AnalysisPlan,
}

impl AnalysisDriver {
    /// Runs the request over the given roots and returns the flat
    /// diagnostic list, ordered by the user-visible analyzer order, then
    /// by diagnostic order as produced by each analyzer.
    pub async fn analyze(
        self: Arc<Self>,
        cancel: &CancellationToken,
        handles: &FxHashMap<PackageId, Arc<PackageHandle>>,
        roots: &[PackageId],
        mut reporter: Option<Box<dyn FnMut(usize, usize) + Send>>,
    ) -> Result<Vec<Diagnostic>> {
        let mut nodes: FxHashMap<PackageId, Arc<AnalysisNode>> = FxHashMap::default();
        for root in roots {
            self.make_node(handles, roots, &mut nodes, root)?;
        }
        link_counters(&nodes);

        // Bottom-up execution, leaves first; parallelism is gated inside
        // the batch and the CPU semaphore, never by capping enqueues.
        let mut tasks: JoinSet<(Arc<AnalysisNode>, Result<Arc<AnalyzeSummary>>)> = JoinSet::new();
        let spawn = |tasks: &mut JoinSet<_>, node: Arc<AnalysisNode>| {
            let driver = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = driver.run_node(&cancel, &node).await;
                (node, result)
            });
        };
        for node in nodes.values() {
            if node.unfinished_succs.load(Ordering::SeqCst) == 0 {
                spawn(&mut tasks, node.clone());
            }
        }

        let total = nodes.len();
        let mut completed = 0usize;
        let mut first_err: Option<snapls_std::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let (node, result) = joined.map_err(map_string_err("analyze"))?;
            completed += 1;
            if let Some(reporter) = reporter.as_mut() {
                reporter(completed, total);
            }
            match result {
                Ok(summary) => {
                    let _ = node.summary_hash.set(summary.summary_hash(&node.pkg_path));
                    *node.summary.lock() = Some(summary);
                    if first_err.is_none() {
                        for pred in node.preds.lock().iter() {
                            let Some(pred) = pred.upgrade() else { continue };
                            if pred.unfinished_succs.fetch_sub(1, Ordering::SeqCst) == 1 {
                                spawn(&mut tasks, pred);
                            }
                        }
                    }
                    // Drop dependency summaries nobody will read again.
                    for succ in &node.succs {
                        if succ.unfinished_preds.fetch_sub(1, Ordering::SeqCst) == 1 {
                            succ.release();
                        }
                    }
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        self.extract_diagnostics(&nodes, roots)
    }

    fn make_node(
        &self,
        handles: &FxHashMap<PackageId, Arc<PackageHandle>>,
        roots: &[PackageId],
        nodes: &mut FxHashMap<PackageId, Arc<AnalysisNode>>,
        id: &PackageId,
    ) -> Result<Arc<AnalysisNode>> {
        if let Some(node) = nodes.get(id) {
            return Ok(node.clone());
        }
        let handle = handles
            .get(id)
            .ok_or_else(|| error_once!("no handle for analyzed package", id: id))?
            .clone();

        let mut succs = Vec::new();
        for dep_id in handle.meta.deps_by_pkg_path.values() {
            let dep_id = dep_id.clone();
            succs.push(self.make_node(handles, roots, nodes, &dep_id)?);
        }

        let is_root = roots.contains(id);
        let analyzers = if is_root {
            self.plan.enabled.clone()
        } else {
            self.plan.facty.clone()
        };

        let node = Arc::new(AnalysisNode {
            id: id.clone(),
            pkg_path: handle.meta.pkg_path.clone(),
            handle,
            analyzers,
            is_root,
            unfinished_succs: AtomicUsize::new(succs.len()),
            succs,
            preds: Mutex::new(Vec::new()),
            unfinished_preds: AtomicUsize::new(0),
            summary: Mutex::new(None),
            summary_hash: OnceLock::new(),
        });
        for succ in &node.succs {
            succ.preds.lock().push(Arc::downgrade(&node));
        }
        nodes.insert(id.clone(), node.clone());
        Ok(node)
    }

    async fn run_node(
        self: Arc<Self>,
        cancel: &CancellationToken,
        node: &Arc<AnalysisNode>,
    ) -> Result<Arc<AnalyzeSummary>> {
        if cancel.is_cancelled() {
            return Err(snapls_std::Error::cancelled());
        }
        let key = self.node_key(node)?;

        if let Some(bytes) = self.ctx.file_cache.get(CacheKind::Analysis, &key) {
            if let Some(summary) = AnalyzeSummary::decode(&bytes) {
                return Ok(Arc::new(summary));
            }
            // Malformed bytes read as a miss.
            log::warn!("malformed analysis entry for {}", node.id);
        }

        let driver = self.clone();
        let node = node.clone();
        self.shared
            .futs
            .clone()
            .get(cancel, key, move |token| async move {
                driver.compute_node(token, node, key).await
            })
            .await
    }

    /// The per-node cache key: analyzer set, handle key, loader error
    /// count, and the combined summary hashes of the successors.
    fn node_key(&self, node: &AnalysisNode) -> Result<Digest> {
        let handle_key = node
            .handle
            .key()
            .ok_or_else(|| error_once!("analyzed handle below ValidKey", id: node.id))?;

        let memo_map = if node.is_root {
            &self.shared.full_keys
        } else {
            &self.shared.facty_keys
        };
        if let Some(memo) = memo_map.lock().get(&node.id) {
            if memo.handle_key == handle_key {
                return Ok(memo.node_key);
            }
        }

        let mut names: Vec<String> = node
            .analyzers
            .iter()
            .map(|a| a.stable_name())
            .collect();
        names.sort();

        let mut sink = DigestSink::with_domain("analysis-node");
        sink.u64(ANALYSIS_GENERATION);
        sink.u64(names.len() as u64);
        for name in &names {
            sink.str(name);
        }
        sink.digest(&handle_key);
        let loader_errors = node
            .handle
            .local_data()
            .map(|local| local.load_diags.len())
            .unwrap_or_default();
        sink.u64(loader_errors as u64);

        // Order-free combination of the dependency summaries.
        let mut acc = Digest::ZERO;
        for succ in &node.succs {
            acc = acc.xor(succ.hash()?);
        }
        sink.digest(&acc);
        let node_key = sink.finish();

        memo_map.lock().insert_mut(
            node.id.clone(),
            KeyMemo {
                handle_key,
                node_key,
            },
        );
        Ok(node_key)
    }

    async fn compute_node(
        self: Arc<Self>,
        cancel: CancellationToken,
        node: Arc<AnalysisNode>,
        key: Digest,
    ) -> Result<Arc<AnalyzeSummary>> {
        let pkg = self
            .batch
            .clone()
            .get_package(cancel.clone(), node.id.clone())
            .await?;

        let mut compiles = pkg.compiles_locally;
        for succ in &node.succs {
            let succ_summary = succ
                .summary()
                .ok_or_else(|| error_once!("dependency summary released early", id: succ.id))?;
            compiles &= succ_summary.compiles;
        }

        if cancel.is_cancelled() {
            return Err(snapls_std::Error::cancelled());
        }

        // Actions run in a horizontal bottom-up order per requires edges.
        let order = topo_by_requires(&node.analyzers);
        let mut results: FxHashMap<String, Arc<dyn Any + Send + Sync>> = FxHashMap::default();
        let mut actions: BTreeMap<String, ActionSummary> = BTreeMap::new();
        for analyzer in order {
            let stable = analyzer.stable_name();
            let (action, result) =
                self.exec_action(analyzer, &stable, &node, &pkg, compiles, &actions, &results)?;
            if let Some(result) = result {
                results.insert(stable.clone(), result);
            }
            actions.insert(stable, action);
        }

        let summary = Arc::new(AnalyzeSummary { compiles, actions });
        // Persist only after the whole node succeeded; a cancelled
        // computation must never leave a torn entry.
        handle::spawn_cache_write(&self.ctx, CacheKind::Analysis, key, summary.encode());
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_action(
        &self,
        analyzer: &'static Analyzer,
        stable: &str,
        node: &AnalysisNode,
        pkg: &Arc<Package>,
        compiles: bool,
        actions: &BTreeMap<String, ActionSummary>,
        results: &FxHashMap<String, Arc<dyn Any + Send + Sync>>,
    ) -> Result<(ActionSummary, Option<Arc<dyn Any + Send + Sync>>)> {
        if !analyzer.run_despite_errors && !compiles {
            return Ok((
                ActionSummary::failed("skipped: package does not compile"),
                None,
            ));
        }
        for req in analyzer.requires {
            let failed = actions
                .get(&req.stable_name())
                .is_some_and(|action| action.err.is_some());
            if failed {
                return Ok((
                    ActionSummary::failed(format!("failed prerequisite: {}", req.stable_name())),
                    None,
                ));
            }
        }

        // Gather facts exported by the same analyzer on dependency
        // packages, admitted through the reachable-paths filter.
        let mut fact_set = FactSet::default();
        if let Some(keyd) = node.handle.key_data() {
            let bloom = keyd.reachable.clone();
            for succ in &node.succs {
                let Some(succ_summary) = succ.summary() else {
                    continue;
                };
                match succ_summary.actions.get(stable) {
                    Some(dep_action) if dep_action.err.is_none() => {
                        fact_set.import(&dep_action.facts, |path| bloom.may_contain(path));
                    }
                    Some(_) => {
                        return Ok((
                            ActionSummary::failed(format!(
                                "failed prerequisite: {stable} on {}",
                                succ.pkg_path
                            )),
                            None,
                        ));
                    }
                    None => {}
                }
            }
        }

        let local_files = node
            .handle
            .local_data()
            .map(|local| local.files.clone())
            .unwrap_or_else(|| Arc::from(Vec::new()));
        let mut pass = Pass {
            analyzer,
            pkg,
            file_handles: &local_files[..],
            results,
            facts: fact_set,
            diagnostics: Vec::new(),
        };

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| (analyzer.run)(&mut pass)));
        self.metrics.analyzer_ran(stable, started.elapsed());

        let (action, result) = match outcome {
            Ok(Ok(value)) => {
                pass.facts.seal();
                let encoded = pass.facts.encode();
                let action = ActionSummary {
                    facts_hash: Digest::of(&encoded),
                    facts: encoded,
                    diagnostics: pass.diagnostics,
                    err: None,
                };
                (action, Some(value))
            }
            Ok(Err(err)) => (ActionSummary::failed(err.to_string()), None),
            // An analyzer panic fails its action; other analyzers on the
            // package still run and the query completes.
            Err(panic) => {
                let msg = panic_message(&panic);
                log::error!("analyzer {stable} panicked on {}: {msg}", node.pkg_path);
                (ActionSummary::failed(format!("panic: {msg}")), None)
            }
        };
        Ok((action, result))
    }

    fn extract_diagnostics(
        &self,
        nodes: &FxHashMap<PackageId, Arc<AnalysisNode>>,
        roots: &[PackageId],
    ) -> Result<Vec<Diagnostic>> {
        let mut out = Vec::new();
        for analyzer in &self.plan.requested {
            let stable = analyzer.stable_name();
            for root in roots {
                let Some(node) = nodes.get(root) else { continue };
                let summary = node
                    .summary()
                    .ok_or_else(|| error_once!("root summary released early", id: root))?;
                if let Some(action) = summary.actions.get(&stable) {
                    if action.err.is_none() {
                        out.extend(action.diagnostics.iter().cloned());
                    }
                }
            }
        }
        Ok(out)
    }
}

fn link_counters(nodes: &FxHashMap<PackageId, Arc<AnalysisNode>>) {
    for node in nodes.values() {
        let preds = node.preds.lock().len();
        let retained = preds + usize::from(node.is_root);
        node.unfinished_preds.store(retained, Ordering::SeqCst);
    }
}

/// Orders a requires-closed analyzer set so that every analyzer follows
/// its requirements, keeping the user-visible order otherwise.
fn topo_by_requires(analyzers: &[&'static Analyzer]) -> Vec<&'static Analyzer> {
    let mut placed: Vec<&'static Analyzer> = Vec::with_capacity(analyzers.len());
    let mut remaining: Vec<&'static Analyzer> = analyzers.to_vec();
    while !remaining.is_empty() {
        let mut progressed = false;
        let mut idx = 0;
        while idx < remaining.len() {
            let a = remaining[idx];
            let ready = a
                .requires
                .iter()
                .all(|req| contains(&placed, req) || !contains(analyzers, req));
            if ready {
                placed.push(a);
                remaining.remove(idx);
                progressed = true;
            } else {
                idx += 1;
            }
        }
        if !progressed {
            // A requires cycle is a registration bug; run the stragglers
            // in given order rather than spinning.
            log::error!("analyzer requires cycle among {remaining:?}");
            placed.extend(remaining.drain(..));
        }
    }
    placed
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Pass) -> Result<Arc<dyn Any + Send + Sync>> {
        Ok(Arc::new(()))
    }

    static BASE: Analyzer = Analyzer {
        name: "base",
        doc: "base analyzer",
        url: "",
        requires: &[],
        produces_facts: true,
        run_despite_errors: false,
        enabled_by_default: false,
        loc: SourceLoc {
            file: file!(),
            line: line!(),
        },
        run: noop,
    };

    static TOP: Analyzer = Analyzer {
        name: "top",
        doc: "depends on base",
        url: "",
        requires: &[&BASE],
        produces_facts: false,
        run_despite_errors: false,
        enabled_by_default: true,
        loc: SourceLoc {
            file: file!(),
            line: line!(),
        },
        run: noop,
    };

    #[test]
    fn test_plan_closes_over_requires() {
        let catalog = AnalyzerCatalog::new(vec![&BASE, &TOP]);
        let plan = catalog.plan(&EngineOpts::default());

        // Only `top` is requested, but `base` is pulled in transitively,
        // and being facty it runs on dependencies too.
        assert_eq!(plan.requested.len(), 1);
        assert!(contains(&plan.requested, &TOP));
        assert!(contains(&plan.enabled, &BASE));
        assert!(contains(&plan.facty, &BASE));
        assert!(!contains(&plan.facty, &TOP));
        // facty is a subset of enabled.
        assert!(plan.facty.iter().all(|a| contains(&plan.enabled, a)));
    }

    #[test]
    fn test_stable_names_distinguish_same_short_name() {
        static NILNESS_A: Analyzer = Analyzer {
            name: "nilness",
            doc: "",
            url: "",
            requires: &[],
            produces_facts: true,
            run_despite_errors: false,
            enabled_by_default: true,
            loc: SourceLoc {
                file: file!(),
                line: line!(),
            },
            run: noop,
        };
        static NILNESS_B: Analyzer = Analyzer {
            name: "nilness",
            doc: "",
            url: "",
            requires: &[],
            produces_facts: true,
            run_despite_errors: false,
            enabled_by_default: true,
            loc: SourceLoc {
                file: file!(),
                line: line!(),
            },
            run: noop,
        };
        assert_ne!(NILNESS_A.stable_name(), NILNESS_B.stable_name());
    }

    #[test]
    fn test_topo_respects_requires() {
        let order = topo_by_requires(&[&TOP, &BASE]);
        let base_pos = order.iter().position(|a| std::ptr::eq(*a, &BASE)).unwrap();
        let top_pos = order.iter().position(|a| std::ptr::eq(*a, &TOP)).unwrap();
        assert!(base_pos < top_pos);
    }
}
