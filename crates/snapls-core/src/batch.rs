//! The transient, parallel batch that drives type checking and import
//! resolution for one snapshot.
//!
//! Concurrent queries share one batch so that in-flight type checks and
//! imports are deduplicated: imports memoize persistently (an import once
//! resolved stays resolved for the life of the batch), syntax packages
//! memoize ephemerally (a cancelled computation is retried by the next
//! caller).

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use snapls_std::error::prelude::*;
use snapls_std::hash::{Digest, FxHashMap, FxHashSet};
use snapls_std::{Error, ImmutBytes};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKind, FileCache as _, Flavor, FutureCache};
use crate::diag::{merge_package_diagnostics, Diagnostic};
use crate::frontend::{ParseMode, ParsedFile, TypeCheckRequest, TypesPackage};
use crate::handle::{self, EvalCtx, HandleState, PackageHandle, PkgData};
use crate::id::{ImportPath, PackageId, PackageName, PackagePath};
use crate::metadata::MetadataGraph;
use crate::vfs::Uri;

/// A fully type-checked syntax package.
pub struct Package {
    /// The package id.
    pub id: PackageId,
    /// The package path.
    pub pkg_path: PackagePath,
    /// The package name.
    pub name: PackageName,
    /// The transitive cache key the package was checked under.
    pub key: Digest,
    /// The parsed compiled files, in input order.
    pub files: Arc<[Arc<ParsedFile>]>,
    /// The types of the package.
    pub types: Arc<TypesPackage>,
    /// Load, parse, and type diagnostics, merged.
    pub diagnostics: Vec<Diagnostic>,
    /// Every package transitively imported, keyed by package path.
    pub dep_imports: Arc<FxHashMap<PackagePath, Arc<TypesPackage>>>,
    /// Whether this package itself had no loader, parse, or type errors.
    pub compiles_locally: bool,
}

/// A transient batch over one snapshot.
pub(crate) struct TypeCheckBatch {
    ctx: Arc<EvalCtx>,
    /// Handles known to the batch, merged in as queries evaluate them.
    handles: Mutex<FxHashMap<PackageId, Arc<PackageHandle>>>,
    imports: FutureCache<PackageId, Arc<TypesPackage>>,
    packages: FutureCache<PackageId, Arc<Package>>,
    /// Export data produced within this batch, readable before the
    /// asynchronous disk write lands.
    exports: Mutex<FxHashMap<Digest, ImmutBytes>>,
    /// Keys whose export blob was already queued for persistence.
    exported_keys: Mutex<FxHashSet<Digest>>,
}

impl TypeCheckBatch {
    pub fn new(ctx: Arc<EvalCtx>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            handles: Mutex::new(FxHashMap::default()),
            imports: FutureCache::new(Flavor::Persistent),
            packages: FutureCache::new(Flavor::Ephemeral),
            exports: Mutex::new(FxHashMap::default()),
            exported_keys: Mutex::new(FxHashSet::default()),
        })
    }

    /// Merges evaluated handles into the batch.
    pub fn add_handles(&self, handles: &FxHashMap<PackageId, Arc<PackageHandle>>) {
        let mut known = self.handles.lock();
        for (id, handle) in handles {
            match known.get(id) {
                Some(existing) if existing.state >= handle.state => {}
                _ => {
                    known.insert(id.clone(), handle.clone());
                }
            }
        }
    }

    fn handle(&self, id: &PackageId) -> Result<Arc<PackageHandle>> {
        self.handles
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| error_once!("package not evaluated in this batch", id: id))
    }

    fn handle_key(&self, id: &PackageId) -> Result<Digest> {
        let handle = self.handle(id)?;
        handle
            .key()
            .ok_or_else(|| error_once!("package handle below ValidKey", id: id))
    }

    /// Registers export data and queues one persistent write per key.
    fn register_export(&self, key: Digest, data: Vec<u8>) {
        self.exports.lock().insert(key, data.clone().into());
        if self.exported_keys.lock().insert(key) {
            handle::spawn_cache_write(&self.ctx, CacheKind::Export, key, data);
        }
    }

    fn export_bytes(&self, key: &Digest) -> Option<ImmutBytes> {
        if let Some(bytes) = self.exports.lock().get(key) {
            return Some(bytes.clone());
        }
        self.ctx.file_cache.get(CacheKind::Export, key)
    }

    /// Returns a type-checked-for-import package, using cached export data
    /// when available.
    pub fn get_import_package(
        self: Arc<Self>,
        cancel: CancellationToken,
        id: PackageId,
    ) -> BoxFuture<'static, Result<Arc<TypesPackage>>> {
        async move {
            let this = self.clone();
            self.imports
                .get(&cancel, id.clone(), move |token| async move {
                    this.resolve_import(token, id).await
                })
                .await
        }
        .boxed()
    }

    async fn resolve_import(
        self: Arc<Self>,
        cancel: CancellationToken,
        id: PackageId,
    ) -> Result<Arc<TypesPackage>> {
        let handle = self.handle(&id)?;
        let meta = handle.meta.clone();

        if let Some(builtin) = self.ctx.frontend.builtin_package(&meta.pkg_path) {
            return Ok(builtin);
        }

        let key = self.handle_key(&id)?;
        if let Some(bytes) = self.export_bytes(&key) {
            let imported = self
                .clone()
                .import_from_export(cancel.clone(), meta.id.clone(), bytes)
                .await;
            match imported {
                Ok(types) => return Ok(types),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    // Malformed or stale export data reads as a miss.
                    log::warn!("importing export data for {id} failed: {err}");
                }
            }
        }

        // Miss: type-check the package for import, then persist its export
        // data for later batches.
        let local = handle
            .local_data()
            .ok_or_else(|| error_once!("import target below ValidLocalData", id: id))?
            .clone();
        let mut deps = FxHashMap::default();
        for (imp_path, dep_id) in &local.inputs.deps_by_imp_path {
            let resolved = self
                .clone()
                .get_import_package(cancel.clone(), dep_id.clone())
                .await;
            match resolved {
                Ok(types) => {
                    deps.insert(imp_path.clone(), types);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                // An unresolved dependency surfaces as a checker error on
                // the import declaration.
                Err(err) => log::debug!("import dependency {dep_id} failed: {err}"),
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        let _permit = self
            .ctx
            .cpu
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::cancelled())?;

        let compiled: Vec<_> = local
            .files
            .iter()
            .filter(|file| meta.compiled_go_files.contains(&file.uri))
            .cloned()
            .collect();
        let parsed = self
            .ctx
            .parse_cache
            .parse(self.ctx.frontend.as_ref(), &compiled, ParseMode::Header);

        let req = TypeCheckRequest {
            inputs: &local.inputs,
            files: &parsed,
            deps: &deps,
        };
        let types = self.ctx.frontend.type_check_for_import(&req)?;
        self.register_export(key, self.ctx.frontend.export(&types));
        Ok(types)
    }

    /// Decodes export data, resolving dependency packages through the
    /// import lookup.
    async fn import_from_export(
        self: Arc<Self>,
        cancel: CancellationToken,
        importer: PackageId,
        data: ImmutBytes,
    ) -> Result<Arc<TypesPackage>> {
        let lookup = ImportLookup::new(&self.ctx.graph, &importer);
        let mut by_path: FxHashMap<PackagePath, Arc<TypesPackage>> = FxHashMap::default();
        for (path, dep_id) in lookup.entries() {
            let resolved = self
                .clone()
                .get_import_package(cancel.clone(), dep_id.clone())
                .await;
            match resolved {
                Ok(types) => {
                    by_path.insert(path.clone(), types);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => log::debug!("import lookup for {path} failed: {err}"),
            }
        }

        self.ctx
            .frontend
            .import_from_export(&data, &|path| by_path.get(path).cloned())
    }

    /// Returns the full syntax package for an evaluated handle.
    pub fn get_package(
        self: Arc<Self>,
        cancel: CancellationToken,
        id: PackageId,
    ) -> BoxFuture<'static, Result<Arc<Package>>> {
        async move {
            let this = self.clone();
            self.packages
                .get(&cancel, id.clone(), move |token| async move {
                    this.check_package(token, id).await
                })
                .await
        }
        .boxed()
    }

    async fn check_package(
        self: Arc<Self>,
        cancel: CancellationToken,
        id: PackageId,
    ) -> Result<Arc<Package>> {
        let handle = self.handle(&id)?;
        if let Some(pkg) = handle.package() {
            return Ok(pkg.clone());
        }
        let meta = handle.meta.clone();
        let key = self.handle_key(&id)?;
        let local = handle
            .local_data()
            .ok_or_else(|| error_once!("package below ValidLocalData", id: id))?
            .clone();

        // Await dependency imports first; a CPU token held across these
        // awaits would deadlock deep import chains.
        let mut deps = FxHashMap::default();
        let mut import_diags = Vec::new();
        for (imp_path, dep_id) in &local.inputs.deps_by_imp_path {
            let resolved = self
                .clone()
                .get_import_package(cancel.clone(), dep_id.clone())
                .await;
            match resolved {
                Ok(types) => {
                    deps.insert(imp_path.clone(), types);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    import_diags.push(Diagnostic::error(
                        "compiler",
                        format!("could not import {imp_path}: {err}"),
                    ));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        let _permit = self
            .ctx
            .cpu
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::cancelled())?;

        // Reuse retained parses when only the package body was dropped.
        let parsed: Arc<[Arc<ParsedFile>]> = match &handle.pkg_data {
            Some(data) if handle.state >= HandleState::ValidImports => data.files.clone(),
            _ => {
                let compiled: Vec<_> = local
                    .files
                    .iter()
                    .filter(|file| meta.compiled_go_files.contains(&file.uri))
                    .cloned()
                    .collect();
                self.ctx
                    .parse_cache
                    .parse(self.ctx.frontend.as_ref(), &compiled, ParseMode::Full)
                    .into()
            }
        };

        let req = TypeCheckRequest {
            inputs: &local.inputs,
            files: &parsed,
            deps: &deps,
        };
        let output = self.ctx.frontend.type_check(&req)?;

        let parse_errors: Vec<Diagnostic> = parsed
            .iter()
            .flat_map(|file| file.errors.iter().cloned())
            .collect();
        let broken_files: Vec<Uri> = parsed
            .iter()
            .filter(|file| file.broken)
            .map(|file| file.uri.clone())
            .collect();
        let compiles_locally = local.load_diags.is_empty()
            && parse_errors.is_empty()
            && output.type_errors.is_empty()
            && import_diags.is_empty();

        let mut diagnostics: Vec<Diagnostic> = local.load_diags.to_vec();
        diagnostics.extend(import_diags);
        diagnostics.extend(merge_package_diagnostics(
            parse_errors,
            output.type_errors,
            &broken_files,
        ));

        let dep_imports = Arc::new(output.types.transitive_imports());
        let pkg = Arc::new(Package {
            id: meta.id.clone(),
            pkg_path: meta.pkg_path.clone(),
            name: meta.name.clone(),
            key,
            files: parsed.clone(),
            types: output.types.clone(),
            diagnostics,
            dep_imports,
            compiles_locally,
        });

        // Keep the syntax package on the snapshot while the user is looking
        // at it.
        if local.open_in_editor {
            let retained = PackageHandle {
                meta: meta.clone(),
                state: HandleState::ValidPackage,
                local: handle.local.clone(),
                keyd: handle.keyd.clone(),
                pkg_data: Some(PkgData {
                    files: parsed,
                    imports: Arc::new(deps),
                    pkg: Some(pkg.clone()),
                }),
            };
            let published = handle::publish(&self.ctx, Arc::new(retained));
            self.add_handles(
                &[(meta.id.clone(), published)].into_iter().collect(),
            );
        }

        self.persist_package(&pkg);
        Ok(pkg)
    }

    /// Queues the derived blobs of a fully checked package.
    fn persist_package(&self, pkg: &Package) {
        self.register_export(pkg.key, self.ctx.frontend.export(&pkg.types));

        let frontend = self.ctx.frontend.as_ref();
        let blobs = [
            (CacheKind::Xrefs, frontend.xrefs(&pkg.files, &pkg.types)),
            (
                CacheKind::MethodSets,
                frontend.methodsets(&pkg.files, &pkg.types),
            ),
            (CacheKind::Tests, frontend.test_index(&pkg.files, &pkg.types)),
            (
                CacheKind::Diagnostics,
                serde_json::to_vec(&pkg.diagnostics).unwrap_or_default(),
            ),
        ];
        for (kind, blob) in blobs {
            handle::spawn_cache_write(&self.ctx, kind, pkg.key, blob);
        }
    }
}

/// An on-demand breadth-first walk from an importer's metadata, producing
/// the package id visible under each package path.
///
/// Two ids for one path is inconsistent metadata: it is reported once and
/// resolved first-wins to avoid cascading failures.
pub(crate) struct ImportLookup {
    by_path: FxHashMap<PackagePath, PackageId>,
}

impl ImportLookup {
    pub fn new(graph: &MetadataGraph, importer: &PackageId) -> Self {
        let mut by_path: FxHashMap<PackagePath, PackageId> = FxHashMap::default();
        let mut queue: VecDeque<PackageId> = VecDeque::new();
        let mut seen: FxHashSet<PackageId> = FxHashSet::default();

        queue.push_back(importer.clone());
        seen.insert(importer.clone());
        while let Some(id) = queue.pop_front() {
            let Some(meta) = graph.package(&id) else {
                log::warn!("import lookup: no metadata for {id}");
                continue;
            };
            for (path, dep_id) in &meta.deps_by_pkg_path {
                match by_path.get(path) {
                    None => {
                        by_path.insert(path.clone(), dep_id.clone());
                    }
                    Some(existing) if existing != dep_id => {
                        log::warn!(
                            "inconsistent metadata: {path} maps to both {existing} and {dep_id}"
                        );
                    }
                    Some(_) => {}
                }
                if seen.insert(dep_id.clone()) {
                    queue.push_back(dep_id.clone());
                }
            }
        }

        Self { by_path }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PackagePath, &PackageId)> {
        self.by_path.iter()
    }

    #[cfg(test)]
    pub fn resolve(&self, path: &PackagePath) -> Option<&PackageId> {
        self.by_path.get(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataPackage;

    fn pkg(id: &str, path: &str, deps: &[(&str, &str)]) -> MetadataPackage {
        MetadataPackage {
            id: PackageId::new(id),
            pkg_path: PackagePath::new(path),
            deps_by_pkg_path: deps
                .iter()
                .map(|(path, id)| (PackagePath::new(*path), PackageId::new(*id)))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_import_lookup_walks_transitively() {
        let graph = MetadataGraph::new([
            pkg("a", "example.com/a", &[("example.com/b", "b")]),
            pkg("b", "example.com/b", &[("example.com/c", "c")]),
            pkg("c", "example.com/c", &[]),
        ]);
        let lookup = ImportLookup::new(&graph, &PackageId::new("a"));
        assert_eq!(
            lookup.resolve(&PackagePath::new("example.com/c")),
            Some(&PackageId::new("c"))
        );
    }

    #[test]
    fn test_import_lookup_first_wins() {
        // Both b and c claim to provide example.com/x, under different ids.
        let graph = MetadataGraph::new([
            pkg(
                "a",
                "example.com/a",
                &[("example.com/b", "b"), ("example.com/c", "c")],
            ),
            pkg("b", "example.com/b", &[("example.com/x", "x1")]),
            pkg("c", "example.com/c", &[("example.com/x", "x2")]),
            pkg("x1", "example.com/x", &[]),
            pkg("x2", "example.com/x", &[]),
        ]);
        let lookup = ImportLookup::new(&graph, &PackageId::new("a"));
        let resolved = lookup.resolve(&PackagePath::new("example.com/x"));
        // First-wins: deterministic because the walk is breadth-first over
        // canonically ordered dependency maps.
        assert_eq!(resolved, Some(&PackageId::new("x1")));
    }
}
