//! The metadata model produced by the external loader, plus the per-graph
//! indices the engine derives from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use ecow::EcoString;
use serde::{Deserialize, Serialize};
use snapls_std::hash::{FxHashMap, FxHashSet};

use crate::diag::Diagnostic;
use crate::id::{ImportPath, PackageId, PackageName, PackagePath};
use crate::vfs::Uri;

/// Module information attached to a package by the loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// The module path.
    pub path: EcoString,
    /// The module version, if resolved.
    pub version: Option<EcoString>,
}

/// Platform type sizes used during type checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSizes {
    /// The platform word size in bytes.
    pub word_size: u64,
    /// The maximum alignment in bytes.
    pub max_align: u64,
}

impl Default for TypeSizes {
    fn default() -> Self {
        Self {
            word_size: 8,
            max_align: 8,
        }
    }
}

/// The external record describing one package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPackage {
    /// The opaque build-system identifier.
    pub id: PackageId,
    /// The linker-visible package path.
    pub pkg_path: PackagePath,
    /// The declared package name.
    pub name: PackageName,
    /// The authored source files.
    pub go_files: Vec<Uri>,
    /// The compiled source files, after generated-code expansion.
    pub compiled_go_files: Vec<Uri>,
    /// Files belonging to the package directory but not compiled.
    pub other_files: Vec<Uri>,
    /// Direct dependencies keyed by source-visible import path.
    pub deps_by_imp_path: BTreeMap<ImportPath, PackageId>,
    /// Direct dependencies keyed by linker-visible package path.
    pub deps_by_pkg_path: BTreeMap<PackagePath, PackageId>,
    /// Diagnostics reported by the loader.
    pub errors: Vec<Diagnostic>,
    /// The package path this package is a test variant of, if any.
    pub for_test: Option<PackagePath>,
    /// Whether this is a standalone file pseudo-package.
    pub standalone: bool,
    /// Whether this is a command-line-arguments package.
    pub is_command_line_arguments: bool,
    /// Module information, if the package belongs to a module.
    pub module: Option<ModuleInfo>,
    /// Platform type sizes.
    pub types_sizes: TypeSizes,
}

impl MetadataPackage {
    /// Iterates the dependency ids, deduplicated.
    pub fn dep_ids(&self) -> impl Iterator<Item = &PackageId> {
        let mut seen = FxHashSet::default();
        self.deps_by_imp_path
            .values()
            .chain(self.deps_by_pkg_path.values())
            .filter(move |id| seen.insert((*id).clone()))
    }

    /// Iterates the source files the type check of this package reads.
    pub fn checked_files(&self) -> impl Iterator<Item = &Uri> {
        let mut seen = FxHashSet::default();
        self.go_files
            .iter()
            .chain(self.compiled_go_files.iter())
            .filter(move |uri| seen.insert((*uri).clone()))
    }
}

/// Supplies the immutable metadata of one snapshot.
pub trait MetadataSource: Send + Sync {
    /// The whole package graph.
    fn graph(&self) -> Arc<MetadataGraph>;

    /// One package of the graph.
    fn package(&self, id: &PackageId) -> Option<Arc<MetadataPackage>> {
        self.graph().package(id).cloned()
    }
}

/// An immutable package graph with the indices derived at construction.
///
/// The graph is guaranteed acyclic: import cycles reported by a buggy
/// loader are broken by deleting one dependency edge and recording a
/// synthetic diagnostic on the affected package.
#[derive(Debug, Default)]
pub struct MetadataGraph {
    packages: FxHashMap<PackageId, Arc<MetadataPackage>>,
    ids_by_pkg_path: FxHashMap<PackagePath, Vec<PackageId>>,
    ids_by_uri: FxHashMap<Uri, Vec<PackageId>>,
    rdeps: FxHashMap<PackageId, Vec<PackageId>>,
}

impl MetadataGraph {
    /// Builds the graph from loader output.
    pub fn new(packages: impl IntoIterator<Item = MetadataPackage>) -> Arc<Self> {
        let mut packages: FxHashMap<PackageId, MetadataPackage> = packages
            .into_iter()
            .map(|pkg| (pkg.id.clone(), pkg))
            .collect();

        break_import_cycles(&mut packages);

        let mut ids_by_pkg_path: FxHashMap<PackagePath, Vec<PackageId>> = FxHashMap::default();
        let mut ids_by_uri: FxHashMap<Uri, Vec<PackageId>> = FxHashMap::default();
        let mut rdeps: FxHashMap<PackageId, Vec<PackageId>> = FxHashMap::default();
        for pkg in packages.values() {
            ids_by_pkg_path
                .entry(pkg.pkg_path.clone())
                .or_default()
                .push(pkg.id.clone());
            for uri in pkg.checked_files() {
                ids_by_uri
                    .entry(uri.clone())
                    .or_default()
                    .push(pkg.id.clone());
            }
            for dep in pkg.dep_ids() {
                rdeps.entry(dep.clone()).or_default().push(pkg.id.clone());
            }
        }
        // First-wins resolution must be deterministic across processes.
        for ids in ids_by_pkg_path.values_mut() {
            ids.sort();
        }
        for ids in ids_by_uri.values_mut() {
            ids.sort();
        }
        for ids in rdeps.values_mut() {
            ids.sort();
        }

        Arc::new(Self {
            packages: packages
                .into_iter()
                .map(|(id, pkg)| (id, Arc::new(pkg)))
                .collect(),
            ids_by_pkg_path,
            ids_by_uri,
            rdeps,
        })
    }

    /// Looks up a package by id.
    pub fn package(&self, id: &PackageId) -> Option<&Arc<MetadataPackage>> {
        self.packages.get(id)
    }

    /// All packages of the graph.
    pub fn packages(&self) -> impl Iterator<Item = &Arc<MetadataPackage>> {
        self.packages.values()
    }

    /// The ids declaring the given package path, in deterministic order.
    ///
    /// More than one id for a path is inconsistent metadata; callers resolve
    /// it first-wins.
    pub fn ids_by_pkg_path(&self, path: &PackagePath) -> &[PackageId] {
        self.ids_by_pkg_path
            .get(path)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The ids whose checked files contain the given uri.
    pub fn ids_by_uri(&self, uri: &Uri) -> &[PackageId] {
        self.ids_by_uri
            .get(uri)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The direct importers of a package.
    pub fn importers(&self, id: &PackageId) -> &[PackageId] {
        self.rdeps.get(id).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Deletes one dependency edge per import cycle, recording a synthetic
/// diagnostic on the package that kept the back edge.
fn break_import_cycles(packages: &mut FxHashMap<PackageId, MetadataPackage>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    let ids: Vec<PackageId> = {
        let mut ids: Vec<_> = packages.keys().cloned().collect();
        ids.sort();
        ids
    };
    let mut marks: FxHashMap<PackageId, Mark> =
        ids.iter().map(|id| (id.clone(), Mark::White)).collect();

    // Iterative DFS; a gray target is a back edge closing a cycle.
    enum Step {
        Enter(PackageId),
        Leave(PackageId),
    }

    for root in &ids {
        if marks.get(root) != Some(&Mark::White) {
            continue;
        }
        let mut stack = vec![Step::Enter(root.clone())];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(id) => {
                    match marks.get(&id) {
                        Some(Mark::White) => {}
                        _ => continue,
                    }
                    marks.insert(id.clone(), Mark::Gray);
                    stack.push(Step::Leave(id.clone()));

                    let deps: Vec<PackageId> = packages
                        .get(&id)
                        .map(|pkg| pkg.dep_ids().cloned().collect())
                        .unwrap_or_default();
                    let mut broken: Vec<PackageId> = Vec::new();
                    for dep in deps {
                        match marks.get(&dep) {
                            Some(Mark::Gray) => broken.push(dep),
                            Some(Mark::White) => stack.push(Step::Enter(dep)),
                            _ => {}
                        }
                    }
                    if !broken.is_empty() {
                        if let Some(pkg) = packages.get_mut(&id) {
                            for dep in &broken {
                                pkg.deps_by_imp_path.retain(|_, v| v != dep);
                                pkg.deps_by_pkg_path.retain(|_, v| v != dep);
                                log::warn!("breaking import cycle at {id} -> {dep}");
                                pkg.errors.push(Diagnostic::error(
                                    "loader",
                                    format!("detected import cycle: {id} imports {dep}"),
                                ));
                            }
                        }
                    }
                }
                Step::Leave(id) => {
                    marks.insert(id, Mark::Black);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(id: &str, deps: &[&str]) -> MetadataPackage {
        MetadataPackage {
            id: PackageId::new(id),
            pkg_path: PackagePath::new(id),
            name: PackageName::new(id.rsplit('/').next().unwrap_or(id)),
            deps_by_imp_path: deps
                .iter()
                .map(|dep| (ImportPath::new(*dep), PackageId::new(*dep)))
                .collect(),
            deps_by_pkg_path: deps
                .iter()
                .map(|dep| (PackagePath::new(*dep), PackageId::new(*dep)))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cycle_is_broken_with_diagnostic() {
        let graph = MetadataGraph::new([pkg("a", &["b"]), pkg("b", &["a"])]);

        let cut: Vec<_> = graph
            .packages()
            .filter(|pkg| !pkg.errors.is_empty())
            .collect();
        assert_eq!(cut.len(), 1, "exactly one edge is deleted");
        assert!(cut[0].errors[0].message.contains("import cycle"));

        // The remaining graph is acyclic: one of the two edges survives.
        let a = graph.package(&PackageId::new("a")).unwrap();
        let b = graph.package(&PackageId::new("b")).unwrap();
        let edges = a.dep_ids().count() + b.dep_ids().count();
        assert_eq!(edges, 1);
    }

    #[test]
    fn test_acyclic_graph_is_untouched() {
        let graph = MetadataGraph::new([pkg("a", &["b"]), pkg("b", &[])]);
        assert!(graph.packages().all(|pkg| pkg.errors.is_empty()));
    }

    #[test]
    fn test_uri_index() {
        let mut package = pkg("a", &[]);
        package.go_files = vec![Uri::new("file:///a.src")];
        let graph = MetadataGraph::new([package]);
        assert_eq!(
            graph.ids_by_uri(&Uri::new("file:///a.src")),
            &[PackageId::new("a")]
        );
    }
}
