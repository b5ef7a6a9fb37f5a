//! The symbol reference graph: per-declaration external reference sets and
//! their transitive closure, used to prune downstream invalidation.

use std::collections::BTreeMap;
use std::sync::Arc;

use ecow::EcoString;
use serde::{Deserialize, Serialize};
use snapls_std::hash::{Digest, DigestSink, FxHashMap, FxHashSet};

use crate::frontend::{ParsedFile, RefTarget};
use crate::id::{PackageId, PackagePath};
use crate::metadata::{MetadataGraph, MetadataPackage};
use crate::vfs::Uri;

/// Bump on any change to the encoded form below.
const TYPEREFS_GENERATION: u64 = 2;

/// A symbol declared by some package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol {
    /// The declaring package.
    pub pkg: PackageId,
    /// The declared name.
    pub name: EcoString,
}

/// The symbol reference summary of one package.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PackageRefs {
    /// For each top-level declaration, the externally declared symbols it
    /// references, directly or through declarations of its own package.
    pub refs: FxHashMap<EcoString, Arc<[Symbol]>>,
    /// The exported declaration names, sorted.
    pub exported: Vec<EcoString>,
}

/// The cache key of a package's reference summary.
pub fn refs_key(graph: &MetadataGraph, meta: &MetadataPackage, files: &[(Uri, Digest)]) -> Digest {
    let mut sink = DigestSink::with_domain("typerefs");
    sink.u64(TYPEREFS_GENERATION);
    sink.str(meta.id.as_str());
    // Canonical order comes from the b-tree map.
    for (imp_path, dep_id) in &meta.deps_by_imp_path {
        sink.str(imp_path.as_str());
        sink.str(dep_id.as_str());
        let dep_name = graph
            .package(dep_id)
            .map(|dep| dep.name.as_str())
            .unwrap_or_default();
        sink.str(dep_name);
    }
    for (uri, digest) in files {
        sink.str(uri.as_str());
        sink.digest(digest);
    }
    sink.finish()
}

/// Computes the reference summary of one package from its parsed compiled
/// files.
///
/// The computation is purely syntactic. Intra-package reference cycles are
/// contracted first; declarations then inherit the external references of
/// every local declaration they reach.
pub fn compute_refs(meta: &MetadataPackage, files: &[Arc<ParsedFile>]) -> PackageRefs {
    // Gather direct references per declaration, resolving import paths to
    // package ids. Unresolvable imports contribute nothing.
    let mut direct_ext: BTreeMap<EcoString, FxHashSet<Symbol>> = BTreeMap::new();
    let mut local_edges: BTreeMap<EcoString, FxHashSet<EcoString>> = BTreeMap::new();
    let mut exported: Vec<EcoString> = Vec::new();

    for file in files {
        for decl in &file.decls {
            let ext = direct_ext.entry(decl.name.clone()).or_default();
            let local = local_edges.entry(decl.name.clone()).or_default();
            if decl.exported && !exported.contains(&decl.name) {
                exported.push(decl.name.clone());
            }
            for target in &decl.refs {
                match target {
                    RefTarget::Local(name) => {
                        local.insert(name.clone());
                    }
                    RefTarget::External(imp_path, name) => {
                        if let Some(dep_id) = meta.deps_by_imp_path.get(imp_path) {
                            ext.insert(Symbol {
                                pkg: dep_id.clone(),
                                name: name.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
    exported.sort();

    // Contract local cycles and propagate external references through the
    // condensation, bottom-up.
    let order: Vec<EcoString> = direct_ext.keys().cloned().collect();
    let sccs = strongly_connected(&order, &local_edges);

    let mut scc_of: FxHashMap<EcoString, usize> = FxHashMap::default();
    for (scc_idx, scc) in sccs.iter().enumerate() {
        for decl in scc {
            scc_of.insert(decl.clone(), scc_idx);
        }
    }

    // `strongly_connected` yields components in reverse topological order:
    // successors come first.
    let mut scc_refs: Vec<FxHashSet<Symbol>> = Vec::with_capacity(sccs.len());
    for (scc_idx, scc) in sccs.iter().enumerate() {
        let mut refs = FxHashSet::default();
        for decl in scc {
            if let Some(ext) = direct_ext.get(decl) {
                refs.extend(ext.iter().cloned());
            }
            for target in local_edges.get(decl).into_iter().flatten() {
                match scc_of.get(target) {
                    Some(&target_scc) if target_scc != scc_idx => {
                        refs.extend(scc_refs[target_scc].iter().cloned());
                    }
                    _ => {}
                }
            }
        }
        scc_refs.push(refs);
    }

    let mut refs: FxHashMap<EcoString, Arc<[Symbol]>> = FxHashMap::default();
    // Declarations sharing one reference set share one allocation.
    let mut interned: FxHashMap<Vec<Symbol>, Arc<[Symbol]>> = FxHashMap::default();
    for decl in &order {
        let scc_idx = scc_of[decl];
        let mut sorted: Vec<Symbol> = scc_refs[scc_idx].iter().cloned().collect();
        sorted.sort();
        let shared = interned
            .entry(sorted.clone())
            .or_insert_with(|| sorted.into())
            .clone();
        refs.insert(decl.clone(), shared);
    }

    PackageRefs { refs, exported }
}

/// The serialized form: declarations sharing identical reference sets are
/// encoded as one class.
#[derive(Debug, Serialize, Deserialize)]
struct EncodedRefs {
    classes: Vec<EncodedClass>,
    exported: Vec<EcoString>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncodedClass {
    decls: Vec<EcoString>,
    refs: Vec<Symbol>,
}

/// Encodes a reference summary; the encoding is byte-stable.
pub fn encode_refs(refs: &PackageRefs) -> Vec<u8> {
    let mut by_set: BTreeMap<Vec<Symbol>, Vec<EcoString>> = BTreeMap::new();
    for (decl, set) in &refs.refs {
        by_set.entry(set.to_vec()).or_default().push(decl.clone());
    }
    let classes = by_set
        .into_iter()
        .map(|(refs, mut decls)| {
            decls.sort();
            EncodedClass { decls, refs }
        })
        .collect();
    let encoded = EncodedRefs {
        classes,
        exported: refs.exported.clone(),
    };
    serde_json::to_vec(&encoded).unwrap_or_default()
}

/// Decodes a reference summary; `None` means the bytes are malformed and
/// the caller recomputes.
pub fn decode_refs(bytes: &[u8]) -> Option<PackageRefs> {
    let encoded: EncodedRefs = serde_json::from_slice(bytes).ok()?;
    let mut refs = FxHashMap::default();
    for class in encoded.classes {
        let shared: Arc<[Symbol]> = class.refs.into();
        for decl in class.decls {
            refs.insert(decl, shared.clone());
        }
    }
    Some(PackageRefs {
        refs,
        exported: encoded.exported,
    })
}

/// Computes strongly connected components over the local reference graph,
/// in reverse topological order (successors before predecessors).
fn strongly_connected(
    order: &[EcoString],
    edges: &BTreeMap<EcoString, FxHashSet<EcoString>>,
) -> Vec<Vec<EcoString>> {
    struct Tarjan<'a> {
        edges: &'a BTreeMap<EcoString, FxHashSet<EcoString>>,
        index: FxHashMap<EcoString, usize>,
        lowlink: FxHashMap<EcoString, usize>,
        on_stack: FxHashSet<EcoString>,
        stack: Vec<EcoString>,
        next: usize,
        sccs: Vec<Vec<EcoString>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: &EcoString) {
            self.index.insert(v.clone(), self.next);
            self.lowlink.insert(v.clone(), self.next);
            self.next += 1;
            self.stack.push(v.clone());
            self.on_stack.insert(v.clone());

            let targets: Vec<EcoString> = self
                .edges
                .get(v)
                .map(|targets| {
                    targets
                        .iter()
                        .filter(|t| self.edges.contains_key(*t))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for w in targets {
                if !self.index.contains_key(&w) {
                    self.visit(&w);
                    let low = self.lowlink[v].min(self.lowlink[&w]);
                    self.lowlink.insert(v.clone(), low);
                } else if self.on_stack.contains(&w) {
                    let low = self.lowlink[v].min(self.index[&w]);
                    self.lowlink.insert(v.clone(), low);
                }
            }

            if self.lowlink[v] == self.index[v] {
                let mut scc = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(&w);
                    let done = w == *v;
                    scc.push(w);
                    if done {
                        break;
                    }
                }
                scc.sort();
                self.sccs.push(scc);
            }
        }
    }

    let mut tarjan = Tarjan {
        edges,
        index: FxHashMap::default(),
        lowlink: FxHashMap::default(),
        on_stack: FxHashSet::default(),
        stack: Vec::new(),
        next: 0,
        sccs: Vec::new(),
    };
    for v in order {
        if !tarjan.index.contains_key(v) {
            tarjan.visit(v);
        }
    }
    tarjan.sccs
}

/// The transitive reference closure over per-package reference summaries.
///
/// Cycles are broken by sentinel: a name's entry is set to empty before
/// recursing and filled in after, which yields a possibly-empty set on
/// cyclic inputs. That is sound: a cycle member can only reach what the
/// cycle as a whole reaches.
pub struct TransitiveRefs<F> {
    refs_of: F,
    memo: FxHashMap<(PackageId, EcoString), Arc<FxHashSet<PackageId>>>,
}

impl<F> TransitiveRefs<F>
where
    F: Fn(&PackageId) -> Option<Arc<PackageRefs>>,
{
    /// Creates a closure evaluator over the given summary lookup.
    pub fn new(refs_of: F) -> Self {
        Self {
            refs_of,
            memo: FxHashMap::default(),
        }
    }

    /// The packages that can influence a predecessor through the exported
    /// surface of `dep`: `{dep}` plus everything reachable from any of its
    /// exported names.
    pub fn reachable_through(&mut self, dep: &PackageId) -> FxHashSet<PackageId> {
        let mut out = FxHashSet::default();
        out.insert(dep.clone());
        let Some(refs) = (self.refs_of)(dep) else {
            return out;
        };
        for name in refs.exported.clone() {
            for pkg in self.of_name(dep, &name).iter() {
                out.insert(pkg.clone());
            }
        }
        out
    }

    fn of_name(&mut self, pkg: &PackageId, name: &EcoString) -> Arc<FxHashSet<PackageId>> {
        let key = (pkg.clone(), name.clone());
        if let Some(cached) = self.memo.get(&key) {
            return cached.clone();
        }
        // Sentinel breaks reference cycles.
        self.memo
            .insert(key.clone(), Arc::new(FxHashSet::default()));

        let mut out = FxHashSet::default();
        let symbols = (self.refs_of)(pkg).and_then(|refs| refs.refs.get(name).cloned());
        for sym in symbols.iter().flat_map(|syms| syms.iter()) {
            out.insert(sym.pkg.clone());
            for reached in self.of_name(&sym.pkg, &sym.name).iter() {
                out.insert(reached.clone());
            }
        }

        let out = Arc::new(out);
        self.memo.insert(key, out.clone());
        out
    }
}

/// The package paths of a reachable set, for the analysis bloom filter.
pub fn reachable_paths(
    graph: &MetadataGraph,
    reachable: impl Iterator<Item = PackageId>,
) -> Vec<PackagePath> {
    let mut paths: Vec<PackagePath> = reachable
        .filter_map(|id| graph.package(&id).map(|meta| meta.pkg_path.clone()))
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{DeclKind, ParsedDecl};
    use crate::id::ImportPath;
    use snapls_std::debug_loc::CharRange;

    fn decl(name: &str, refs: Vec<RefTarget>) -> ParsedDecl {
        ParsedDecl {
            name: name.into(),
            kind: DeclKind::Func,
            exported: name.chars().next().is_some_and(|c| c.is_uppercase()),
            range: CharRange::default(),
            refs,
        }
    }

    fn file(decls: Vec<ParsedDecl>) -> Arc<ParsedFile> {
        Arc::new(ParsedFile {
            uri: Uri::new("file:///a.src"),
            digest: Digest::ZERO,
            package_name: None,
            imports: Vec::new(),
            decls,
            errors: Vec::new(),
            broken: false,
        })
    }

    fn meta_with_dep(imp: &str, id: &str) -> MetadataPackage {
        MetadataPackage {
            deps_by_imp_path: [(ImportPath::new(imp), PackageId::new(id))].into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_local_refs_propagate() {
        let meta = meta_with_dep("dep", "dep-id");
        let files = [file(vec![
            decl("A", vec![RefTarget::Local("b".into())]),
            decl(
                "b",
                vec![RefTarget::External(ImportPath::new("dep"), "S".into())],
            ),
        ])];

        let refs = compute_refs(&meta, &files);
        let a = &refs.refs["A"];
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].name, "S");
        assert_eq!(refs.exported, vec![EcoString::from("A")]);
        // Identical sets share one allocation.
        assert!(Arc::ptr_eq(&refs.refs["A"], &refs.refs["b"]));
    }

    #[test]
    fn test_local_cycle_contracts() {
        let meta = meta_with_dep("dep", "dep-id");
        let files = [file(vec![
            decl(
                "A",
                vec![
                    RefTarget::Local("B".into()),
                    RefTarget::External(ImportPath::new("dep"), "X".into()),
                ],
            ),
            decl(
                "B",
                vec![
                    RefTarget::Local("A".into()),
                    RefTarget::External(ImportPath::new("dep"), "Y".into()),
                ],
            ),
        ])];

        let refs = compute_refs(&meta, &files);
        assert_eq!(refs.refs["A"].len(), 2);
        assert_eq!(refs.refs["A"], refs.refs["B"]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let meta = meta_with_dep("dep", "dep-id");
        let files = [file(vec![decl(
            "A",
            vec![RefTarget::External(ImportPath::new("dep"), "S".into())],
        )])];
        let refs = compute_refs(&meta, &files);

        let decoded = decode_refs(&encode_refs(&refs)).unwrap();
        assert_eq!(decoded, refs);
    }

    #[test]
    fn test_encoding_is_byte_stable() {
        let meta = meta_with_dep("dep", "dep-id");
        let files = [file(vec![
            decl(
                "B",
                vec![RefTarget::External(ImportPath::new("dep"), "S".into())],
            ),
            decl(
                "A",
                vec![RefTarget::External(ImportPath::new("dep"), "S".into())],
            ),
        ])];
        let lhs = encode_refs(&compute_refs(&meta, &files));
        let rhs = encode_refs(&compute_refs(&meta, &files));
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_cross_package_cycle_terminates() {
        // a.A references b.B which references a.A again.
        let a = PackageId::new("a");
        let b = PackageId::new("b");
        let mk = |pkg: &PackageId, name: &str, target: &PackageId, tname: &str| {
            let mut refs = FxHashMap::default();
            let syms: Arc<[Symbol]> = vec![Symbol {
                pkg: target.clone(),
                name: tname.into(),
            }]
            .into();
            refs.insert(EcoString::from(name), syms);
            (
                pkg.clone(),
                Arc::new(PackageRefs {
                    refs,
                    exported: vec![name.into()],
                }),
            )
        };
        let summaries: FxHashMap<PackageId, Arc<PackageRefs>> =
            [mk(&a, "A", &b, "B"), mk(&b, "B", &a, "A")]
                .into_iter()
                .collect();

        let mut closure = TransitiveRefs::new(|id: &PackageId| summaries.get(id).cloned());
        let reached = closure.reachable_through(&a);
        assert!(reached.contains(&a));
        assert!(reached.contains(&b));
    }
}
