//! End-to-end scenarios over the toy-language frontend: incremental
//! analysis, precise pruning, cycle handling, cancellation, and error
//! suppression.

use std::sync::Arc;
use std::time::Duration;

use snapls_core::analysis::{Analyzer, AnalyzerCatalog, SourceLoc};
use snapls_core::stats::AnalysisStats;
use snapls_core::testing::{test_package, TestFrontend};
use snapls_core::{
    EngineOpts, FileSource, MemCache, MemoryFileSource, MetadataGraph, MetadataPackage, PackageId,
    Snapshot, SnapshotChanges, SnapshotInputs, Uri,
};
use tokio_util::sync::CancellationToken;

/// A facty analyzer: exports one package fact per analyzed package.
static FACTY_X: Analyzer = Analyzer {
    name: "factyx",
    doc: "exports a marker fact",
    url: "",
    requires: &[],
    produces_facts: true,
    run_despite_errors: false,
    enabled_by_default: false,
    loc: SourceLoc {
        file: file!(),
        line: line!(),
    },
    run: |pass| {
        let path = pass.package().pkg_path.clone();
        pass.facts()
            .export_package_fact(path, "seen", serde_json::json!(true));
        Ok(Arc::new(()))
    },
};

/// A plain analyzer requiring the facty one.
static ENABLED_Y: Analyzer = Analyzer {
    name: "enabledy",
    doc: "consumes factyx results",
    url: "",
    requires: &[&FACTY_X],
    produces_facts: false,
    run_despite_errors: false,
    enabled_by_default: true,
    loc: SourceLoc {
        file: file!(),
        line: line!(),
    },
    run: |pass| {
        // The horizontal dependency must have produced a typed result.
        assert!(pass.result_of::<()>(&FACTY_X).is_some());
        Ok(Arc::new(()))
    },
};

struct Fixture {
    source: Arc<MemoryFileSource>,
    frontend: Arc<TestFrontend>,
    cache: Arc<MemCache>,
    stats: Arc<AnalysisStats>,
    catalog: Arc<AnalyzerCatalog>,
    packages: Vec<MetadataPackage>,
}

impl Fixture {
    fn new(analyzers: Vec<&'static Analyzer>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            source: Arc::new(MemoryFileSource::default()),
            frontend: Arc::new(TestFrontend::default()),
            cache: Arc::new(MemCache::default()),
            stats: Arc::new(AnalysisStats::default()),
            catalog: Arc::new(AnalyzerCatalog::new(analyzers)),
            packages: Vec::new(),
        }
    }

    fn add(&mut self, id: &str, deps: &[(&str, &str)], files: &[(&str, &str)]) {
        for (uri, content) in files {
            self.source.insert(*uri, content);
        }
        let uris: Vec<&str> = files.iter().map(|(uri, _)| *uri).collect();
        self.packages.push(test_package(id, deps, &uris));
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Snapshot::new(SnapshotInputs {
            opts: Arc::new(EngineOpts::default()),
            frontend: self.frontend.clone(),
            file_source: self.source.clone() as Arc<dyn FileSource>,
            file_cache: self.cache.clone(),
            graph: MetadataGraph::new(self.packages.clone()),
            catalog: self.catalog.clone(),
            metrics: self.stats.clone(),
        })
    }
}

fn ids(names: &[&str]) -> Vec<PackageId> {
    names.iter().map(|name| PackageId::new(*name)).collect()
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Lets queued asynchronous cache writes land.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// E1: facty analyzers run on dependencies, enabled ones on roots; repeat
// queries hit the cache; an edit re-analyzes only the edited package.
#[tokio::test(flavor = "multi_thread")]
async fn test_analysis_is_incremental() {
    let mut fx = Fixture::new(vec![&FACTY_X, &ENABLED_Y]);
    fx.add("c", &[], &[("file:///c.src", "package c\nfunc C\n")]);
    fx.add(
        "b",
        &[("c", "c")],
        &[("file:///b.src", "package b\nimport \"c\"\nfunc B: c.C\n")],
    );
    fx.add(
        "a",
        &[("b", "b")],
        &[("file:///a.src", "package a\nimport \"b\"\nfunc A: b.B\n")],
    );

    let snap = fx.snapshot();
    let diags = snap.analyze(&token(), &ids(&["a"]), None).await.unwrap();
    assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");

    let x = FACTY_X.stable_name();
    let y = ENABLED_Y.stable_name();
    // Both analyzers on the root, only the facty one on dependencies.
    assert_eq!(fx.stats.runs_of(&x), 3);
    assert_eq!(fx.stats.runs_of(&y), 1);
    settle().await;

    // Second query after no edits: every node is a cache hit.
    let diags = snap.analyze(&token(), &ids(&["a"]), None).await.unwrap();
    assert!(diags.is_empty());
    assert_eq!(fx.stats.runs_of(&x), 3);
    assert_eq!(fx.stats.runs_of(&y), 1);

    // Edit a's file: only a re-runs; b and c hit the cache.
    fx.source
        .insert("file:///a.src", "package a\nimport \"b\"\nfunc A: b.B\nvar extra\n");
    let snap2 = snap.clone_with(SnapshotChanges::files([Uri::new("file:///a.src")]));
    let checks_before = fx.frontend.type_checks();
    let diags = snap2.analyze(&token(), &ids(&["a"]), None).await.unwrap();
    assert!(diags.is_empty());
    assert_eq!(fx.stats.runs_of(&x), 4);
    assert_eq!(fx.stats.runs_of(&y), 2);
    assert_eq!(fx.frontend.type_checks() - checks_before, 1);
}

// E2: editing a shared leaf invalidates the whole diamond: four re-checks,
// one export write per package, no import-mode checks.
#[tokio::test(flavor = "multi_thread")]
async fn test_leaf_edit_invalidates_diamond() {
    let mut fx = Fixture::new(vec![&FACTY_X, &ENABLED_Y]);
    fx.add("leaf", &[], &[("file:///leaf.src", "package leaf\nfunc Leaf\n")]);
    fx.add(
        "l",
        &[("leaf", "leaf")],
        &[("file:///l.src", "package l\nimport \"leaf\"\nfunc L: leaf.Leaf\n")],
    );
    fx.add(
        "r",
        &[("leaf", "leaf")],
        &[("file:///r.src", "package r\nimport \"leaf\"\nfunc R: leaf.Leaf\n")],
    );
    fx.add(
        "root",
        &[("l", "l"), ("r", "r")],
        &[(
            "file:///root.src",
            "package root\nimport \"l\"\nimport \"r\"\nfunc Root: l.L, r.R\n",
        )],
    );

    let snap = fx.snapshot();
    snap.analyze(&token(), &ids(&["root"]), None).await.unwrap();
    assert_eq!(fx.frontend.type_checks(), 4);
    assert_eq!(fx.frontend.import_checks(), 0);
    settle().await;
    let exports_before = fx.cache.len_of(snapls_core::CacheKind::Export);
    assert_eq!(exports_before, 4);

    // Change the exported surface of the leaf.
    fx.source.insert(
        "file:///leaf.src",
        "package leaf\nfunc Leaf\nfunc Extra\n",
    );
    let snap2 = snap.clone_with(SnapshotChanges::files([Uri::new("file:///leaf.src")]));
    snap2.analyze(&token(), &ids(&["root"]), None).await.unwrap();
    settle().await;

    // All four keys changed: four fresh checks and one export write each.
    assert_eq!(fx.frontend.type_checks(), 8);
    assert_eq!(fx.frontend.import_checks(), 0);
    assert_eq!(fx.cache.len_of(snapls_core::CacheKind::Export), 8);
}

// P3: an edit that stays outside the reachable surface of a transitive
// predecessor leaves that predecessor's key untouched.
#[tokio::test(flavor = "multi_thread")]
async fn test_precise_pruning_skips_unreachable_edits() {
    let mut fx = Fixture::new(vec![]);
    fx.add("p", &[], &[("file:///p.src", "package p\nfunc P\n")]);
    // m's exported surface does not reference p.
    fx.add(
        "m",
        &[("p", "p")],
        &[(
            "file:///m.src",
            "package m\nimport \"p\"\nfunc M\nvar helper: p.P\n",
        )],
    );
    fx.add(
        "q",
        &[("m", "m")],
        &[("file:///q.src", "package q\nimport \"m\"\nfunc Q: m.M\n")],
    );

    let snap = fx.snapshot();
    snap.type_check(&token(), &ids(&["q"])).await.unwrap();
    let q_key = snap
        .package_handle(&PackageId::new("q"))
        .and_then(|handle| handle.key())
        .unwrap();
    let m_key = snap
        .package_handle(&PackageId::new("m"))
        .and_then(|handle| handle.key())
        .unwrap();

    fx.source
        .insert("file:///p.src", "package p\nfunc P\nvar hidden\n");
    let snap2 = snap.clone_with(SnapshotChanges::files([Uri::new("file:///p.src")]));
    snap2.type_check(&token(), &ids(&["q"])).await.unwrap();

    let q_key2 = snap2
        .package_handle(&PackageId::new("q"))
        .and_then(|handle| handle.key())
        .unwrap();
    let m_key2 = snap2
        .package_handle(&PackageId::new("m"))
        .and_then(|handle| handle.key())
        .unwrap();

    // m imports p directly, so its key moves; q only reaches m's exported
    // surface, which does not lead to p.
    assert_ne!(m_key, m_key2);
    assert_eq!(q_key, q_key2);
}

// P7: a clone with no changes shares every handle by pointer.
#[tokio::test(flavor = "multi_thread")]
async fn test_empty_clone_shares_handles() {
    let mut fx = Fixture::new(vec![]);
    fx.add("b", &[], &[("file:///b.src", "package b\nfunc B\n")]);
    fx.add(
        "a",
        &[("b", "b")],
        &[("file:///a.src", "package a\nimport \"b\"\nfunc A: b.B\n")],
    );

    let snap = fx.snapshot();
    snap.type_check(&token(), &ids(&["a"])).await.unwrap();

    let clone = snap.clone_with(SnapshotChanges::default());
    for id in ["a", "b"] {
        let id = PackageId::new(id);
        let before = snap.package_handle(&id).unwrap();
        let after = clone.package_handle(&id).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }
}

// E3: a loader-reported import cycle is broken with a synthetic
// diagnostic, and type checking proceeds.
#[tokio::test(flavor = "multi_thread")]
async fn test_import_cycle_is_broken() {
    let mut fx = Fixture::new(vec![]);
    fx.add(
        "a",
        &[("b", "b")],
        &[("file:///a.src", "package a\nfunc A\n")],
    );
    fx.add(
        "b",
        &[("a", "a")],
        &[("file:///b.src", "package b\nfunc B\n")],
    );

    let snap = fx.snapshot();
    let pkgs = snap.type_check(&token(), &ids(&["a", "b"])).await.unwrap();
    assert_eq!(pkgs.len(), 2);

    let cycle_diags: usize = pkgs
        .iter()
        .flat_map(|pkg| pkg.diagnostics.iter())
        .filter(|diag| diag.message.contains("import cycle"))
        .count();
    assert_eq!(cycle_diags, 1);
}

// E4: cancelling one of two queries sharing a batch leaves the other
// undisturbed.
#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_mid_batch() {
    let mut fx = Fixture::new(vec![]);
    let big: String = std::iter::once("package i\n".to_string())
        .chain((0..2000).map(|n| format!("func I{n}\n")))
        .collect();
    fx.add("i", &[], &[("file:///i.src", &big)]);
    fx.add(
        "p",
        &[("i", "i")],
        &[("file:///p.src", "package p\nimport \"i\"\nfunc P: i.I0\n")],
    );

    let snap = fx.snapshot();
    let cancelled = token();

    let q1 = {
        let snap = snap.clone();
        let ctx = cancelled.clone();
        tokio::spawn(async move { snap.type_check(&ctx, &ids(&["p"])).await })
    };
    let q2 = {
        let snap = snap.clone();
        tokio::spawn(async move { snap.type_check(&token(), &ids(&["p"])).await })
    };

    tokio::time::sleep(Duration::from_millis(2)).await;
    cancelled.cancel();

    let r1 = q1.await.unwrap();
    let r2 = q2.await.unwrap();
    // Q2 always completes with the full result.
    let pkgs = r2.unwrap();
    assert_eq!(pkgs[0].pkg_path.as_str(), "p");
    assert!(pkgs[0].compiles_locally);
    // Q1 either observed the cancellation or had already finished.
    if let Err(err) = r1 {
        assert!(err.is_cancelled());
    }
}

// E5: two analyzers sharing a short name keep distinct actions and facts.
#[tokio::test(flavor = "multi_thread")]
async fn test_same_name_analyzers_do_not_collide() {
    static NILNESS_ONE: Analyzer = Analyzer {
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
        run: |pass| {
            let path = pass.package().pkg_path.clone();
            pass.facts()
                .export_package_fact(path, "impl", serde_json::json!("one"));
            pass.report(snapls_core::Diagnostic::error("", "from one"));
            Ok(Arc::new(()))
        },
    };
    static NILNESS_TWO: Analyzer = Analyzer {
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
        run: |pass| {
            let path = pass.package().pkg_path.clone();
            pass.facts()
                .export_package_fact(path, "impl", serde_json::json!("two"));
            pass.report(snapls_core::Diagnostic::error("", "from two"));
            Ok(Arc::new(()))
        },
    };

    let mut fx = Fixture::new(vec![&NILNESS_ONE, &NILNESS_TWO]);
    fx.add("a", &[], &[("file:///a.src", "package a\nfunc A\n")]);

    let snap = fx.snapshot();
    let diags = snap.analyze(&token(), &ids(&["a"]), None).await.unwrap();
    let messages: Vec<&str> = diags.iter().map(|diag| diag.message.as_str()).collect();
    assert_eq!(messages, vec!["from one", "from two"]);
}

// E6: type errors in a file that failed to parse are suppressed; clean
// files keep theirs.
#[tokio::test(flavor = "multi_thread")]
async fn test_parse_error_suppression() {
    let mut fx = Fixture::new(vec![]);
    fx.add(
        "a",
        &[],
        &[
            ("file:///broken.src", "package a\n!garbage\nfunc F: missing\n"),
            ("file:///clean.src", "func G: alsomissing\n"),
        ],
    );

    let snap = fx.snapshot();
    let pkgs = snap.type_check(&token(), &ids(&["a"])).await.unwrap();
    let messages: Vec<&str> = pkgs[0]
        .diagnostics
        .iter()
        .map(|diag| diag.message.as_str())
        .collect();

    assert!(messages.iter().any(|msg| msg.contains("expected declaration")));
    assert!(messages.iter().any(|msg| msg.contains("undefined: alsomissing")));
    assert!(
        !messages.iter().any(|msg| msg.contains("undefined: missing")),
        "type errors in the broken file must be suppressed: {messages:?}"
    );
}

// P6: a panicking analyzer fails its own action only.
#[tokio::test(flavor = "multi_thread")]
async fn test_analyzer_panic_is_contained() {
    static PANICKY: Analyzer = Analyzer {
        name: "panicky",
        doc: "",
        url: "",
        requires: &[],
        produces_facts: false,
        run_despite_errors: false,
        enabled_by_default: true,
        loc: SourceLoc {
            file: file!(),
            line: line!(),
        },
        run: |_| panic!("analyzer bug"),
    };
    static STEADY: Analyzer = Analyzer {
        name: "steady",
        doc: "",
        url: "",
        requires: &[],
        produces_facts: false,
        run_despite_errors: false,
        enabled_by_default: true,
        loc: SourceLoc {
            file: file!(),
            line: line!(),
        },
        run: |pass| {
            pass.report(snapls_core::Diagnostic::error("", "steady ran"));
            Ok(Arc::new(()))
        },
    };

    let mut fx = Fixture::new(vec![&PANICKY, &STEADY]);
    fx.add("a", &[], &[("file:///a.src", "package a\nfunc A\n")]);

    let snap = fx.snapshot();
    let diags = snap.analyze(&token(), &ids(&["a"]), None).await.unwrap();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].message, "steady ran");
}

// P1: independent engines over identical inputs produce byte-equal cache
// writes and equal diagnostic sequences.
#[tokio::test(flavor = "multi_thread")]
async fn test_determinism_across_engines() {
    let build = || {
        let mut fx = Fixture::new(vec![&FACTY_X, &ENABLED_Y]);
        fx.add("b", &[], &[("file:///b.src", "package b\nfunc B\nvar stray: nope\n")]);
        fx.add(
            "a",
            &[("b", "b")],
            &[("file:///a.src", "package a\nimport \"b\"\nfunc A: b.B\n")],
        );
        fx
    };

    let run = |fx: Fixture| async move {
        let snap = fx.snapshot();
        let diags = snap.analyze(&token(), &ids(&["a"]), None).await.unwrap();
        let pkgs = snap.type_check(&token(), &ids(&["a", "b"])).await.unwrap();
        let mut all: Vec<snapls_core::Diagnostic> = diags;
        for pkg in &pkgs {
            all.extend(pkg.diagnostics.iter().cloned());
        }
        settle().await;
        (serde_json::to_vec(&all).unwrap(), fx.cache.dump())
    };

    let (diags1, dump1) = run(build()).await;
    let (diags2, dump2) = run(build()).await;
    assert_eq!(diags1, diags2);
    assert_eq!(dump1.len(), dump2.len());
    for ((key1, bytes1), (key2, bytes2)) in dump1.iter().zip(dump2.iter()) {
        assert_eq!(key1, key2);
        assert_eq!(bytes1, bytes2, "cache entry {key1:?} differs");
    }
}

// Language built-ins resolve through the frontend's constant packages.
#[tokio::test(flavor = "multi_thread")]
async fn test_builtin_import() {
    let mut fx = Fixture::new(vec![]);
    fx.add("unsafe", &[], &[]);
    fx.add(
        "a",
        &[("unsafe", "unsafe")],
        &[(
            "file:///a.src",
            "package a\nimport \"unsafe\"\nfunc A: unsafe.Pointer\n",
        )],
    );

    let snap = fx.snapshot();
    let pkgs = snap.type_check(&token(), &ids(&["a"])).await.unwrap();
    assert!(pkgs[0].compiles_locally, "{:?}", pkgs[0].diagnostics);
}

// Symbols are extracted per package and cached by local key.
#[tokio::test(flavor = "multi_thread")]
async fn test_symbols_query() {
    let mut fx = Fixture::new(vec![]);
    fx.add(
        "a",
        &[],
        &[("file:///a.src", "package a\nfunc A\ntype T\nvar hidden\n")],
    );

    let snap = fx.snapshot();
    let symbols = snap.symbols(&token(), &ids(&["a"])).await.unwrap();
    let names: Vec<&str> = symbols[0]
        .symbols
        .iter()
        .map(|sym| sym.name.as_str())
        .collect();
    assert_eq!(names, vec!["A", "T", "hidden"]);
    assert!(symbols[0].symbols[0].exported);
    assert!(!symbols[0].symbols[2].exported);
}
