//! Test support: a deterministic miniature frontend over a line-based
//! toy language, plus fixture helpers.
//!
//! The language is one declaration per line:
//!
//! ```text
//! package a
//! import "example.com/b"
//! func F: b.X, helper
//! type T
//! var helper
//! !anything      <- a parse error
//! ```
//!
//! A reference `b.X` resolves through the import whose last path segment
//! is `b`; a bare reference resolves within the package. Exported names
//! start with an uppercase letter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ecow::EcoString;
use serde::{Deserialize, Serialize};
use snapls_std::debug_loc::CharRange;
use snapls_std::error::prelude::*;
use snapls_std::{bail, hash::FxHashMap};

use crate::diag::Diagnostic;
use crate::frontend::{
    DeclKind, Frontend, ParseMode, ParsedDecl, ParsedFile, RefTarget, TypeCheckOutput,
    TypeCheckRequest, TypesPackage,
};
use crate::id::{ImportPath, PackageId, PackageName, PackagePath};
use crate::metadata::MetadataPackage;
use crate::vfs::{FileHandle, Uri};

/// A deterministic frontend for the toy language, counting its
/// invocations so tests can assert how much work a query performed.
#[derive(Default)]
pub struct TestFrontend {
    parses: AtomicU64,
    type_checks: AtomicU64,
    import_checks: AtomicU64,
}

impl TestFrontend {
    /// The number of full type checks performed.
    pub fn type_checks(&self) -> u64 {
        self.type_checks.load(Ordering::SeqCst)
    }

    /// The number of for-import type checks performed.
    pub fn import_checks(&self) -> u64 {
        self.import_checks.load(Ordering::SeqCst)
    }

    /// The number of files parsed (cache misses only).
    pub fn parses(&self) -> u64 {
        self.parses.load(Ordering::SeqCst)
    }
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}

fn decl_kind(keyword: &str) -> Option<DeclKind> {
    match keyword {
        "func" => Some(DeclKind::Func),
        "type" => Some(DeclKind::Type),
        "var" => Some(DeclKind::Var),
        "const" => Some(DeclKind::Const),
        _ => None,
    }
}

/// The export-data encoding of the toy language.
#[derive(Serialize, Deserialize)]
struct ExportData {
    path: PackagePath,
    name: PackageName,
    exports: Vec<EcoString>,
    deps: Vec<PackagePath>,
}

impl Frontend for TestFrontend {
    fn parse(&self, file: &FileHandle, _mode: ParseMode) -> Arc<ParsedFile> {
        self.parses.fetch_add(1, Ordering::SeqCst);

        let mut parsed = ParsedFile {
            uri: file.uri.clone(),
            digest: file.digest,
            package_name: None,
            imports: Vec::new(),
            decls: Vec::new(),
            errors: Vec::new(),
            broken: false,
        };
        let Ok(text) = file.text() else {
            parsed.broken = true;
            parsed
                .errors
                .push(Diagnostic::error("compiler", "file is not valid utf-8")
                    .at(file.uri.clone(), None));
            return Arc::new(parsed);
        };

        // Import aliases visible to reference resolution in this file.
        let mut aliases: FxHashMap<&str, ImportPath> = FxHashMap::default();

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            if let Some(rest) = line.strip_prefix('!') {
                parsed.broken = true;
                parsed.errors.push(
                    Diagnostic::error("compiler", format!("expected declaration, found {rest:?}"))
                        .at(file.uri.clone(), Some(CharRange::line(line_no))),
                );
                continue;
            }
            if let Some(name) = line.strip_prefix("package ") {
                parsed.package_name = Some(PackageName::new(name.trim()));
                continue;
            }
            if let Some(path) = line.strip_prefix("import ") {
                let path = path.trim().trim_matches('"');
                let imp = ImportPath::new(path);
                let alias = path.rsplit('/').next().unwrap_or(path);
                aliases.insert(alias, imp.clone());
                parsed.imports.push(imp);
                continue;
            }

            let (head, refs) = match line.split_once(':') {
                Some((head, refs)) => (head.trim(), refs.trim()),
                None => (line, ""),
            };
            let mut words = head.split_whitespace();
            let keyword = words.next().unwrap_or_default();
            let Some(kind) = decl_kind(keyword) else {
                parsed.broken = true;
                parsed.errors.push(
                    Diagnostic::error("compiler", format!("expected declaration, found {line:?}"))
                        .at(file.uri.clone(), Some(CharRange::line(line_no))),
                );
                continue;
            };
            let Some(name) = words.next() else {
                parsed.broken = true;
                parsed.errors.push(
                    Diagnostic::error("compiler", "declaration is missing a name")
                        .at(file.uri.clone(), Some(CharRange::line(line_no))),
                );
                continue;
            };

            let mut targets = Vec::new();
            for target in refs.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                match target.split_once('.') {
                    Some((alias, sym)) => match aliases.get(alias) {
                        Some(imp) => {
                            targets.push(RefTarget::External(imp.clone(), sym.into()));
                        }
                        None => targets.push(RefTarget::Local(target.into())),
                    },
                    None => targets.push(RefTarget::Local(target.into())),
                }
            }
            parsed.decls.push(ParsedDecl {
                name: name.into(),
                kind,
                exported: is_exported(name),
                range: CharRange::line(line_no),
                refs: targets,
            });
        }

        Arc::new(parsed)
    }

    fn type_check(&self, req: &TypeCheckRequest) -> Result<TypeCheckOutput> {
        self.type_checks.fetch_add(1, Ordering::SeqCst);

        let mut type_errors = Vec::new();
        let local_names: Vec<&EcoString> = req
            .files
            .iter()
            .flat_map(|file| file.decls.iter().map(|decl| &decl.name))
            .collect();

        for file in req.files {
            for imp in &file.imports {
                if !req.deps.contains_key(imp) {
                    type_errors.push(
                        Diagnostic::error("compiler", format!("could not import {imp}"))
                            .at(file.uri.clone(), None),
                    );
                }
            }
            for decl in &file.decls {
                for target in &decl.refs {
                    match target {
                        RefTarget::Local(name) => {
                            if !local_names.iter().any(|local| *local == name) {
                                type_errors.push(
                                    Diagnostic::error("compiler", format!("undefined: {name}"))
                                        .at(file.uri.clone(), Some(decl.range)),
                                );
                            }
                        }
                        RefTarget::External(imp, sym) => match req.deps.get(imp) {
                            Some(dep) if dep.exports_name(sym) => {}
                            Some(dep) => {
                                type_errors.push(
                                    Diagnostic::error(
                                        "compiler",
                                        format!("undefined: {}.{sym}", dep.name),
                                    )
                                    .at(file.uri.clone(), Some(decl.range)),
                                );
                            }
                            None => {
                                // The import failed; already reported above.
                            }
                        },
                    }
                }
            }
        }

        Ok(TypeCheckOutput {
            types: self.types_of(req),
            type_errors,
        })
    }

    fn type_check_for_import(&self, req: &TypeCheckRequest) -> Result<Arc<TypesPackage>> {
        self.import_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.types_of(req))
    }

    fn export(&self, types: &TypesPackage) -> Vec<u8> {
        let data = ExportData {
            path: types.path.clone(),
            name: types.name.clone(),
            exports: types.exports.clone(),
            deps: types.imports.iter().map(|dep| dep.path.clone()).collect(),
        };
        serde_json::to_vec(&data).unwrap_or_default()
    }

    fn import_from_export(
        &self,
        data: &[u8],
        deps: &dyn Fn(&PackagePath) -> Option<Arc<TypesPackage>>,
    ) -> Result<Arc<TypesPackage>> {
        let decoded: ExportData = serde_json::from_slice(data).context("importFromExport")?;
        let mut imports = Vec::new();
        for path in &decoded.deps {
            match deps(path) {
                Some(dep) => imports.push(dep),
                None => bail!("export data references unknown package {path}"),
            }
        }
        Ok(Arc::new(TypesPackage {
            path: decoded.path,
            name: decoded.name,
            exports: decoded.exports,
            imports,
            payload: None,
        }))
    }

    fn builtin_package(&self, path: &PackagePath) -> Option<Arc<TypesPackage>> {
        (path.as_str() == "unsafe").then(|| {
            Arc::new(TypesPackage {
                path: path.clone(),
                name: PackageName::new("unsafe"),
                exports: vec!["Pointer".into(), "Sizeof".into()],
                imports: Vec::new(),
                payload: None,
            })
        })
    }
}

impl TestFrontend {
    fn types_of(&self, req: &TypeCheckRequest) -> Arc<TypesPackage> {
        let mut exports: Vec<EcoString> = req
            .files
            .iter()
            .flat_map(|file| file.decls.iter())
            .filter(|decl| decl.exported)
            .map(|decl| decl.name.clone())
            .collect();
        exports.sort();
        exports.dedup();

        let mut imports: Vec<Arc<TypesPackage>> = req.deps.values().cloned().collect();
        imports.sort_by(|lhs, rhs| lhs.path.cmp(&rhs.path));

        Arc::new(TypesPackage {
            path: req.inputs.pkg_path.clone(),
            name: req.inputs.name.clone(),
            exports,
            imports,
            payload: None,
        })
    }
}

/// A metadata record for a test package whose id, path, and name coincide.
pub fn test_package(
    id: &str,
    deps: &[(&str, &str)],
    files: &[&str],
) -> MetadataPackage {
    MetadataPackage {
        id: PackageId::new(id),
        pkg_path: PackagePath::new(id),
        name: PackageName::new(id.rsplit('/').next().unwrap_or(id)),
        go_files: files.iter().map(|uri| Uri::new(*uri)).collect(),
        compiled_go_files: files.iter().map(|uri| Uri::new(*uri)).collect(),
        deps_by_imp_path: deps
            .iter()
            .map(|(imp, id)| (ImportPath::new(*imp), PackageId::new(*id)))
            .collect(),
        deps_by_pkg_path: deps
            .iter()
            .map(|(imp, id)| (PackagePath::new(*imp), PackageId::new(*id)))
            .collect(),
        ..Default::default()
    }
}
