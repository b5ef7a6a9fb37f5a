//! The compiler frontend contract.
//!
//! The engine treats parsing, type checking, and the export-data codec as a
//! black box behind this trait; everything it learns about source code
//! arrives through the types below.

use std::any::Any;
use std::sync::Arc;

use ecow::EcoString;
use serde::{Deserialize, Serialize};
use snapls_std::debug_loc::CharRange;
use snapls_std::error::prelude::*;
use snapls_std::hash::{Digest, FxHashMap};

use crate::diag::Diagnostic;
use crate::handle::TypeCheckInputs;
use crate::id::{ImportPath, PackageName, PackagePath};
use crate::vfs::{FileHandle, Uri};

/// How deep a file is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParseMode {
    /// The whole file, with full position information.
    Full,
    /// Declarations only, with object resolution skipped. Used on the
    /// import path where function bodies are ignored.
    Header,
}

/// The kind of a top-level declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclKind {
    /// A function or method.
    Func,
    /// A type declaration.
    Type,
    /// A variable declaration.
    Var,
    /// A constant declaration.
    Const,
}

/// A symbol referenced by a declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefTarget {
    /// A reference to a declaration of the same package.
    Local(EcoString),
    /// A reference to a symbol of an imported package.
    External(ImportPath, EcoString),
}

/// One top-level declaration of a parsed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedDecl {
    /// The declared name.
    pub name: EcoString,
    /// The declaration kind.
    pub kind: DeclKind,
    /// Whether the name is exported.
    pub exported: bool,
    /// The declaration range within its file.
    pub range: CharRange,
    /// The symbols the declaration references, syntactically.
    pub refs: Vec<RefTarget>,
}

/// A parsed file. Parse failures are carried as diagnostics; a file that
/// failed to parse has `broken` set and its declarations are best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFile {
    /// The file identifier.
    pub uri: Uri,
    /// The digest of the parsed content.
    pub digest: Digest,
    /// The declared package name, if the clause parsed.
    pub package_name: Option<PackageName>,
    /// The imports declared by the file.
    pub imports: Vec<ImportPath>,
    /// The top-level declarations.
    pub decls: Vec<ParsedDecl>,
    /// Parse errors, if any.
    pub errors: Vec<Diagnostic>,
    /// Whether the file failed to parse.
    pub broken: bool,
}

/// A type-checked-for-import package: the exported surface of a package,
/// without syntax trees or function bodies.
#[derive(Debug)]
pub struct TypesPackage {
    /// The package path.
    pub path: PackagePath,
    /// The package name.
    pub name: PackageName,
    /// The exported names, sorted.
    pub exports: Vec<EcoString>,
    /// The packages this one imports, type-checked for import.
    pub imports: Vec<Arc<TypesPackage>>,
    /// Frontend-private data, e.g. the real type-checker object.
    pub payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl TypesPackage {
    /// Whether the package exports the given name.
    pub fn exports_name(&self, name: &str) -> bool {
        self.exports.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    /// Walks `imports` transitively, recording every distinct package by
    /// path. First-wins on duplicate paths.
    pub fn transitive_imports(&self) -> FxHashMap<PackagePath, Arc<TypesPackage>> {
        let mut out: FxHashMap<PackagePath, Arc<TypesPackage>> = FxHashMap::default();
        let mut stack: Vec<Arc<TypesPackage>> = self.imports.clone();
        while let Some(pkg) = stack.pop() {
            if out.contains_key(&pkg.path) {
                continue;
            }
            stack.extend(pkg.imports.iter().cloned());
            out.insert(pkg.path.clone(), pkg);
        }
        out
    }
}

/// The request handed to the type checker.
pub struct TypeCheckRequest<'a> {
    /// The full input record of the package.
    pub inputs: &'a TypeCheckInputs,
    /// The parsed compiled files, in input order.
    pub files: &'a [Arc<ParsedFile>],
    /// The resolved import packages, keyed by source-visible import path.
    /// A declared import missing here failed to resolve; the checker
    /// reports a structured error on the import declaration.
    pub deps: &'a FxHashMap<ImportPath, Arc<TypesPackage>>,
}

/// The output of a full type check.
pub struct TypeCheckOutput {
    /// The types of the package.
    pub types: Arc<TypesPackage>,
    /// Type errors, in source order.
    pub type_errors: Vec<Diagnostic>,
}

/// The black-box compiler frontend.
///
/// Implementations must be deterministic: equal requests yield equal
/// outputs, including diagnostic order. Positions from imports and syntax
/// share one address space because every parse goes through the engine's
/// parse cache.
pub trait Frontend: Send + Sync {
    /// Parses one file. Parse errors land inside the returned file.
    fn parse(&self, file: &FileHandle, mode: ParseMode) -> Arc<ParsedFile>;

    /// Fully type-checks a package.
    fn type_check(&self, req: &TypeCheckRequest) -> Result<TypeCheckOutput>;

    /// Type-checks a package for import: function bodies ignored.
    fn type_check_for_import(&self, req: &TypeCheckRequest) -> Result<Arc<TypesPackage>>;

    /// Encodes export data for a type-checked package.
    fn export(&self, types: &TypesPackage) -> Vec<u8>;

    /// Decodes export data, resolving dependency packages through the given
    /// lookup.
    fn import_from_export(
        &self,
        data: &[u8],
        deps: &dyn Fn(&PackagePath) -> Option<Arc<TypesPackage>>,
    ) -> Result<Arc<TypesPackage>>;

    /// The constant package for a language built-in sentinel path, e.g.
    /// `unsafe`.
    fn builtin_package(&self, path: &PackagePath) -> Option<Arc<TypesPackage>>;

    /// Encodes the cross-reference index of a package.
    fn xrefs(&self, _files: &[Arc<ParsedFile>], _types: &TypesPackage) -> Vec<u8> {
        Vec::new()
    }

    /// Encodes the method-set index of a package.
    fn methodsets(&self, _files: &[Arc<ParsedFile>], _types: &TypesPackage) -> Vec<u8> {
        Vec::new()
    }

    /// Encodes the test index of a package.
    fn test_index(&self, _files: &[Arc<ParsedFile>], _types: &TypesPackage) -> Vec<u8> {
        Vec::new()
    }
}
