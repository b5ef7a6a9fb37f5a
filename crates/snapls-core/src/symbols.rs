//! Package-level symbol extraction.

use std::sync::Arc;

use ecow::EcoString;
use serde::{Deserialize, Serialize};
use snapls_std::debug_loc::CharRange;
use snapls_std::error::prelude::*;
use snapls_std::hash::{Digest, DigestSink};

use crate::cache::{CacheKind, FileCache as _};
use crate::frontend::{DeclKind, ParseMode};
use crate::handle::{self, EvalCtx, PackageHandle};
use crate::id::{PackageId, PackagePath};
use crate::vfs::Uri;

/// Bump on any change to the encoded form below.
const SYMBOLS_GENERATION: u64 = 1;

/// One package-level symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// The declared name.
    pub name: EcoString,
    /// The declaration kind.
    pub kind: DeclKind,
    /// Whether the name is exported.
    pub exported: bool,
    /// The declaring file.
    pub uri: Uri,
    /// The declaration range.
    pub range: CharRange,
}

/// The symbols of one package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolPackage {
    /// The package id.
    pub id: PackageId,
    /// The package path.
    pub pkg_path: PackagePath,
    /// The symbols, in file order.
    pub symbols: Vec<SymbolInfo>,
}

fn symbols_key(local_key: Digest) -> Digest {
    let mut sink = DigestSink::with_domain("symbols");
    sink.u64(SYMBOLS_GENERATION);
    sink.digest(&local_key);
    sink.finish()
}

/// Extracts the symbols of one evaluated package, going through the
/// symbols cache. The key covers only local inputs: symbols do not depend
/// on dependencies.
pub(crate) fn package_symbols(
    ctx: &Arc<EvalCtx>,
    handle: &Arc<PackageHandle>,
) -> Result<Arc<SymbolPackage>> {
    let local = handle
        .local_data()
        .ok_or_else(|| error_once!("symbols of unevaluated package", id: handle.meta.id))?;

    let key = symbols_key(local.local_key);
    if let Some(bytes) = ctx.file_cache.get(CacheKind::Symbols, &key) {
        if let Ok(symbols) = serde_json::from_slice::<SymbolPackage>(&bytes) {
            return Ok(Arc::new(symbols));
        }
        log::warn!("malformed symbols entry for {}", handle.meta.id);
    }

    let parsed = ctx
        .parse_cache
        .parse(ctx.frontend.as_ref(), &local.files, ParseMode::Full);
    let mut symbols = Vec::new();
    for file in &parsed {
        for decl in &file.decls {
            symbols.push(SymbolInfo {
                name: decl.name.clone(),
                kind: decl.kind,
                exported: decl.exported,
                uri: file.uri.clone(),
                range: decl.range,
            });
        }
    }

    let result = Arc::new(SymbolPackage {
        id: handle.meta.id.clone(),
        pkg_path: handle.meta.pkg_path.clone(),
        symbols,
    });
    handle::spawn_cache_write(
        ctx,
        CacheKind::Symbols,
        key,
        serde_json::to_vec(result.as_ref()).unwrap_or_default(),
    );
    Ok(result)
}
