//! The serializable result of analyzing one package.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snapls_std::hash::{Digest, DigestSink};

use crate::diag::Diagnostic;
use crate::id::PackagePath;

/// Bump on any change to the encoded form below.
const SUMMARY_GENERATION: u64 = 4;

/// The result of one analyzer on one package.
///
/// If `err` is set, the other fields are undefined.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionSummary {
    /// The encoded fact set produced by the action.
    pub facts: Vec<u8>,
    /// The digest of `facts`.
    pub facts_hash: Digest,
    /// Diagnostics reported by the action.
    pub diagnostics: Vec<Diagnostic>,
    /// Why the action did not complete, if it did not.
    pub err: Option<String>,
}

impl ActionSummary {
    /// A summary for an action that could not run.
    pub fn failed(err: impl Into<String>) -> Self {
        Self {
            err: Some(err.into()),
            ..Default::default()
        }
    }
}

/// The serializable summary of analyzing one package: the `compiles` bit
/// and one action per analyzer, keyed by stable name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeSummary {
    /// Whether the package and every transitive dependency had no loader,
    /// parse, or type-check errors.
    pub compiles: bool,
    /// One entry per analyzer the node was asked to run.
    pub actions: BTreeMap<String, ActionSummary>,
}

impl AnalyzeSummary {
    /// The hash contributed to predecessors' cache keys.
    ///
    /// Diagnostics are deliberately excluded: they do not influence
    /// downstream analyses.
    pub fn summary_hash(&self, pkg_path: &PackagePath) -> Digest {
        let mut sink = DigestSink::with_domain("analyze-summary");
        sink.u64(SUMMARY_GENERATION);
        sink.str(pkg_path.as_str());
        sink.u64(self.compiles as u64);
        for (stable_name, action) in &self.actions {
            sink.str(stable_name);
            match &action.err {
                Some(err) => {
                    sink.u64(1);
                    sink.str(err);
                }
                None => {
                    sink.u64(0);
                    sink.digest(&action.facts_hash);
                }
            }
        }
        sink.finish()
    }

    /// Encodes the summary; stable key order makes the encoding
    /// byte-stable.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes a summary; `None` means the bytes are malformed and the
    /// caller recomputes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_diagnostics() {
        let mut with_diags = AnalyzeSummary {
            compiles: true,
            actions: BTreeMap::new(),
        };
        with_diags.actions.insert(
            "nilness(a.rs:1)".into(),
            ActionSummary {
                facts: Vec::new(),
                facts_hash: Digest::ZERO,
                diagnostics: vec![Diagnostic::error("nilness", "possible nil deref")],
                err: None,
            },
        );
        let mut without = with_diags.clone();
        if let Some(action) = without.actions.get_mut("nilness(a.rs:1)") {
            action.diagnostics.clear();
        }

        let path = PackagePath::new("example.com/a");
        assert_eq!(with_diags.summary_hash(&path), without.summary_hash(&path));
    }

    #[test]
    fn test_hash_tracks_facts_and_errors() {
        let path = PackagePath::new("example.com/a");
        let mut base = AnalyzeSummary {
            compiles: true,
            actions: BTreeMap::new(),
        };
        base.actions
            .insert("x(a.rs:1)".into(), ActionSummary::default());
        let base_hash = base.summary_hash(&path);

        let mut with_facts = base.clone();
        if let Some(action) = with_facts.actions.get_mut("x(a.rs:1)") {
            action.facts_hash = Digest::of(b"facts");
        }
        assert_ne!(base_hash, with_facts.summary_hash(&path));

        let mut with_err = base.clone();
        if let Some(action) = with_err.actions.get_mut("x(a.rs:1)") {
            action.err = Some("panic".into());
        }
        assert_ne!(base_hash, with_err.summary_hash(&path));

        let mut no_compile = base;
        no_compile.compiles = false;
        assert_ne!(base_hash, no_compile.summary_hash(&path));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(AnalyzeSummary::decode(b"not json").is_none());
    }
}
