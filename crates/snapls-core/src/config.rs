//! The options to create the engine.

use std::collections::BTreeMap;

use ecow::EcoString;
use serde::{Deserialize, Serialize};

/// The options to create a snapshot engine.
///
/// All environment-derived values arrive here as opaque strings; the core
/// itself never reads the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOpts {
    /// A tag distinguishing the view type a snapshot serves.
    #[serde(rename = "viewKind")]
    pub view_kind: EcoString,

    /// The URL template for diagnostic links.
    #[serde(rename = "linkTarget")]
    pub link_target: EcoString,

    /// Whether diagnostics carry related information.
    #[serde(rename = "relatedInformation")]
    pub related_information: bool,

    /// The language version string, e.g. `go1.24`.
    #[serde(rename = "languageVersion")]
    pub language_version: EcoString,

    /// Per-analyzer enablement overriding the catalog defaults.
    pub analyzers: BTreeMap<EcoString, bool>,

    /// The vulnerability database URL analog, treated as an opaque string.
    #[serde(rename = "vulndbUrl")]
    pub vulndb_url: Option<EcoString>,

    /// Overrides the CPU-bound fan-out width. Zero means the logical CPU
    /// count.
    pub parallelism: usize,

    /// Bounds concurrent disk-cache writers.
    #[serde(rename = "cacheWriters")]
    pub cache_writers: usize,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            view_kind: "default".into(),
            link_target: "https://pkg.go.dev".into(),
            related_information: true,
            language_version: EcoString::new(),
            analyzers: BTreeMap::new(),
            vulndb_url: None,
            parallelism: 0,
            cache_writers: 32,
        }
    }
}

impl EngineOpts {
    /// The effective CPU-bound fan-out width.
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            return self.parallelism;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
