//! Analyzer facts: key/value annotations on objects or packages,
//! serialized per analyzer and importable by dependent analyses.

use std::collections::BTreeMap;

use ecow::EcoString;
use serde::{Deserialize, Serialize};
use snapls_std::hash::Digest;

use crate::id::PackagePath;

/// Addresses one fact: a package, an optional object within it, and the
/// fact kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    /// The package the fact is about.
    pub pkg: PackagePath,
    /// The object the fact is about; `None` for package-level facts.
    pub object: Option<EcoString>,
    /// The fact kind, scoped per analyzer by construction.
    pub kind: EcoString,
}

/// The fact set threaded through one action: facts imported from
/// dependency actions of the same analyzer, plus facts exported while the
/// analyzer runs.
#[derive(Debug, Default)]
pub struct FactSet {
    facts: BTreeMap<FactKey, serde_json::Value>,
    sealed: bool,
}

impl FactSet {
    /// Imports the encoded facts of a dependency action, keeping only
    /// facts about packages the filter admits.
    ///
    /// The filter may have false positives; those cost a useless entry,
    /// never a wrong answer.
    pub fn import(&mut self, encoded: &[u8], admit: impl Fn(&PackagePath) -> bool) {
        let Some(decoded) = decode_facts(encoded) else {
            log::warn!("malformed fact blob; dropping");
            return;
        };
        for (key, value) in decoded {
            if admit(&key.pkg) {
                self.facts.insert(key, value);
            }
        }
    }

    /// Records a fact about an object.
    ///
    /// Panics if the owning action already completed.
    pub fn export_object_fact(
        &mut self,
        pkg: PackagePath,
        object: impl Into<EcoString>,
        kind: impl Into<EcoString>,
        value: serde_json::Value,
    ) {
        self.export(FactKey {
            pkg,
            object: Some(object.into()),
            kind: kind.into(),
        }, value);
    }

    /// Records a fact about a package.
    ///
    /// Panics if the owning action already completed.
    pub fn export_package_fact(
        &mut self,
        pkg: PackagePath,
        kind: impl Into<EcoString>,
        value: serde_json::Value,
    ) {
        self.export(FactKey {
            pkg,
            object: None,
            kind: kind.into(),
        }, value);
    }

    fn export(&mut self, key: FactKey, value: serde_json::Value) {
        assert!(
            !self.sealed,
            "fact export after the analyzer completed: {key:?}"
        );
        self.facts.insert(key, value);
    }

    /// Reads an object fact.
    pub fn object_fact(
        &self,
        pkg: &PackagePath,
        object: &str,
        kind: &str,
    ) -> Option<&serde_json::Value> {
        self.facts.get(&FactKey {
            pkg: pkg.clone(),
            object: Some(object.into()),
            kind: kind.into(),
        })
    }

    /// Reads a package fact.
    pub fn package_fact(&self, pkg: &PackagePath, kind: &str) -> Option<&serde_json::Value> {
        self.facts.get(&FactKey {
            pkg: pkg.clone(),
            object: None,
            kind: kind.into(),
        })
    }

    /// Disables further exports.
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    /// Encodes the set; the encoding is byte-stable because the map is
    /// ordered.
    pub fn encode(&self) -> Vec<u8> {
        let entries: Vec<(&FactKey, &serde_json::Value)> = self.facts.iter().collect();
        serde_json::to_vec(&entries).unwrap_or_default()
    }

    /// The digest of the encoded set.
    pub fn digest(&self) -> Digest {
        Digest::of(&self.encode())
    }

    /// Whether no facts are recorded.
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

fn decode_facts(encoded: &[u8]) -> Option<Vec<(FactKey, serde_json::Value)>> {
    serde_json::from_slice(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_filter() {
        let mut facts = FactSet::default();
        facts.export_object_fact(
            PackagePath::new("example.com/a"),
            "F",
            "nilness",
            serde_json::json!({"nil": true}),
        );
        facts.export_package_fact(
            PackagePath::new("example.com/b"),
            "purity",
            serde_json::json!(1),
        );

        let mut imported = FactSet::default();
        imported.import(&facts.encode(), |pkg| pkg.as_str() == "example.com/a");
        assert!(imported
            .object_fact(&PackagePath::new("example.com/a"), "F", "nilness")
            .is_some());
        assert!(imported
            .package_fact(&PackagePath::new("example.com/b"), "purity")
            .is_none());
    }

    #[test]
    fn test_encoding_is_stable() {
        let mut lhs = FactSet::default();
        let mut rhs = FactSet::default();
        for (pkg, obj) in [("b", "Y"), ("a", "X")] {
            lhs.export_object_fact(PackagePath::new(pkg), obj, "k", serde_json::json!(0));
        }
        for (pkg, obj) in [("a", "X"), ("b", "Y")] {
            rhs.export_object_fact(PackagePath::new(pkg), obj, "k", serde_json::json!(0));
        }
        assert_eq!(lhs.encode(), rhs.encode());
        assert_eq!(lhs.digest(), rhs.digest());
    }

    #[test]
    #[should_panic(expected = "fact export after the analyzer completed")]
    fn test_export_after_seal_panics() {
        let mut facts = FactSet::default();
        facts.seal();
        facts.export_package_fact(PackagePath::new("a"), "k", serde_json::json!(0));
    }
}
