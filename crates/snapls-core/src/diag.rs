//! Diagnostic types and the merge rules applied when a package carries both
//! parse and type errors.

use ecow::EcoString;
use serde::{Deserialize, Serialize};
use snapls_std::debug_loc::CharRange;

use crate::vfs::Uri;

/// The severity of a diagnostic message, following the LSP specification.
#[derive(
    serde_repr::Serialize_repr, serde_repr::Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq,
)]
#[repr(u8)]
pub enum DiagSeverity {
    /// An error message.
    Error = 1,
    /// A warning message.
    Warning = 2,
    /// An information message.
    Information = 3,
    /// A hint message.
    Hint = 4,
}

/// A piece of related information attached to a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagRelated {
    /// The file the related information points into.
    pub uri: Option<Uri>,
    /// The range of the related information.
    pub range: Option<CharRange>,
    /// The message of the related information.
    pub message: EcoString,
}

/// A diagnostic produced by the loader, the compiler frontend, or an
/// analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The file the diagnostic points into, if resolved.
    pub uri: Option<Uri>,
    /// The range of the diagnostic.
    pub range: Option<CharRange>,
    /// The severity of the diagnostic.
    pub severity: DiagSeverity,
    /// The producer of the diagnostic, e.g. `compiler` or an analyzer name.
    pub source: EcoString,
    /// The diagnostic message.
    pub message: EcoString,
    /// A link documenting the diagnostic, if any.
    pub code_href: Option<EcoString>,
    /// Related information attached to the diagnostic.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<DiagRelated>,
}

impl Diagnostic {
    /// Creates an error diagnostic from a source and message.
    pub fn error(source: impl Into<EcoString>, message: impl Into<EcoString>) -> Self {
        Self {
            uri: None,
            range: None,
            severity: DiagSeverity::Error,
            source: source.into(),
            message: message.into(),
            code_href: None,
            related: Vec::new(),
        }
    }

    /// Attaches a file location to the diagnostic.
    pub fn at(mut self, uri: Uri, range: Option<CharRange>) -> Self {
        self.uri = Some(uri);
        self.range = range;
        self
    }
}

/// Merges parse and type errors of one package into its diagnostic list.
///
/// Type errors pointing into a file that failed to parse are suppressed;
/// they are follow-ons of the parse failure. Continuation errors (messages
/// prefixed with a tab) attach as related information to the previous
/// diagnostic in the batch.
pub fn merge_package_diagnostics(
    parse_errors: Vec<Diagnostic>,
    type_errors: Vec<Diagnostic>,
    broken_files: &[Uri],
) -> Vec<Diagnostic> {
    let mut out = parse_errors;
    let first_type_error = out.len();

    for diag in type_errors {
        if let Some(uri) = &diag.uri {
            if broken_files.contains(uri) {
                continue;
            }
        }
        if let Some(message) = diag.message.strip_prefix('\t') {
            // A continuation of the previous type error.
            if out.len() > first_type_error {
                if let Some(prev) = out.last_mut() {
                    prev.related.push(DiagRelated {
                        uri: diag.uri.clone(),
                        range: diag.range,
                        message: message.into(),
                    });
                    continue;
                }
            }
        }
        out.push(diag);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_error(uri: &str, message: &str) -> Diagnostic {
        Diagnostic::error("compiler", message).at(Uri::new(uri), None)
    }

    #[test]
    fn test_suppresses_type_errors_in_broken_files() {
        let broken = vec![Uri::new("file:///broken.src")];
        let parse = vec![type_error("file:///broken.src", "expected declaration")];
        let types = vec![
            type_error("file:///broken.src", "undefined: x"),
            type_error("file:///ok.src", "undefined: y"),
        ];

        let merged = merge_package_diagnostics(parse, types, &broken);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].message, "expected declaration");
        assert_eq!(merged[1].message, "undefined: y");
    }

    #[test]
    fn test_continuation_attaches_to_previous() {
        let types = vec![
            type_error("file:///a.src", "cannot use x"),
            type_error("file:///a.src", "\thave int, want string"),
        ];

        let merged = merge_package_diagnostics(Vec::new(), types, &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].related.len(), 1);
        assert_eq!(merged[0].related[0].message, "have int, want string");
    }

    #[test]
    fn test_leading_continuation_stays_standalone() {
        let types = vec![type_error("file:///a.src", "\tstray continuation")];
        let merged = merge_package_diagnostics(Vec::new(), types, &[]);
        assert_eq!(merged.len(), 1);
    }
}
