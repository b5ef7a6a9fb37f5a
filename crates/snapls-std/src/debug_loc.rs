//! Source location types for diagnostics.

use core::fmt;

use serde::{Deserialize, Serialize};

/// A char position represented in form of line and column.
/// The position is encoded in Utf-8 or Utf-16, and the encoding is
/// determined by usage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
pub struct CharPosition {
    /// The line number, starting at 0.
    pub line: usize,
    /// The column number, starting at 0.
    pub column: usize,
}

impl fmt::Display for CharPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

impl From<(usize, usize)> for CharPosition {
    fn from((line, column): (usize, usize)) -> Self {
        CharPosition { line, column }
    }
}

/// A resolved file range.
///
/// See [`CharPosition`] for the definition of the position inside a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
pub struct CharRange {
    /// The start position.
    pub start: CharPosition,
    /// The end position.
    pub end: CharPosition,
}

impl CharRange {
    /// Creates a range covering a whole line.
    pub fn line(line: usize) -> Self {
        Self {
            start: CharPosition { line, column: 0 },
            end: CharPosition { line, column: 0 },
        }
    }
}

impl fmt::Display for CharRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}
