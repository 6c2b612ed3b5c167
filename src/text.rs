//! Source positions and virtual source edits.
//!
//! Positions follow the Python `ast` convention: 1-indexed lines, 0-indexed
//! byte columns, half-open on the column end. The line-oriented `cut` and
//! `replace` helpers use 0-indexed lines instead, matching the coordinates
//! call-frame introspection hands around.
//!
//! `ReplacedString` pairs a source text with pending edits so that positions
//! keep referring to the unedited text while extraction sees the edited one.
//! This is what lets parameter overrides survive call-site recovery without
//! invalidating every cached position.

use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextError {
    /// A cut boundary fell strictly inside a pending replacement.
    #[error("cut boundary at line {line}, column {col} falls inside a replacement")]
    AmbiguousCut { line: usize, col: usize },

    /// A line/column position pointed outside the text.
    #[error("position out of bounds: line {line}, column {col}")]
    OutOfBounds { line: usize, col: usize },
}

pub type TextResult<T> = Result<T, TextError>;

// ============================================================================
// Positions
// ============================================================================

/// A statement or expression position in source text.
///
/// Lines are 1-indexed, columns are 0-indexed byte offsets into the line.
/// The end column is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Position {
    pub lineno: usize,
    pub end_lineno: usize,
    pub col_offset: usize,
    pub end_col_offset: usize,
}

/// Convert a flat byte span into a [`Position`].
///
/// # Arguments
///
/// * `start` / `end` - byte offsets into `text`, half-open
/// * `text` - the text the offsets refer to
pub fn span_to_pos(start: usize, end: usize, text: &str) -> Position {
    let (lineno, col_offset) = offset_to_line_col(start, text);
    let (end_lineno, end_col_offset) = offset_to_line_col(end, text);
    Position {
        lineno,
        end_lineno,
        col_offset,
        end_col_offset,
    }
}

fn offset_to_line_col(offset: usize, text: &str) -> (usize, usize) {
    let offset = offset.min(text.len());
    let before = &text[..offset];
    let lineno = before.bytes().filter(|&b| b == b'\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    (lineno, offset - line_start)
}

/// Convert a 0-indexed line and byte column into a flat byte offset.
pub fn line_col_to_offset(text: &str, line: usize, col: usize) -> TextResult<usize> {
    let mut start = 0usize;
    for _ in 0..line {
        match text[start..].find('\n') {
            Some(i) => start += i + 1,
            None => return Err(TextError::OutOfBounds { line, col }),
        }
    }
    let line_end = text[start..]
        .find('\n')
        .map(|i| start + i)
        .unwrap_or(text.len());
    if start + col > line_end || !text.is_char_boundary(start + col) {
        return Err(TextError::OutOfBounds { line, col });
    }
    Ok(start + col)
}

// ============================================================================
// Line-oriented cut and replace
// ============================================================================

/// Extract the text between two line/column positions.
///
/// Lines are 0-indexed, columns are byte offsets, the end column is
/// exclusive.
pub fn cut(
    text: &str,
    start_line: usize,
    end_line: usize,
    start_col: usize,
    end_col: usize,
) -> TextResult<String> {
    let a = line_col_to_offset(text, start_line, start_col)?;
    let b = line_col_to_offset(text, end_line, end_col)?;
    Ok(text[a..b].to_string())
}

/// Replace the text between two line/column positions.
///
/// Coordinates as in [`cut`]. The replacement may span a different number of
/// lines than the replaced region.
pub fn replace(
    text: &str,
    replacement: &str,
    start_line: usize,
    end_line: usize,
    start_col: usize,
    end_col: usize,
) -> TextResult<String> {
    let a = line_col_to_offset(text, start_line, start_col)?;
    let b = line_col_to_offset(text, end_line, end_col)?;
    Ok(format!("{}{}{}", &text[..a], replacement, &text[b..]))
}

// ============================================================================
// ReplacedString
// ============================================================================

/// A pending edit against the original text, in original coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub start_line: usize,
    pub end_line: usize,
    pub start_col: usize,
    pub end_col: usize,
    pub text: String,
}

/// Source text with pending replacements.
///
/// Positions (and parses) refer to the original text; [`ReplacedString::cut`]
/// and [`ReplacedString::render`] see the edited text. Replacements must not
/// overlap.
#[derive(Debug, Clone)]
pub struct ReplacedString {
    original: String,
    // (start offset, end offset, replacement text), sorted by start
    edits: Vec<(usize, usize, String)>,
}

impl ReplacedString {
    pub fn new(original: impl Into<String>, replacements: Vec<Replacement>) -> TextResult<Self> {
        let original = original.into();
        let mut edits = Vec::with_capacity(replacements.len());
        for r in replacements {
            let a = line_col_to_offset(&original, r.start_line, r.start_col)?;
            let b = line_col_to_offset(&original, r.end_line, r.end_col)?;
            edits.push((a, b, r.text));
        }
        edits.sort_by_key(|&(a, _, _)| a);
        for pair in edits.windows(2) {
            if pair[0].1 > pair[1].0 {
                let (line, col) = offset_to_line_col(pair[1].0, &original);
                return Err(TextError::AmbiguousCut {
                    line: line - 1,
                    col,
                });
            }
        }
        Ok(ReplacedString { original, edits })
    }

    /// The unedited text all positions refer to.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Add one more replacement, in original coordinates.
    pub fn replace(
        mut self,
        replacement: &str,
        start_line: usize,
        end_line: usize,
        start_col: usize,
        end_col: usize,
    ) -> TextResult<Self> {
        let a = line_col_to_offset(&self.original, start_line, start_col)?;
        let b = line_col_to_offset(&self.original, end_line, end_col)?;
        if self
            .edits
            .iter()
            .any(|&(ea, eb, _)| a < eb && ea < b)
        {
            return Err(TextError::AmbiguousCut {
                line: start_line,
                col: start_col,
            });
        }
        self.edits.push((a, b, replacement.to_string()));
        self.edits.sort_by_key(|&(x, _, _)| x);
        Ok(self)
    }

    /// The text with all replacements applied.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.original.len());
        let mut cursor = 0usize;
        for (a, b, text) in &self.edits {
            out.push_str(&self.original[cursor..*a]);
            out.push_str(text);
            cursor = *b;
        }
        out.push_str(&self.original[cursor..]);
        out
    }

    /// Extract a span, given in original coordinates, with replacements
    /// applied.
    ///
    /// A replacement entirely inside the span appears replaced; one entirely
    /// outside is ignored. A boundary strictly inside a replacement has no
    /// well-defined result and errors.
    pub fn cut(
        &self,
        start_line: usize,
        end_line: usize,
        start_col: usize,
        end_col: usize,
    ) -> TextResult<String> {
        let a = line_col_to_offset(&self.original, start_line, start_col)?;
        let b = line_col_to_offset(&self.original, end_line, end_col)?;
        for &(ea, eb, _) in &self.edits {
            for (bound, line, col) in [(a, start_line, start_col), (b, end_line, end_col)] {
                if bound > ea && bound < eb {
                    return Err(TextError::AmbiguousCut { line, col });
                }
            }
        }
        let mut out = String::new();
        let mut cursor = a;
        for (ea, eb, text) in &self.edits {
            if *eb <= a || *ea >= b {
                continue;
            }
            out.push_str(&self.original[cursor..*ea]);
            out.push_str(text);
            cursor = *eb;
        }
        out.push_str(&self.original[cursor..b]);
        Ok(out)
    }
}

// ============================================================================
// SourceText
// ============================================================================

/// Module source, either plain or carrying pending edits.
#[derive(Debug, Clone)]
pub enum SourceText {
    Plain(String),
    Replaced(ReplacedString),
}

impl SourceText {
    /// The text positions and parses refer to.
    pub fn original(&self) -> &str {
        match self {
            SourceText::Plain(s) => s,
            SourceText::Replaced(r) => r.original(),
        }
    }

    /// Extract a span in original coordinates, with any edits applied.
    pub fn cut(
        &self,
        start_line: usize,
        end_line: usize,
        start_col: usize,
        end_col: usize,
    ) -> TextResult<String> {
        match self {
            SourceText::Plain(s) => cut(s, start_line, end_line, start_col, end_col),
            SourceText::Replaced(r) => r.cut(start_line, end_line, start_col, end_col),
        }
    }
}

impl From<String> for SourceText {
    fn from(s: String) -> Self {
        SourceText::Plain(s)
    }
}

impl From<&str> for SourceText {
    fn from(s: &str) -> Self {
        SourceText::Plain(s.to_string())
    }
}

impl From<ReplacedString> for SourceText {
    fn from(r: ReplacedString) -> Self {
        SourceText::Replaced(r)
    }
}

// ============================================================================
// Tests
// ============================================================================
