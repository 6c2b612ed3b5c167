//! Error types and error code constants for unravel.
//!
//! This module provides a unified error type (`UnravelError`) that bridges
//! domain-specific errors from the text and scope subsystems into a common
//! format suitable for CLI and JSON output.
//!
//! ## Error Code Mapping
//!
//! Exit codes:
//! - `2`: Invalid arguments (bad input from caller)
//! - `3`: Resolution errors (name not found, unsupported construct,
//!   missing module source)
//! - `10`: Internal errors (bugs, unexpected state)
//!
//! ## Design
//!
//! - **Unified type**: `UnravelError` is the single error type at the API
//!   surface
//! - **Bridging**: `impl From<X> for UnravelError` bridges domain errors
//! - **Code mapping**: `OutputErrorCode` provides stable integer codes

use std::fmt;

use thiserror::Error;

use crate::adapter::RequirementError;
use crate::scope::ScopeError;
use crate::text::TextError;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, UnravelError>;

// ============================================================================
// Output Error Codes
// ============================================================================

/// Error codes for CLI exits and JSON error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputErrorCode {
    /// Invalid arguments from caller (bad input, malformed request).
    InvalidArguments = 2,
    /// Resolution errors (name not found, unsupported construct).
    ResolutionError = 3,
    /// Internal errors (bugs, unexpected state).
    InternalError = 10,
}

impl OutputErrorCode {
    /// Get the numeric code value.
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for OutputErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ============================================================================
// Unified Error Type
// ============================================================================

/// Unified error type for the unravel API surface.
#[derive(Debug, Error)]
pub enum UnravelError {
    /// Invalid arguments from caller.
    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },

    /// A name could not be resolved to a defining statement.
    #[error("could not find '{name}' in {scope} (tried variants: {})", .variants.join(", "))]
    NameNotFound {
        name: String,
        scope: String,
        variants: Vec<String>,
    },

    /// The defining statement uses a construct the resolver does not model.
    #[error("unsupported construct: {construct}: {detail}")]
    UnsupportedConstruct { construct: String, detail: String },

    /// A call's arguments cannot be bound to the callee's parameters.
    #[error("signature mismatch: {message}")]
    SignatureMismatch { message: String },

    /// A graph import has no resolvable package requirement.
    #[error("could not find requirement for package '{package}'")]
    RequirementNotFound { package: String },

    /// No source text is registered for a module.
    #[error("no source available for module '{module}'")]
    MissingSourceFile { module: String },

    /// No statement could be located at a frame position.
    #[error("no matching statement at line {line} of module '{module}'")]
    StatementNotFound { module: String, line: usize },

    /// The source text failed to parse.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A cut boundary fell inside a pending replacement.
    #[error("ambiguous cut at line {line}, column {col}")]
    AmbiguousCut { line: usize, col: usize },

    /// A position pointed outside the text.
    #[error("position out of bounds: line {line}, column {col}")]
    OutOfBounds { line: usize, col: usize },

    /// Internal error (bug or unexpected state).
    #[error("internal error: {message}")]
    InternalError { message: String },
}

// ============================================================================
// Error Code Mapping
// ============================================================================

impl From<&UnravelError> for OutputErrorCode {
    fn from(err: &UnravelError) -> Self {
        match err {
            UnravelError::InvalidArguments { .. } => OutputErrorCode::InvalidArguments,
            UnravelError::NameNotFound { .. } => OutputErrorCode::ResolutionError,
            UnravelError::UnsupportedConstruct { .. } => OutputErrorCode::ResolutionError,
            UnravelError::SignatureMismatch { .. } => OutputErrorCode::ResolutionError,
            UnravelError::RequirementNotFound { .. } => OutputErrorCode::ResolutionError,
            UnravelError::MissingSourceFile { .. } => OutputErrorCode::ResolutionError,
            UnravelError::StatementNotFound { .. } => OutputErrorCode::ResolutionError,
            UnravelError::Parse { .. } => OutputErrorCode::InvalidArguments,
            UnravelError::AmbiguousCut { .. } => OutputErrorCode::InvalidArguments,
            UnravelError::OutOfBounds { .. } => OutputErrorCode::InvalidArguments,
            UnravelError::InternalError { .. } => OutputErrorCode::InternalError,
        }
    }
}

impl From<UnravelError> for OutputErrorCode {
    fn from(err: UnravelError) -> Self {
        OutputErrorCode::from(&err)
    }
}

// ============================================================================
// Bridges
// ============================================================================

impl From<TextError> for UnravelError {
    fn from(err: TextError) -> Self {
        match err {
            TextError::AmbiguousCut { line, col } => UnravelError::AmbiguousCut { line, col },
            TextError::OutOfBounds { line, col } => UnravelError::OutOfBounds { line, col },
        }
    }
}

impl From<ScopeError> for UnravelError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::SignatureMismatch { message } => {
                UnravelError::SignatureMismatch { message }
            }
            ScopeError::NotACall { call } => UnravelError::InvalidArguments {
                message: format!("expected a call expression, got '{}'", call),
            },
            ScopeError::Parse { message } => UnravelError::Parse { message },
            ScopeError::Text(text_err) => text_err.into(),
        }
    }
}

impl From<RequirementError> for UnravelError {
    fn from(err: RequirementError) -> Self {
        match err {
            RequirementError::NotFound { package } => {
                UnravelError::RequirementNotFound { package }
            }
        }
    }
}

// ============================================================================
// Convenience Constructors
// ============================================================================

impl UnravelError {
    /// Create an invalid arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        UnravelError::InvalidArguments {
            message: message.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        UnravelError::Parse {
            message: message.into(),
        }
    }

    /// Create an unsupported construct error.
    pub fn unsupported(construct: impl Into<String>, detail: impl Into<String>) -> Self {
        UnravelError::UnsupportedConstruct {
            construct: construct.into(),
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        UnravelError::InternalError {
            message: message.into(),
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> OutputErrorCode {
        OutputErrorCode::from(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
