//! Interfaces to the collaborators outside the reconstruction core.
//!
//! Packaging inference, value serialization, module introspection, and
//! call-site parameter overrides are separate concerns; the core only talks
//! to them through the traits here. The `Null*` implementations know and do
//! nothing, which is the correct default for plain source reconstruction.

use thiserror::Error;

use crate::scope::Scope;
use crate::text::{ReplacedString, TextResult};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum RequirementError {
    /// No installable requirement covers an imported package.
    #[error("could not find requirement for package '{package}'")]
    NotFound { package: String },
}

// ============================================================================
// Module introspection
// ============================================================================

/// Answers what a module exports, for expanding `from m import *`.
pub trait ModuleIntrospector {
    /// The names a `*` import of `module` would bind, when known.
    fn exported_names(&self, module: &str) -> Option<Vec<String>>;
}

/// Knows no modules; star imports stay unexpandable.
pub struct NullIntrospector;

impl ModuleIntrospector for NullIntrospector {
    fn exported_names(&self, _module: &str) -> Option<Vec<String>> {
        None
    }
}

// ============================================================================
// Requirements scanning
// ============================================================================

/// Maps the modules imported by a dump to installable requirements.
pub trait RequirementsScanner {
    fn scan(&self, modules: &[String]) -> Result<Vec<String>, RequirementError>;
}

/// Declares no requirements for anything.
pub struct NullScanner;

impl RequirementsScanner for NullScanner {
    fn scan(&self, _modules: &[String]) -> Result<Vec<String>, RequirementError> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Value serialization
// ============================================================================

/// Contributes loader statements for values that cannot be rebuilt from
/// source alone.
pub trait Serializer {
    /// Statements that recreate `varname` from its serialized form. They are
    /// injected into the graph without analysis.
    fn loader_statements(&self, varname: &str, scope: &Scope) -> Vec<String>;
}

/// Serializes nothing; every value must come from source.
pub struct NullSerializer;

impl Serializer for NullSerializer {
    fn loader_statements(&self, _varname: &str, _scope: &Scope) -> Vec<String> {
        Vec::new()
    }
}

// ============================================================================
// Parameter overrides
// ============================================================================

/// Rewrites call-site argument text, producing pending edits instead of a
/// changed string so positions stay valid.
pub trait ParamRewriter {
    fn rewrite(&self, source: &str) -> TextResult<ReplacedString>;
}

/// Leaves every call site untouched.
pub struct NullRewriter;

impl ParamRewriter for NullRewriter {
    fn rewrite(&self, source: &str) -> TextResult<ReplacedString> {
        ReplacedString::new(source, Vec::new())
    }
}

// ============================================================================
// Tests
// ============================================================================
