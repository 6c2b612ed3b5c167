//! Session-confined state.
//!
//! All caches live here and travel explicitly through the API: the
//! content-hash-keyed parse cache, the module source registry, the
//! scope-disambiguation registry, and the interactive history cells. Nothing
//! in the crate holds process-wide state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rustpython_parser::ast;
use sha2::{Digest, Sha256};

use crate::ast_utils;
use crate::error::Result;
use crate::text::SourceText;

// ============================================================================
// Content hashing
// ============================================================================

/// SHA-256 content hash, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn compute(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        ContentHash(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session
// ============================================================================

/// Shared state for one reconstruction run.
#[derive(Default)]
pub struct Session {
    parse_cache: RefCell<HashMap<ContentHash, Rc<Vec<ast::Stmt>>>>,
    modules: RefCell<HashMap<String, Rc<SourceText>>>,
    // dotted scope path -> disambiguation keys in first-seen order
    scope_keys: RefCell<HashMap<String, Vec<String>>>,
    history: RefCell<Vec<Rc<str>>>,
}

impl Session {
    pub fn new() -> Self {
        Session::default()
    }

    /// Parse a source text, memoized by content hash.
    pub fn parse(&self, source: &str) -> Result<Rc<Vec<ast::Stmt>>> {
        let hash = ContentHash::compute(source);
        if let Some(cached) = self.parse_cache.borrow().get(&hash) {
            return Ok(Rc::clone(cached));
        }
        let parsed = Rc::new(ast_utils::parse_suite(source)?);
        self.parse_cache
            .borrow_mut()
            .insert(hash, Rc::clone(&parsed));
        Ok(parsed)
    }

    /// Register the source text of a module.
    pub fn register_module(&self, name: impl Into<String>, source: impl Into<SourceText>) {
        self.modules
            .borrow_mut()
            .insert(name.into(), Rc::new(source.into()));
    }

    /// The registered source of a module, if any.
    pub fn module_source(&self, name: &str) -> Option<Rc<SourceText>> {
        self.modules.borrow().get(name).map(Rc::clone)
    }

    /// Append an interactive history cell.
    pub fn push_history_cell(&self, source: impl Into<String>) {
        self.history.borrow_mut().push(Rc::from(source.into()));
    }

    /// All interactive history cells, oldest first.
    pub fn history_cells(&self) -> Vec<Rc<str>> {
        self.history.borrow().clone()
    }

    /// Disambiguation index for a scope path.
    ///
    /// Scopes with the same dotted path but different defining locations get
    /// distinct indices, assigned in first-seen order; re-deriving a scope
    /// from the same location keeps its index stable.
    pub fn scope_index(&self, path: &str, key: &str) -> usize {
        let mut registry = self.scope_keys.borrow_mut();
        let keys = registry.entry(path.to_string()).or_default();
        match keys.iter().position(|k| k == key) {
            Some(i) => i,
            None => {
                keys.push(key.to_string());
                keys.len() - 1
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
