//! Lexical scopes, scoped names, and call-argument binding.
//!
//! A [`Scope`] describes where a name lives: a module plus a chain of
//! enclosing function frames, innermost first. Frames carry a synthetic body:
//! the statements of the enclosing function with the call's arguments bound
//! as plain assignments in front, so the finder can treat parameters like any
//! other defined name. A [`ScopedName`] is a (possibly dotted) name together
//! with the scope it occurred in and an optional position ceiling for the
//! backward search.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;
use rustpython_parser::ast;
use thiserror::Error;
use tracing::warn;

use crate::ast_utils;
use crate::error::Result;
use crate::session::Session;

/// Sentinel assigned to a bound method's receiver parameter. Resolving
/// attribute access through the receiver is a known gap; the sentinel makes
/// the gap visible in the dump instead of silently producing wrong code.
pub const UNSUPPORTED_SELF_SENTINEL: &str = "_unsupported_self_reference";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("signature mismatch: {message}")]
    SignatureMismatch { message: String },

    #[error("expected a call expression: {call}")]
    NotACall { call: String },

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error(transparent)]
    Text(#[from] crate::text::TextError),
}

pub type ScopeResult<T> = std::result::Result<T, ScopeError>;

// ============================================================================
// Signature
// ============================================================================

/// The parameter list of a function definition, as source text.
///
/// Default values are stored as the source of the default expression, so
/// binding a call produces assignments that still parse in the caller's
/// context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    pub argnames: Vec<String>,
    pub pos_only_argnames: Vec<String>,
    pub kwonly_argnames: Vec<String>,
    pub defaults: IndexMap<String, String>,
    pub kwonly_defaults: IndexMap<String, String>,
    pub vararg: Option<String>,
    pub kwarg: Option<String>,
    pub ignore_extra_kwargs: bool,
}

impl Signature {
    /// All positionally fillable parameter names, in declaration order.
    pub fn all_argnames(&self) -> Vec<String> {
        let mut names = self.pos_only_argnames.clone();
        names.extend(self.argnames.iter().cloned());
        names
    }

    /// Remove and return the first positional parameter (the receiver of a
    /// bound method).
    pub fn remove_first(&mut self) -> Option<String> {
        if !self.pos_only_argnames.is_empty() {
            Some(self.pos_only_argnames.remove(0))
        } else if !self.argnames.is_empty() {
            Some(self.argnames.remove(0))
        } else {
            None
        }
    }

    fn kwonly_names(&self) -> Vec<String> {
        let mut names = self.kwonly_argnames.clone();
        for name in self.kwonly_defaults.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Statically bind a call's arguments to this parameter list.
    ///
    /// Returns one value expression per resolved parameter, keyed by
    /// parameter name. Resolution order: keyword-only parameters, positional
    /// parameters in declaration order, the `*args` overflow (an empty list
    /// literal when declared but unused), leftover keywords, the `**kwargs`
    /// sink, and finally unfilled defaults. When the call carries a
    /// `**`-splat, defaults are rewritten as `<splat>.get('<name>',
    /// <default>)` since the splat may override them at runtime.
    ///
    /// # Errors
    ///
    /// `SignatureMismatch` when positional arguments overflow without a
    /// `*args`, a keyword has no matching parameter or sink, or a
    /// positional-only parameter is passed by keyword.
    pub fn get_call_assignments(
        &self,
        pos_args: &[String],
        keyword_args: &IndexMap<String, String>,
        star_args: Option<&str>,
        star_kwargs: Option<&str>,
    ) -> ScopeResult<IndexMap<String, String>> {
        let mut res: IndexMap<String, String> = IndexMap::new();
        let mut keywords = keyword_args.clone();

        for name in self.kwonly_names() {
            if let Some(value) = keywords.shift_remove(&name) {
                res.insert(name, value);
            } else if let Some(splat) = star_kwargs {
                match self.kwonly_defaults.get(&name) {
                    Some(default) => {
                        res.insert(name.clone(), format!("{}.get('{}', {})", splat, name, default));
                    }
                    None => {
                        res.insert(name.clone(), format!("{}['{}']", splat, name));
                    }
                }
            } else if let Some(default) = self.kwonly_defaults.get(&name) {
                res.insert(name, default.clone());
            } else {
                return Err(ScopeError::SignatureMismatch {
                    message: format!("missing keyword-only argument '{}'", name),
                });
            }
        }

        let mut positional: Vec<String> = pos_args.to_vec();
        if let Some(star) = star_args {
            match split_star_args(star) {
                Some(elements) => positional.extend(elements),
                None => warn!(star_args = star, "cannot statically unpack *-argument"),
            }
        }
        let all = self.all_argnames();
        let mut values = positional.into_iter();
        for name in &all {
            match values.next() {
                Some(value) => {
                    res.insert(name.clone(), value);
                }
                None => break,
            }
        }
        let overflow: Vec<String> = values.collect();
        if let Some(vararg) = &self.vararg {
            res.insert(vararg.clone(), format!("[{}]", overflow.join(", ")));
        } else if !overflow.is_empty() {
            return Err(ScopeError::SignatureMismatch {
                message: format!("{} extra positional argument(s)", overflow.len()),
            });
        }

        let mut extra: IndexMap<String, String> = IndexMap::new();
        for (name, value) in keywords {
            if self.pos_only_argnames.contains(&name) {
                return Err(ScopeError::SignatureMismatch {
                    message: format!("positional-only parameter '{}' passed by keyword", name),
                });
            }
            if self.argnames.contains(&name) || self.defaults.contains_key(&name) {
                res.insert(name, value);
            } else {
                extra.insert(name, value);
            }
        }
        if let Some(kwarg) = &self.kwarg {
            let inner: Vec<String> = extra
                .iter()
                .map(|(k, v)| format!("'{}': {}", k, v))
                .collect();
            res.insert(kwarg.clone(), format!("{{{}}}", inner.join(", ")));
        } else if !extra.is_empty() && !self.ignore_extra_kwargs {
            return Err(ScopeError::SignatureMismatch {
                message: format!(
                    "unexpected keyword argument(s): {}",
                    extra.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            });
        }

        for (name, default) in &self.defaults {
            if !res.contains_key(name) {
                match star_kwargs {
                    Some(splat) => {
                        res.insert(name.clone(), format!("{}.get('{}', {})", splat, name, default));
                    }
                    None => {
                        res.insert(name.clone(), default.clone());
                    }
                }
            }
        }

        Ok(res)
    }
}

/// Split a `*`-argument into element sources when it is a list or tuple
/// literal.
fn split_star_args(source: &str) -> Option<Vec<String>> {
    let trimmed = source.trim();
    let expr = ast_utils::parse_expr(trimmed).ok()?;
    let elts = match &expr {
        ast::Expr::List(list) => &list.elts,
        ast::Expr::Tuple(tuple) => &tuple.elts,
        _ => return None,
    };
    Some(
        elts.iter()
            .map(|e| ast_utils::get_source_segment(trimmed, e).to_string())
            .collect(),
    )
}

/// Read a [`Signature`] off a parsed parameter list.
pub fn parse_def_args(args: &ast::Arguments, source: &str) -> Signature {
    let mut sig = Signature::default();
    for arg in &args.posonlyargs {
        let name = arg.def.arg.to_string();
        if let Some(default) = &arg.default {
            sig.defaults.insert(
                name.clone(),
                ast_utils::get_source_segment(source, default.as_ref()).to_string(),
            );
        }
        sig.pos_only_argnames.push(name);
    }
    for arg in &args.args {
        let name = arg.def.arg.to_string();
        if let Some(default) = &arg.default {
            sig.defaults.insert(
                name.clone(),
                ast_utils::get_source_segment(source, default.as_ref()).to_string(),
            );
        }
        sig.argnames.push(name);
    }
    for arg in &args.kwonlyargs {
        let name = arg.def.arg.to_string();
        if let Some(default) = &arg.default {
            sig.kwonly_defaults.insert(
                name.clone(),
                ast_utils::get_source_segment(source, default.as_ref()).to_string(),
            );
        }
        sig.kwonly_argnames.push(name);
    }
    sig.vararg = args.vararg.as_ref().map(|a| a.arg.to_string());
    sig.kwarg = args.kwarg.as_ref().map(|a| a.arg.to_string());
    sig
}

// ============================================================================
// Call sources
// ============================================================================

/// The arguments of a call expression, as source text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub pos_args: Vec<String>,
    pub keyword_args: IndexMap<String, String>,
    pub star_args: Option<String>,
    pub star_kwargs: Option<String>,
}

/// Parse a call expression's source into its argument sources.
pub fn get_call_signature(call_source: &str) -> ScopeResult<CallArgs> {
    let trimmed = call_source.trim();
    let expr = ast_utils::parse_expr(trimmed).map_err(|e| ScopeError::Parse {
        message: e.to_string(),
    })?;
    let ast::Expr::Call(call) = &expr else {
        return Err(ScopeError::NotACall {
            call: call_source.to_string(),
        });
    };
    let mut result = CallArgs::default();
    for arg in &call.args {
        if let ast::Expr::Starred(star) = arg {
            result.star_args =
                Some(ast_utils::get_source_segment(trimmed, star.value.as_ref()).to_string());
        } else {
            result
                .pos_args
                .push(ast_utils::get_source_segment(trimmed, arg).to_string());
        }
    }
    for keyword in &call.keywords {
        let value = ast_utils::get_source_segment(trimmed, &keyword.value).to_string();
        match &keyword.arg {
            Some(name) => {
                result.keyword_args.insert(name.to_string(), value);
            }
            None => result.star_kwargs = Some(value),
        }
    }
    Ok(result)
}

/// Split a call source into callee text and argument text.
pub fn split_call(call_source: &str) -> ScopeResult<(String, String)> {
    let trimmed = call_source.trim();
    let expr = ast_utils::parse_expr(trimmed).map_err(|e| ScopeError::Parse {
        message: e.to_string(),
    })?;
    let ast::Expr::Call(call) = &expr else {
        return Err(ScopeError::NotACall {
            call: call_source.to_string(),
        });
    };
    let callee = ast_utils::get_source_segment(trimmed, call.func.as_ref()).to_string();
    let (_, func_end) = ast_utils::node_span(call.func.as_ref());
    let rest = &trimmed[func_end.min(trimmed.len())..];
    let inner = match (rest.find('('), rest.rfind(')')) {
        (Some(open), Some(close)) if open < close => rest[open + 1..close].trim().to_string(),
        _ => String::new(),
    };
    Ok((callee, inner))
}

// ============================================================================
// Scope
// ============================================================================

/// A statement plus the source text its ranges refer to.
///
/// Synthetic assignments produced by call binding carry the calling scope, so
/// the names on their right-hand side resolve in the caller's frame rather
/// than the callee's. Canonicalized imports without an alias carry
/// `global_scope`, meaning the binding lives at module level wherever it is
/// quoted from.
#[derive(Debug, Clone)]
pub struct SourcedStmt {
    pub stmt: Rc<ast::Stmt>,
    pub source: Rc<str>,
    pub caller_scope: Option<Rc<Scope>>,
    pub global_scope: bool,
}

impl SourcedStmt {
    pub fn new(stmt: Rc<ast::Stmt>, source: Rc<str>) -> Self {
        SourcedStmt {
            stmt,
            source,
            caller_scope: None,
            global_scope: false,
        }
    }

    /// Canonical source of the statement.
    pub fn segment(&self) -> String {
        ast_utils::statement_source(&self.source, &self.stmt)
    }

    /// Position of the statement within its source.
    pub fn position(&self) -> crate::text::Position {
        ast_utils::get_position(&self.source, self.stmt.as_ref())
    }
}

/// One function frame of a scope: the qualified name and the synthetic body.
#[derive(Debug, Clone)]
pub struct ScopeFrame {
    pub name: String,
    pub body: Vec<SourcedStmt>,
}

/// Where a name lives: a module plus enclosing function frames, innermost
/// first.
#[derive(Debug, Clone)]
pub struct Scope {
    pub module: String,
    pub def_source: Rc<str>,
    pub scopelist: Vec<Rc<ScopeFrame>>,
    /// Disambiguation index for equal dotted paths from different defining
    /// locations.
    pub index: usize,
}

impl Scope {
    /// The scope of nothing: no module, no frames.
    pub fn empty() -> Scope {
        Scope {
            module: String::new(),
            def_source: Rc::from(""),
            scopelist: Vec::new(),
            index: 0,
        }
    }

    /// The module-level scope of a registered module.
    ///
    /// A module without registered source still gets a scope; resolution in
    /// it falls back to the interactive history for `__main__` and fails
    /// otherwise.
    pub fn toplevel(session: &Session, module: &str) -> Scope {
        let def_source: Rc<str> = match session.module_source(module) {
            Some(text) => Rc::from(text.original()),
            None => {
                warn!(module, "no source registered for module");
                Rc::from("")
            }
        };
        Scope {
            module: module.to_string(),
            def_source,
            scopelist: Vec::new(),
            index: 0,
        }
    }

    /// Derive the scope of a call site inside `def_source`.
    ///
    /// Locates the chain of function definitions containing `lineno`, drops
    /// the innermost `drop_n`, and binds `call_source`'s arguments to the
    /// innermost remaining definition's parameters as synthetic assignments.
    /// Methods are tagged `Class::method`; a `staticmethod` decorator
    /// suppresses the implicit receiver, otherwise the receiver is assigned
    /// the unsupported-self sentinel.
    #[allow(clippy::too_many_arguments)]
    pub fn from_source(
        session: &Session,
        def_source: &str,
        lineno: usize,
        call_source: &str,
        module: &str,
        drop_n: usize,
        calling_scope: Option<&Scope>,
        key: Option<&str>,
    ) -> Result<Scope> {
        let stmts = session.parse(def_source)?;
        let branch = find_branch(def_source, &stmts, lineno);

        let mut defs: Vec<(String, &ast::StmtFunctionDef, bool)> = Vec::new();
        let mut enclosing_class: Option<&str> = None;
        for stmt in &branch {
            match stmt {
                ast::Stmt::ClassDef(class) => enclosing_class = Some(class.name.as_str()),
                ast::Stmt::FunctionDef(def) => {
                    let (full_name, dynamic) = match enclosing_class.take() {
                        Some(class) => (
                            format!("{}::{}", class, def.name),
                            !has_decorator(def, "staticmethod"),
                        ),
                        None => (def.name.to_string(), false),
                    };
                    defs.push((full_name, def, dynamic));
                }
                _ => enclosing_class = None,
            }
        }
        for _ in 0..drop_n {
            defs.pop();
        }

        let source_rc: Rc<str> = Rc::from(def_source);
        if defs.is_empty() {
            return Ok(Scope {
                module: module.to_string(),
                def_source: source_rc,
                scopelist: Vec::new(),
                index: 0,
            });
        }

        let mut frames: Vec<Rc<ScopeFrame>> = Vec::new();
        let last = defs.len() - 1;
        for (i, (full_name, def, dynamic)) in defs.iter().enumerate() {
            let mut body: Vec<SourcedStmt> = Vec::new();
            if i == last {
                let mut assignments: Vec<String> = Vec::new();
                let mut sig = parse_def_args(&def.args, def_source);
                if *dynamic {
                    if let Some(receiver) = sig.remove_first() {
                        assignments.push(format!("{} = {}", receiver, UNSUPPORTED_SELF_SENTINEL));
                    }
                }
                if !call_source.is_empty() {
                    let call = get_call_signature(call_source)?;
                    let bound = sig.get_call_assignments(
                        &call.pos_args,
                        &call.keyword_args,
                        call.star_args.as_deref(),
                        call.star_kwargs.as_deref(),
                    )?;
                    for (name, value) in bound {
                        assignments.push(format!("{} = {}", name, value));
                    }
                }
                for line in assignments {
                    let mut parsed = ast_utils::parse_suite(&line)?;
                    let stmt = Rc::new(parsed.remove(0));
                    body.push(SourcedStmt {
                        stmt,
                        source: Rc::from(line.as_str()),
                        caller_scope: calling_scope.map(|s| Rc::new(s.clone())),
                        global_scope: false,
                    });
                }
            }
            for stmt in &def.body {
                body.push(SourcedStmt::new(
                    Rc::new(stmt.clone()),
                    Rc::clone(&source_rc),
                ));
            }
            frames.push(Rc::new(ScopeFrame {
                name: full_name.clone(),
                body,
            }));
        }
        frames.reverse();

        let mut scope = Scope {
            module: module.to_string(),
            def_source: source_rc,
            scopelist: frames,
            index: 0,
        };
        if let Some(key) = key {
            let path = scope.dot_string();
            scope.index = session.scope_index(&path, key);
        }
        Ok(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.module.is_empty() && self.scopelist.is_empty() && self.def_source.is_empty()
    }

    /// A scope without frames is the module's global scope.
    pub fn is_global(&self) -> bool {
        self.scopelist.is_empty()
    }

    pub fn len(&self) -> usize {
        self.scopelist.len()
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    /// The scope one frame further out.
    pub fn up(&self) -> Scope {
        let mut scopelist = self.scopelist.clone();
        if !scopelist.is_empty() {
            scopelist.remove(0);
        }
        Scope {
            module: self.module.clone(),
            def_source: Rc::clone(&self.def_source),
            scopelist,
            index: 0,
        }
    }

    /// The module-level scope of this scope's module.
    pub fn global_(&self) -> Scope {
        Scope {
            module: self.module.clone(),
            def_source: Rc::clone(&self.def_source),
            scopelist: Vec::new(),
            index: 0,
        }
    }

    /// Dotted path, outermost first.
    pub fn dot_string(&self) -> String {
        let mut parts = vec![self.module.clone()];
        for frame in self.scopelist.iter().rev() {
            parts.push(frame.name.clone());
        }
        let mut path = parts.join(".");
        if self.index > 0 {
            path.push_str(&format!("#{}", self.index));
        }
        path
    }

    /// Flatten a variable name into a globally unique identifier.
    ///
    /// Module-level names of `__main__` (or of no module) stay as they are;
    /// everything else gets the module and frame chain fused in.
    pub fn unscoped(&self, varname: &str) -> String {
        if self.scopelist.is_empty() && (self.module.is_empty() || self.module == "__main__") {
            return varname.to_string();
        }
        let mut parts = vec![self.module.replace('.', "_")];
        for frame in &self.scopelist {
            parts.push(frame.name.replace("::", "_"));
        }
        if self.index > 0 {
            parts.push(self.index.to_string());
        }
        parts.push(varname.to_string());
        parts.join("_")
    }

    /// A [`ScopedName`] in this scope.
    pub fn d_name(
        &self,
        name: impl Into<String>,
        pos: Option<(usize, usize)>,
        cell_no: Option<usize>,
    ) -> ScopedName {
        ScopedName {
            name: name.into(),
            scope: self.clone(),
            pos,
            cell_no,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope[{}]", self.dot_string())
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.dot_string() == other.dot_string()
    }
}

impl Eq for Scope {}

impl Hash for Scope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dot_string().hash(state);
    }
}

/// The chain of statements containing `lineno`, outermost first.
fn find_branch<'a>(source: &str, stmts: &'a [ast::Stmt], lineno: usize) -> Vec<&'a ast::Stmt> {
    for stmt in stmts {
        let pos = ast_utils::get_position(source, stmt);
        if pos.lineno <= lineno && lineno <= pos.end_lineno {
            let mut chain = vec![stmt];
            for body in ast_utils::child_bodies(stmt) {
                let nested = find_branch(source, body, lineno);
                if !nested.is_empty() {
                    chain.extend(nested);
                    break;
                }
            }
            return chain;
        }
    }
    Vec::new()
}

fn has_decorator(def: &ast::StmtFunctionDef, name: &str) -> bool {
    def.decorator_list
        .iter()
        .any(|dec| matches!(dec, ast::Expr::Name(n) if n.id.as_str() == name))
}

// ============================================================================
// ScopedName
// ============================================================================

/// A (possibly dotted) name in a scope.
///
/// `pos` is the search ceiling: only statements strictly before it count as
/// candidate definitions. `cell_no` pins the interactive history cell the
/// search starts from.
#[derive(Debug, Clone)]
pub struct ScopedName {
    pub name: String,
    pub scope: Scope,
    pub pos: Option<(usize, usize)>,
    pub cell_no: Option<usize>,
}

impl ScopedName {
    pub fn new(name: impl Into<String>, scope: Scope) -> Self {
        ScopedName {
            name: name.into(),
            scope,
            pos: None,
            cell_no: None,
        }
    }

    /// Progressive dotted prefixes: `a.b.c` gives `a`, `a.b`, `a.b.c`.
    pub fn variants(&self) -> Vec<String> {
        let parts: Vec<&str> = self.name.split('.').collect();
        (1..=parts.len())
            .map(|i| parts[..i].join("."))
            .collect()
    }

    /// The name before the first dot.
    pub fn toplevel_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Move the search one scope level out, clearing position state.
    pub fn up(&mut self) {
        self.scope = self.scope.up();
        self.pos = None;
        self.cell_no = None;
    }
}

impl PartialEq for ScopedName {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.scope == other.scope && self.pos == other.pos
    }
}

impl Eq for ScopedName {}

impl Hash for ScopedName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.scope.hash(state);
        self.pos.hash(state);
    }
}

impl fmt::Display for ScopedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.scope, self.name)
    }
}

// ============================================================================
// Tests
// ============================================================================
