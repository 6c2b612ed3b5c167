//! Call-site recovery from captured stack frames.
//!
//! A [`Frame`] is a snapshot of one live frame: module, entered function,
//! current line, and an optional column. A [`FrameStack`] lists frames
//! innermost first, starting at the frame that contains the capture call.
//!
//! Recovering the literal call expression works on positions alone: the
//! statements overlapping the frame line are searched for call expressions,
//! the column picks the innermost candidate when available, and otherwise
//! the first candidate whose callee's trailing name matches the entered
//! function wins. Constructor entries (`__init__`, `__call__`) accept any
//! call, since the entered name never appears at the call site. The matched
//! span is cut from the module's [`SourceText`] so pending parameter edits
//! survive into the recovered text.
//!
//! [`CallInfo`] then resolves the scope surrounding the capture call,
//! recursing one hop per stack level so that each level's parameter
//! bindings carry the scope they were evaluated in. Missing source, a
//! module-level frame, or a module boundary all degrade to the toplevel
//! scope instead of failing.
//!
//! [`SourceText`]: crate::text::SourceText

use rustpython_parser::ast;
use tracing::{debug, warn};

use crate::ast_utils;
use crate::error::{Result, UnravelError};
use crate::scope::{self, Scope, Signature};
use crate::session::Session;

use indexmap::IndexMap;

// ============================================================================
// Frames
// ============================================================================

/// Snapshot of one live stack frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Module the frame's code lives in.
    pub module: String,
    /// Name of the function the frame is executing, `<module>` at toplevel.
    pub function: String,
    /// Line currently executing, 1-indexed.
    pub lineno: usize,
    /// Column of the executing expression, when the runtime exposes it.
    pub col: Option<usize>,
    /// Identity key for scope disambiguation across frames that share a
    /// dotted path.
    pub key: String,
}

impl Frame {
    pub fn new(module: impl Into<String>, function: impl Into<String>, lineno: usize) -> Self {
        let module = module.into();
        let key = format!("{}:{}", module, lineno);
        Frame {
            module,
            function: function.into(),
            lineno,
            col: None,
            key,
        }
    }

    pub fn with_col(mut self, col: usize) -> Self {
        self.col = Some(col);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

/// Captured frames, innermost first.
#[derive(Debug, Clone, Default)]
pub struct FrameStack {
    frames: Vec<Frame>,
}

impl FrameStack {
    pub fn new(frames: Vec<Frame>) -> Self {
        FrameStack { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

// ============================================================================
// Call expression recovery
// ============================================================================

/// Recover the source text of the call to `callee` on `lineno` of `module`.
///
/// # Errors
///
/// [`UnravelError::MissingSourceFile`] when the module has no registered
/// source, [`UnravelError::StatementNotFound`] when no statement covers the
/// line or no call candidate matches.
pub fn recover_call(
    session: &Session,
    module: &str,
    lineno: usize,
    col: Option<usize>,
    callee: &str,
) -> Result<String> {
    let Some(text) = session.module_source(module) else {
        return Err(UnravelError::MissingSourceFile {
            module: module.to_string(),
        });
    };
    let source = text.original().to_string();
    let parsed = session.parse(&source)?;
    let stmts = ast_utils::statements_at_line(&source, &parsed, lineno);
    if stmts.is_empty() {
        return Err(UnravelError::StatementNotFound {
            module: module.to_string(),
            line: lineno,
        });
    }

    let mut candidates: Vec<&ast::ExprCall> = Vec::new();
    for stmt in stmts {
        ast_utils::walk_exprs(stmt, &mut |expr| {
            if let ast::Expr::Call(call) = expr {
                let pos = ast_utils::get_position(&source, call);
                if pos.lineno <= lineno && lineno <= pos.end_lineno {
                    candidates.push(call);
                }
            }
        });
    }

    let chosen = match col {
        Some(col) => innermost_at(&source, &candidates, lineno, col),
        None => {
            let any_call = callee == "__init__" || callee == "__call__";
            candidates.iter().copied().find(|call| {
                any_call || trailing_name(&call.func).map_or(false, |n| n == callee)
            })
        }
    };
    let Some(call) = chosen else {
        debug!(module, lineno, callee, "no call candidate matched");
        return Err(UnravelError::StatementNotFound {
            module: module.to_string(),
            line: lineno,
        });
    };

    let pos = ast_utils::get_position(&source, call);
    let cut = text.cut(
        pos.lineno - 1,
        pos.end_lineno - 1,
        pos.col_offset,
        pos.end_col_offset,
    )?;
    Ok(cut)
}

/// The smallest candidate whose span contains (lineno, col).
fn innermost_at<'a>(
    source: &str,
    candidates: &[&'a ast::ExprCall],
    lineno: usize,
    col: usize,
) -> Option<&'a ast::ExprCall> {
    candidates
        .iter()
        .copied()
        .filter(|call| {
            let pos = ast_utils::get_position(source, *call);
            let after_start = pos.lineno < lineno || (pos.lineno == lineno && pos.col_offset <= col);
            let before_end =
                lineno < pos.end_lineno || (lineno == pos.end_lineno && col < pos.end_col_offset);
            after_start && before_end
        })
        .min_by_key(|call| {
            let (start, end) = ast_utils::node_span(*call);
            end - start
        })
}

/// The last identifier of a callee expression: `a.b.c(..)` gives `c`.
fn trailing_name(func: &ast::Expr) -> Option<&str> {
    match func {
        ast::Expr::Name(name) => Some(name.id.as_str()),
        ast::Expr::Attribute(attr) => Some(attr.attr.as_str()),
        ast::Expr::Call(call) => trailing_name(&call.func),
        _ => None,
    }
}

// ============================================================================
// CallInfo
// ============================================================================

/// Where the capture call was made relative to the captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    /// Caller and callee share a module.
    Here,
    /// The call crossed a module boundary.
    NextModule,
}

/// Everything known about the capture call site.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Scope surrounding the capture call, with parameter bindings from the
    /// outer frames.
    pub scope: Scope,
    /// Recovered source of the capture call expression, when the frame's
    /// module source is available.
    pub call_source: Option<String>,
    pub origin: CallOrigin,
}

impl CallInfo {
    /// Resolve the capture call named `capture_fn` at the top of `stack`.
    ///
    /// # Errors
    ///
    /// Fails on an empty stack or an unparseable module source. A missing
    /// source or unmatched call degrades to `call_source: None` and a
    /// toplevel scope.
    pub fn from_stack(session: &Session, stack: &FrameStack, capture_fn: &str) -> Result<CallInfo> {
        let Some(frame) = stack.frames().first() else {
            return Err(UnravelError::invalid_args("empty frame stack"));
        };
        let call_source = match recover_call(
            session,
            &frame.module,
            frame.lineno,
            frame.col,
            capture_fn,
        ) {
            Ok(source) => Some(source),
            Err(UnravelError::MissingSourceFile { .. })
            | Err(UnravelError::StatementNotFound { .. }) => None,
            Err(err) => return Err(err),
        };
        let origin = match stack.frames().get(1) {
            Some(parent) if parent.module != frame.module => CallOrigin::NextModule,
            _ => CallOrigin::Here,
        };
        let scope = scope_at(session, stack, 0)?;
        Ok(CallInfo {
            scope,
            call_source,
            origin,
        })
    }

    /// Source text of the first positional argument of the capture call, the
    /// expression that produced the captured value.
    pub fn capture_argument(&self) -> Result<String> {
        let Some(call) = &self.call_source else {
            return Err(UnravelError::invalid_args(
                "no capture call expression was recovered",
            ));
        };
        let args = scope::get_call_signature(call).map_err(UnravelError::from)?;
        args.pos_args.into_iter().next().ok_or_else(|| {
            UnravelError::invalid_args("capture call has no positional argument")
        })
    }

    /// Bind the capture call's arguments to `sig`'s parameters.
    pub fn argument_expressions(&self, sig: &Signature) -> Result<IndexMap<String, String>> {
        let Some(call) = &self.call_source else {
            return Ok(IndexMap::new());
        };
        let args = scope::get_call_signature(call).map_err(UnravelError::from)?;
        let bound = sig
            .get_call_assignments(
                &args.pos_args,
                &args.keyword_args,
                args.star_args.as_deref(),
                args.star_kwargs.as_deref(),
            )
            .map_err(UnravelError::from)?;
        Ok(bound)
    }
}

/// Scope of the frame at `depth`, with parameters bound from the frame one
/// level out.
///
/// Degrades to the module's toplevel scope when the frame is module level,
/// has no parent, crosses a module boundary, or has no registered source.
fn scope_at(session: &Session, stack: &FrameStack, depth: usize) -> Result<Scope> {
    let frame = &stack.frames()[depth];
    if frame.function == "<module>" {
        return Ok(Scope::toplevel(session, &frame.module));
    }
    let Some(parent) = stack.frames().get(depth + 1) else {
        debug!(function = %frame.function, "frame has no parent, using toplevel scope");
        return Ok(Scope::toplevel(session, &frame.module));
    };
    if parent.module != frame.module {
        debug!(
            from = %parent.module,
            to = %frame.module,
            "module boundary, using toplevel scope"
        );
        return Ok(Scope::toplevel(session, &frame.module));
    }
    let Some(text) = session.module_source(&frame.module) else {
        warn!(module = %frame.module, "no source for frame module, using toplevel scope");
        return Ok(Scope::toplevel(session, &frame.module));
    };
    let source = text.original().to_string();

    let entered = frame
        .function
        .rsplit('.')
        .next()
        .unwrap_or(&frame.function);
    let parent_call =
        match recover_call(session, &parent.module, parent.lineno, parent.col, entered) {
            Ok(call) => call,
            Err(UnravelError::MissingSourceFile { .. })
            | Err(UnravelError::StatementNotFound { .. }) => {
                debug!(function = %frame.function, "caller expression not recovered");
                String::new()
            }
            Err(err) => return Err(err),
        };

    let calling_scope = scope_at(session, stack, depth + 1)?;
    Scope::from_source(
        session,
        &source,
        frame.lineno,
        &parent_call,
        &frame.module,
        0,
        Some(&calling_scope),
        Some(&frame.key),
    )
}

// ============================================================================
// Tests
// ============================================================================
