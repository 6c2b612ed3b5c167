//! Helpers over the Python AST.
//!
//! Thin wrappers around `rustpython-parser` plus the walking and
//! source-extraction utilities the resolver layers share: byte spans to
//! positions, statement source with decorators re-attached and indentation
//! normalized, dotted attribute chains, and statement/expression traversal.

use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::Parse;

use crate::error::{Result, UnravelError};
use crate::text::{span_to_pos, Position};

// ============================================================================
// Parsing
// ============================================================================

/// Parse a module body.
pub fn parse_suite(source: &str) -> Result<Vec<ast::Stmt>> {
    ast::Suite::parse(source, "<unravel>").map_err(|e| UnravelError::parse(e.to_string()))
}

/// Parse a single expression.
pub fn parse_expr(source: &str) -> Result<ast::Expr> {
    ast::Expr::parse(source, "<unravel>").map_err(|e| UnravelError::parse(e.to_string()))
}

// ============================================================================
// Spans and positions
// ============================================================================

/// Byte span of a node, half-open.
pub fn node_span(node: &impl Ranged) -> (usize, usize) {
    let range = node.range();
    (usize::from(range.start()), usize::from(range.end()))
}

/// Position of a node within its source.
pub fn get_position(source: &str, node: &impl Ranged) -> Position {
    let (start, end) = node_span(node);
    span_to_pos(start, end, source)
}

/// The raw source slice covered by a node.
pub fn get_source_segment<'a>(source: &'a str, node: &impl Ranged) -> &'a str {
    let (start, end) = node_span(node);
    &source[start.min(source.len())..end.min(source.len())]
}

// ============================================================================
// Statement source extraction
// ============================================================================

/// Extract the canonical source of a statement.
///
/// Decorator lines are re-attached when the parser's range excludes them, and
/// the indentation of nested statements is normalized to column zero so the
/// result is valid as a standalone module-level statement.
pub fn statement_source(source: &str, stmt: &ast::Stmt) -> String {
    let decorators: &[ast::Expr] = match stmt {
        ast::Stmt::FunctionDef(def) => &def.decorator_list,
        ast::Stmt::AsyncFunctionDef(def) => &def.decorator_list,
        ast::Stmt::ClassDef(def) => &def.decorator_list,
        _ => &[],
    };
    let segment = get_source_segment(source, stmt);
    let col = get_position(source, stmt).col_offset;
    let mut text = String::new();
    if !decorators.is_empty() && !segment.trim_start().starts_with('@') {
        for dec in decorators {
            text.push('@');
            text.push_str(get_source_segment(source, dec));
            text.push('\n');
        }
    }
    text.push_str(segment);
    fix_indent(&text, col)
}

/// Remove `col` columns of indentation from every line that carries them.
///
/// The first line of an extracted segment starts at the statement's column
/// and so has no leading indentation; continuation lines keep theirs.
pub fn fix_indent(text: &str, col: usize) -> String {
    if col == 0 {
        return text.to_string();
    }
    let lines: Vec<&str> = text
        .split('\n')
        .map(|line| {
            let leading = line.bytes().take_while(|&b| b == b' ').count();
            if leading >= col {
                &line[col..]
            } else {
                line
            }
        })
        .collect();
    lines.join("\n")
}

/// Byte span of the name token of a def or class statement.
///
/// The parser gives identifiers no ranges, so the token is located by
/// scanning the statement text for its introducing keyword.
pub fn def_name_span(source: &str, stmt: &ast::Stmt) -> Option<(usize, usize)> {
    let (start, end) = node_span(stmt);
    let (name, keyword) = match stmt {
        ast::Stmt::FunctionDef(def) => (def.name.as_str(), "def"),
        ast::Stmt::AsyncFunctionDef(def) => (def.name.as_str(), "def"),
        ast::Stmt::ClassDef(def) => (def.name.as_str(), "class"),
        _ => return None,
    };
    let segment = &source[start.min(source.len())..end.min(source.len())];
    for (at, _) in segment.match_indices(keyword) {
        let before_ok = at == 0
            || !segment[..at]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        let after = &segment[at + keyword.len()..];
        if !before_ok || !after.starts_with(|c: char| c.is_whitespace()) {
            continue;
        }
        let ws = after.len() - after.trim_start().len();
        let name_at = start + at + keyword.len() + ws;
        if source[name_at..].starts_with(name) {
            return Some((name_at, name_at + name.len()));
        }
    }
    None
}

// ============================================================================
// Attribute chains
// ============================================================================

/// Collapse a pure attribute chain into its name parts.
///
/// `a.b.c` gives `["a", "b", "c"]`; anything whose base is not a plain name
/// chain gives `None`.
pub fn join_attr(expr: &ast::Expr) -> Option<Vec<&str>> {
    match expr {
        ast::Expr::Name(name) => Some(vec![name.id.as_str()]),
        ast::Expr::Attribute(attr) => {
            let mut parts = join_attr(&attr.value)?;
            parts.push(attr.attr.as_str());
            Some(parts)
        }
        _ => None,
    }
}

// ============================================================================
// Traversal
// ============================================================================

/// Statement lists nested inside a compound statement, without entering
/// function or class bodies.
pub fn nested_bodies(stmt: &ast::Stmt) -> Vec<&[ast::Stmt]> {
    match stmt {
        ast::Stmt::If(s) => vec![&s.body[..], &s.orelse[..]],
        ast::Stmt::For(s) => vec![&s.body[..], &s.orelse[..]],
        ast::Stmt::AsyncFor(s) => vec![&s.body[..], &s.orelse[..]],
        ast::Stmt::While(s) => vec![&s.body[..], &s.orelse[..]],
        ast::Stmt::With(s) => vec![&s.body[..]],
        ast::Stmt::AsyncWith(s) => vec![&s.body[..]],
        ast::Stmt::Try(s) => {
            let mut bodies = vec![&s.body[..], &s.orelse[..], &s.finalbody[..]];
            for handler in &s.handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                bodies.push(&h.body[..]);
            }
            bodies
        }
        ast::Stmt::TryStar(s) => {
            let mut bodies = vec![&s.body[..], &s.orelse[..], &s.finalbody[..]];
            for handler in &s.handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                bodies.push(&h.body[..]);
            }
            bodies
        }
        ast::Stmt::Match(s) => s.cases.iter().map(|case| &case.body[..]).collect(),
        _ => vec![],
    }
}

/// Statement lists nested inside any statement, function and class bodies
/// included.
pub fn child_bodies(stmt: &ast::Stmt) -> Vec<&[ast::Stmt]> {
    match stmt {
        ast::Stmt::FunctionDef(s) => vec![&s.body[..]],
        ast::Stmt::AsyncFunctionDef(s) => vec![&s.body[..]],
        ast::Stmt::ClassDef(s) => vec![&s.body[..]],
        _ => nested_bodies(stmt),
    }
}

/// Expressions appearing directly in a statement, not counting nested
/// statements.
pub fn stmt_child_exprs(stmt: &ast::Stmt) -> Vec<&ast::Expr> {
    let mut exprs: Vec<&ast::Expr> = Vec::new();
    match stmt {
        ast::Stmt::FunctionDef(s) => {
            exprs.extend(s.decorator_list.iter());
            exprs.extend(arguments_exprs(&s.args));
            if let Some(returns) = &s.returns {
                exprs.push(returns);
            }
        }
        ast::Stmt::AsyncFunctionDef(s) => {
            exprs.extend(s.decorator_list.iter());
            exprs.extend(arguments_exprs(&s.args));
            if let Some(returns) = &s.returns {
                exprs.push(returns);
            }
        }
        ast::Stmt::ClassDef(s) => {
            exprs.extend(s.decorator_list.iter());
            exprs.extend(s.bases.iter());
            exprs.extend(s.keywords.iter().map(|kw| &kw.value));
        }
        ast::Stmt::Return(s) => exprs.extend(s.value.as_deref()),
        ast::Stmt::Delete(s) => exprs.extend(s.targets.iter()),
        ast::Stmt::Assign(s) => {
            exprs.extend(s.targets.iter());
            exprs.push(&s.value);
        }
        ast::Stmt::AugAssign(s) => {
            exprs.push(&s.target);
            exprs.push(&s.value);
        }
        ast::Stmt::AnnAssign(s) => {
            exprs.push(&s.target);
            exprs.push(&s.annotation);
            exprs.extend(s.value.as_deref());
        }
        ast::Stmt::For(s) => {
            exprs.push(&s.target);
            exprs.push(&s.iter);
        }
        ast::Stmt::AsyncFor(s) => {
            exprs.push(&s.target);
            exprs.push(&s.iter);
        }
        ast::Stmt::While(s) => exprs.push(&s.test),
        ast::Stmt::If(s) => exprs.push(&s.test),
        ast::Stmt::With(s) => {
            for item in &s.items {
                exprs.push(&item.context_expr);
                exprs.extend(item.optional_vars.as_deref());
            }
        }
        ast::Stmt::AsyncWith(s) => {
            for item in &s.items {
                exprs.push(&item.context_expr);
                exprs.extend(item.optional_vars.as_deref());
            }
        }
        ast::Stmt::Raise(s) => {
            exprs.extend(s.exc.as_deref());
            exprs.extend(s.cause.as_deref());
        }
        ast::Stmt::Assert(s) => {
            exprs.push(&s.test);
            exprs.extend(s.msg.as_deref());
        }
        ast::Stmt::Expr(s) => exprs.push(&s.value),
        ast::Stmt::Match(s) => {
            exprs.push(&s.subject);
            for case in &s.cases {
                exprs.extend(case.guard.as_deref());
            }
        }
        _ => {}
    }
    exprs
}

/// Default, annotation, and return-type expressions of a parameter list.
pub fn arguments_exprs(args: &ast::Arguments) -> Vec<&ast::Expr> {
    let mut exprs: Vec<&ast::Expr> = Vec::new();
    for arg in args
        .posonlyargs
        .iter()
        .chain(args.args.iter())
        .chain(args.kwonlyargs.iter())
    {
        exprs.extend(arg.default.as_deref());
        exprs.extend(arg.def.annotation.as_deref());
    }
    if let Some(vararg) = &args.vararg {
        exprs.extend(vararg.annotation.as_deref());
    }
    if let Some(kwarg) = &args.kwarg {
        exprs.extend(kwarg.annotation.as_deref());
    }
    exprs
}

/// Direct child expressions of an expression.
pub fn expr_child_exprs(expr: &ast::Expr) -> Vec<&ast::Expr> {
    let mut exprs: Vec<&ast::Expr> = Vec::new();
    match expr {
        ast::Expr::BoolOp(e) => exprs.extend(e.values.iter()),
        ast::Expr::NamedExpr(e) => {
            exprs.push(&e.target);
            exprs.push(&e.value);
        }
        ast::Expr::BinOp(e) => {
            exprs.push(&e.left);
            exprs.push(&e.right);
        }
        ast::Expr::UnaryOp(e) => exprs.push(&e.operand),
        ast::Expr::Lambda(e) => {
            exprs.extend(arguments_exprs(&e.args));
            exprs.push(&e.body);
        }
        ast::Expr::IfExp(e) => {
            exprs.push(&e.test);
            exprs.push(&e.body);
            exprs.push(&e.orelse);
        }
        ast::Expr::Dict(e) => {
            exprs.extend(e.keys.iter().flatten());
            exprs.extend(e.values.iter());
        }
        ast::Expr::Set(e) => exprs.extend(e.elts.iter()),
        ast::Expr::ListComp(e) => {
            exprs.push(&e.elt);
            exprs.extend(comprehension_exprs(&e.generators));
        }
        ast::Expr::SetComp(e) => {
            exprs.push(&e.elt);
            exprs.extend(comprehension_exprs(&e.generators));
        }
        ast::Expr::DictComp(e) => {
            exprs.push(&e.key);
            exprs.push(&e.value);
            exprs.extend(comprehension_exprs(&e.generators));
        }
        ast::Expr::GeneratorExp(e) => {
            exprs.push(&e.elt);
            exprs.extend(comprehension_exprs(&e.generators));
        }
        ast::Expr::Await(e) => exprs.push(&e.value),
        ast::Expr::Yield(e) => exprs.extend(e.value.as_deref()),
        ast::Expr::YieldFrom(e) => exprs.push(&e.value),
        ast::Expr::Compare(e) => {
            exprs.push(&e.left);
            exprs.extend(e.comparators.iter());
        }
        ast::Expr::Call(e) => {
            exprs.push(&e.func);
            exprs.extend(e.args.iter());
            exprs.extend(e.keywords.iter().map(|kw| &kw.value));
        }
        ast::Expr::FormattedValue(e) => {
            exprs.push(&e.value);
            exprs.extend(e.format_spec.as_deref());
        }
        ast::Expr::JoinedStr(e) => exprs.extend(e.values.iter()),
        ast::Expr::Attribute(e) => exprs.push(&e.value),
        ast::Expr::Subscript(e) => {
            exprs.push(&e.value);
            exprs.push(&e.slice);
        }
        ast::Expr::Starred(e) => exprs.push(&e.value),
        ast::Expr::List(e) => exprs.extend(e.elts.iter()),
        ast::Expr::Tuple(e) => exprs.extend(e.elts.iter()),
        ast::Expr::Slice(e) => {
            exprs.extend(e.lower.as_deref());
            exprs.extend(e.upper.as_deref());
            exprs.extend(e.step.as_deref());
        }
        _ => {}
    }
    exprs
}

fn comprehension_exprs(generators: &[ast::Comprehension]) -> Vec<&ast::Expr> {
    let mut exprs: Vec<&ast::Expr> = Vec::new();
    for gen in generators {
        exprs.push(&gen.target);
        exprs.push(&gen.iter);
        exprs.extend(gen.ifs.iter());
    }
    exprs
}

/// Apply `f` to every expression in an expression tree, outermost first.
pub fn walk_expr_tree<'a>(expr: &'a ast::Expr, f: &mut dyn FnMut(&'a ast::Expr)) {
    f(expr);
    for child in expr_child_exprs(expr) {
        walk_expr_tree(child, f);
    }
}

/// Apply `f` to every expression in a statement subtree, nested statements
/// included.
pub fn walk_exprs<'a>(stmt: &'a ast::Stmt, f: &mut dyn FnMut(&'a ast::Expr)) {
    for expr in stmt_child_exprs(stmt) {
        walk_expr_tree(expr, f);
    }
    for body in child_bodies(stmt) {
        for nested in body {
            walk_exprs(nested, f);
        }
    }
}

/// Top-level statements whose line range covers `lineno` (1-indexed).
pub fn statements_at_line<'a>(
    source: &str,
    stmts: &'a [ast::Stmt],
    lineno: usize,
) -> Vec<&'a ast::Stmt> {
    stmts
        .iter()
        .filter(|stmt| {
            let pos = get_position(source, *stmt);
            pos.lineno <= lineno && lineno <= pos.end_lineno
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
