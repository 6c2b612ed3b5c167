//! Dependency graph over resolved definitions.
//!
//! The builder runs a worklist closure: each pending [`ScopedName`] is
//! resolved to its defining statement, the statement's free variables become
//! new pending names, and the node enters the graph before its dependencies
//! are expanded so cycles terminate. [`CodeGraph::dumps`] then emits the
//! nodes dependencies-first, renaming on name collisions, as one directly
//! executable source text.
//!
//! Free-variable classification follows the runtime's scoping rules:
//!
//! - in a statement block, a name loaded before it is bound counts as a
//!   dependency (`a = run(a)` depends on both `a` and `run`);
//! - in a function body, parameters and every body binding are subtracted at
//!   scope end, so a load before its own assignment stays local;
//! - `global` and `nonlocal` declarations keep a name free;
//! - class bodies run methods as independent functions and the remaining
//!   statements as a sequential block of their own;
//! - attribute and subscript stores keep their base a load, and pure
//!   attribute chains collapse into one dotted candidate so the finder can
//!   try the full path before shorter prefixes.

use std::collections::VecDeque;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use rustpython_parser::ast;
use tracing::{debug, warn};

use crate::adapter::{ModuleIntrospector, RequirementError, RequirementsScanner, Serializer};
use crate::ast_utils;
use crate::builtins;
use crate::error::{Result, UnravelError};
use crate::finder::{self, Found};
use crate::frame::{CallInfo, FrameStack};
use crate::scope::{Scope, ScopedName, SourcedStmt};
use crate::session::Session;

// ============================================================================
// Free-variable classification
// ============================================================================

#[derive(Default)]
struct VarFinder {
    globals: IndexSet<String>,
    locals: IndexSet<String>,
    // global/nonlocal declarations, exempt from localization
    declared: IndexSet<String>,
}

impl VarFinder {
    fn bind(&mut self, name: &str) {
        if !self.declared.contains(name) {
            self.locals.insert(name.to_string());
        }
    }

    fn load_name(&mut self, dotted: &str) {
        let base = dotted.split('.').next().unwrap_or(dotted);
        if self.locals.contains(base) && !self.declared.contains(base) {
            return;
        }
        self.globals.insert(dotted.to_string());
    }

    fn load_expr(&mut self, expr: &ast::Expr) {
        match expr {
            ast::Expr::Name(name) => self.load_name(name.id.as_str()),
            ast::Expr::Attribute(attr) => match ast_utils::join_attr(expr) {
                Some(parts) => self.load_name(&parts.join(".")),
                None => self.load_expr(&attr.value),
            },
            ast::Expr::Lambda(lambda) => {
                for e in ast_utils::arguments_exprs(&lambda.args) {
                    self.load_expr(e);
                }
                let mut inner = VarFinder::default();
                for param in param_names(&lambda.args) {
                    inner.bind(&param);
                }
                inner.load_expr(&lambda.body);
                for free in inner.finish_function() {
                    self.load_name(&free);
                }
            }
            ast::Expr::ListComp(comp) => self.load_comprehension(&[&comp.elt], &comp.generators),
            ast::Expr::SetComp(comp) => self.load_comprehension(&[&comp.elt], &comp.generators),
            ast::Expr::GeneratorExp(comp) => {
                self.load_comprehension(&[&comp.elt], &comp.generators)
            }
            ast::Expr::DictComp(comp) => {
                self.load_comprehension(&[&comp.key, &comp.value], &comp.generators)
            }
            ast::Expr::NamedExpr(walrus) => {
                self.load_expr(&walrus.value);
                self.bind_target(&walrus.target);
            }
            _ => {
                for child in ast_utils::expr_child_exprs(expr) {
                    self.load_expr(child);
                }
            }
        }
    }

    fn load_comprehension(&mut self, elts: &[&ast::Expr], generators: &[ast::Comprehension]) {
        let mut inner = VarFinder::default();
        for gen in generators {
            inner.load_expr(&gen.iter);
            inner.bind_target(&gen.target);
            for cond in &gen.ifs {
                inner.load_expr(cond);
            }
        }
        for elt in elts {
            inner.load_expr(elt);
        }
        for free in inner.finish_function() {
            self.load_name(&free);
        }
    }

    /// Binding occurrence. Attribute and subscript stores load their base
    /// instead of binding anything.
    fn bind_target(&mut self, target: &ast::Expr) {
        match target {
            ast::Expr::Name(name) => self.bind(name.id.as_str()),
            ast::Expr::Tuple(tuple) => {
                for elt in &tuple.elts {
                    self.bind_target(elt);
                }
            }
            ast::Expr::List(list) => {
                for elt in &list.elts {
                    self.bind_target(elt);
                }
            }
            ast::Expr::Starred(starred) => self.bind_target(&starred.value),
            ast::Expr::Attribute(attr) => self.load_expr(&attr.value),
            ast::Expr::Subscript(sub) => {
                self.load_expr(&sub.value);
                self.load_expr(&sub.slice);
            }
            _ => {}
        }
    }

    fn visit_block(&mut self, stmts: &[ast::Stmt]) {
        for stmt in stmts {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::FunctionDef(def) => {
                self.bind(def.name.as_str());
                for dec in &def.decorator_list {
                    self.load_expr(dec);
                }
                for e in ast_utils::arguments_exprs(&def.args) {
                    self.load_expr(e);
                }
                if let Some(returns) = &def.returns {
                    self.load_expr(returns);
                }
                for free in function_free_names(&def.args, &def.body) {
                    self.load_name(&free);
                }
            }
            ast::Stmt::AsyncFunctionDef(def) => {
                self.bind(def.name.as_str());
                for dec in &def.decorator_list {
                    self.load_expr(dec);
                }
                for e in ast_utils::arguments_exprs(&def.args) {
                    self.load_expr(e);
                }
                if let Some(returns) = &def.returns {
                    self.load_expr(returns);
                }
                for free in function_free_names(&def.args, &def.body) {
                    self.load_name(&free);
                }
            }
            ast::Stmt::ClassDef(class) => {
                self.bind(class.name.as_str());
                for free in class_free_names(class) {
                    self.load_name(&free);
                }
            }
            ast::Stmt::Assign(assign) => {
                self.load_expr(&assign.value);
                for target in &assign.targets {
                    self.bind_target(target);
                }
            }
            ast::Stmt::AugAssign(assign) => {
                self.load_expr(&assign.target);
                self.load_expr(&assign.value);
                self.bind_target(&assign.target);
            }
            ast::Stmt::AnnAssign(assign) => {
                self.load_expr(&assign.annotation);
                if let Some(value) = &assign.value {
                    self.load_expr(value);
                    self.bind_target(&assign.target);
                }
            }
            ast::Stmt::Return(ret) => {
                if let Some(value) = &ret.value {
                    self.load_expr(value);
                }
            }
            ast::Stmt::Delete(del) => {
                for target in &del.targets {
                    if !matches!(target, ast::Expr::Name(_)) {
                        self.bind_target(target);
                    }
                }
            }
            ast::Stmt::For(stmt) => {
                self.load_expr(&stmt.iter);
                self.bind_target(&stmt.target);
                self.visit_block(&stmt.body);
                self.visit_block(&stmt.orelse);
            }
            ast::Stmt::AsyncFor(stmt) => {
                self.load_expr(&stmt.iter);
                self.bind_target(&stmt.target);
                self.visit_block(&stmt.body);
                self.visit_block(&stmt.orelse);
            }
            ast::Stmt::While(stmt) => {
                self.load_expr(&stmt.test);
                self.visit_block(&stmt.body);
                self.visit_block(&stmt.orelse);
            }
            ast::Stmt::If(stmt) => {
                self.load_expr(&stmt.test);
                self.visit_block(&stmt.body);
                self.visit_block(&stmt.orelse);
            }
            ast::Stmt::With(stmt) => {
                for item in &stmt.items {
                    self.load_expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.bind_target(vars);
                    }
                }
                self.visit_block(&stmt.body);
            }
            ast::Stmt::AsyncWith(stmt) => {
                for item in &stmt.items {
                    self.load_expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.bind_target(vars);
                    }
                }
                self.visit_block(&stmt.body);
            }
            ast::Stmt::Match(stmt) => {
                self.load_expr(&stmt.subject);
                for case in &stmt.cases {
                    if let Some(guard) = &case.guard {
                        self.load_expr(guard);
                    }
                    self.visit_block(&case.body);
                }
            }
            ast::Stmt::Raise(stmt) => {
                if let Some(exc) = &stmt.exc {
                    self.load_expr(exc);
                }
                if let Some(cause) = &stmt.cause {
                    self.load_expr(cause);
                }
            }
            ast::Stmt::Try(stmt) => {
                self.visit_block(&stmt.body);
                self.visit_handlers(&stmt.handlers);
                self.visit_block(&stmt.orelse);
                self.visit_block(&stmt.finalbody);
            }
            ast::Stmt::TryStar(stmt) => {
                self.visit_block(&stmt.body);
                self.visit_handlers(&stmt.handlers);
                self.visit_block(&stmt.orelse);
                self.visit_block(&stmt.finalbody);
            }
            ast::Stmt::Assert(stmt) => {
                self.load_expr(&stmt.test);
                if let Some(msg) = &stmt.msg {
                    self.load_expr(msg);
                }
            }
            ast::Stmt::Import(import) => {
                for alias in &import.names {
                    self.bind(bound_import_name(alias));
                }
            }
            ast::Stmt::ImportFrom(import) => {
                for alias in &import.names {
                    if alias.name.as_str() != "*" {
                        self.bind(bound_import_name(alias));
                    }
                }
            }
            ast::Stmt::Global(decl) => {
                for name in &decl.names {
                    self.declared.insert(name.to_string());
                    self.globals.insert(name.to_string());
                }
            }
            ast::Stmt::Nonlocal(decl) => {
                for name in &decl.names {
                    self.declared.insert(name.to_string());
                    self.globals.insert(name.to_string());
                }
            }
            ast::Stmt::Expr(stmt) => self.load_expr(&stmt.value),
            ast::Stmt::Pass(_) | ast::Stmt::Break(_) | ast::Stmt::Continue(_) => {}
            _ => {
                for expr in ast_utils::stmt_child_exprs(stmt) {
                    self.load_expr(expr);
                }
            }
        }
    }

    fn visit_handlers(&mut self, handlers: &[ast::ExceptHandler]) {
        for handler in handlers {
            let ast::ExceptHandler::ExceptHandler(h) = handler;
            if let Some(type_) = &h.type_ {
                self.load_expr(type_);
            }
            if let Some(name) = &h.name {
                self.bind(name.as_str());
            }
            self.visit_block(&h.body);
        }
    }

    /// Function-scope result: every binding in the body shadows the whole
    /// scope, so locals are subtracted at the end.
    fn finish_function(self) -> IndexSet<String> {
        let VarFinder {
            globals,
            locals,
            declared,
        } = self;
        globals
            .into_iter()
            .filter(|g| {
                let base = g.split('.').next().unwrap_or(g);
                declared.contains(base) || !locals.contains(base)
            })
            .collect()
    }

    /// Block result: sequential, no final subtraction.
    fn finish_block(self) -> IndexSet<String> {
        self.globals
    }
}

fn param_names(args: &ast::Arguments) -> Vec<String> {
    let mut names: Vec<String> = args
        .posonlyargs
        .iter()
        .chain(&args.args)
        .chain(&args.kwonlyargs)
        .map(|arg| arg.def.arg.to_string())
        .collect();
    if let Some(vararg) = &args.vararg {
        names.push(vararg.arg.to_string());
    }
    if let Some(kwarg) = &args.kwarg {
        names.push(kwarg.arg.to_string());
    }
    names
}

fn bound_import_name(alias: &ast::Alias) -> &str {
    match &alias.asname {
        Some(asname) => asname.as_str(),
        None => alias
            .name
            .as_str()
            .split('.')
            .next()
            .unwrap_or(alias.name.as_str()),
    }
}

fn function_free_names(args: &ast::Arguments, body: &[ast::Stmt]) -> IndexSet<String> {
    let mut inner = VarFinder::default();
    for param in param_names(args) {
        inner.bind(&param);
    }
    inner.visit_block(body);
    inner.finish_function()
}

/// Class rule: methods analyzed as independent functions whose free names
/// bypass class-level bindings, everything else as a sequential block.
fn class_free_names(class: &ast::StmtClassDef) -> IndexSet<String> {
    let mut vf = VarFinder::default();
    for dec in &class.decorator_list {
        vf.load_expr(dec);
    }
    for base in &class.bases {
        vf.load_expr(base);
    }
    for kw in &class.keywords {
        vf.load_expr(&kw.value);
    }
    for stmt in &class.body {
        match stmt {
            ast::Stmt::FunctionDef(def) => {
                for dec in &def.decorator_list {
                    vf.load_expr(dec);
                }
                for e in ast_utils::arguments_exprs(&def.args) {
                    vf.load_expr(e);
                }
                if let Some(returns) = &def.returns {
                    vf.load_expr(returns);
                }
                for free in function_free_names(&def.args, &def.body) {
                    vf.globals.insert(free);
                }
                vf.bind(def.name.as_str());
            }
            ast::Stmt::AsyncFunctionDef(def) => {
                for dec in &def.decorator_list {
                    vf.load_expr(dec);
                }
                for e in ast_utils::arguments_exprs(&def.args) {
                    vf.load_expr(e);
                }
                if let Some(returns) = &def.returns {
                    vf.load_expr(returns);
                }
                for free in function_free_names(&def.args, &def.body) {
                    vf.globals.insert(free);
                }
                vf.bind(def.name.as_str());
            }
            _ => vf.visit_stmt(stmt),
        }
    }
    vf.finish_block()
}

/// Free variables of one statement.
pub fn find_globals(stmt: &ast::Stmt) -> IndexSet<String> {
    let mut vf = VarFinder::default();
    vf.visit_stmt(stmt);
    vf.finish_block()
}

/// Free variables of a statement block under the sequential rule.
pub fn find_globals_stmts(stmts: &[ast::Stmt]) -> IndexSet<String> {
    let mut vf = VarFinder::default();
    vf.visit_block(stmts);
    vf.finish_block()
}

// ============================================================================
// Scope-aware rename
// ============================================================================

/// Rename every unshadowed occurrence of `from` in `source` to `to`.
///
/// Attribute names and comprehension targets are never touched; a function
/// whose parameters or body bind `from` keeps its body unchanged while its
/// decorators and defaults are still renamed; method names inside class
/// bodies stay as they are. `rename_locals` additionally renames def/class
/// name tokens, for renaming a definition itself rather than references to
/// it.
pub fn rename(source: &str, from: &str, to: &str, rename_locals: bool) -> Result<String> {
    let stmts = ast_utils::parse_suite(source)?;
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for stmt in &stmts {
        collect_stmt_spans(source, stmt, from, rename_locals, &mut spans);
    }
    spans.sort_unstable();
    spans.dedup();
    let mut out = source.to_string();
    for &(start, end) in spans.iter().rev() {
        out.replace_range(start..end, to);
    }
    Ok(out)
}

/// Rename references to `from` without touching the statement's own
/// assignment targets.
///
/// A later generation of a renamed name reads the earlier generation on its
/// right-hand side but must keep binding the plain name, so only the loads
/// move.
fn rename_references(source: &str, from: &str, to: &str) -> Result<String> {
    let stmts = ast_utils::parse_suite(source)?;
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for stmt in &stmts {
        collect_stmt_spans(source, stmt, from, false, &mut spans);
    }
    let mut bound: Vec<(usize, usize)> = Vec::new();
    for stmt in &stmts {
        match stmt {
            ast::Stmt::Assign(assign) => {
                for target in &assign.targets {
                    collect_target_spans(target, from, &mut bound);
                }
            }
            ast::Stmt::AnnAssign(assign) => collect_target_spans(&assign.target, from, &mut bound),
            _ => {}
        }
    }
    spans.retain(|span| !bound.contains(span));
    spans.sort_unstable();
    spans.dedup();
    let mut out = source.to_string();
    for &(start, end) in spans.iter().rev() {
        out.replace_range(start..end, to);
    }
    Ok(out)
}

fn collect_target_spans(target: &ast::Expr, from: &str, out: &mut Vec<(usize, usize)>) {
    match target {
        ast::Expr::Name(name) => {
            if name.id.as_str() == from {
                out.push(ast_utils::node_span(target));
            }
        }
        ast::Expr::Tuple(tuple) => {
            for elt in &tuple.elts {
                collect_target_spans(elt, from, out);
            }
        }
        ast::Expr::List(list) => {
            for elt in &list.elts {
                collect_target_spans(elt, from, out);
            }
        }
        ast::Expr::Starred(starred) => collect_target_spans(&starred.value, from, out),
        _ => {}
    }
}

fn collect_stmt_spans(
    source: &str,
    stmt: &ast::Stmt,
    from: &str,
    rename_locals: bool,
    spans: &mut Vec<(usize, usize)>,
) {
    match stmt {
        ast::Stmt::FunctionDef(def) => {
            if rename_locals && def.name.as_str() == from {
                if let Some(span) = ast_utils::def_name_span(source, stmt) {
                    spans.push(span);
                }
            }
            for dec in &def.decorator_list {
                collect_expr_spans(source, dec, from, spans);
            }
            for e in ast_utils::arguments_exprs(&def.args) {
                collect_expr_spans(source, e, from, spans);
            }
            if let Some(returns) = &def.returns {
                collect_expr_spans(source, returns, from, spans);
            }
            if !function_shadows(&def.args, &def.body, from) {
                for nested in &def.body {
                    collect_stmt_spans(source, nested, from, rename_locals, spans);
                }
            }
        }
        ast::Stmt::AsyncFunctionDef(def) => {
            if rename_locals && def.name.as_str() == from {
                if let Some(span) = ast_utils::def_name_span(source, stmt) {
                    spans.push(span);
                }
            }
            for dec in &def.decorator_list {
                collect_expr_spans(source, dec, from, spans);
            }
            for e in ast_utils::arguments_exprs(&def.args) {
                collect_expr_spans(source, e, from, spans);
            }
            if let Some(returns) = &def.returns {
                collect_expr_spans(source, returns, from, spans);
            }
            if !function_shadows(&def.args, &def.body, from) {
                for nested in &def.body {
                    collect_stmt_spans(source, nested, from, rename_locals, spans);
                }
            }
        }
        ast::Stmt::ClassDef(class) => {
            if rename_locals && class.name.as_str() == from {
                if let Some(span) = ast_utils::def_name_span(source, stmt) {
                    spans.push(span);
                }
            }
            for dec in &class.decorator_list {
                collect_expr_spans(source, dec, from, spans);
            }
            for base in &class.bases {
                collect_expr_spans(source, base, from, spans);
            }
            for kw in &class.keywords {
                collect_expr_spans(source, &kw.value, from, spans);
            }
            for nested in &class.body {
                // method names are attribute names, never renamed
                collect_stmt_spans(source, nested, from, false, spans);
            }
        }
        ast::Stmt::Global(_) | ast::Stmt::Nonlocal(_) => {}
        _ => {
            for expr in ast_utils::stmt_child_exprs(stmt) {
                collect_expr_spans(source, expr, from, spans);
            }
            for body in ast_utils::nested_bodies(stmt) {
                for nested in body {
                    collect_stmt_spans(source, nested, from, rename_locals, spans);
                }
            }
        }
    }
}

fn collect_expr_spans(source: &str, expr: &ast::Expr, from: &str, spans: &mut Vec<(usize, usize)>) {
    match expr {
        ast::Expr::Name(name) => {
            if name.id.as_str() == from {
                spans.push(ast_utils::node_span(expr));
            }
        }
        ast::Expr::Attribute(attr) => collect_expr_spans(source, &attr.value, from, spans),
        ast::Expr::Lambda(lambda) => {
            for e in ast_utils::arguments_exprs(&lambda.args) {
                collect_expr_spans(source, e, from, spans);
            }
            if !param_names(&lambda.args).iter().any(|p| p == from) {
                collect_expr_spans(source, &lambda.body, from, spans);
            }
        }
        ast::Expr::ListComp(comp) => {
            collect_comp_spans(source, &[&comp.elt], &comp.generators, from, spans)
        }
        ast::Expr::SetComp(comp) => {
            collect_comp_spans(source, &[&comp.elt], &comp.generators, from, spans)
        }
        ast::Expr::GeneratorExp(comp) => {
            collect_comp_spans(source, &[&comp.elt], &comp.generators, from, spans)
        }
        ast::Expr::DictComp(comp) => collect_comp_spans(
            source,
            &[&comp.key, &comp.value],
            &comp.generators,
            from,
            spans,
        ),
        _ => {
            for child in ast_utils::expr_child_exprs(expr) {
                collect_expr_spans(source, child, from, spans);
            }
        }
    }
}

fn collect_comp_spans(
    source: &str,
    elts: &[&ast::Expr],
    generators: &[ast::Comprehension],
    from: &str,
    spans: &mut Vec<(usize, usize)>,
) {
    let shadowed = generators.iter().any(|gen| {
        let mut names = IndexSet::new();
        target_names(&gen.target, &mut names);
        names.contains(from)
    });
    if shadowed {
        // only the first iterable evaluates outside the comprehension scope
        if let Some(first) = generators.first() {
            collect_expr_spans(source, &first.iter, from, spans);
        }
        return;
    }
    for gen in generators {
        collect_expr_spans(source, &gen.iter, from, spans);
        for cond in &gen.ifs {
            collect_expr_spans(source, cond, from, spans);
        }
    }
    for elt in elts {
        collect_expr_spans(source, elt, from, spans);
    }
}

fn target_names(target: &ast::Expr, out: &mut IndexSet<String>) {
    match target {
        ast::Expr::Name(name) => {
            out.insert(name.id.to_string());
        }
        ast::Expr::Tuple(tuple) => {
            for elt in &tuple.elts {
                target_names(elt, out);
            }
        }
        ast::Expr::List(list) => {
            for elt in &list.elts {
                target_names(elt, out);
            }
        }
        ast::Expr::Starred(starred) => target_names(&starred.value, out),
        _ => {}
    }
}

fn function_shadows(args: &ast::Arguments, body: &[ast::Stmt], from: &str) -> bool {
    if param_names(args).iter().any(|p| p == from) {
        return true;
    }
    let mut bound = IndexSet::new();
    block_bindings(body, &mut bound);
    bound.contains(from)
}

fn block_bindings(stmts: &[ast::Stmt], out: &mut IndexSet<String>) {
    for stmt in stmts {
        match stmt {
            ast::Stmt::Assign(assign) => {
                for target in &assign.targets {
                    target_names(target, out);
                }
            }
            ast::Stmt::AnnAssign(assign) => target_names(&assign.target, out),
            ast::Stmt::AugAssign(assign) => target_names(&assign.target, out),
            ast::Stmt::For(stmt) => target_names(&stmt.target, out),
            ast::Stmt::AsyncFor(stmt) => target_names(&stmt.target, out),
            ast::Stmt::FunctionDef(def) => {
                out.insert(def.name.to_string());
            }
            ast::Stmt::AsyncFunctionDef(def) => {
                out.insert(def.name.to_string());
            }
            ast::Stmt::ClassDef(class) => {
                out.insert(class.name.to_string());
            }
            ast::Stmt::Import(import) => {
                for alias in &import.names {
                    out.insert(bound_import_name(alias).to_string());
                }
            }
            ast::Stmt::ImportFrom(import) => {
                for alias in &import.names {
                    if alias.name.as_str() != "*" {
                        out.insert(bound_import_name(alias).to_string());
                    }
                }
            }
            ast::Stmt::With(stmt) => {
                for item in &stmt.items {
                    if let Some(vars) = &item.optional_vars {
                        target_names(vars, out);
                    }
                }
            }
            ast::Stmt::AsyncWith(stmt) => {
                for item in &stmt.items {
                    if let Some(vars) = &item.optional_vars {
                        target_names(vars, out);
                    }
                }
            }
            ast::Stmt::Try(stmt) => {
                for handler in &stmt.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(name) = &h.name {
                        out.insert(name.to_string());
                    }
                }
            }
            _ => {}
        }
        for body in ast_utils::nested_bodies(stmt) {
            block_bindings(body, out);
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// One resolved definition and its dependencies.
#[derive(Debug, Clone)]
pub struct CodeNode {
    /// Refined name the definition was resolved for.
    pub name: ScopedName,
    /// Canonical source of the definition.
    pub source: String,
    pub stmt: SourcedStmt,
    /// Free variables of the definition, scoped for further resolution.
    pub globals_: Vec<ScopedName>,
}

impl CodeNode {
    /// Build a node from a resolution result, classifying its free
    /// variables and dropping builtins.
    pub fn from_found(found: Found) -> CodeNode {
        let raw = find_globals(&found.stmt.stmt);
        let mut globals_ = Vec::new();
        for name in raw {
            if builtins::is_builtin(&name) {
                continue;
            }
            globals_.push(scoped_dependency(&found, name));
        }
        CodeNode {
            name: found.name,
            source: found.source,
            stmt: found.stmt,
            globals_,
        }
    }

    fn is_import(&self) -> bool {
        matches!(
            self.stmt.stmt.as_ref(),
            ast::Stmt::Import(_) | ast::Stmt::ImportFrom(_)
        )
    }
}

/// Scope and position for one free variable of a resolved definition.
///
/// Synthetic parameter assignments carry the scope of the call site that
/// produced them; canonicalized global imports resolve at module level; a
/// def or class body resolves its free names at call time, so no position
/// ceiling applies to them.
fn scoped_dependency(found: &Found, name: String) -> ScopedName {
    if let Some(tag) = &found.stmt.caller_scope {
        return ScopedName {
            name,
            scope: (**tag).clone(),
            pos: None,
            cell_no: None,
        };
    }
    if found.stmt.global_scope {
        return ScopedName {
            name,
            scope: found.name.scope.global_(),
            pos: None,
            cell_no: found.name.cell_no,
        };
    }
    let pos = match found.stmt.stmt.as_ref() {
        ast::Stmt::FunctionDef(_) | ast::Stmt::AsyncFunctionDef(_) | ast::Stmt::ClassDef(_) => {
            None
        }
        _ => found.name.pos,
    };
    ScopedName {
        name,
        scope: found.name.scope.clone(),
        pos,
        cell_no: found.name.cell_no,
    }
}

/// Canonical bound name of a single-target statement.
///
/// # Errors
///
/// Multi-target and unpacking assignments have no single name and error.
pub fn name_from_ast_node(stmt: &ast::Stmt) -> Result<String> {
    match stmt {
        ast::Stmt::Assign(assign) => {
            if assign.targets.len() != 1 {
                return Err(UnravelError::invalid_args(
                    "statement assigns more than one target",
                ));
            }
            match &assign.targets[0] {
                ast::Expr::Name(name) => Ok(name.id.to_string()),
                _ => Err(UnravelError::invalid_args(
                    "assignment target is not a plain name",
                )),
            }
        }
        ast::Stmt::AnnAssign(assign) => match assign.target.as_ref() {
            ast::Expr::Name(name) => Ok(name.id.to_string()),
            _ => Err(UnravelError::invalid_args(
                "assignment target is not a plain name",
            )),
        },
        ast::Stmt::FunctionDef(def) => Ok(def.name.to_string()),
        ast::Stmt::AsyncFunctionDef(def) => Ok(def.name.to_string()),
        ast::Stmt::ClassDef(class) => Ok(class.name.to_string()),
        ast::Stmt::Import(import) if import.names.len() == 1 => {
            Ok(bound_import_name(&import.names[0]).to_string())
        }
        ast::Stmt::ImportFrom(import) if import.names.len() == 1 => {
            Ok(bound_import_name(&import.names[0]).to_string())
        }
        _ => Err(UnravelError::invalid_args(
            "statement does not bind a single name",
        )),
    }
}

// ============================================================================
// Graph
// ============================================================================

/// How a graph build behaves.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Fail on the first unresolvable name instead of warning and dropping.
    pub strict: bool,
    /// Modules whose imports are chased into the module source instead of
    /// kept as import statements.
    pub full_dump_module_names: Vec<String>,
}

/// Dependency graph keyed by the requested [`ScopedName`]s.
#[derive(Debug, Clone, Default)]
pub struct CodeGraph {
    nodes: IndexMap<ScopedName, CodeNode>,
}

impl CodeGraph {
    pub fn new() -> CodeGraph {
        CodeGraph::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &IndexMap<ScopedName, CodeNode> {
        &self.nodes
    }

    /// Seed the graph from the evaluable representation of the captured
    /// value, returning the initial worklist.
    ///
    /// A named start synthesizes `<name> = <repr>` and enters the graph; an
    /// unnamed start only seeds the worklist.
    pub fn add_startnodes(
        &mut self,
        repr: &str,
        name: Option<&str>,
        scope: &Scope,
    ) -> Result<Vec<ScopedName>> {
        match name {
            Some(name) => {
                let source = format!("{} = {}", name, repr);
                let mut parsed = ast_utils::parse_suite(&source)?;
                let stmt = Rc::new(parsed.remove(0));
                let globals_: Vec<ScopedName> = find_globals(&stmt)
                    .into_iter()
                    .filter(|g| !builtins::is_builtin(g))
                    .map(|g| ScopedName::new(g, scope.clone()))
                    .collect();
                let key = ScopedName::new(name, scope.clone());
                let node = CodeNode {
                    name: key.clone(),
                    source: source.clone(),
                    stmt: SourcedStmt::new(stmt, Rc::from(source.as_str())),
                    globals_: globals_.clone(),
                };
                self.nodes.insert(key, node);
                Ok(globals_)
            }
            None => {
                let parsed = ast_utils::parse_suite(repr)?;
                Ok(find_globals_stmts(&parsed)
                    .into_iter()
                    .filter(|g| !builtins::is_builtin(g))
                    .map(|g| ScopedName::new(g, scope.clone()))
                    .collect())
            }
        }
    }

    /// Run the worklist closure.
    ///
    /// Each pending name resolves to a node whose free variables extend the
    /// worklist; a name already present as a key is skipped, and a node is
    /// inserted before its dependencies are expanded so mutual references
    /// terminate.
    ///
    /// # Errors
    ///
    /// In strict mode the first unresolvable name aborts the build.
    pub fn build(
        &mut self,
        session: &Session,
        introspector: &dyn ModuleIntrospector,
        worklist: Vec<ScopedName>,
        options: &BuildOptions,
    ) -> Result<()> {
        let mut pending: VecDeque<ScopedName> = worklist.into();
        while let Some(target) = pending.pop_front() {
            if self.nodes.contains_key(&target) {
                continue;
            }
            let found =
                match find_codenode(session, introspector, &target, &options.full_dump_module_names)
                {
                    Ok(found) => found,
                    Err(err) => {
                        if options.strict {
                            return Err(err);
                        }
                        warn!(name = %target.name, scope = %target.scope, %err, "dropping unresolved name");
                        continue;
                    }
                };
            let node = CodeNode::from_found(found);
            let deps = node.globals_.clone();
            self.nodes.insert(target, node);
            for dep in deps {
                if !self.nodes.contains_key(&dep) {
                    pending.push_back(dep);
                }
            }
        }
        Ok(())
    }

    /// Append a node without dependency analysis. Injected nodes participate
    /// in ordering as leaves.
    pub fn inject(&mut self, node: CodeNode) {
        self.nodes.insert(node.name.clone(), node);
    }

    /// Inject a serializer's loader statements for `varname`.
    pub fn inject_loaders(
        &mut self,
        serializer: &dyn Serializer,
        varname: &str,
        scope: &Scope,
    ) -> Result<()> {
        for line in serializer.loader_statements(varname, scope) {
            self.inject(leaf_node(&line, scope)?);
        }
        Ok(())
    }

    /// Indices in emission order: dependencies first, ties broken by
    /// discovery order. Cycles fall back to discovery order.
    fn topo_order(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let mut order = Vec::with_capacity(n);
        let mut done = vec![false; n];
        while order.len() < n {
            let mut progressed = false;
            for i in 0..n {
                if done[i] {
                    continue;
                }
                let Some((_, node)) = self.nodes.get_index(i) else {
                    continue;
                };
                let ready = node.globals_.iter().all(|dep| {
                    match self.nodes.get_index_of(dep) {
                        None => true,
                        Some(j) => j == i || done[j],
                    }
                });
                if ready {
                    done[i] = true;
                    order.push(i);
                    progressed = true;
                }
            }
            if !progressed {
                debug!("reference cycle in graph, falling back to discovery order");
                for i in 0..n {
                    if !done[i] {
                        done[i] = true;
                        order.push(i);
                        break;
                    }
                }
            }
        }
        order
    }

    /// Serialize the graph to one executable source text.
    ///
    /// Nodes are emitted dependencies-first and joined by two blank lines.
    /// Duplicate definitions (same name, same source) collapse into one.
    /// When distinct definitions share a name, every one but the last is
    /// renamed to its scope-flattened identifier, and references in
    /// depending nodes are rewritten to match.
    pub fn dumps(&self) -> Result<String> {
        let order = self.topo_order();

        // collapse duplicates, remembering each node's representative
        let mut rep: IndexMap<(String, String), usize> = IndexMap::new();
        let mut canon: IndexMap<usize, usize> = IndexMap::new();
        let mut emitted: Vec<usize> = Vec::new();
        for i in order {
            let Some((_, node)) = self.nodes.get_index(i) else {
                continue;
            };
            let sig = (node.name.name.clone(), node.source.clone());
            match rep.get(&sig) {
                Some(&keeper) => {
                    canon.insert(i, keeper);
                }
                None => {
                    rep.insert(sig, i);
                    canon.insert(i, i);
                    emitted.push(i);
                }
            }
        }

        // collision-driven renames: all but the last holder of a name move
        // to their flattened identifier
        let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
        for &i in &emitted {
            if let Some((_, node)) = self.nodes.get_index(i) {
                groups
                    .entry(node.name.name.clone())
                    .or_default()
                    .push(i);
            }
        }
        let mut taken: IndexSet<String> = groups.keys().cloned().collect();
        let mut renames: IndexMap<usize, (String, String)> = IndexMap::new();
        for (plain, members) in &groups {
            if members.len() < 2 || plain.contains('.') {
                continue;
            }
            for &i in &members[..members.len() - 1] {
                let Some((_, node)) = self.nodes.get_index(i) else {
                    continue;
                };
                if node.is_import() {
                    warn!(name = %plain, "import shares a name with another definition and cannot be renamed");
                    continue;
                }
                let mut candidate = node.name.scope.unscoped(plain);
                if candidate == *plain || taken.contains(&candidate) {
                    let base = candidate.clone();
                    let mut suffix = 2usize;
                    loop {
                        let next = format!("{}_{}", base, suffix);
                        if next != *plain && !taken.contains(&next) {
                            candidate = next;
                            break;
                        }
                        suffix += 1;
                    }
                }
                taken.insert(candidate.clone());
                renames.insert(i, (plain.clone(), candidate));
            }
        }

        let mut parts: Vec<String> = Vec::new();
        for &i in &emitted {
            let Some((_, node)) = self.nodes.get_index(i) else {
                continue;
            };
            let mut source = node.source.clone();
            if let Some((old, new)) = renames.get(&i) {
                source = rename(&source, old, new, true)?;
            }
            for dep in &node.globals_ {
                let Some(j) = self.nodes.get_index_of(dep) else {
                    continue;
                };
                let j = canon.get(&j).copied().unwrap_or(j);
                if let Some((old, new)) = renames.get(&j) {
                    // a later generation keeps binding the plain name, only
                    // its reads of the earlier generation move
                    source = if node.name.name == *old {
                        rename_references(&source, old, new)?
                    } else {
                        rename(&source, old, new, false)?
                    };
                }
            }
            parts.push(source);
        }
        if parts.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("{}\n", parts.join("\n\n\n")))
    }
}

/// A dependency-free node for injected statements.
fn leaf_node(source: &str, scope: &Scope) -> Result<CodeNode> {
    let mut parsed = ast_utils::parse_suite(source)?;
    if parsed.is_empty() {
        return Err(UnravelError::invalid_args("empty loader statement"));
    }
    let stmt = Rc::new(parsed.remove(0));
    let name = name_from_ast_node(&stmt)?;
    Ok(CodeNode {
        name: ScopedName::new(name, scope.clone()),
        source: source.trim_end().to_string(),
        stmt: SourcedStmt::new(stmt, Rc::from(source)),
        globals_: Vec::new(),
    })
}

/// Resolve one name to its definition, chasing imports from full-dump
/// modules into the module source.
pub fn find_codenode(
    session: &Session,
    introspector: &dyn ModuleIntrospector,
    target: &ScopedName,
    full_dump_module_names: &[String],
) -> Result<Found> {
    let found = finder::find_in_scope(session, introspector, target)?;
    if let ast::Stmt::ImportFrom(import) = found.stmt.stmt.as_ref() {
        let module = import.module.as_ref().map(|m| m.as_str()).unwrap_or("");
        let chase = import.level.map_or(true, |l| l.to_u32() == 0)
            && full_dump_module_names.iter().any(|m| m == module);
        if chase {
            if let Some(alias) = import.names.first() {
                if alias.asname.is_none() {
                    let inner =
                        ScopedName::new(alias.name.as_str(), Scope::toplevel(session, module));
                    match finder::find_scopedname_in_module(session, introspector, &inner) {
                        Ok(chased) => return Ok(chased),
                        Err(err) => {
                            warn!(module, name = %alias.name, %err, "falling back to the import statement");
                        }
                    }
                }
            }
        }
    }
    Ok(found)
}

// ============================================================================
// Entry points
// ============================================================================

/// Build the graph for a module-level name. Static entry used by the CLI.
pub fn build_codegraph_for_name(
    session: &Session,
    introspector: &dyn ModuleIntrospector,
    module: &str,
    name: &str,
    options: &BuildOptions,
) -> Result<CodeGraph> {
    let scope = Scope::toplevel(session, module);
    let mut graph = CodeGraph::new();
    graph.build(
        session,
        introspector,
        vec![ScopedName::new(name, scope)],
        options,
    )?;
    Ok(graph)
}

/// Build the graph from a captured frame stack.
///
/// Recovers the capture call named `capture_fn` at the top of the stack,
/// takes its first positional argument as the start expression, and resolves
/// everything in the caller's scope.
pub fn build_codegraph(
    session: &Session,
    introspector: &dyn ModuleIntrospector,
    stack: &FrameStack,
    capture_fn: &str,
    name: Option<&str>,
    options: &BuildOptions,
) -> Result<CodeGraph> {
    let info = CallInfo::from_stack(session, stack, capture_fn)?;
    let repr = info.capture_argument()?;
    let mut graph = CodeGraph::new();
    let worklist = graph.add_startnodes(&repr, name, &info.scope)?;
    graph.build(session, introspector, worklist, options)?;
    Ok(graph)
}

/// Build from a captured frame stack and serialize in one step.
pub fn dumps(
    session: &Session,
    introspector: &dyn ModuleIntrospector,
    stack: &FrameStack,
    capture_fn: &str,
    name: Option<&str>,
    options: &BuildOptions,
) -> Result<String> {
    build_codegraph(session, introspector, stack, capture_fn, name, options)?.dumps()
}

/// Map the import statements of a built graph to installable requirements.
///
/// # Errors
///
/// A missing requirement is fatal only when `strict`; otherwise it is
/// logged and the scan result is empty.
pub fn check_requirements(
    graph: &CodeGraph,
    scanner: &dyn RequirementsScanner,
    strict: bool,
) -> Result<Vec<String>> {
    let mut modules: Vec<String> = Vec::new();
    for node in graph.nodes.values() {
        match node.stmt.stmt.as_ref() {
            ast::Stmt::Import(import) => {
                for alias in &import.names {
                    let name = alias.name.as_str();
                    let top = name.split('.').next().unwrap_or(name);
                    if !modules.iter().any(|m| m == top) {
                        modules.push(top.to_string());
                    }
                }
            }
            ast::Stmt::ImportFrom(import) if import.level.map_or(true, |l| l.to_u32() == 0) => {
                if let Some(module) = &import.module {
                    let top = module.as_str().split('.').next().unwrap_or(module.as_str());
                    if !modules.iter().any(|m| m == top) {
                        modules.push(top.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    match scanner.scan(&modules) {
        Ok(requirements) => Ok(requirements),
        Err(RequirementError::NotFound { package }) => {
            if strict {
                Err(UnravelError::RequirementNotFound { package })
            } else {
                warn!(package, "requirement not found, continuing without it");
                Ok(Vec::new())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{NullIntrospector, NullScanner, NullSerializer};

    fn globals_of(source: &str) -> Vec<String> {
        let stmts = ast_utils::parse_suite(source).unwrap();
        find_globals_stmts(&stmts).into_iter().collect()
    }

    mod var_finder {
        use super::*;

        #[test]
        fn loads_count_before_the_statement_binds() {
            assert_eq!(globals_of("a = run(a)\n"), vec!["run", "a"]);
        }

        #[test]
        fn sequential_bindings_localize_later_loads() {
            assert_eq!(globals_of("a = 1\nb = a + c\n"), vec!["c"]);
        }

        #[test]
        fn function_bindings_shadow_the_whole_body() {
            assert_eq!(globals_of("def f():\n    y = x\n    x = 1\n"), Vec::<String>::new());
        }

        #[test]
        fn function_parameters_are_local() {
            assert_eq!(
                globals_of("def f(z):\n    a = 2\n    return a + z + x\n"),
                vec!["x"]
            );
        }

        #[test]
        fn global_declaration_stays_free() {
            assert_eq!(
                globals_of("def f():\n    global counter\n    counter = counter + 1\n"),
                vec!["counter"]
            );
        }

        #[test]
        fn recursion_is_not_a_dependency() {
            assert_eq!(
                globals_of("def fact(n):\n    return fact(n - 1)\n"),
                Vec::<String>::new()
            );
        }

        #[test]
        fn attribute_chains_collapse_to_one_dotted_name() {
            assert_eq!(
                globals_of("def f(v):\n    return np.linalg.norm(v)\n"),
                vec!["np.linalg.norm"]
            );
        }

        #[test]
        fn attribute_store_keeps_the_base_a_load() {
            assert_eq!(globals_of("a.b = c\n"), vec!["c", "a"]);
        }

        #[test]
        fn subscript_store_keeps_base_and_index_loads() {
            assert_eq!(globals_of("a[i] = 1\n"), vec!["a", "i"]);
        }

        #[test]
        fn comprehension_targets_are_local() {
            assert_eq!(
                globals_of("def f(xs):\n    return [g(x) for x in xs]\n"),
                vec!["g"]
            );
        }

        #[test]
        fn lambda_parameters_are_local() {
            assert_eq!(globals_of("h = lambda z: z + w\n"), vec!["w"]);
        }

        #[test]
        fn decorators_and_defaults_classify_in_the_enclosing_block() {
            assert_eq!(
                globals_of("@wrap\ndef f(a=default):\n    return a\n"),
                vec!["wrap", "default"]
            );
        }

        #[test]
        fn class_body_runs_methods_as_functions() {
            let source = "\
class C(Base):
    size = default

    def area(self):
        return self.size * scale
";
            assert_eq!(globals_of(source), vec!["Base", "default", "scale"]);
        }

        #[test]
        fn imports_bind_their_aliases() {
            assert_eq!(
                globals_of("import os\np = os.path.join(a, b)\n"),
                vec!["a", "b"]
            );
        }

        #[test]
        fn loop_variables_are_bindings() {
            assert_eq!(
                globals_of("for item in items:\n    total = total + item\n"),
                vec!["items", "total"]
            );
        }
    }

    mod renaming {
        use super::*;

        #[test]
        fn parameters_shadow_the_body_but_not_defaults() {
            let out = rename("@aaa\ndef foo(aaa=aaa):\n    return aaa\n", "aaa", "xxx", false)
                .unwrap();
            assert_eq!(out, "@xxx\ndef foo(aaa=xxx):\n    return aaa\n");
        }

        #[test]
        fn rename_locals_renames_the_def_name() {
            let out = rename("def aaa():\n    return aaa\n", "aaa", "xxx", true).unwrap();
            assert_eq!(out, "def xxx():\n    return xxx\n");
        }

        #[test]
        fn def_names_stay_without_rename_locals() {
            let out = rename("def aaa():\n    return aaa\n", "aaa", "xxx", false).unwrap();
            assert_eq!(out, "def aaa():\n    return xxx\n");
        }

        #[test]
        fn body_locals_shadow_references() {
            let out = rename("def f():\n    aaa = 1\n    return aaa\n", "aaa", "xxx", false)
                .unwrap();
            assert_eq!(out, "def f():\n    aaa = 1\n    return aaa\n");
        }

        #[test]
        fn class_bodies_rename_statements_but_not_method_names() {
            let source = "\
class C:
    aaa = aaa + 1

    def aaa(self):
        return self.aaa + aaa
";
            let expected = "\
class C:
    xxx = xxx + 1

    def aaa(self):
        return self.aaa + xxx
";
            assert_eq!(rename(source, "aaa", "xxx", false).unwrap(), expected);
        }

        #[test]
        fn comprehension_targets_shadow_all_but_the_first_iterable() {
            let out = rename("ys = [aaa for aaa in aaa]\n", "aaa", "xxx", false).unwrap();
            assert_eq!(out, "ys = [aaa for aaa in xxx]\n");
        }

        #[test]
        fn attribute_names_are_never_renamed() {
            let out = rename("obj.aaa = aaa\n", "aaa", "xxx", false).unwrap();
            assert_eq!(out, "obj.aaa = xxx\n");
        }

        #[test]
        fn plain_assignment_targets_are_renamed() {
            let out = rename("aaa = aaa + 1\n", "aaa", "xxx", false).unwrap();
            assert_eq!(out, "xxx = xxx + 1\n");
        }

        #[test]
        fn lambda_parameters_shadow_the_lambda_body() {
            let out = rename("f = lambda aaa: aaa + 1\n", "aaa", "xxx", false).unwrap();
            assert_eq!(out, "f = lambda aaa: aaa + 1\n");
        }
    }

    mod building {
        use super::*;

        fn build_for(source: &str, name: &str, options: &BuildOptions) -> Result<CodeGraph> {
            let session = Session::new();
            session.register_module("__main__", source);
            build_codegraph_for_name(&session, &NullIntrospector, "__main__", name, options)
        }

        #[test]
        fn chain_dumps_in_dependency_order() {
            let graph = build_for(
                "x = 1\ny = x + 1\nz = y + x\n",
                "z",
                &BuildOptions::default(),
            )
            .unwrap();
            assert_eq!(graph.dumps().unwrap(), "x = 1\n\n\ny = x + 1\n\n\nz = y + x\n");
        }

        #[test]
        fn function_dump_places_dependencies_first() {
            let source = "x = 100\n\ndef test_func(a, b):\n    return a + b + x\n";
            let graph = build_for(source, "test_func", &BuildOptions::default()).unwrap();
            assert_eq!(
                graph.dumps().unwrap(),
                "x = 100\n\n\ndef test_func(a, b):\n    return a + b + x\n"
            );
        }

        #[test]
        fn builtins_are_not_dependencies() {
            let graph = build_for(
                "xs = [1, 2]\ny = len(xs)\n",
                "y",
                &BuildOptions::default(),
            )
            .unwrap();
            assert_eq!(graph.len(), 2);
            assert_eq!(graph.dumps().unwrap(), "xs = [1, 2]\n\n\ny = len(xs)\n");
        }

        #[test]
        fn imports_are_kept_as_nodes() {
            let source = "import math\n\ndef area(r):\n    return math.pi * r * r\n";
            let graph = build_for(source, "area", &BuildOptions::default()).unwrap();
            let dump = graph.dumps().unwrap();
            assert_eq!(dump, "import math\n\n\ndef area(r):\n    return math.pi * r * r\n");
        }

        #[test]
        fn strict_mode_fails_on_unresolved_names() {
            let err = build_for(
                "y = missing + 1\n",
                "y",
                &BuildOptions {
                    strict: true,
                    ..BuildOptions::default()
                },
            )
            .unwrap_err();
            assert!(matches!(err, UnravelError::NameNotFound { .. }));
        }

        #[test]
        fn lenient_mode_drops_unresolved_names() {
            let graph = build_for("y = missing + 1\n", "y", &BuildOptions::default()).unwrap();
            assert_eq!(graph.dumps().unwrap(), "y = missing + 1\n");
        }

        #[test]
        fn mutual_references_terminate() {
            let source = "\
def ping(n):
    return pong(n - 1) if n else 0

def pong(n):
    return ping(n - 1) if n else 1
";
            let graph = build_for(source, "ping", &BuildOptions::default()).unwrap();
            assert_eq!(graph.len(), 2);
            let dump = graph.dumps().unwrap();
            assert!(dump.contains("def ping"));
            assert!(dump.contains("def pong"));
        }

        #[test]
        fn full_dump_modules_are_chased_into_source() {
            let session = Session::new();
            session.register_module("helpers", "def util():\n    return 1\n");
            session.register_module("__main__", "from helpers import util\ny = util()\n");
            let options = BuildOptions {
                strict: false,
                full_dump_module_names: vec!["helpers".to_string()],
            };
            let graph =
                build_codegraph_for_name(&session, &NullIntrospector, "__main__", "y", &options)
                    .unwrap();
            let dump = graph.dumps().unwrap();
            assert!(dump.contains("def util"));
            assert!(!dump.contains("from helpers import"));
        }

        #[test]
        fn colliding_names_are_flattened() {
            let session = Session::new();
            let source = "x = 2\n\ndef f():\n    x = 1\n    return x\n";
            session.register_module("__main__", source);
            let scope_f =
                Scope::from_source(&session, source, 4, "", "__main__", 0, None, None).unwrap();
            let mut graph = CodeGraph::new();
            graph
                .build(
                    &session,
                    &NullIntrospector,
                    vec![
                        scope_f.d_name("x", None, None),
                        ScopedName::new("x", scope_f.global_()),
                    ],
                    &BuildOptions::default(),
                )
                .unwrap();
            assert_eq!(graph.dumps().unwrap(), "__main___f_x = 1\n\n\nx = 2\n");
        }

        #[test]
        fn reassignment_chains_keep_the_final_binding() {
            // the last generation must still bind the plain name the start
            // node reads; only its right-hand side moves to the renamed
            // earlier generation
            let graph =
                build_for("x = 1\nx = x + 1\ny = x\n", "y", &BuildOptions::default()).unwrap();
            assert_eq!(
                graph.dumps().unwrap(),
                "x_2 = 1\n\n\nx = x_2 + 1\n\n\ny = x\n"
            );
        }

        #[test]
        fn duplicate_resolutions_collapse() {
            // z and y both depend on x, requested at different positions
            let graph = build_for(
                "x = 1\ny = x + 1\nz = y + x\n",
                "z",
                &BuildOptions::default(),
            )
            .unwrap();
            let dump = graph.dumps().unwrap();
            assert_eq!(dump.matches("x = 1").count(), 1);
        }

        #[test]
        fn injected_nodes_are_emitted() {
            let session = Session::new();
            session.register_module("__main__", "y = 1\n");
            let mut graph = build_codegraph_for_name(
                &session,
                &NullIntrospector,
                "__main__",
                "y",
                &BuildOptions::default(),
            )
            .unwrap();
            let scope = Scope::toplevel(&session, "__main__");
            graph
                .inject(leaf_node("data = load_blob('data.bin')", &scope).unwrap());
            let dump = graph.dumps().unwrap();
            assert!(dump.contains("data = load_blob('data.bin')"));
        }

        #[test]
        fn null_serializer_injects_nothing() {
            let session = Session::new();
            session.register_module("__main__", "y = 1\n");
            let mut graph = build_codegraph_for_name(
                &session,
                &NullIntrospector,
                "__main__",
                "y",
                &BuildOptions::default(),
            )
            .unwrap();
            let scope = Scope::toplevel(&session, "__main__");
            graph
                .inject_loaders(&NullSerializer, "y", &scope)
                .unwrap();
            assert_eq!(graph.len(), 1);
        }

        #[test]
        fn dumps_is_idempotent() {
            let graph = build_for(
                "x = 1\ny = x + 1\nz = y + x\n",
                "z",
                &BuildOptions::default(),
            )
            .unwrap();
            assert_eq!(graph.dumps().unwrap(), graph.dumps().unwrap());
        }
    }

    mod start_nodes {
        use super::*;

        #[test]
        fn named_start_enters_the_graph() {
            let mut graph = CodeGraph::new();
            let worklist = graph
                .add_startnodes("bip + x", Some("y"), &Scope::empty())
                .unwrap();
            assert_eq!(graph.len(), 1);
            let names: Vec<String> = worklist.into_iter().map(|n| n.name).collect();
            assert_eq!(names, vec!["bip", "x"]);
        }

        #[test]
        fn unnamed_start_only_seeds_the_worklist() {
            let mut graph = CodeGraph::new();
            let worklist = graph
                .add_startnodes("run(a)", None, &Scope::empty())
                .unwrap();
            assert!(graph.is_empty());
            let names: Vec<String> = worklist.into_iter().map(|n| n.name).collect();
            assert_eq!(names, vec!["run", "a"]);
        }
    }

    mod single_names {
        use super::*;

        fn first_stmt(source: &str) -> ast::Stmt {
            ast_utils::parse_suite(source).unwrap().remove(0)
        }

        #[test]
        fn single_target_forms_name() {
            assert_eq!(name_from_ast_node(&first_stmt("x = 1\n")).unwrap(), "x");
            assert_eq!(name_from_ast_node(&first_stmt("x: int = 1\n")).unwrap(), "x");
            assert_eq!(name_from_ast_node(&first_stmt("def f():\n    pass\n")).unwrap(), "f");
            assert_eq!(name_from_ast_node(&first_stmt("class C:\n    pass\n")).unwrap(), "C");
            assert_eq!(
                name_from_ast_node(&first_stmt("import numpy as np\n")).unwrap(),
                "np"
            );
        }

        #[test]
        fn multi_target_forms_error() {
            assert!(name_from_ast_node(&first_stmt("a = b = 1\n")).is_err());
            assert!(name_from_ast_node(&first_stmt("a, b = 1, 2\n")).is_err());
            assert!(name_from_ast_node(&first_stmt("run()\n")).is_err());
        }
    }

    mod requirements {
        use super::*;

        struct FailingScanner;

        impl RequirementsScanner for FailingScanner {
            fn scan(&self, _modules: &[String]) -> std::result::Result<Vec<String>, RequirementError> {
                Err(RequirementError::NotFound {
                    package: "numpy".to_string(),
                })
            }
        }

        fn import_graph() -> CodeGraph {
            let session = Session::new();
            session.register_module("__main__", "import numpy.linalg\nv = numpy.linalg.det\n");
            build_codegraph_for_name(
                &session,
                &NullIntrospector,
                "__main__",
                "v",
                &BuildOptions::default(),
            )
            .unwrap()
        }

        #[test]
        fn scan_receives_top_level_module_names() {
            let graph = import_graph();
            assert!(check_requirements(&graph, &NullScanner, true).unwrap().is_empty());
        }

        #[test]
        fn missing_requirement_is_fatal_only_in_strict_mode() {
            let graph = import_graph();
            let err = check_requirements(&graph, &FailingScanner, true).unwrap_err();
            assert!(matches!(err, UnravelError::RequirementNotFound { .. }));
            assert!(check_requirements(&graph, &FailingScanner, false)
                .unwrap()
                .is_empty());
        }
    }
}
