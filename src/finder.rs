//! Locating the statement that defines a name.
//!
//! Statements are scanned backward, newest first, under an optional position
//! ceiling: only statements strictly before the ceiling count, which is what
//! makes reassignment chains like `a = 1; b = a; a = b` resolve to the right
//! generation of each name.
//!
//! Five kinds of statement can define a name, tried per statement in this
//! order: function definitions, class definitions, `import`, `from ...
//! import` (with `*` imports expanded through the module introspector at
//! match time), and assignments. Conditional and loop bodies are searched;
//! function and class interiors are not, since their bindings are invisible
//! outside. A name bound in a `with` header is not modeled and errors.
//!
//! Resolution falls through scope levels one frame at a time, then to the
//! module source, then (for `__main__` without a source file) to the
//! interactive history, newest cell first.

use std::rc::Rc;

use rustpython_parser::ast;
use tracing::debug;

use crate::adapter::ModuleIntrospector;
use crate::ast_utils;
use crate::error::{Result, UnravelError};
use crate::scope::{Scope, ScopedName, SourcedStmt};
use crate::session::Session;

// ============================================================================
// Results
// ============================================================================

/// A resolved definition.
#[derive(Debug, Clone)]
pub struct Found {
    /// Canonical source of the defining statement. Multi-name imports are
    /// narrowed to the single matching alias.
    pub source: String,
    /// The defining statement, canonicalized for imports.
    pub stmt: SourcedStmt,
    /// The matched name variant, stamped with scope and position.
    pub name: ScopedName,
}

// ============================================================================
// Statement filtering
// ============================================================================

/// Statements strictly before a position ceiling.
pub fn statements_before<'a>(
    stmts: &'a [SourcedStmt],
    pos: Option<(usize, usize)>,
) -> Vec<&'a SourcedStmt> {
    match pos {
        None => stmts.iter().collect(),
        Some(ceiling) => stmts
            .iter()
            .filter(|s| {
                let p = s.position();
                (p.lineno, p.col_offset) < ceiling
            })
            .collect(),
    }
}

// ============================================================================
// Matching
// ============================================================================

/// Try to match one statement as the definition of `variant`.
///
/// Returns the canonical source and statement on a match. Compound
/// statements are searched backward; function and class interiors are not
/// entered.
fn match_statement(
    introspector: &dyn ModuleIntrospector,
    sourced: &SourcedStmt,
    variant: &str,
) -> Result<Option<(String, SourcedStmt)>> {
    match sourced.stmt.as_ref() {
        ast::Stmt::FunctionDef(def) if def.name.as_str() == variant => {
            Ok(Some((sourced.segment(), sourced.clone())))
        }
        ast::Stmt::AsyncFunctionDef(def) if def.name.as_str() == variant => {
            Ok(Some((sourced.segment(), sourced.clone())))
        }
        ast::Stmt::ClassDef(class) if class.name.as_str() == variant => {
            Ok(Some((sourced.segment(), sourced.clone())))
        }
        ast::Stmt::Import(import) => {
            for alias in &import.names {
                let matched = match &alias.asname {
                    Some(asname) => asname.as_str() == variant,
                    None => alias.name.as_str() == variant,
                };
                if matched {
                    let text = match &alias.asname {
                        Some(asname) => format!("import {} as {}", alias.name, asname),
                        None => format!("import {}", alias.name),
                    };
                    return Ok(Some(canonical_import(text, alias.asname.is_none())?));
                }
            }
            Ok(None)
        }
        ast::Stmt::ImportFrom(import) => {
            let dots = ".".repeat(
                import
                    .level
                    .map(|l| l.to_u32() as usize)
                    .unwrap_or(0),
            );
            let module = import
                .module
                .as_ref()
                .map(|m| m.as_str())
                .unwrap_or("");
            for alias in &import.names {
                if alias.name.as_str() == "*" {
                    let Some(exported) = introspector.exported_names(module) else {
                        debug!(module, "cannot expand star import");
                        continue;
                    };
                    if exported.iter().any(|n| n == variant) {
                        let text = format!("from {}{} import {}", dots, module, variant);
                        return Ok(Some(canonical_import(text, true)?));
                    }
                    continue;
                }
                let matched = match &alias.asname {
                    Some(asname) => asname.as_str() == variant,
                    None => alias.name.as_str() == variant,
                };
                if matched {
                    let text = match &alias.asname {
                        Some(asname) => {
                            format!("from {}{} import {} as {}", dots, module, alias.name, asname)
                        }
                        None => format!("from {}{} import {}", dots, module, alias.name),
                    };
                    return Ok(Some(canonical_import(text, alias.asname.is_none())?));
                }
            }
            Ok(None)
        }
        ast::Stmt::Assign(assign) => {
            if assign.targets.iter().any(|t| target_binds(t, variant)) {
                Ok(Some((sourced.segment(), sourced.clone())))
            } else {
                Ok(None)
            }
        }
        ast::Stmt::AnnAssign(assign) => {
            if assign.value.is_some() && target_binds(&assign.target, variant) {
                Ok(Some((sourced.segment(), sourced.clone())))
            } else {
                Ok(None)
            }
        }
        ast::Stmt::With(with) => {
            for item in &with.items {
                if let Some(vars) = &item.optional_vars {
                    if target_binds(vars, variant) {
                        return Err(UnravelError::unsupported(
                            "with statement",
                            format!("'{}' is bound in a with header", variant),
                        ));
                    }
                }
            }
            match_nested(introspector, sourced, variant)
        }
        ast::Stmt::If(_)
        | ast::Stmt::For(_)
        | ast::Stmt::AsyncFor(_)
        | ast::Stmt::While(_)
        | ast::Stmt::Try(_)
        | ast::Stmt::TryStar(_)
        | ast::Stmt::Match(_)
        | ast::Stmt::AsyncWith(_) => match_nested(introspector, sourced, variant),
        _ => Ok(None),
    }
}

/// Search the nested bodies of a compound statement, backward.
fn match_nested(
    introspector: &dyn ModuleIntrospector,
    sourced: &SourcedStmt,
    variant: &str,
) -> Result<Option<(String, SourcedStmt)>> {
    for body in ast_utils::nested_bodies(&sourced.stmt) {
        for stmt in body.iter().rev() {
            let nested = SourcedStmt {
                stmt: Rc::new(stmt.clone()),
                source: Rc::clone(&sourced.source),
                caller_scope: sourced.caller_scope.clone(),
                global_scope: sourced.global_scope,
            };
            if let Some(hit) = match_statement(introspector, &nested, variant)? {
                return Ok(Some(hit));
            }
        }
    }
    Ok(None)
}

fn canonical_import(text: String, global_scope: bool) -> Result<(String, SourcedStmt)> {
    let mut parsed = ast_utils::parse_suite(&text)?;
    let stmt = Rc::new(parsed.remove(0));
    let sourced = SourcedStmt {
        stmt,
        source: Rc::from(text.as_str()),
        caller_scope: None,
        global_scope,
    };
    Ok((text, sourced))
}

fn target_binds(expr: &ast::Expr, name: &str) -> bool {
    match expr {
        ast::Expr::Name(n) => n.id.as_str() == name,
        ast::Expr::Tuple(t) => t.elts.iter().any(|e| target_binds(e, name)),
        ast::Expr::List(l) => l.elts.iter().any(|e| target_binds(e, name)),
        ast::Expr::Starred(s) => target_binds(&s.value, name),
        _ => false,
    }
}

/// Scan a statement list backward for the definition of any variant of
/// `target`, stamping hits with `scope`.
fn scan(
    introspector: &dyn ModuleIntrospector,
    stmts: &[SourcedStmt],
    target: &ScopedName,
    scope: &Scope,
) -> Result<Option<Found>> {
    let variants = target.variants();
    for sourced in statements_before(stmts, target.pos).into_iter().rev() {
        for variant in &variants {
            if let Some((source, stmt)) = match_statement(introspector, sourced, variant)? {
                let pos = sourced.position();
                return Ok(Some(Found {
                    source,
                    stmt,
                    name: ScopedName {
                        name: variant.clone(),
                        scope: scope.clone(),
                        pos: Some((pos.lineno, pos.col_offset)),
                        cell_no: target.cell_no,
                    },
                }));
            }
        }
    }
    Ok(None)
}

fn not_found(target: &ScopedName) -> UnravelError {
    UnravelError::NameNotFound {
        name: target.name.clone(),
        scope: target.scope.to_string(),
        variants: target.variants(),
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Find the definition of `target` in a given source text.
///
/// The target's scope is stamped onto the result; its position bounds the
/// backward search.
pub fn find_scopedname_in_source(
    session: &Session,
    introspector: &dyn ModuleIntrospector,
    target: &ScopedName,
    source: &str,
) -> Result<Found> {
    let parsed = session.parse(source)?;
    let source_rc: Rc<str> = Rc::from(source);
    let stmts: Vec<SourcedStmt> = parsed
        .iter()
        .map(|stmt| SourcedStmt::new(Rc::new(stmt.clone()), Rc::clone(&source_rc)))
        .collect();
    scan(introspector, &stmts, target, &target.scope)?.ok_or_else(|| not_found(target))
}

/// Find the definition of `target` at the module level of its scope's
/// module.
///
/// Falls back to the interactive history when `__main__` has no registered
/// source.
pub fn find_scopedname_in_module(
    session: &Session,
    introspector: &dyn ModuleIntrospector,
    target: &ScopedName,
) -> Result<Found> {
    let module = target.scope.module.clone();
    if let Some(text) = session.module_source(&module) {
        let global = target.scope.global_();
        let module_target = ScopedName {
            name: target.name.clone(),
            scope: global,
            pos: target.pos,
            cell_no: target.cell_no,
        };
        return find_scopedname_in_source(session, introspector, &module_target, text.original());
    }
    if !target.scope.def_source.is_empty() {
        let module_target = ScopedName {
            name: target.name.clone(),
            scope: target.scope.global_(),
            pos: target.pos,
            cell_no: target.cell_no,
        };
        let source = Rc::clone(&target.scope.def_source);
        return find_scopedname_in_source(session, introspector, &module_target, &source);
    }
    if module == "__main__" && !session.history_cells().is_empty() {
        return find_scopedname_in_history(session, introspector, target);
    }
    Err(UnravelError::MissingSourceFile { module })
}

/// Find the definition of `target` in the interactive history, walking
/// cells newest first from the target's cell.
pub fn find_scopedname_in_history(
    session: &Session,
    introspector: &dyn ModuleIntrospector,
    target: &ScopedName,
) -> Result<Found> {
    let cells = session.history_cells();
    if cells.is_empty() {
        return Err(not_found(target));
    }
    let start = target.cell_no.unwrap_or(cells.len() - 1).min(cells.len() - 1);
    for cell_no in (0..=start).rev() {
        let source = &cells[cell_no];
        let parsed = session.parse(source)?;
        let stmts: Vec<SourcedStmt> = parsed
            .iter()
            .map(|stmt| SourcedStmt::new(Rc::new(stmt.clone()), Rc::clone(source)))
            .collect();
        let cell_scope = Scope {
            module: "__main__".to_string(),
            def_source: Rc::clone(source),
            scopelist: Vec::new(),
            index: 0,
        };
        let cell_target = ScopedName {
            name: target.name.clone(),
            scope: cell_scope.clone(),
            // the ceiling only applies inside the cell it refers to
            pos: if cell_no == start { target.pos } else { None },
            cell_no: Some(cell_no),
        };
        if let Some(found) = scan(introspector, &stmts, &cell_target, &cell_scope)? {
            return Ok(found);
        }
    }
    Err(not_found(target))
}

/// Resolve `target` by walking its scope chain outward, then the module
/// level.
///
/// Each failed frame drops one scope level and clears the position ceiling,
/// mirroring how an enclosing function's names are all visible regardless of
/// statement order at the point of use.
pub fn find_in_scope(
    session: &Session,
    introspector: &dyn ModuleIntrospector,
    target: &ScopedName,
) -> Result<Found> {
    let mut current = target.clone();
    while !current.scope.is_global() {
        let frame = Rc::clone(&current.scope.scopelist[0]);
        if let Some(found) = scan(introspector, &frame.body, &current, &current.scope)? {
            return Ok(found);
        }
        debug!(name = %current.name, scope = %current.scope, "not in frame, moving up");
        current.up();
    }
    find_scopedname_in_module(session, introspector, &current)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NullIntrospector;

    struct StarExports(Vec<&'static str>);

    impl ModuleIntrospector for StarExports {
        fn exported_names(&self, _module: &str) -> Option<Vec<String>> {
            Some(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    fn target(name: &str) -> ScopedName {
        ScopedName::new(name, Scope::empty())
    }

    mod in_source {
        use super::*;

        #[test]
        fn annassign_defines_a_name() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("a"),
                "\na: int = 1\n",
            )
            .unwrap();
            assert_eq!(found.source, "a: int = 1");
            assert!(matches!(found.stmt.stmt.as_ref(), ast::Stmt::AnnAssign(_)));
            assert_eq!(found.name.name, "a");
        }

        #[test]
        fn latest_assignment_wins() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("a"),
                "\na = 1\nb = a\na = b\n",
            )
            .unwrap();
            assert_eq!(found.source, "a = b");
            assert_eq!(found.name.pos, Some((4, 0)));
        }

        #[test]
        fn position_ceiling_hides_later_assignments() {
            let session = Session::new();
            let mut name = target("a");
            name.pos = Some((4, 0));
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &name,
                "\na = 1\nb = a\na = b\n",
            )
            .unwrap();
            assert_eq!(found.source, "a = 1");
            assert_eq!(found.name.pos, Some((2, 0)));
        }

        #[test]
        fn function_and_class_definitions_match() {
            let session = Session::new();
            let source = "def f():\n    return 1\n\nclass C:\n    ...\n";
            let f = find_scopedname_in_source(&session, &NullIntrospector, &target("f"), source)
                .unwrap();
            assert!(f.source.starts_with("def f()"));
            let c = find_scopedname_in_source(&session, &NullIntrospector, &target("C"), source)
                .unwrap();
            assert!(c.source.starts_with("class C"));
        }

        #[test]
        fn import_is_narrowed_to_the_matching_alias() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("b"),
                "import a, b\n",
            )
            .unwrap();
            assert_eq!(found.source, "import b");
            assert!(found.stmt.global_scope);
        }

        #[test]
        fn import_asname_binds_the_alias() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("np"),
                "import numpy as np\n",
            )
            .unwrap();
            assert_eq!(found.source, "import numpy as np");
            assert!(!found.stmt.global_scope);
        }

        #[test]
        fn from_import_matches_and_canonicalizes() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("a"),
                "from b import a, c\n",
            )
            .unwrap();
            assert_eq!(found.source, "from b import a");
        }

        #[test]
        fn star_import_expands_through_the_introspector() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &StarExports(vec!["foo", "bar"]),
                &target("bar"),
                "from mymod import *\n",
            )
            .unwrap();
            assert_eq!(found.source, "from mymod import bar");
        }

        #[test]
        fn star_import_without_introspection_misses() {
            let session = Session::new();
            let err = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("bar"),
                "from mymod import *\n",
            )
            .unwrap_err();
            assert!(matches!(err, UnravelError::NameNotFound { .. }));
        }

        #[test]
        fn variants_resolve_module_imports() {
            let session = Session::new();
            let mut name = target("helpers.tool");
            name.scope = Scope::empty();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &name,
                "from pkg import helpers\n",
            )
            .unwrap();
            assert_eq!(found.source, "from pkg import helpers");
            assert_eq!(found.name.name, "helpers");
        }

        #[test]
        fn conditional_bodies_are_searched() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("x"),
                "if cond:\n    x = 1\nelse:\n    x = 2\n",
            )
            .unwrap();
            assert_eq!(found.source, "x = 2");
        }

        #[test]
        fn function_interiors_are_not_searched() {
            let session = Session::new();
            let err = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("x"),
                "def f():\n    x = 1\n",
            )
            .unwrap_err();
            assert!(matches!(err, UnravelError::NameNotFound { .. }));
        }

        #[test]
        fn with_header_binding_is_unsupported() {
            let session = Session::new();
            let err = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("fh"),
                "with open(p) as fh:\n    data = fh.read()\n",
            )
            .unwrap_err();
            assert!(matches!(err, UnravelError::UnsupportedConstruct { .. }));
        }

        #[test]
        fn with_body_is_searched() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("data"),
                "with open(p) as fh:\n    data = fh.read()\n",
            )
            .unwrap();
            assert_eq!(found.source, "data = fh.read()");
        }

        #[test]
        fn tuple_targets_bind_each_name() {
            let session = Session::new();
            let found = find_scopedname_in_source(
                &session,
                &NullIntrospector,
                &target("b"),
                "a, b = 1, 2\n",
            )
            .unwrap();
            assert_eq!(found.source, "a, b = 1, 2");
        }

        #[test]
        fn missing_name_reports_variants() {
            let session = Session::new();
            let err =
                find_scopedname_in_source(&session, &NullIntrospector, &target("a.b"), "x = 1\n")
                    .unwrap_err();
            match err {
                UnravelError::NameNotFound { variants, .. } => {
                    assert_eq!(variants, vec!["a".to_string(), "a.b".to_string()]);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    mod in_history {
        use super::*;

        fn two_cell_session() -> Session {
            let session = Session::new();
            session.push_history_cell("\na = 1\nb = a\n");
            session.push_history_cell("\na = b\n");
            session
        }

        #[test]
        fn latest_cell_wins() {
            let session = two_cell_session();
            let name = ScopedName::new("a", Scope::toplevel(&session, "__main__"));
            let found =
                find_scopedname_in_history(&session, &NullIntrospector, &name).unwrap();
            assert_eq!(found.source, "a = b");
            assert_eq!(found.name.cell_no, Some(1));
        }

        #[test]
        fn ceiling_in_starting_cell_falls_back_to_earlier_cells() {
            let session = two_cell_session();
            let mut name = ScopedName::new("a", Scope::toplevel(&session, "__main__"));
            name.pos = Some((2, 0));
            name.cell_no = Some(1);
            let found =
                find_scopedname_in_history(&session, &NullIntrospector, &name).unwrap();
            assert_eq!(found.source, "a = 1");
            assert_eq!(found.name.cell_no, Some(0));
        }

        #[test]
        fn module_lookup_falls_back_to_history() {
            let session = two_cell_session();
            let name = ScopedName::new("b", Scope::toplevel(&session, "__main__"));
            let found = find_scopedname_in_module(&session, &NullIntrospector, &name).unwrap();
            assert_eq!(found.source, "b = a");
        }
    }

    mod in_scope {
        use super::*;

        #[test]
        fn parameters_resolve_as_synthetic_assignments() {
            let session = Session::new();
            let source = "x = 1\n\ndef f(z):\n    a = 2\n    return a + z + x\n";
            session.register_module("__main__", source);
            let scope = Scope::from_source(
                &session, source, 4, "f(41)", "__main__", 0, None, None,
            )
            .unwrap();
            let found = find_in_scope(
                &session,
                &NullIntrospector,
                &scope.d_name("z", None, None),
            )
            .unwrap();
            assert_eq!(found.source, "z = 41");
        }

        #[test]
        fn frame_misses_fall_through_to_module_level() {
            let session = Session::new();
            let source = "x = 1\n\ndef f(z):\n    a = 2\n    return a + z + x\n";
            session.register_module("__main__", source);
            let scope = Scope::from_source(
                &session, source, 4, "f(41)", "__main__", 0, None, None,
            )
            .unwrap();
            let found = find_in_scope(
                &session,
                &NullIntrospector,
                &scope.d_name("x", None, None),
            )
            .unwrap();
            assert_eq!(found.source, "x = 1");
            assert!(found.name.scope.is_global());
        }

        #[test]
        fn unresolvable_names_error() {
            let session = Session::new();
            let source = "x = 1\n";
            session.register_module("__main__", source);
            let scope = Scope::toplevel(&session, "__main__");
            let err = find_in_scope(
                &session,
                &NullIntrospector,
                &scope.d_name("nope", None, None),
            )
            .unwrap_err();
            assert!(matches!(err, UnravelError::NameNotFound { .. }));
        }
    }
}
