//! Tests for the guard injected around Python submissions.
//!
//! The wrapped text is parsed back with ruff and checked structurally, so the
//! assertions do not depend on the quote style or indentation the generator
//! picks.

use pretty_assertions::assert_eq;
use resident::{
    DIAGNOSTIC_PREFIX, ErrorPolicy, GUARD_EXCEPTION_NAME, RewriteError, SourceRewriter,
    rewrite::{assigned_names, wrap},
};
use ruff_python_ast::{ExceptHandler, Expr, Stmt, StmtTry, comparable::ComparableStmt};
use ruff_python_parser::parse_module;

fn parse_body(code: &str) -> Vec<Stmt> {
    parse_module(code).expect("rewritten code should parse").into_syntax().body
}

/// Parses `wrapped` and returns its single top-level `try` statement.
fn single_guard(wrapped: &str) -> StmtTry {
    let mut body = parse_body(wrapped);
    assert_eq!(body.len(), 1, "expected exactly one top-level statement in:\n{wrapped}");
    match body.remove(0) {
        Stmt::Try(guard) => guard,
        other => panic!("expected a try statement, got {other:?}"),
    }
}

fn handler_body(guard: &StmtTry) -> &[Stmt] {
    assert_eq!(guard.handlers.len(), 1, "guard should have exactly one handler");
    let ExceptHandler::ExceptHandler(handler) = &guard.handlers[0];
    &handler.body
}

fn count_ifs(stmts: &[Stmt]) -> usize {
    stmts.iter().filter(|stmt| matches!(stmt, Stmt::If(_))).count()
}

// ============================================================================
// Structure of the guarded block
// ============================================================================

#[test]
fn wrap_produces_one_try_statement() {
    let code = "import math\nx = 4\ny = math.sqrt(x)\nprint(y)\n";
    let guard = single_guard(&wrap(code, ErrorPolicy::PrintOnly).unwrap());
    assert!(guard.orelse.is_empty(), "no else clause expected");
    assert!(guard.finalbody.is_empty(), "no finally clause expected");
    assert!(!guard.is_star);
}

#[test]
fn protected_body_matches_submitted_statements() {
    let code = "import math\nx = 4\ny = math.sqrt(x)\nprint(y)\n";
    let guard = single_guard(&wrap(code, ErrorPolicy::PrintWithVariables).unwrap());
    let submitted = parse_body(code);

    let expected: Vec<ComparableStmt> = submitted.iter().map(ComparableStmt::from).collect();
    let actual: Vec<ComparableStmt> = guard.body.iter().map(ComparableStmt::from).collect();
    assert_eq!(actual, expected);
}

#[test]
fn handler_binds_exception_to_reserved_name() {
    let guard = single_guard(&wrap("x = 1 / 0", ErrorPolicy::PrintOnly).unwrap());
    let ExceptHandler::ExceptHandler(handler) = &guard.handlers[0];

    let Some(Expr::Name(type_name)) = handler.type_.as_deref() else {
        panic!("handler should name an exception type");
    };
    assert_eq!(type_name.id.as_str(), "Exception");
    assert_eq!(
        handler.name.as_ref().map(|name| name.as_str()),
        Some(GUARD_EXCEPTION_NAME)
    );
}

#[test]
fn handler_does_not_bind_user_visible_names() {
    // the handler runs at module level: an import would overwrite a user global
    let code = "e = 7\ntraceback = 'log'\ny = 1 / 0";
    let guard = single_guard(&wrap(code, ErrorPolicy::PrintWithVariables).unwrap());
    let body = handler_body(&guard);
    assert!(
        !body.iter().any(|stmt| matches!(stmt, Stmt::Import(_) | Stmt::ImportFrom(_))),
        "handler must not import"
    );
    let ExceptHandler::ExceptHandler(handler) = &guard.handlers[0];
    assert_ne!(handler.name.as_ref().map(|name| name.as_str()), Some("e"));
}

#[test]
fn handler_prints_diagnostic_prefix() {
    let wrapped = wrap("value = int('nope')", ErrorPolicy::PrintOnly).unwrap();
    assert!(
        wrapped.contains(DIAGNOSTIC_PREFIX),
        "handler should print the diagnostic prefix:\n{wrapped}"
    );
    assert!(wrapped.contains("print_exc"), "handler should print the traceback:\n{wrapped}");
}

#[test]
fn compound_statements_are_wrapped_whole() {
    let code = "\
def double(n):
    return n * 2

class Box:
    pass

for i in range(3):
    total = double(i)
";
    let guard = single_guard(&wrap(code, ErrorPolicy::PrintOnly).unwrap());
    assert_eq!(guard.body.len(), 3);
    assert!(matches!(guard.body[0], Stmt::FunctionDef(_)));
    assert!(matches!(guard.body[1], Stmt::ClassDef(_)));
    assert!(matches!(guard.body[2], Stmt::For(_)));
}

#[test]
fn rewritten_block_has_no_blank_lines() {
    // stdin is evaluated interactively, where a blank line ends a compound statement
    let code = "def f():\n    a = 1\n\n    return a\n\n\nresult = f()\n";
    let wrapped = wrap(code, ErrorPolicy::PrintWithVariables).unwrap();
    assert!(
        wrapped.lines().all(|line| !line.trim().is_empty()),
        "blank line found in:\n{wrapped}"
    );
}

// ============================================================================
// Error policies
// ============================================================================

#[test]
fn print_only_emits_no_variable_checks() {
    let guard = single_guard(&wrap("a = 1\nb = 2", ErrorPolicy::PrintOnly).unwrap());
    assert_eq!(count_ifs(handler_body(&guard)), 0);
}

#[test]
fn print_with_variables_checks_each_assigned_name() {
    let guard = single_guard(&wrap("a = 1\nb, c = 2, 3\nb += a", ErrorPolicy::PrintWithVariables).unwrap());
    assert_eq!(count_ifs(handler_body(&guard)), 3, "one check per distinct name");
}

#[test]
fn print_with_variables_without_assignments_matches_print_only() {
    let code = "print('hello')";
    let with_vars = single_guard(&wrap(code, ErrorPolicy::PrintWithVariables).unwrap());
    let print_only = single_guard(&wrap(code, ErrorPolicy::PrintOnly).unwrap());
    assert_eq!(handler_body(&with_vars).len(), handler_body(&print_only).len());
}

#[test]
fn default_policy_prints_variables() {
    assert_eq!(ErrorPolicy::default(), ErrorPolicy::PrintWithVariables);
    assert_eq!(SourceRewriter::default().policy(), ErrorPolicy::PrintWithVariables);
}

#[test]
fn rewriter_applies_its_policy() {
    let rewriter = SourceRewriter::new(ErrorPolicy::PrintOnly);
    let code = "x = 1";
    assert_eq!(rewriter.wrap(code).unwrap(), wrap(code, ErrorPolicy::PrintOnly).unwrap());
}

// ============================================================================
// Assigned names
// ============================================================================

#[test]
fn assigned_names_covers_every_binding_form() {
    let code = "\
a = 1
b, (c, d) = 2, (3, 4)
e += 1
f: int = 5
for g in range(2):
    pass
with open('x') as h:
    pass
if (i := 10) > 5:
    pass
";
    let names: Vec<String> = assigned_names(code).unwrap().into_iter().collect();
    assert_eq!(names, ["a", "b", "c", "d", "e", "f", "g", "h", "i"]);
}

#[test]
fn assigned_names_includes_nested_scopes() {
    let names = assigned_names("def f():\n    inner = 1\n    return inner\n").unwrap();
    assert!(names.contains("inner"));
}

#[test]
fn assigned_names_ignores_loads_and_attributes() {
    let names = assigned_names("obj.attr = 1\nitems[0] = 2\nprint(unbound)\n").unwrap();
    assert!(names.is_empty(), "unexpected names: {names:?}");
}

// ============================================================================
// Edge cases
// ============================================================================

#[test]
fn empty_input_renders_empty() {
    assert_eq!(wrap("", ErrorPolicy::PrintWithVariables).unwrap(), "");
    assert_eq!(wrap("   \n\n", ErrorPolicy::PrintOnly).unwrap(), "");
    assert_eq!(wrap("# only a comment\n", ErrorPolicy::PrintOnly).unwrap(), "");
}

#[test]
fn syntax_error_is_reported_not_repaired() {
    let err = wrap("x = (", ErrorPolicy::PrintWithVariables).unwrap_err();
    assert!(matches!(err, RewriteError::Syntax { .. }), "got {err:?}");
}

#[test]
fn syntax_error_offset_points_into_source() {
    let code = "a = 1\nb = = 2\n";
    let RewriteError::Syntax { offset, message } = wrap(code, ErrorPolicy::PrintOnly).unwrap_err() else {
        panic!("expected a syntax error");
    };
    assert!(offset as usize >= "a = 1\n".len(), "offset {offset} should be on line 2");
    assert!(!message.is_empty());
}

#[test]
fn already_guarded_code_is_wrapped_again() {
    let code = "try:\n    x = 1\nexcept ValueError:\n    pass\n";
    let guard = single_guard(&wrap(code, ErrorPolicy::PrintOnly).unwrap());
    assert_eq!(guard.body.len(), 1);
    assert!(matches!(guard.body[0], Stmt::Try(_)));
}
