//! Source-to-source guard injection for Python submissions.
//!
//! Submitted code is parsed with ruff, wrapped in one top-level
//! `try`/`except Exception` block, and rendered back to text. A fault in user
//! code then aborts only that submission: the handler prints a diagnostic and
//! the interpreter process, with all of its accumulated state, survives.

use std::{collections::BTreeSet, fmt};

use ruff_python_ast::{
    self as ast, Expr, ExprContext, Stmt,
    visitor::{self, Visitor},
};
use ruff_python_codegen::{Generator, Stylist};
use ruff_python_parser::parse_module;
use ruff_text_size::Ranged;
use serde::{Deserialize, Serialize};

/// Text printed by the fault handler before the exception description.
pub const DIAGNOSTIC_PREFIX: &str = "An error occurred:";

/// Name the fault handler binds the caught exception to.
///
/// The handler runs at module level, and Python unbinds the `as` target when
/// the handler exits, so the name must never collide with user globals. The
/// leading underscores also keep it out of the python preset's state snapshots.
pub const GUARD_EXCEPTION_NAME: &str = "__resident_exc";

/// What the injected fault handler does when user code raises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Print the diagnostic prefix, the exception and its traceback.
    PrintOnly,
    /// Like `PrintOnly`, then print `name: value` for every name the block
    /// assigns that is bound when the handler runs.
    #[default]
    PrintWithVariables,
}

/// Failure to produce a guarded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// The submitted code does not parse. The rewriter never repairs input.
    Syntax { message: String, offset: u32 },
    /// The generated handler did not parse back into a `try` statement.
    Template(String),
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { message, offset } => write!(f, "syntax error at offset {offset}: {message}"),
            Self::Template(msg) => write!(f, "guard template error: {msg}"),
        }
    }
}

impl std::error::Error for RewriteError {}

/// Wraps Python code in a guarded block according to a fixed [`ErrorPolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceRewriter {
    policy: ErrorPolicy,
}

impl SourceRewriter {
    /// Creates a rewriter that guards with `policy`.
    #[must_use]
    pub fn new(policy: ErrorPolicy) -> Self {
        Self { policy }
    }

    /// The policy applied by [`wrap`](Self::wrap).
    #[must_use]
    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// See [`wrap`].
    pub fn wrap(&self, code: &str) -> Result<String, RewriteError> {
        wrap(code, self.policy)
    }
}

/// Parses `code`, splices its whole statement list into the body of a single
/// `try` statement, and renders the result.
///
/// Code with no statements (blank or comments only) renders as an empty
/// string. The order of per-name diagnostic lines follows set iteration and
/// must not be relied upon.
pub fn wrap(code: &str, policy: ErrorPolicy) -> Result<String, RewriteError> {
    let parsed = parse_module(code).map_err(|e| RewriteError::Syntax {
        message: e.to_string(),
        offset: u32::from(e.range().start()),
    })?;
    let stylist = Stylist::from_tokens(parsed.tokens(), code);
    let module = parsed.into_syntax();
    if module.body.is_empty() {
        return Ok(String::new());
    }

    let names = bind_targets(&module.body);
    let mut guard = guard_template(policy, &names)?;
    guard.body = module.body;
    Ok(Generator::from(&stylist).stmt(&Stmt::Try(guard)))
}

/// Returns every name that appears as an assignment target anywhere in `code`.
pub fn assigned_names(code: &str) -> Result<BTreeSet<String>, RewriteError> {
    let parsed = parse_module(code).map_err(|e| RewriteError::Syntax {
        message: e.to_string(),
        offset: u32::from(e.range().start()),
    })?;
    Ok(bind_targets(&parsed.syntax().body))
}

fn bind_targets(body: &[Stmt]) -> BTreeSet<String> {
    let mut collector = BindTargets::default();
    collector.visit_body(body);
    collector.names
}

/// Collects identifiers in store context: assignment, augmented and annotated
/// assignment targets, loop targets, `with ... as` targets, walrus targets.
#[derive(Default)]
struct BindTargets {
    names: BTreeSet<String>,
}

impl<'a> Visitor<'a> for BindTargets {
    fn visit_expr(&mut self, expr: &'a Expr) {
        if let Expr::Name(ast::ExprName {
            id,
            ctx: ExprContext::Store,
            ..
        }) = expr
        {
            self.names.insert(id.to_string());
        }
        visitor::walk_expr(self, expr);
    }
}

/// Builds the `try` statement that will receive the user's statements.
///
/// The handler is produced as source and parsed back, which keeps node
/// construction inside the parser. The `pass` body is replaced by the caller.
fn guard_template(policy: ErrorPolicy, names: &BTreeSet<String>) -> Result<ast::StmtTry, RewriteError> {
    let source = handler_source(policy, names);
    let parsed = parse_module(&source).map_err(|e| RewriteError::Template(e.to_string()))?;
    match parsed.into_syntax().body.into_iter().next() {
        Some(Stmt::Try(guard)) => Ok(guard),
        _ => Err(RewriteError::Template("expected a try statement".to_owned())),
    }
}

fn handler_source(policy: ErrorPolicy, names: &BTreeSet<String>) -> String {
    // no import statement: it would bind `traceback` in the user's globals
    let mut source = format!("try:\n    pass\nexcept Exception as {GUARD_EXCEPTION_NAME}:\n");
    source.push_str(&format!("    print('{DIAGNOSTIC_PREFIX}', {GUARD_EXCEPTION_NAME})\n"));
    source.push_str("    __import__('traceback').print_exc()\n");
    if policy == ErrorPolicy::PrintWithVariables {
        // names come from the parser, so they are valid identifiers and safe to quote
        for name in names {
            source.push_str(&format!(
                "    if '{name}' in locals():\n        print('{name}:', locals()['{name}'])\n"
            ));
        }
    }
    source
}
