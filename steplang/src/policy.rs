//! Static policy gate over parsed step sources.
//!
//! Runs before any execution and collects every violation so the model sees
//! the full list at once, not just the first offending construct.

use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::FStringPart;
use crate::ast::Index;
use crate::ast::Param;
use crate::ast::Program;
use crate::ast::Stmt;
use crate::ast::StmtKind;

/// Identifiers rejected wherever they appear as names, including pure name
/// references that are never called.
const BANNED_NAMES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "globals",
    "locals",
    "vars",
    "dir",
    "help",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "exit",
    "quit",
    "__import__",
    "os",
    "sys",
    "subprocess",
    "socket",
    "pathlib",
    "shutil",
    "urllib",
    "requests",
    "http",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub line: u32,
    pub message: String,
}

/// Validate a parsed program against the sandbox policy. An empty result
/// means the program may execute.
pub fn check_policy(program: &Program) -> Vec<PolicyViolation> {
    let mut checker = Checker {
        violations: Vec::new(),
    };
    checker.check_suite(&program.body);
    checker.violations
}

struct Checker {
    violations: Vec<PolicyViolation>,
}

impl Checker {
    fn reject(&mut self, line: u32, message: impl Into<String>) {
        self.violations.push(PolicyViolation {
            line,
            message: message.into(),
        });
    }

    fn check_name(&mut self, name: &str, line: u32) {
        if BANNED_NAMES.contains(&name) {
            self.reject(line, format!("use of banned identifier `{name}`"));
        }
        if name.starts_with("__") {
            self.reject(line, format!("use of dunder identifier `{name}`"));
        }
    }

    fn check_params(&mut self, params: &[Param], line: u32) {
        for param in params {
            self.check_name(&param.name, line);
            if let Some(default) = &param.default {
                self.check_expr(default);
            }
        }
    }

    fn check_suite(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.check_stmt(stmt);
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        let line = stmt.loc.line;
        match &stmt.kind {
            StmtKind::Import { module } | StmtKind::FromImport { module } => {
                self.reject(line, format!("import of `{module}` is not allowed"));
            }
            StmtKind::Global { .. } => {
                self.reject(line, "`global` is not allowed");
            }
            StmtKind::Nonlocal { .. } => {
                self.reject(line, "`nonlocal` is not allowed");
            }
            StmtKind::Expr(expr) => self.check_expr(expr),
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    self.check_expr(target);
                }
                self.check_expr(value);
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.check_expr(target);
                self.check_expr(value);
            }
            StmtKind::Del { targets } => {
                for target in targets {
                    self.check_expr(target);
                }
            }
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Return { value } => {
                if let Some(value) = value {
                    self.check_expr(value);
                }
            }
            StmtKind::If { branches, orelse } => {
                for (test, suite) in branches {
                    self.check_expr(test);
                    self.check_suite(suite);
                }
                self.check_suite(orelse);
            }
            StmtKind::While { test, body } => {
                self.check_expr(test);
                self.check_suite(body);
            }
            StmtKind::For { target, iter, body } => {
                self.check_expr(target);
                self.check_expr(iter);
                self.check_suite(body);
            }
            StmtKind::FuncDef { name, params, body } => {
                self.check_name(name, line);
                self.check_params(params, line);
                self.check_suite(body);
            }
        }
    }

    fn check_expr(&mut self, expr: &Expr) {
        let line = expr.loc.line;
        match &expr.kind {
            ExprKind::Name(name) => self.check_name(name, line),
            ExprKind::Attribute { value, attr } => {
                if attr.starts_with("__") {
                    self.reject(line, format!("access to dunder attribute `{attr}`"));
                }
                self.check_expr(value);
            }
            ExprKind::None
            | ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_) => {}
            ExprKind::FString(parts) => {
                for part in parts {
                    if let FStringPart::Expr(expr) = part {
                        self.check_expr(expr);
                    }
                }
            }
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.check_expr(item);
                }
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.check_expr(key);
                    self.check_expr(value);
                }
            }
            ExprKind::Unary { operand, .. } => self.check_expr(operand),
            ExprKind::Binary { left, right, .. } => {
                self.check_expr(left);
                self.check_expr(right);
            }
            ExprKind::BoolChain { values, .. } => {
                for value in values {
                    self.check_expr(value);
                }
            }
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.check_expr(left);
                for comparator in comparators {
                    self.check_expr(comparator);
                }
            }
            ExprKind::Call { func, args, kwargs } => {
                self.check_expr(func);
                for arg in args {
                    self.check_expr(arg);
                }
                for (_, value) in kwargs {
                    self.check_expr(value);
                }
            }
            ExprKind::Subscript { value, index } => {
                self.check_expr(value);
                match &**index {
                    Index::Item(item) => self.check_expr(item),
                    Index::Slice { lower, upper, step } => {
                        for bound in [lower, upper, step].into_iter().flatten() {
                            self.check_expr(bound);
                        }
                    }
                }
            }
            ExprKind::Ternary { test, body, orelse } => {
                self.check_expr(test);
                self.check_expr(body);
                self.check_expr(orelse);
            }
            ExprKind::Lambda { params, body } => {
                self.check_params(params, line);
                self.check_expr(body);
            }
            ExprKind::ListComp {
                elt,
                target,
                iter,
                ifs,
            } => {
                self.check_expr(elt);
                self.check_expr(target);
                self.check_expr(iter);
                for cond in ifs {
                    self.check_expr(cond);
                }
            }
            ExprKind::DictComp {
                key,
                value,
                target,
                iter,
                ifs,
            } => {
                self.check_expr(key);
                self.check_expr(value);
                self.check_expr(target);
                self.check_expr(iter);
                for cond in ifs {
                    self.check_expr(cond);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::parser::parse_program;

    fn violations(source: &str) -> Vec<PolicyViolation> {
        check_policy(&parse_program(source).unwrap())
    }

    #[test]
    fn rejects_imports() {
        let found = violations("import os\n");
        assert_eq!(found.len(), 2, "import construct and banned name: {found:?}");
        assert!(found[0].message.contains("import"));
    }

    #[test]
    fn rejects_from_import() {
        assert!(!violations("from json import loads\n").is_empty());
    }

    #[test]
    fn rejects_scope_escapes() {
        assert!(!violations("def f():\n    global x\n    x = 1\n").is_empty());
        assert!(!violations("def f():\n    nonlocal x\n").is_empty());
    }

    #[test]
    fn rejects_dunder_attribute() {
        let found = violations("x = ().__class__\n");
        assert!(found.iter().any(|v| v.message.contains("__class__")));
    }

    #[test]
    fn rejects_banned_name_even_unused() {
        assert!(!violations("x = eval\n").is_empty());
        assert!(!violations("y = [open]\n").is_empty());
        assert!(!violations("subprocess\n").is_empty());
    }

    #[test]
    fn reports_line_numbers() {
        let found = violations("x = 1\ny = eval\n");
        assert_eq!(found[0].line, 2);
    }

    #[test]
    fn accepts_ordinary_step() {
        let source = "\
snippet = context[0][0:5]
hits = context[0].find('world', max_hits=3)
state['work'] = {'snippet': snippet, 'hits': hits}
tool.FINAL(snippet)
";
        assert!(violations(source).is_empty());
    }
}
