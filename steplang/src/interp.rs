//! Restricted tree-walking evaluator for validated step programs.
//!
//! The evaluator owns everything observable from model code: the builtin
//! allow-list, the injected `state`/`context`/`tool` globals, stdout capture
//! and the instruction budget. Document bytes are only reachable through the
//! [`CorpusHost`] trait, so every read is span-logged by the host.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value as Json;

use rlm_protocol::LlmRequest;
use rlm_protocol::SearchRequest;
use rlm_protocol::ToolRequests;

use crate::ast::BinOp;
use crate::ast::BoolOp;
use crate::ast::CmpOp;
use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::FStringPart;
use crate::ast::Index;
use crate::ast::Loc;
use crate::ast::Param;
use crate::ast::Program;
use crate::ast::Stmt;
use crate::ast::StmtKind;
use crate::ast::UnaryOp;
use crate::error::EvalError;
use crate::error::EvalErrorKind;
use crate::error::HostError;
use crate::value::Builtin;
use crate::value::FnBody;
use crate::value::Function;
use crate::value::Value;
use crate::value::json_to_value;
use crate::value::range_len;
use crate::value::repr;
use crate::value::stringify;
use crate::value::value_cmp;
use crate::value::value_eq;
use crate::value::value_to_json;

/// Longest string/list the repetition operator may produce.
const MAX_REPEAT_CHARS: usize = 8_000_000;
/// Largest range the evaluator will materialize for iteration.
const MAX_RANGE_ITER: i64 = 5_000_000;
const MAX_CALL_DEPTH: usize = 50;

/// Structural section span surfaced by `doc.sections()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSpan {
    pub title: String,
    pub start_char: usize,
    pub end_char: usize,
}

/// Host interface the corpus view implements for the evaluator.
///
/// All range arguments are char offsets already clamped by the caller's
/// semantics; implementations log a span for every slice they return.
pub trait CorpusHost {
    fn doc_count(&self) -> usize;
    fn doc_len(&self, doc_index: usize) -> usize;
    fn read_slice(
        &self,
        doc_index: usize,
        start: usize,
        end: usize,
        tag: Option<&str>,
    ) -> Result<String, HostError>;
    fn find(
        &self,
        doc_index: usize,
        needle: &str,
        start: usize,
        end: usize,
        max_hits: usize,
        tag: Option<&str>,
    ) -> Result<Vec<(usize, usize)>, HostError>;
    fn regex(
        &self,
        doc_index: usize,
        pattern: &str,
        start: usize,
        end: usize,
        max_hits: usize,
        tag: Option<&str>,
    ) -> Result<Vec<(usize, usize)>, HostError>;
    fn sections(&self, doc_index: usize) -> Result<Vec<SectionSpan>, HostError>;
    fn page_spans(&self, doc_index: usize) -> Result<Vec<(usize, usize)>, HostError>;
}

/// Per-step execution limits enforced by the evaluator itself.
#[derive(Debug, Clone, Copy)]
pub struct StepLimits {
    pub max_instructions: u64,
    pub max_stdout_chars: usize,
    pub max_tool_requests: usize,
}

impl Default for StepLimits {
    fn default() -> Self {
        Self {
            max_instructions: 200_000,
            max_stdout_chars: 16_384,
            max_tool_requests: 16,
        }
    }
}

/// Cooperative step terminator raised by `tool.YIELD` / `tool.FINAL`.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Yield { reason: Option<String> },
    Final { answer: Json },
}

/// Everything one evaluation produced.
#[derive(Debug)]
pub struct StepOutcome {
    /// The `state` global after execution, converted back to JSON.
    pub state: Json,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub tool_requests: ToolRequests,
    pub terminator: Option<Terminator>,
    /// Uncaught error, if any. State and stdout are still best-effort valid.
    pub error: Option<EvalError>,
    pub instructions: u64,
}

/// Execute a policy-validated program against the given state and corpus.
pub fn run_step(
    program: &Program,
    state: Json,
    host: &dyn CorpusHost,
    limits: &StepLimits,
) -> StepOutcome {
    let mut interp = Interp::new(host, limits);
    interp
        .globals
        .insert("state".to_string(), json_to_value(&state));
    interp.globals.insert("context".to_string(), Value::Corpus);
    interp.globals.insert("tool".to_string(), Value::Tool);
    for builtin in Builtin::all() {
        interp
            .globals
            .insert(builtin.name().to_string(), Value::Builtin(*builtin));
    }

    let mut terminator = None;
    let mut error = None;
    match interp.exec_suite(&program.body) {
        Ok(_) => {}
        Err(Interrupt::Terminate(t)) => terminator = Some(t),
        Err(Interrupt::Error(e)) => error = Some(e),
    }

    let state_out = match interp.globals.get("state") {
        Some(value) => match value_to_json(value) {
            Ok(json) => json,
            Err(type_name) => {
                if error.is_none() {
                    error = Some(EvalError::new(
                        EvalErrorKind::Type,
                        0,
                        format!("state is not JSON-serializable: contains {type_name}"),
                    ));
                }
                state
            }
        },
        None => state,
    };

    StepOutcome {
        state: state_out,
        stdout: interp.stdout,
        stdout_truncated: interp.stdout_truncated,
        tool_requests: interp.tool_requests,
        terminator,
        error,
        instructions: interp.instructions,
    }
}

enum Interrupt {
    Error(EvalError),
    Terminate(Terminator),
}

impl From<EvalError> for Interrupt {
    fn from(e: EvalError) -> Self {
        Interrupt::Error(e)
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

type EResult<T> = Result<T, Interrupt>;

struct Interp<'a> {
    host: &'a dyn CorpusHost,
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
    stdout: String,
    stdout_truncated: bool,
    instructions: u64,
    limits: StepLimits,
    tool_requests: ToolRequests,
}

impl<'a> Interp<'a> {
    fn new(host: &'a dyn CorpusHost, limits: &StepLimits) -> Self {
        Self {
            host,
            globals: HashMap::new(),
            frames: Vec::new(),
            stdout: String::new(),
            stdout_truncated: false,
            instructions: 0,
            limits: *limits,
            tool_requests: ToolRequests::default(),
        }
    }

    fn err(&self, kind: EvalErrorKind, loc: Loc, message: impl Into<String>) -> Interrupt {
        Interrupt::Error(EvalError::new(kind, loc.line, message))
    }

    fn tick(&mut self, loc: Loc) -> EResult<()> {
        self.instructions += 1;
        if self.instructions > self.limits.max_instructions {
            return Err(self.err(
                EvalErrorKind::InstructionLimit,
                loc,
                format!("step exceeded {} instructions", self.limits.max_instructions),
            ));
        }
        Ok(())
    }

    fn write_stdout(&mut self, text: &str) {
        if self.stdout_truncated {
            return;
        }
        let remaining = self.limits.max_stdout_chars.saturating_sub(
            self.stdout.chars().count(),
        );
        if text.chars().count() <= remaining {
            self.stdout.push_str(text);
        } else {
            self.stdout.extend(text.chars().take(remaining));
            self.stdout_truncated = true;
        }
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    fn lookup(&self, name: &str, loc: Loc) -> EResult<Value> {
        if let Some(frame) = self.frames.last() {
            if let Some(value) = frame.get(name) {
                return Ok(value.clone());
            }
        }
        match self.globals.get(name) {
            Some(value) => Ok(value.clone()),
            None => Err(self.err(
                EvalErrorKind::Name,
                loc,
                format!("name `{name}` is not defined"),
            )),
        }
    }

    fn bind(&mut self, name: &str, value: Value) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn unbind(&mut self, name: &str, loc: Loc) -> EResult<()> {
        let removed = match self.frames.last_mut() {
            Some(frame) => frame.remove(name).is_some(),
            None => self.globals.remove(name).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(self.err(
                EvalErrorKind::Name,
                loc,
                format!("name `{name}` is not defined"),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn exec_suite(&mut self, body: &[Stmt]) -> EResult<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> EResult<Flow> {
        let loc = stmt.loc;
        self.tick(loc)?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign { target, op, value } => {
                let rhs = self.eval(value)?;
                let current = self.eval(target)?;
                let next = self.binary(*op, current, rhs, loc)?;
                self.assign(target, next)?;
                Ok(Flow::Normal)
            }
            StmtKind::Del { targets } => {
                for target in targets {
                    self.delete(target)?;
                }
                Ok(Flow::Normal)
            }
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Return { value } => {
                if self.frames.is_empty() {
                    return Err(self.err(
                        EvalErrorKind::Value,
                        loc,
                        "`return` outside of a function",
                    ));
                }
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::If { branches, orelse } => {
                for (test, suite) in branches {
                    if self.eval(test)?.truthy() {
                        return self.exec_suite(suite);
                    }
                }
                self.exec_suite(orelse)
            }
            StmtKind::While { test, body } => {
                while self.eval(test)?.truthy() {
                    self.tick(loc)?;
                    match self.exec_suite(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::For { target, iter, body } => {
                let items = {
                    let iterable = self.eval(iter)?;
                    self.iterate(&iterable, loc)?
                };
                for item in items {
                    self.tick(loc)?;
                    self.assign(target, item)?;
                    match self.exec_suite(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::FuncDef { name, params, body } => {
                let params = self.eval_params(params)?;
                let function = Function {
                    name: Some(name.clone()),
                    params,
                    body: FnBody::Suite(Rc::clone(body)),
                };
                self.bind(name, Value::Function(Rc::new(function)));
                Ok(Flow::Normal)
            }
            // The policy rejects these before execution; reaching one means
            // the caller skipped the gate.
            StmtKind::Import { module } | StmtKind::FromImport { module } => Err(self.err(
                EvalErrorKind::Value,
                loc,
                format!("import of `{module}` is not allowed"),
            )),
            StmtKind::Global { .. } | StmtKind::Nonlocal { .. } => Err(self.err(
                EvalErrorKind::Value,
                loc,
                "scope escape statements are not allowed",
            )),
        }
    }

    fn eval_params(&mut self, params: &[Param]) -> EResult<Vec<(String, Option<Value>)>> {
        let mut out = Vec::with_capacity(params.len());
        for param in params {
            let default = match &param.default {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            };
            out.push((param.name.clone(), default));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Assignment targets
    // ------------------------------------------------------------------

    fn assign(&mut self, target: &Expr, value: Value) -> EResult<()> {
        let loc = target.loc;
        match &target.kind {
            ExprKind::Name(name) => {
                self.bind(name, value);
                Ok(())
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                let values = self.iterate(&value, loc)?;
                if values.len() != items.len() {
                    return Err(self.err(
                        EvalErrorKind::Value,
                        loc,
                        format!(
                            "cannot unpack {} values into {} targets",
                            values.len(),
                            items.len()
                        ),
                    ));
                }
                for (item, v) in items.iter().zip(values) {
                    self.assign(item, v)?;
                }
                Ok(())
            }
            ExprKind::Subscript { value: obj, index } => {
                let container = self.eval(obj)?;
                let index = match &**index {
                    Index::Item(expr) => self.eval(expr)?,
                    Index::Slice { .. } => {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            "slice assignment is not supported",
                        ));
                    }
                };
                self.set_item(&container, index, value, loc)
            }
            _ => Err(self.err(EvalErrorKind::Type, loc, "invalid assignment target")),
        }
    }

    fn set_item(&mut self, container: &Value, index: Value, value: Value, loc: Loc) -> EResult<()> {
        match container {
            Value::List(items) => {
                let idx = index.as_int().ok_or_else(|| {
                    self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("list index must be int, not {}", index.type_name()),
                    )
                })?;
                let mut items = items.borrow_mut();
                let len = items.len() as i64;
                let resolved = if idx < 0 { idx + len } else { idx };
                if resolved < 0 || resolved >= len {
                    return Err(self.err(EvalErrorKind::Index, loc, "list index out of range"));
                }
                items[resolved as usize] = value;
                Ok(())
            }
            Value::Dict(map) => {
                let key = match index {
                    Value::Str(s) => s.to_string(),
                    other => {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("dict keys must be str, not {}", other.type_name()),
                        ));
                    }
                };
                map.borrow_mut().insert(key, value);
                Ok(())
            }
            other => Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("{} does not support item assignment", other.type_name()),
            )),
        }
    }

    fn delete(&mut self, target: &Expr) -> EResult<()> {
        let loc = target.loc;
        match &target.kind {
            ExprKind::Name(name) => self.unbind(name, loc),
            ExprKind::Subscript { value: obj, index } => {
                let container = self.eval(obj)?;
                let index = match &**index {
                    Index::Item(expr) => self.eval(expr)?,
                    Index::Slice { .. } => {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            "slice deletion is not supported",
                        ));
                    }
                };
                match (&container, &index) {
                    (Value::Dict(map), Value::Str(key)) => {
                        if map.borrow_mut().remove(&**key).is_none() {
                            return Err(self.err(
                                EvalErrorKind::Key,
                                loc,
                                format!("key {} not found", repr(&index)),
                            ));
                        }
                        Ok(())
                    }
                    (Value::List(items), _) => {
                        let idx = index.as_int().ok_or_else(|| {
                            self.err(EvalErrorKind::Type, loc, "list index must be int")
                        })?;
                        let mut items = items.borrow_mut();
                        let len = items.len() as i64;
                        let resolved = if idx < 0 { idx + len } else { idx };
                        if resolved < 0 || resolved >= len {
                            return Err(self.err(
                                EvalErrorKind::Index,
                                loc,
                                "list index out of range",
                            ));
                        }
                        items.remove(resolved as usize);
                        Ok(())
                    }
                    _ => Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("cannot delete from {}", container.type_name()),
                    )),
                }
            }
            _ => Err(self.err(EvalErrorKind::Type, loc, "invalid del target")),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval(&mut self, expr: &Expr) -> EResult<Value> {
        let loc = expr.loc;
        self.tick(loc)?;
        match &expr.kind {
            ExprKind::None => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(n) => Ok(Value::Int(*n)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::str(s.clone())),
            ExprKind::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Lit(s) => out.push_str(s),
                        FStringPart::Expr(expr) => {
                            let value = self.eval(expr)?;
                            out.push_str(&stringify(&value));
                        }
                    }
                }
                Ok(Value::str(out))
            }
            ExprKind::Name(name) => self.lookup(name, loc),
            ExprKind::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::list(out))
            }
            ExprKind::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Tuple(Rc::new(out)))
            }
            ExprKind::Dict(pairs) => {
                let mut out = BTreeMap::new();
                for (key, value) in pairs {
                    let key = match self.eval(key)? {
                        Value::Str(s) => s.to_string(),
                        other => {
                            return Err(self.err(
                                EvalErrorKind::Type,
                                loc,
                                format!("dict keys must be str, not {}", other.type_name()),
                            ));
                        }
                    };
                    out.insert(key, self.eval(value)?);
                }
                Ok(Value::dict(out))
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(n) => n
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| self.err(EvalErrorKind::Value, loc, "integer overflow")),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                        other => Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("bad operand for unary -: {}", other.type_name()),
                        )),
                    },
                    UnaryOp::Pos => match value {
                        v @ (Value::Int(_) | Value::Float(_)) => Ok(v),
                        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                        other => Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("bad operand for unary +: {}", other.type_name()),
                        )),
                    },
                }
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right, loc)
            }
            ExprKind::BoolChain { op, values } => {
                let mut last = Value::None;
                for (i, value) in values.iter().enumerate() {
                    last = self.eval(value)?;
                    let truthy = last.truthy();
                    let short = match op {
                        BoolOp::And => !truthy,
                        BoolOp::Or => truthy,
                    };
                    if short && i + 1 < values.len() {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => {
                let mut prev = self.eval(left)?;
                for (op, comparator) in ops.iter().zip(comparators.iter()) {
                    let next = self.eval(comparator)?;
                    if !self.compare(*op, &prev, &next, loc)? {
                        return Ok(Value::Bool(false));
                    }
                    prev = next;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Call { func, args, kwargs } => {
                let callee = self.eval(func)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg)?);
                }
                let mut kwarg_values = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    kwarg_values.push((name.clone(), self.eval(value)?));
                }
                self.call(callee, arg_values, kwarg_values, loc)
            }
            ExprKind::Attribute { value, attr } => {
                let recv = self.eval(value)?;
                self.attribute(recv, attr, loc)
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(value)?;
                self.subscript(container, index, loc)
            }
            ExprKind::Ternary { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            ExprKind::Lambda { params, body } => {
                let params = self.eval_params(params)?;
                Ok(Value::Function(Rc::new(Function {
                    name: None,
                    params,
                    body: FnBody::Expr(Rc::new((**body).clone())),
                })))
            }
            ExprKind::ListComp {
                elt,
                target,
                iter,
                ifs,
            } => {
                let items = {
                    let iterable = self.eval(iter)?;
                    self.iterate(&iterable, loc)?
                };
                let mut out = Vec::new();
                'outer: for item in items {
                    self.tick(loc)?;
                    self.assign(target, item)?;
                    for cond in ifs {
                        if !self.eval(cond)?.truthy() {
                            continue 'outer;
                        }
                    }
                    out.push(self.eval(elt)?);
                }
                Ok(Value::list(out))
            }
            ExprKind::DictComp {
                key,
                value,
                target,
                iter,
                ifs,
            } => {
                let items = {
                    let iterable = self.eval(iter)?;
                    self.iterate(&iterable, loc)?
                };
                let mut out = BTreeMap::new();
                'outer: for item in items {
                    self.tick(loc)?;
                    self.assign(target, item)?;
                    for cond in ifs {
                        if !self.eval(cond)?.truthy() {
                            continue 'outer;
                        }
                    }
                    let k = match self.eval(key)? {
                        Value::Str(s) => s.to_string(),
                        other => {
                            return Err(self.err(
                                EvalErrorKind::Type,
                                loc,
                                format!("dict keys must be str, not {}", other.type_name()),
                            ));
                        }
                    };
                    out.insert(k, self.eval(value)?);
                }
                Ok(Value::dict(out))
            }
        }
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn binary(&mut self, op: BinOp, left: Value, right: Value, loc: Loc) -> EResult<Value> {
        // String and sequence forms first; everything else is numeric.
        match (&op, &left, &right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                let mut out = String::with_capacity(a.len() + b.len());
                out.push_str(a);
                out.push_str(b);
                return Ok(Value::str(out));
            }
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                let mut out = a.borrow().clone();
                out.extend(b.borrow().iter().cloned());
                return Ok(Value::list(out));
            }
            (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
                let mut out = (**a).clone();
                out.extend((**b).iter().cloned());
                return Ok(Value::Tuple(Rc::new(out)));
            }
            (BinOp::Mul, Value::Str(s), _) | (BinOp::Mul, _, Value::Str(s)) => {
                let count = match (left.as_int(), right.as_int()) {
                    (Some(n), None) | (None, Some(n)) => n,
                    _ => {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            "can't multiply str by non-int",
                        ));
                    }
                };
                let count = count.max(0) as usize;
                if s.len().saturating_mul(count) > MAX_REPEAT_CHARS {
                    return Err(self.err(
                        EvalErrorKind::Value,
                        loc,
                        "string repetition result too large",
                    ));
                }
                return Ok(Value::str(s.repeat(count)));
            }
            (BinOp::Mul, Value::List(items), _) | (BinOp::Mul, _, Value::List(items)) => {
                let count = match (left.as_int(), right.as_int()) {
                    (Some(n), None) | (None, Some(n)) => n,
                    _ => {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            "can't multiply list by non-int",
                        ));
                    }
                };
                let count = count.max(0) as usize;
                let items = items.borrow();
                if items.len().saturating_mul(count) > MAX_REPEAT_CHARS {
                    return Err(self.err(
                        EvalErrorKind::Value,
                        loc,
                        "list repetition result too large",
                    ));
                }
                let mut out = Vec::with_capacity(items.len() * count);
                for _ in 0..count {
                    out.extend(items.iter().cloned());
                }
                return Ok(Value::list(out));
            }
            _ => {}
        }

        if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
            return self.int_binary(op, a, b, loc);
        }
        let (Some(a), Some(b)) = (left.as_float(), right.as_float()) else {
            return Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!(
                    "unsupported operand types for {}: {} and {}",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                ),
            ));
        };
        let out = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if b == 0.0 {
                    return Err(self.err(EvalErrorKind::ZeroDivision, loc, "division by zero"));
                }
                a / b
            }
            BinOp::FloorDiv => {
                if b == 0.0 {
                    return Err(self.err(EvalErrorKind::ZeroDivision, loc, "division by zero"));
                }
                (a / b).floor()
            }
            BinOp::Mod => {
                if b == 0.0 {
                    return Err(self.err(EvalErrorKind::ZeroDivision, loc, "division by zero"));
                }
                a - b * (a / b).floor()
            }
            BinOp::Pow => a.powf(b),
        };
        Ok(Value::Float(out))
    }

    fn int_binary(&mut self, op: BinOp, a: i64, b: i64, loc: Loc) -> EResult<Value> {
        let overflow = |interp: &Self| interp.err(EvalErrorKind::Value, loc, "integer overflow");
        match op {
            BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(|| overflow(self)),
            BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(|| overflow(self)),
            BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(|| overflow(self)),
            BinOp::Div => {
                if b == 0 {
                    return Err(self.err(EvalErrorKind::ZeroDivision, loc, "division by zero"));
                }
                Ok(Value::Float(a as f64 / b as f64))
            }
            BinOp::FloorDiv => {
                if b == 0 {
                    return Err(self.err(EvalErrorKind::ZeroDivision, loc, "division by zero"));
                }
                Ok(Value::Int(a.div_euclid(b)))
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(self.err(EvalErrorKind::ZeroDivision, loc, "division by zero"));
                }
                Ok(Value::Int(a.rem_euclid(b)))
            }
            BinOp::Pow => {
                if b < 0 {
                    return Ok(Value::Float((a as f64).powf(b as f64)));
                }
                let exp = u32::try_from(b).map_err(|_| overflow(self))?;
                a.checked_pow(exp).map(Value::Int).ok_or_else(|| overflow(self))
            }
        }
    }

    fn compare(&mut self, op: CmpOp, left: &Value, right: &Value, loc: Loc) -> EResult<bool> {
        let ordering = |interp: &Self, l: &Value, r: &Value| -> EResult<Ordering> {
            value_cmp(l, r).ok_or_else(|| {
                interp.err(
                    EvalErrorKind::Type,
                    loc,
                    format!(
                        "cannot compare {} and {}",
                        l.type_name(),
                        r.type_name()
                    ),
                )
            })
        };
        let result = match op {
            CmpOp::Eq => value_eq(left, right),
            CmpOp::NotEq => !value_eq(left, right),
            CmpOp::Lt => ordering(self, left, right)? == Ordering::Less,
            CmpOp::Le => ordering(self, left, right)? != Ordering::Greater,
            CmpOp::Gt => ordering(self, left, right)? == Ordering::Greater,
            CmpOp::Ge => ordering(self, left, right)? != Ordering::Less,
            CmpOp::In => self.contains(right, left, loc)?,
            CmpOp::NotIn => !self.contains(right, left, loc)?,
            // No object identity in the subset; `is` only matters for None
            // checks, which equality covers.
            CmpOp::Is => value_eq(left, right),
            CmpOp::IsNot => !value_eq(left, right),
        };
        Ok(result)
    }

    fn contains(&mut self, container: &Value, item: &Value, loc: Loc) -> EResult<bool> {
        match container {
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(&**needle)),
                other => Err(self.err(
                    EvalErrorKind::Type,
                    loc,
                    format!("'in <str>' requires str, not {}", other.type_name()),
                )),
            },
            Value::List(items) => Ok(items.borrow().iter().any(|v| value_eq(v, item))),
            Value::Tuple(items) => Ok(items.iter().any(|v| value_eq(v, item))),
            Value::Dict(map) => match item {
                Value::Str(key) => Ok(map.borrow().contains_key(&**key)),
                _ => Ok(false),
            },
            Value::Range { start, stop, step } => match item.as_int() {
                Some(n) => {
                    if *step > 0 {
                        Ok(n >= *start && n < *stop && (n - start).rem_euclid(*step) == 0)
                    } else if *step < 0 {
                        Ok(n <= *start && n > *stop && (start - n).rem_euclid(-step) == 0)
                    } else {
                        Ok(false)
                    }
                }
                None => Ok(false),
            },
            other => Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("{} is not a container", other.type_name()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    fn iterate(&mut self, value: &Value, loc: Loc) -> EResult<Vec<Value>> {
        match value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok((**items).clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::Dict(map) => Ok(map.borrow().keys().map(|k| Value::str(k.clone())).collect()),
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                if len > MAX_RANGE_ITER {
                    return Err(self.err(
                        EvalErrorKind::Value,
                        loc,
                        "range too large to iterate",
                    ));
                }
                let mut out = Vec::with_capacity(len as usize);
                let mut current = *start;
                for _ in 0..len {
                    out.push(Value::Int(current));
                    current += step;
                }
                Ok(out)
            }
            Value::Corpus => Ok((0..self.host.doc_count()).map(Value::Doc).collect()),
            other => Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("{} is not iterable", other.type_name()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Attribute access and subscripts
    // ------------------------------------------------------------------

    fn attribute(&mut self, recv: Value, attr: &str, loc: Loc) -> EResult<Value> {
        let known: &[&str] = match &recv {
            Value::Str(_) => &[
                "lower",
                "upper",
                "strip",
                "lstrip",
                "rstrip",
                "split",
                "splitlines",
                "join",
                "startswith",
                "endswith",
                "find",
                "replace",
                "count",
                "isdigit",
                "isalpha",
            ],
            Value::List(_) => &[
                "append", "extend", "insert", "pop", "remove", "index", "count", "sort", "reverse",
            ],
            Value::Dict(_) => &["get", "keys", "values", "items", "pop", "update", "setdefault"],
            Value::Doc(_) => &["slice", "find", "regex", "sections", "page_spans"],
            Value::Tool => &["queue_llm", "queue_search", "YIELD", "FINAL"],
            other => {
                return Err(self.err(
                    EvalErrorKind::Attribute,
                    loc,
                    format!("{} has no attribute `{attr}`", other.type_name()),
                ));
            }
        };
        if !known.contains(&attr) {
            return Err(self.err(
                EvalErrorKind::Attribute,
                loc,
                format!("{} has no attribute `{attr}`", recv.type_name()),
            ));
        }
        Ok(Value::BoundMethod {
            recv: Box::new(recv),
            name: Rc::from(attr),
        })
    }

    fn subscript(&mut self, container: Value, index: &Index, loc: Loc) -> EResult<Value> {
        match index {
            Index::Item(expr) => {
                let key = self.eval(expr)?;
                self.get_item(&container, &key, loc)
            }
            Index::Slice { lower, upper, step } => {
                let lower = self.eval_slice_bound(lower)?;
                let upper = self.eval_slice_bound(upper)?;
                let step = self.eval_slice_bound(step)?;
                self.get_slice(&container, lower, upper, step, loc)
            }
        }
    }

    fn eval_slice_bound(&mut self, bound: &Option<Expr>) -> EResult<Option<i64>> {
        match bound {
            None => Ok(None),
            Some(expr) => {
                let loc = expr.loc;
                let value = self.eval(expr)?;
                match value {
                    Value::None => Ok(None),
                    other => other.as_int().map(Some).ok_or_else(|| {
                        self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("slice indices must be int, not {}", other.type_name()),
                        )
                    }),
                }
            }
        }
    }

    fn get_item(&mut self, container: &Value, key: &Value, loc: Loc) -> EResult<Value> {
        match container {
            Value::List(items) => {
                let items = items.borrow();
                let idx = self.resolve_index(key, items.len(), loc)?;
                Ok(items[idx].clone())
            }
            Value::Tuple(items) => {
                let idx = self.resolve_index(key, items.len(), loc)?;
                Ok(items[idx].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = self.resolve_index(key, chars.len(), loc)?;
                Ok(Value::str(chars[idx].to_string()))
            }
            Value::Dict(map) => match key {
                Value::Str(k) => map.borrow().get(&**k).cloned().ok_or_else(|| {
                    self.err(EvalErrorKind::Key, loc, format!("key {} not found", repr(key)))
                }),
                other => Err(self.err(
                    EvalErrorKind::Type,
                    loc,
                    format!("dict keys must be str, not {}", other.type_name()),
                )),
            },
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step) as usize;
                let idx = self.resolve_index(key, len, loc)?;
                Ok(Value::Int(start + (idx as i64) * step))
            }
            Value::Corpus => {
                let count = self.host.doc_count();
                let idx = self.resolve_index(key, count, loc)?;
                Ok(Value::Doc(idx))
            }
            Value::Doc(doc_index) => {
                // doc[i] reads the single char at i.
                let len = self.host.doc_len(*doc_index);
                let idx = self.resolve_index(key, len, loc)?;
                let text = self
                    .host
                    .read_slice(*doc_index, idx, idx + 1, None)
                    .map_err(|e| self.host_err(e, loc))?;
                Ok(Value::str(text))
            }
            other => Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("{} is not subscriptable", other.type_name()),
            )),
        }
    }

    fn resolve_index(&self, key: &Value, len: usize, loc: Loc) -> EResult<usize> {
        let idx = key.as_int().ok_or_else(|| {
            self.err(
                EvalErrorKind::Type,
                loc,
                format!("indices must be int, not {}", key.type_name()),
            )
        })?;
        let len = len as i64;
        let resolved = if idx < 0 { idx + len } else { idx };
        if resolved < 0 || resolved >= len {
            return Err(self.err(EvalErrorKind::Index, loc, "index out of range"));
        }
        Ok(resolved as usize)
    }

    fn get_slice(
        &mut self,
        container: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
        loc: Loc,
    ) -> EResult<Value> {
        if let Value::Doc(doc_index) = container {
            if step.is_some() {
                return Err(self.err(
                    EvalErrorKind::Type,
                    loc,
                    "document slices do not support a step",
                ));
            }
            return self.doc_slice(*doc_index, lower, upper, None, loc);
        }

        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(self.err(EvalErrorKind::Value, loc, "slice step cannot be zero"));
        }
        match container {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let indices = slice_indices(chars.len(), lower, upper, step);
                Ok(Value::str(
                    indices.into_iter().map(|i| chars[i]).collect::<String>(),
                ))
            }
            Value::List(items) => {
                let items = items.borrow();
                let indices = slice_indices(items.len(), lower, upper, step);
                Ok(Value::list(
                    indices.into_iter().map(|i| items[i].clone()).collect(),
                ))
            }
            Value::Tuple(items) => {
                let indices = slice_indices(items.len(), lower, upper, step);
                Ok(Value::Tuple(Rc::new(
                    indices.into_iter().map(|i| items[i].clone()).collect(),
                )))
            }
            other => Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("{} is not sliceable", other.type_name()),
            )),
        }
    }

    /// Shared by `doc[a:b]` and `doc.slice(a, b, tag)`. Resolves negative
    /// bounds against the document length, clamps, and skips both the read
    /// and the span log for empty results.
    fn doc_slice(
        &mut self,
        doc_index: usize,
        lower: Option<i64>,
        upper: Option<i64>,
        tag: Option<&str>,
        loc: Loc,
    ) -> EResult<Value> {
        let len = self.host.doc_len(doc_index) as i64;
        let resolve = |bound: Option<i64>, default: i64| -> i64 {
            match bound {
                None => default,
                Some(b) if b < 0 => (b + len).clamp(0, len),
                Some(b) => b.clamp(0, len),
            }
        };
        let start = resolve(lower, 0);
        let end = resolve(upper, len);
        if start >= end {
            return Ok(Value::str(String::new()));
        }
        let text = self
            .host
            .read_slice(doc_index, start as usize, end as usize, tag)
            .map_err(|e| self.host_err(e, loc))?;
        Ok(Value::str(text))
    }

    fn host_err(&self, e: HostError, loc: Loc) -> Interrupt {
        Interrupt::Error(EvalError::new(
            EvalErrorKind::Host(e.kind),
            loc.line,
            e.message,
        ))
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        match callee {
            Value::Builtin(builtin) => self.call_builtin(builtin, args, kwargs, loc),
            Value::Function(function) => self.call_function(&function, args, kwargs, loc),
            Value::BoundMethod { recv, name } => self.call_method(*recv, &name, args, kwargs, loc),
            other => Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("{} is not callable", other.type_name()),
            )),
        }
    }

    fn call_function(
        &mut self,
        function: &Function,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.err(EvalErrorKind::Value, loc, "maximum call depth exceeded"));
        }
        let mut frame = HashMap::new();
        let mut positional = args.into_iter();
        for (name, default) in &function.params {
            if let Some(value) = positional.next() {
                frame.insert(name.clone(), value);
                continue;
            }
            if let Some((_, value)) = kwargs.iter().find(|(k, _)| k == name) {
                frame.insert(name.clone(), value.clone());
                continue;
            }
            match default {
                Some(value) => {
                    frame.insert(name.clone(), value.clone());
                }
                None => {
                    return Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("missing argument `{name}`"),
                    ));
                }
            }
        }
        if positional.next().is_some() {
            return Err(self.err(EvalErrorKind::Type, loc, "too many positional arguments"));
        }
        for (name, _) in &kwargs {
            if !function.params.iter().any(|(p, _)| p == name) {
                return Err(self.err(
                    EvalErrorKind::Type,
                    loc,
                    format!("unexpected keyword argument `{name}`"),
                ));
            }
        }

        self.frames.push(frame);
        let result = match &function.body {
            FnBody::Suite(body) => self.exec_suite(body).map(|flow| match flow {
                Flow::Return(value) => value,
                _ => Value::None,
            }),
            FnBody::Expr(expr) => self.eval(expr),
        };
        self.frames.pop();
        result
    }

    fn call1(&mut self, callable: &Value, arg: Value, loc: Loc) -> EResult<Value> {
        self.call(callable.clone(), vec![arg], Vec::new(), loc)
    }

    // ------------------------------------------------------------------
    // Builtins
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        let argc = args.len();
        let arity = |interp: &Self, ok: bool, expected: &str| -> EResult<()> {
            if ok {
                Ok(())
            } else {
                Err(interp.err(
                    EvalErrorKind::Type,
                    loc,
                    format!("{}() expects {expected}, got {argc}", builtin.name()),
                ))
            }
        };
        let no_kwargs = |interp: &Self| -> EResult<()> {
            if kwargs.is_empty() {
                Ok(())
            } else {
                Err(interp.err(
                    EvalErrorKind::Type,
                    loc,
                    format!("{}() takes no keyword arguments", builtin.name()),
                ))
            }
        };

        match builtin {
            Builtin::Len => {
                no_kwargs(self)?;
                arity(self, argc == 1, "1 argument")?;
                let len = match &args[0] {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.borrow().len(),
                    Value::Tuple(items) => items.len(),
                    Value::Dict(map) => map.borrow().len(),
                    Value::Range { start, stop, step } => range_len(*start, *stop, *step) as usize,
                    Value::Corpus => self.host.doc_count(),
                    Value::Doc(index) => self.host.doc_len(*index),
                    other => {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("{} has no len()", other.type_name()),
                        ));
                    }
                };
                Ok(Value::Int(len as i64))
            }
            Builtin::Range => {
                no_kwargs(self)?;
                arity(self, (1..=3).contains(&argc), "1 to 3 arguments")?;
                let ints: Vec<i64> = args
                    .iter()
                    .map(|a| {
                        a.as_int().ok_or_else(|| {
                            self.err(EvalErrorKind::Type, loc, "range() arguments must be int")
                        })
                    })
                    .collect::<EResult<_>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => unreachable!("arity checked"),
                };
                if step == 0 {
                    return Err(self.err(EvalErrorKind::Value, loc, "range() step cannot be zero"));
                }
                Ok(Value::Range { start, stop, step })
            }
            Builtin::Enumerate => {
                no_kwargs(self)?;
                arity(self, argc == 1 || argc == 2, "1 or 2 arguments")?;
                let start = match args.get(1) {
                    Some(v) => v.as_int().ok_or_else(|| {
                        self.err(EvalErrorKind::Type, loc, "enumerate() start must be int")
                    })?,
                    None => 0,
                };
                let items = self.iterate(&args[0], loc)?;
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| Value::Tuple(Rc::new(vec![Value::Int(start + i as i64), v])))
                        .collect(),
                ))
            }
            Builtin::Zip => {
                no_kwargs(self)?;
                let mut columns = Vec::with_capacity(argc);
                for arg in &args {
                    columns.push(self.iterate(arg, loc)?);
                }
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    out.push(Value::Tuple(Rc::new(
                        columns.iter().map(|c| c[i].clone()).collect(),
                    )));
                }
                Ok(Value::list(out))
            }
            Builtin::Map => {
                no_kwargs(self)?;
                arity(self, argc == 2, "2 arguments")?;
                let items = self.iterate(&args[1], loc)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    self.tick(loc)?;
                    out.push(self.call1(&args[0], item, loc)?);
                }
                Ok(Value::list(out))
            }
            Builtin::Filter => {
                no_kwargs(self)?;
                arity(self, argc == 2, "2 arguments")?;
                let items = self.iterate(&args[1], loc)?;
                let mut out = Vec::new();
                for item in items {
                    self.tick(loc)?;
                    let keep = match &args[0] {
                        Value::None => item.truthy(),
                        callable => self.call1(callable, item.clone(), loc)?.truthy(),
                    };
                    if keep {
                        out.push(item);
                    }
                }
                Ok(Value::list(out))
            }
            Builtin::Sorted => {
                arity(self, argc == 1, "1 positional argument")?;
                let mut key = None;
                let mut reverse = false;
                for (name, value) in &kwargs {
                    match name.as_str() {
                        "key" => key = Some(value.clone()),
                        "reverse" => reverse = value.truthy(),
                        other => {
                            return Err(self.err(
                                EvalErrorKind::Type,
                                loc,
                                format!("sorted() got unexpected keyword `{other}`"),
                            ));
                        }
                    }
                }
                let items = self.iterate(&args[0], loc)?;
                let sorted = self.sort_values(items, key.as_ref(), reverse, loc)?;
                Ok(Value::list(sorted))
            }
            Builtin::Reversed => {
                no_kwargs(self)?;
                arity(self, argc == 1, "1 argument")?;
                let mut items = self.iterate(&args[0], loc)?;
                items.reverse();
                Ok(Value::list(items))
            }
            Builtin::Min | Builtin::Max => {
                arity(self, argc >= 1, "at least 1 argument")?;
                let mut key = None;
                for (name, value) in &kwargs {
                    if name == "key" {
                        key = Some(value.clone());
                    } else {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("{}() got unexpected keyword `{name}`", builtin.name()),
                        ));
                    }
                }
                let items = if argc == 1 {
                    self.iterate(&args[0], loc)?
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(self.err(
                        EvalErrorKind::Value,
                        loc,
                        format!("{}() of empty sequence", builtin.name()),
                    ));
                }
                let want_greater = matches!(builtin, Builtin::Max);
                let mut best = items[0].clone();
                let mut best_key = match &key {
                    Some(k) => self.call1(k, best.clone(), loc)?,
                    None => best.clone(),
                };
                for item in items.into_iter().skip(1) {
                    self.tick(loc)?;
                    let item_key = match &key {
                        Some(k) => self.call1(k, item.clone(), loc)?,
                        None => item.clone(),
                    };
                    let ord = value_cmp(&item_key, &best_key).ok_or_else(|| {
                        self.err(EvalErrorKind::Type, loc, "incomparable values")
                    })?;
                    let better = if want_greater {
                        ord == Ordering::Greater
                    } else {
                        ord == Ordering::Less
                    };
                    if better {
                        best = item;
                        best_key = item_key;
                    }
                }
                Ok(best)
            }
            Builtin::Sum => {
                no_kwargs(self)?;
                arity(self, argc == 1 || argc == 2, "1 or 2 arguments")?;
                let items = self.iterate(&args[0], loc)?;
                let mut acc = args.get(1).cloned().unwrap_or(Value::Int(0));
                for item in items {
                    self.tick(loc)?;
                    acc = self.binary(BinOp::Add, acc, item, loc)?;
                }
                Ok(acc)
            }
            Builtin::Abs => {
                no_kwargs(self)?;
                arity(self, argc == 1, "1 argument")?;
                match &args[0] {
                    Value::Int(n) => n
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| self.err(EvalErrorKind::Value, loc, "integer overflow")),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    other => Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("abs() requires a number, got {}", other.type_name()),
                    )),
                }
            }
            Builtin::Round => {
                no_kwargs(self)?;
                arity(self, argc == 1 || argc == 2, "1 or 2 arguments")?;
                let digits = match args.get(1) {
                    Some(v) => v.as_int().ok_or_else(|| {
                        self.err(EvalErrorKind::Type, loc, "round() digits must be int")
                    })?,
                    None => 0,
                };
                let value = args[0].as_float().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "round() requires a number")
                })?;
                let factor = 10f64.powi(digits as i32);
                let rounded = (value * factor).round() / factor;
                if args.get(1).is_none() && matches!(args[0], Value::Int(_) | Value::Bool(_)) {
                    Ok(args[0].clone())
                } else if args.get(1).is_none() {
                    Ok(Value::Int(rounded as i64))
                } else {
                    Ok(Value::Float(rounded))
                }
            }
            Builtin::Str => {
                no_kwargs(self)?;
                arity(self, argc <= 1, "at most 1 argument")?;
                match args.into_iter().next() {
                    Some(value) => Ok(Value::str(stringify(&value))),
                    None => Ok(Value::str(String::new())),
                }
            }
            Builtin::Int => {
                no_kwargs(self)?;
                arity(self, argc <= 1, "at most 1 argument")?;
                match args.into_iter().next() {
                    None => Ok(Value::Int(0)),
                    Some(Value::Int(n)) => Ok(Value::Int(n)),
                    Some(Value::Bool(b)) => Ok(Value::Int(i64::from(b))),
                    Some(Value::Float(f)) => Ok(Value::Int(f.trunc() as i64)),
                    Some(Value::Str(s)) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        self.err(
                            EvalErrorKind::Value,
                            loc,
                            format!("invalid literal for int(): {}", s.trim()),
                        )
                    }),
                    Some(other) => Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("int() can't convert {}", other.type_name()),
                    )),
                }
            }
            Builtin::Float => {
                no_kwargs(self)?;
                arity(self, argc <= 1, "at most 1 argument")?;
                match args.into_iter().next() {
                    None => Ok(Value::Float(0.0)),
                    Some(Value::Float(f)) => Ok(Value::Float(f)),
                    Some(Value::Int(n)) => Ok(Value::Float(n as f64)),
                    Some(Value::Bool(b)) => Ok(Value::Float(f64::from(u8::from(b)))),
                    Some(Value::Str(s)) => {
                        s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                            self.err(
                                EvalErrorKind::Value,
                                loc,
                                format!("invalid literal for float(): {}", s.trim()),
                            )
                        })
                    }
                    Some(other) => Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("float() can't convert {}", other.type_name()),
                    )),
                }
            }
            Builtin::Bool => {
                no_kwargs(self)?;
                arity(self, argc <= 1, "at most 1 argument")?;
                Ok(Value::Bool(
                    args.first().map(Value::truthy).unwrap_or(false),
                ))
            }
            Builtin::List => {
                no_kwargs(self)?;
                arity(self, argc <= 1, "at most 1 argument")?;
                match args.first() {
                    None => Ok(Value::list(Vec::new())),
                    Some(value) => {
                        let items = self.iterate(value, loc)?;
                        Ok(Value::list(items))
                    }
                }
            }
            Builtin::Tuple => {
                no_kwargs(self)?;
                arity(self, argc <= 1, "at most 1 argument")?;
                match args.first() {
                    None => Ok(Value::Tuple(Rc::new(Vec::new()))),
                    Some(value) => {
                        let items = self.iterate(value, loc)?;
                        Ok(Value::Tuple(Rc::new(items)))
                    }
                }
            }
            Builtin::Dict => {
                no_kwargs(self)?;
                arity(self, argc <= 1, "at most 1 argument")?;
                match args.first() {
                    None => Ok(Value::dict(BTreeMap::new())),
                    Some(Value::Dict(map)) => Ok(Value::dict(map.borrow().clone())),
                    Some(value) => {
                        let pairs = self.iterate(value, loc)?;
                        let mut out = BTreeMap::new();
                        for pair in pairs {
                            let items = self.iterate(&pair, loc)?;
                            let [key, value] = items.as_slice() else {
                                return Err(self.err(
                                    EvalErrorKind::Value,
                                    loc,
                                    "dict() requires key/value pairs",
                                ));
                            };
                            let Value::Str(key) = key else {
                                return Err(self.err(
                                    EvalErrorKind::Type,
                                    loc,
                                    "dict keys must be str",
                                ));
                            };
                            out.insert(key.to_string(), value.clone());
                        }
                        Ok(Value::dict(out))
                    }
                }
            }
            Builtin::Isinstance => {
                no_kwargs(self)?;
                arity(self, argc == 2, "2 arguments")?;
                let matches_type = |value: &Value, ty: &Value| -> bool {
                    let Value::Builtin(b) = ty else { return false };
                    match b {
                        Builtin::Str => matches!(value, Value::Str(_)),
                        Builtin::Int => matches!(value, Value::Int(_) | Value::Bool(_)),
                        Builtin::Float => matches!(value, Value::Float(_)),
                        Builtin::Bool => matches!(value, Value::Bool(_)),
                        Builtin::List => matches!(value, Value::List(_)),
                        Builtin::Dict => matches!(value, Value::Dict(_)),
                        Builtin::Tuple => matches!(value, Value::Tuple(_)),
                        _ => false,
                    }
                };
                let result = match &args[1] {
                    Value::Tuple(types) => types.iter().any(|ty| matches_type(&args[0], ty)),
                    single => matches_type(&args[0], single),
                };
                Ok(Value::Bool(result))
            }
            Builtin::Print => {
                let mut sep = " ".to_string();
                let mut end = "\n".to_string();
                for (name, value) in &kwargs {
                    match name.as_str() {
                        "sep" => sep = stringify(value),
                        "end" => end = stringify(value),
                        other => {
                            return Err(self.err(
                                EvalErrorKind::Type,
                                loc,
                                format!("print() got unexpected keyword `{other}`"),
                            ));
                        }
                    }
                }
                let rendered: Vec<String> = args.iter().map(stringify).collect();
                let mut line = rendered.join(&sep);
                line.push_str(&end);
                self.write_stdout(&line);
                Ok(Value::None)
            }
        }
    }

    fn sort_values(
        &mut self,
        items: Vec<Value>,
        key: Option<&Value>,
        reverse: bool,
        loc: Loc,
    ) -> EResult<Vec<Value>> {
        let mut decorated = Vec::with_capacity(items.len());
        for item in items {
            self.tick(loc)?;
            let sort_key = match key {
                Some(k) => self.call1(k, item.clone(), loc)?,
                None => item.clone(),
            };
            decorated.push((sort_key, item));
        }
        let mut incomparable = false;
        decorated.sort_by(|a, b| match value_cmp(&a.0, &b.0) {
            Some(ordering) => ordering,
            None => {
                incomparable = true;
                Ordering::Equal
            }
        });
        if incomparable {
            return Err(self.err(EvalErrorKind::Type, loc, "incomparable sort keys"));
        }
        if reverse {
            decorated.reverse();
        }
        Ok(decorated.into_iter().map(|(_, item)| item).collect())
    }

    // ------------------------------------------------------------------
    // Methods
    // ------------------------------------------------------------------

    fn call_method(
        &mut self,
        recv: Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        match &recv {
            Value::Str(s) => self.str_method(s.clone(), name, args, kwargs, loc),
            Value::List(items) => self.list_method(items.clone(), name, args, kwargs, loc),
            Value::Dict(map) => self.dict_method(map.clone(), name, args, kwargs, loc),
            Value::Doc(index) => self.doc_method(*index, name, args, kwargs, loc),
            Value::Tool => self.tool_method(name, args, kwargs, loc),
            other => Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("{} has no methods", other.type_name()),
            )),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn str_method(
        &mut self,
        recv: Rc<str>,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        if !kwargs.is_empty() {
            return Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("str.{name}() takes no keyword arguments"),
            ));
        }
        let want_str = |interp: &Self, v: &Value| -> EResult<String> {
            match v {
                Value::Str(s) => Ok(s.to_string()),
                other => Err(interp.err(
                    EvalErrorKind::Type,
                    loc,
                    format!("expected str argument, got {}", other.type_name()),
                )),
            }
        };
        match name {
            "lower" => Ok(Value::str(recv.to_lowercase())),
            "upper" => Ok(Value::str(recv.to_uppercase())),
            "strip" | "lstrip" | "rstrip" => {
                let chars: Option<Vec<char>> = match args.first() {
                    None | Some(Value::None) => None,
                    Some(v) => Some(want_str(self, v)?.chars().collect()),
                };
                let pred = |c: char| match &chars {
                    None => c.is_whitespace(),
                    Some(set) => set.contains(&c),
                };
                let out = match name {
                    "strip" => recv.trim_matches(pred),
                    "lstrip" => recv.trim_start_matches(pred),
                    _ => recv.trim_end_matches(pred),
                };
                Ok(Value::str(out.to_string()))
            }
            "split" => {
                let parts: Vec<Value> = match args.first() {
                    None | Some(Value::None) => recv
                        .split_whitespace()
                        .map(|p| Value::str(p.to_string()))
                        .collect(),
                    Some(v) => {
                        let sep = want_str(self, v)?;
                        if sep.is_empty() {
                            return Err(self.err(
                                EvalErrorKind::Value,
                                loc,
                                "empty separator",
                            ));
                        }
                        recv.split(sep.as_str())
                            .map(|p| Value::str(p.to_string()))
                            .collect()
                    }
                };
                Ok(Value::list(parts))
            }
            "splitlines" => Ok(Value::list(
                recv.lines().map(|l| Value::str(l.to_string())).collect(),
            )),
            "join" => {
                let arg = args.first().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "join() expects 1 argument")
                })?;
                let items = self.iterate(arg, loc)?;
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Str(s) => parts.push(s.to_string()),
                        other => {
                            return Err(self.err(
                                EvalErrorKind::Type,
                                loc,
                                format!("join() requires str items, got {}", other.type_name()),
                            ));
                        }
                    }
                }
                Ok(Value::str(parts.join(&recv)))
            }
            "startswith" | "endswith" => {
                let arg = args.first().ok_or_else(|| {
                    self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("{name}() expects 1 argument"),
                    )
                })?;
                let prefix = want_str(self, arg)?;
                let result = if name == "startswith" {
                    recv.starts_with(&prefix)
                } else {
                    recv.ends_with(&prefix)
                };
                Ok(Value::Bool(result))
            }
            "find" => {
                let arg = args.first().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "find() expects 1 argument")
                })?;
                let needle = want_str(self, arg)?;
                let start_chars = match args.get(1) {
                    Some(v) => v.as_int().unwrap_or(0).max(0) as usize,
                    None => 0,
                };
                let skipped: String = recv.chars().skip(start_chars).collect();
                match skipped.find(&needle) {
                    Some(byte_pos) => {
                        let char_pos = skipped[..byte_pos].chars().count();
                        Ok(Value::Int((start_chars + char_pos) as i64))
                    }
                    None => Ok(Value::Int(-1)),
                }
            }
            "replace" => {
                let (Some(old), Some(new)) = (args.first(), args.get(1)) else {
                    return Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        "replace() expects 2 arguments",
                    ));
                };
                let old = want_str(self, old)?;
                let new = want_str(self, new)?;
                if old.is_empty() {
                    return Err(self.err(EvalErrorKind::Value, loc, "empty pattern"));
                }
                Ok(Value::str(recv.replace(&old, &new)))
            }
            "count" => {
                let arg = args.first().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "count() expects 1 argument")
                })?;
                let needle = want_str(self, arg)?;
                if needle.is_empty() {
                    return Ok(Value::Int(recv.chars().count() as i64 + 1));
                }
                Ok(Value::Int(recv.matches(&needle).count() as i64))
            }
            "isdigit" => Ok(Value::Bool(
                !recv.is_empty() && recv.chars().all(|c| c.is_ascii_digit()),
            )),
            "isalpha" => Ok(Value::Bool(
                !recv.is_empty() && recv.chars().all(char::is_alphabetic),
            )),
            other => Err(self.err(
                EvalErrorKind::Attribute,
                loc,
                format!("str has no method `{other}`"),
            )),
        }
    }

    fn list_method(
        &mut self,
        recv: Rc<RefCell<Vec<Value>>>,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        match name {
            "append" => {
                let value = args.into_iter().next().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "append() expects 1 argument")
                })?;
                recv.borrow_mut().push(value);
                Ok(Value::None)
            }
            "extend" => {
                let arg = args.first().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "extend() expects 1 argument")
                })?;
                let items = self.iterate(arg, loc)?;
                recv.borrow_mut().extend(items);
                Ok(Value::None)
            }
            "insert" => {
                let (Some(index), Some(value)) = (args.first(), args.get(1)) else {
                    return Err(self.err(EvalErrorKind::Type, loc, "insert() expects 2 arguments"));
                };
                let idx = index.as_int().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "insert() index must be int")
                })?;
                let mut items = recv.borrow_mut();
                let len = items.len() as i64;
                let resolved = if idx < 0 { (idx + len).max(0) } else { idx.min(len) };
                items.insert(resolved as usize, value.clone());
                Ok(Value::None)
            }
            "pop" => {
                let mut items = recv.borrow_mut();
                if items.is_empty() {
                    return Err(self.err(EvalErrorKind::Index, loc, "pop from empty list"));
                }
                let idx = match args.first() {
                    None => items.len() as i64 - 1,
                    Some(v) => v.as_int().ok_or_else(|| {
                        self.err(EvalErrorKind::Type, loc, "pop() index must be int")
                    })?,
                };
                let len = items.len() as i64;
                let resolved = if idx < 0 { idx + len } else { idx };
                if resolved < 0 || resolved >= len {
                    return Err(self.err(EvalErrorKind::Index, loc, "pop index out of range"));
                }
                Ok(items.remove(resolved as usize))
            }
            "remove" => {
                let target = args.first().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "remove() expects 1 argument")
                })?;
                let mut items = recv.borrow_mut();
                match items.iter().position(|v| value_eq(v, target)) {
                    Some(pos) => {
                        items.remove(pos);
                        Ok(Value::None)
                    }
                    None => Err(self.err(EvalErrorKind::Value, loc, "value not in list")),
                }
            }
            "index" => {
                let target = args.first().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "index() expects 1 argument")
                })?;
                let items = recv.borrow();
                match items.iter().position(|v| value_eq(v, target)) {
                    Some(pos) => Ok(Value::Int(pos as i64)),
                    None => Err(self.err(EvalErrorKind::Value, loc, "value not in list")),
                }
            }
            "count" => {
                let target = args.first().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "count() expects 1 argument")
                })?;
                let count = recv.borrow().iter().filter(|v| value_eq(v, target)).count();
                Ok(Value::Int(count as i64))
            }
            "sort" => {
                let mut key = None;
                let mut reverse = false;
                for (kw, value) in &kwargs {
                    match kw.as_str() {
                        "key" => key = Some(value.clone()),
                        "reverse" => reverse = value.truthy(),
                        other => {
                            return Err(self.err(
                                EvalErrorKind::Type,
                                loc,
                                format!("sort() got unexpected keyword `{other}`"),
                            ));
                        }
                    }
                }
                let items = recv.borrow().clone();
                let sorted = self.sort_values(items, key.as_ref(), reverse, loc)?;
                *recv.borrow_mut() = sorted;
                Ok(Value::None)
            }
            "reverse" => {
                recv.borrow_mut().reverse();
                Ok(Value::None)
            }
            other => Err(self.err(
                EvalErrorKind::Attribute,
                loc,
                format!("list has no method `{other}`"),
            )),
        }
    }

    fn dict_method(
        &mut self,
        recv: Rc<RefCell<BTreeMap<String, Value>>>,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        if !kwargs.is_empty() {
            return Err(self.err(
                EvalErrorKind::Type,
                loc,
                format!("dict.{name}() takes no keyword arguments"),
            ));
        }
        let want_key = |interp: &Self, v: Option<&Value>| -> EResult<String> {
            match v {
                Some(Value::Str(s)) => Ok(s.to_string()),
                Some(other) => Err(interp.err(
                    EvalErrorKind::Type,
                    loc,
                    format!("dict keys must be str, not {}", other.type_name()),
                )),
                None => Err(interp.err(EvalErrorKind::Type, loc, "missing key argument")),
            }
        };
        match name {
            "get" => {
                let key = want_key(self, args.first())?;
                let default = args.get(1).cloned().unwrap_or(Value::None);
                Ok(recv.borrow().get(&key).cloned().unwrap_or(default))
            }
            "keys" => Ok(Value::list(
                recv.borrow().keys().map(|k| Value::str(k.clone())).collect(),
            )),
            "values" => Ok(Value::list(recv.borrow().values().cloned().collect())),
            "items" => Ok(Value::list(
                recv.borrow()
                    .iter()
                    .map(|(k, v)| Value::Tuple(Rc::new(vec![Value::str(k.clone()), v.clone()])))
                    .collect(),
            )),
            "pop" => {
                let key = want_key(self, args.first())?;
                match recv.borrow_mut().remove(&key) {
                    Some(value) => Ok(value),
                    None => match args.get(1) {
                        Some(default) => Ok(default.clone()),
                        None => Err(self.err(
                            EvalErrorKind::Key,
                            loc,
                            format!("key '{key}' not found"),
                        )),
                    },
                }
            }
            "update" => {
                let arg = args.first().ok_or_else(|| {
                    self.err(EvalErrorKind::Type, loc, "update() expects 1 argument")
                })?;
                let Value::Dict(other) = arg else {
                    return Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("update() requires a dict, got {}", arg.type_name()),
                    ));
                };
                let other = other.borrow().clone();
                recv.borrow_mut().extend(other);
                Ok(Value::None)
            }
            "setdefault" => {
                let key = want_key(self, args.first())?;
                let default = args.get(1).cloned().unwrap_or(Value::None);
                let mut map = recv.borrow_mut();
                Ok(map.entry(key).or_insert(default).clone())
            }
            other => Err(self.err(
                EvalErrorKind::Attribute,
                loc,
                format!("dict has no method `{other}`"),
            )),
        }
    }

    fn doc_method(
        &mut self,
        doc_index: usize,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        let kwarg = |name: &str| -> Option<&Value> {
            kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
        };
        let opt_str = |interp: &Self, v: Option<&Value>| -> EResult<Option<String>> {
            match v {
                None | Some(Value::None) => Ok(None),
                Some(Value::Str(s)) => Ok(Some(s.to_string())),
                Some(other) => Err(interp.err(
                    EvalErrorKind::Type,
                    loc,
                    format!("tag must be str, got {}", other.type_name()),
                )),
            }
        };
        let opt_int = |interp: &Self, v: Option<&Value>| -> EResult<Option<i64>> {
            match v {
                None | Some(Value::None) => Ok(None),
                Some(other) => other.as_int().map(Some).ok_or_else(|| {
                    interp.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("expected int, got {}", other.type_name()),
                    )
                }),
            }
        };

        match name {
            "slice" => {
                let lower = opt_int(self, args.first())?;
                let upper = opt_int(self, args.get(1))?;
                let tag = opt_str(self, args.get(2).or_else(|| kwarg("tag")))?;
                self.doc_slice(doc_index, lower, upper, tag.as_deref(), loc)
            }
            "find" | "regex" => {
                let pattern = match args.first() {
                    Some(Value::Str(s)) => s.to_string(),
                    _ => {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("{name}() expects a str pattern"),
                        ));
                    }
                };
                let len = self.host.doc_len(doc_index);
                let start = opt_int(self, kwarg("start"))?
                    .unwrap_or(0)
                    .clamp(0, len as i64) as usize;
                let end = opt_int(self, kwarg("end"))?
                    .unwrap_or(len as i64)
                    .clamp(0, len as i64) as usize;
                let max_hits = opt_int(self, kwarg("max_hits"))?.unwrap_or(20).max(0) as usize;
                let tag = opt_str(self, kwarg("tag"))?;
                let hits = if name == "find" {
                    self.host
                        .find(doc_index, &pattern, start, end, max_hits, tag.as_deref())
                } else {
                    self.host
                        .regex(doc_index, &pattern, start, end, max_hits, tag.as_deref())
                }
                .map_err(|e| self.host_err(e, loc))?;
                Ok(Value::list(
                    hits.into_iter()
                        .map(|(a, b)| {
                            Value::Tuple(Rc::new(vec![
                                Value::Int(a as i64),
                                Value::Int(b as i64),
                            ]))
                        })
                        .collect(),
                ))
            }
            "sections" => {
                let sections = self
                    .host
                    .sections(doc_index)
                    .map_err(|e| self.host_err(e, loc))?;
                Ok(Value::list(
                    sections
                        .into_iter()
                        .map(|s| {
                            let mut map = BTreeMap::new();
                            map.insert("title".to_string(), Value::str(s.title));
                            map.insert("start".to_string(), Value::Int(s.start_char as i64));
                            map.insert("end".to_string(), Value::Int(s.end_char as i64));
                            Value::dict(map)
                        })
                        .collect(),
                ))
            }
            "page_spans" => {
                let pages = self
                    .host
                    .page_spans(doc_index)
                    .map_err(|e| self.host_err(e, loc))?;
                Ok(Value::list(
                    pages
                        .into_iter()
                        .map(|(a, b)| {
                            Value::Tuple(Rc::new(vec![
                                Value::Int(a as i64),
                                Value::Int(b as i64),
                            ]))
                        })
                        .collect(),
                ))
            }
            other => Err(self.err(
                EvalErrorKind::Attribute,
                loc,
                format!("doc has no method `{other}`"),
            )),
        }
    }

    fn tool_method(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        loc: Loc,
    ) -> EResult<Value> {
        let kwarg = |name: &str| -> Option<&Value> {
            kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
        };
        match name {
            "queue_llm" => {
                let (Some(Value::Str(key)), Some(Value::Str(prompt))) =
                    (args.first(), args.get(1))
                else {
                    return Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        "queue_llm(key, prompt, ...) requires str key and prompt",
                    ));
                };
                let model_hint = match args.get(2).or_else(|| kwarg("model_hint")) {
                    None | Some(Value::None) => None,
                    Some(Value::Str(s)) => Some(s.to_string()),
                    Some(other) => {
                        return Err(self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("model_hint must be str, got {}", other.type_name()),
                        ));
                    }
                };
                let max_tokens = match args.get(3).or_else(|| kwarg("max_tokens")) {
                    None | Some(Value::None) => None,
                    Some(v) => {
                        let n = v.as_int().ok_or_else(|| {
                            self.err(EvalErrorKind::Type, loc, "max_tokens must be int")
                        })?;
                        Some(n.max(0) as u32)
                    }
                };
                let temperature = match args.get(4).or_else(|| kwarg("temperature")) {
                    None | Some(Value::None) => None,
                    Some(v) => Some(v.as_float().ok_or_else(|| {
                        self.err(EvalErrorKind::Type, loc, "temperature must be a number")
                    })?),
                };
                let metadata = match args.get(5).or_else(|| kwarg("metadata")) {
                    None | Some(Value::None) => None,
                    Some(v) => Some(value_to_json(v).map_err(|type_name| {
                        self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("metadata is not JSON-serializable: contains {type_name}"),
                        )
                    })?),
                };
                let request = LlmRequest {
                    key: key.to_string(),
                    prompt: prompt.to_string(),
                    model_hint,
                    max_tokens,
                    temperature,
                    metadata,
                };
                self.queue_llm(request, loc)?;
                Ok(Value::None)
            }
            "queue_search" => {
                let (Some(Value::Str(key)), Some(Value::Str(query))) =
                    (args.first(), args.get(1))
                else {
                    return Err(self.err(
                        EvalErrorKind::Type,
                        loc,
                        "queue_search(key, query, ...) requires str key and query",
                    ));
                };
                let k = match args.get(2).or_else(|| kwarg("k")) {
                    None | Some(Value::None) => 8,
                    Some(v) => v
                        .as_int()
                        .ok_or_else(|| self.err(EvalErrorKind::Type, loc, "k must be int"))?
                        .max(1) as usize,
                };
                let filters = match args.get(3).or_else(|| kwarg("filters")) {
                    None | Some(Value::None) => None,
                    Some(v) => Some(value_to_json(v).map_err(|type_name| {
                        self.err(
                            EvalErrorKind::Type,
                            loc,
                            format!("filters is not JSON-serializable: contains {type_name}"),
                        )
                    })?),
                };
                let request = SearchRequest {
                    key: key.to_string(),
                    query: query.to_string(),
                    k,
                    filters,
                };
                self.queue_search(request, loc)?;
                Ok(Value::None)
            }
            "YIELD" => {
                let reason = match args.first() {
                    None | Some(Value::None) => None,
                    Some(value) => Some(stringify(value)),
                };
                Err(Interrupt::Terminate(Terminator::Yield { reason }))
            }
            "FINAL" => {
                let answer = args.first().cloned().unwrap_or(Value::None);
                let answer = value_to_json(&answer).map_err(|type_name| {
                    self.err(
                        EvalErrorKind::Type,
                        loc,
                        format!("FINAL answer is not JSON-serializable: contains {type_name}"),
                    )
                })?;
                Err(Interrupt::Terminate(Terminator::Final { answer }))
            }
            other => Err(self.err(
                EvalErrorKind::Attribute,
                loc,
                format!("tool has no method `{other}`"),
            )),
        }
    }

    fn queue_llm(&mut self, request: LlmRequest, loc: Loc) -> EResult<()> {
        // Same key within a step replaces the earlier request.
        if let Some(existing) = self
            .tool_requests
            .llm
            .iter_mut()
            .find(|r| r.key == request.key)
        {
            *existing = request;
            return Ok(());
        }
        self.check_tool_budget(loc)?;
        self.tool_requests.llm.push(request);
        Ok(())
    }

    fn queue_search(&mut self, request: SearchRequest, loc: Loc) -> EResult<()> {
        if let Some(existing) = self
            .tool_requests
            .search
            .iter_mut()
            .find(|r| r.key == request.key)
        {
            *existing = request;
            return Ok(());
        }
        self.check_tool_budget(loc)?;
        self.tool_requests.search.push(request);
        Ok(())
    }

    fn check_tool_budget(&self, loc: Loc) -> EResult<()> {
        if self.tool_requests.len() >= self.limits.max_tool_requests {
            return Err(self.err(
                EvalErrorKind::ToolRequestLimit,
                loc,
                format!(
                    "step exceeded {} tool requests",
                    self.limits.max_tool_requests
                ),
            ));
        }
        Ok(())
    }
}

/// Resolve Python slice semantics (negative bounds, negative step) into
/// concrete indices.
fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let resolve = |bound: Option<i64>, default: i64, max: i64| -> i64 {
        match bound {
            None => default,
            Some(b) if b < 0 => (b + len).clamp(if step < 0 { -1 } else { 0 }, max),
            Some(b) => b.clamp(if step < 0 { -1 } else { 0 }, max),
        }
    };
    let mut out = Vec::new();
    if step > 0 {
        let start = resolve(lower, 0, len);
        let stop = resolve(upper, len, len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = resolve(lower, len - 1, len - 1);
        let stop = resolve(upper, -1, len - 1);
        let mut i = start;
        while i > stop {
            if i >= 0 && i < len {
                out.push(i as usize);
            }
            i += step;
        }
    }
    out
}
