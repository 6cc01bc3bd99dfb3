//! Compiled constraint trees and their evaluator
//!
//! A `Constraint` is a boolean tree over one token (or one aggregated
//! region) binding: logical combinators, typed comparisons, look-around
//! tests, structure boundary tests, id-list membership, function calls, and
//! nested sub-query references. Attribute and function references are typed
//! handles resolved at compile time.
//!
//! Evaluation never fails: an undefined value makes the enclosing
//! comparison false, it does not abort the scan.

use crate::builtins::{FuncId, FuncRegistry, ParamType};
use crate::context::Context;
use crate::corpus::{AttrHandle, Corpus, StructHandle};
use crate::environment::{EnvId, Environment, EnvironmentManager};
use lasso::{Key, Spur};
use regex::Regex;
use std::borrow::Cow;
use std::fmt;

/// Comparison operator of a constraint node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
        };
        write!(f, "{}", symbol)
    }
}

/// A regular-expression pattern compiled at query-compile time, kept with
/// its source string. Matches the whole value, not a substring.
#[derive(Clone)]
pub struct StrPattern {
    pub source: String,
    rx: Regex,
}

impl StrPattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        let rx = Regex::new(&format!("^(?:{})$", source))?;
        Ok(Self {
            source: source.to_string(),
            rx,
        })
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.rx.is_match(value)
    }
}

// Manual Debug implementation (skip the compiled automaton)
impl fmt::Debug for StrPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StrPattern").field(&self.source).finish()
    }
}

// Manual PartialEq implementation (compare pattern strings, not compiled regex)
impl PartialEq for StrPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Literal-or-pattern test on an annotated value
#[derive(Debug, Clone, PartialEq)]
pub enum ValueTest {
    Literal(String),
    Pattern(StrPattern),
}

impl ValueTest {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            ValueTest::Literal(s) => s == value,
            ValueTest::Pattern(p) => p.is_match(value),
        }
    }
}

/// Operand of a comparison or function call, fully resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Positional attribute of the bound token
    PosAttr(AttrHandle),
    /// Annotated value of the enclosing region of a structural attribute
    StructAttr(StructHandle),
    Str(String),
    /// Regex literal; only valid on the right of `=` / `!=`
    Pat(StrPattern),
    Int(i64),
    Float(f64),
    /// Reference into the environment's bound-variable table; only valid
    /// on the right of `=` / `!=` (membership semantics)
    Var(String),
    Call { func: FuncId, args: Vec<Operand> },
}

/// A compiled boolean constraint tree
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Const(bool),
    And(Box<Constraint>, Box<Constraint>),
    Or(Box<Constraint>, Box<Constraint>),
    Implies(Box<Constraint>, Box<Constraint>),
    Not(Box<Constraint>),
    Cmp {
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// True iff the operand resolves to a defined value
    Exists(Operand),
    /// True iff `test` holds at some position of the window
    Lookaround {
        window: Context,
        test: Box<Constraint>,
    },
    /// True iff the current position is a structure boundary
    Boundary {
        attr: StructHandle,
        is_closing: bool,
    },
    /// Membership of the attribute's interned value in a sorted id set
    IdList {
        attr: AttrHandle,
        ids: Vec<Spur>,
        negated: bool,
    },
    /// Function call in boolean position
    Call { func: FuncId, args: Vec<Operand> },
    /// True iff the referenced environment's pattern matches here
    Subquery(EnvId),
}

/// A resolved operand value
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    Str(Cow<'a, str>),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// An interned attribute value; compares by id against the same
    /// attribute, by string otherwise
    Id { attr: AttrHandle, id: Spur },
}

impl<'a> Value<'a> {
    pub fn as_str<'s>(&'s self, corpus: &'s Corpus) -> Option<&'s str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            Value::Id { id, .. } => Some(corpus.resolve(*id)),
            _ => None,
        }
    }
}

/// What a constraint is evaluated against: one token position, or an
/// aggregated region span (inclusive end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Token(usize),
    Span { start: usize, end: usize },
}

impl Binding {
    /// The position attribute references resolve at: the token itself, or
    /// the start of an aggregated span.
    pub fn pos(self) -> usize {
        match self {
            Binding::Token(p) => p,
            Binding::Span { start, .. } => start,
        }
    }
}

/// Everything one evaluation call needs, passed explicitly: the corpus,
/// the environment arena, the function registry, and the id of the
/// environment being evaluated.
#[derive(Clone, Copy)]
pub struct EvalCx<'a> {
    pub corpus: &'a Corpus,
    pub envs: &'a EnvironmentManager,
    pub funcs: &'a FuncRegistry,
    pub env: EnvId,
}

impl<'a> EvalCx<'a> {
    pub fn new(
        corpus: &'a Corpus,
        envs: &'a EnvironmentManager,
        funcs: &'a FuncRegistry,
        env: EnvId,
    ) -> Self {
        Self {
            corpus,
            envs,
            funcs,
            env,
        }
    }

    /// The environment under evaluation
    pub fn env(&self) -> &'a Environment {
        self.envs
            .get(self.env)
            .expect("environment must stay live for the duration of an evaluation")
    }

    /// The same context, switched to another environment (sub-queries)
    pub fn with_env(&self, env: EnvId) -> Self {
        Self { env, ..*self }
    }
}

/// Evaluate a constraint tree against one binding.
pub fn eval_bool<'a>(cx: &EvalCx<'a>, constraint: &'a Constraint, binding: Binding) -> bool {
    match constraint {
        Constraint::Const(v) => *v,
        Constraint::And(l, r) => eval_bool(cx, l, binding) && eval_bool(cx, r, binding),
        Constraint::Or(l, r) => eval_bool(cx, l, binding) || eval_bool(cx, r, binding),
        Constraint::Implies(l, r) => !eval_bool(cx, l, binding) || eval_bool(cx, r, binding),
        Constraint::Not(c) => !eval_bool(cx, c, binding),
        Constraint::Cmp { op, lhs, rhs } => eval_cmp(cx, *op, lhs, rhs, binding),
        Constraint::Exists(operand) => match operand {
            Operand::Var(name) => cx.env().variable(name).is_some_and(|words| !words.is_empty()),
            _ => operand_value(cx, operand, binding).as_ref().is_some_and(truthy),
        },
        Constraint::Lookaround { window, test } => match window.window(cx.corpus, binding.pos()) {
            Some((lo, hi)) => (lo..=hi).any(|p| eval_bool(cx, test, Binding::Token(p))),
            None => false,
        },
        Constraint::Boundary { attr, is_closing } => {
            cx.corpus.is_boundary(*attr, binding.pos(), *is_closing)
        }
        Constraint::IdList {
            attr,
            ids,
            negated,
        } => {
            let member = cx.corpus.value_id(*attr, binding.pos()).is_some_and(|id| {
                ids.binary_search_by_key(&id.into_usize(), |s| s.into_usize())
                    .is_ok()
            });
            member != *negated
        }
        Constraint::Call { func, args } => {
            eval_func(cx, *func, args, binding).as_ref().is_some_and(truthy)
        }
        Constraint::Subquery(env) => crate::vm::matches_at(&cx.with_env(*env), binding.pos()),
    }
}

/// Truthiness of a resolved value (the `exists` rules): strings and
/// attribute references are defined, numbers are true iff non-zero.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Str(_) | Value::Id { .. } => true,
        Value::Int(n) => *n != 0,
        Value::Float(x) => *x != 0.0,
        Value::Bool(b) => *b,
    }
}

fn eval_cmp<'a>(
    cx: &EvalCx<'a>,
    op: CmpOp,
    lhs: &'a Operand,
    rhs: &'a Operand,
    binding: Binding,
) -> bool {
    match rhs {
        // regex right-hand side: whole-value match
        Operand::Pat(pattern) => {
            if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                return false;
            }
            let Some(lv) = operand_value(cx, lhs, binding) else {
                return false;
            };
            let Some(s) = lv.as_str(cx.corpus) else {
                return false;
            };
            (op == CmpOp::Eq) == pattern.is_match(s)
        }
        // variable right-hand side: membership in the bound word list;
        // unbound variables never match
        Operand::Var(name) => {
            if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                return false;
            }
            let Some(words) = cx.env().variable(name) else {
                return false;
            };
            let Some(lv) = operand_value(cx, lhs, binding) else {
                return false;
            };
            let Some(s) = lv.as_str(cx.corpus) else {
                return false;
            };
            (op == CmpOp::Eq) == words.iter().any(|w| w == s)
        }
        _ => {
            let Some(lv) = operand_value(cx, lhs, binding) else {
                return false;
            };
            let Some(rv) = operand_value(cx, rhs, binding) else {
                return false;
            };
            compare_values(cx, op, &lv, &rv).unwrap_or(false)
        }
    }
}

/// Compare two resolved values; `None` means the pair is not comparable
/// under this operator (which evaluates as false).
fn compare_values(cx: &EvalCx, op: CmpOp, lhs: &Value, rhs: &Value) -> Option<bool> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(cmp_f64(op, *a as f64, *b as f64)),
        (Value::Float(a), Value::Float(b)) => Some(cmp_f64(op, *a, *b)),
        (Value::Int(a), Value::Float(b)) => Some(cmp_f64(op, *a as f64, *b)),
        (Value::Float(a), Value::Int(b)) => Some(cmp_f64(op, *a, *b as f64)),
        (Value::Bool(a), Value::Bool(b)) => eq_only(op, a == b),
        // same attribute: interned ids decide without touching strings
        (Value::Id { attr: a1, id: i1 }, Value::Id { attr: a2, id: i2 }) if a1 == a2 => {
            eq_only(op, i1 == i2)
        }
        _ => {
            let ls = lhs.as_str(cx.corpus)?;
            let rs = rhs.as_str(cx.corpus)?;
            eq_only(op, ls == rs)
        }
    }
}

fn eq_only(op: CmpOp, equal: bool) -> Option<bool> {
    match op {
        CmpOp::Eq => Some(equal),
        CmpOp::Ne => Some(!equal),
        _ => None, // ordering is not defined for strings
    }
}

fn cmp_f64(op: CmpOp, a: f64, b: f64) -> bool {
    match op {
        CmpOp::Gt => a > b,
        CmpOp::Lt => a < b,
        CmpOp::Ge => a >= b,
        CmpOp::Le => a <= b,
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
    }
}

fn operand_value<'a>(
    cx: &EvalCx<'a>,
    operand: &'a Operand,
    binding: Binding,
) -> Option<Value<'a>> {
    match operand {
        Operand::PosAttr(attr) => cx
            .corpus
            .value_id(*attr, binding.pos())
            .map(|id| Value::Id { attr: *attr, id }),
        Operand::StructAttr(s) => cx
            .corpus
            .region_value(*s, binding.pos())
            .map(|v| Value::Str(Cow::Borrowed(v))),
        Operand::Str(s) => Some(Value::Str(Cow::Borrowed(s))),
        Operand::Int(n) => Some(Value::Int(*n)),
        Operand::Float(x) => Some(Value::Float(*x)),
        // patterns and variables are comparison right-hand sides only
        Operand::Pat(_) | Operand::Var(_) => None,
        Operand::Call { func, args } => eval_func(cx, *func, args, binding),
    }
}

fn eval_func<'a>(
    cx: &EvalCx<'a>,
    func: FuncId,
    args: &'a [Operand],
    binding: Binding,
) -> Option<Value<'a>> {
    let def = cx.funcs.def(func);
    let mut values = Vec::with_capacity(args.len());
    for (arg, param) in args.iter().zip(def.params) {
        let value = operand_value(cx, arg, binding)?;
        values.push(coerce(cx, value, *param)?);
    }
    cx.funcs.call(func, &values)
}

fn coerce<'a>(cx: &EvalCx<'a>, value: Value<'a>, param: ParamType) -> Option<Value<'a>> {
    match (param, value) {
        (ParamType::Str, Value::Id { id, .. }) => {
            Some(Value::Str(Cow::Borrowed(cx.corpus.resolve(id))))
        }
        (ParamType::Str, v @ Value::Str(_)) => Some(v),
        (ParamType::Int, v @ Value::Int(_)) => Some(v),
        _ => None,
    }
}
