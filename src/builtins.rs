//! Builtin function registry
//!
//! Named functions callable from query constraints, each with a declared
//! parameter list. The compiler checks name and arity against this registry;
//! evaluation receives already-resolved argument values and returns `None`
//! for anything it cannot compute (which the evaluator treats as false).

use crate::constraint::Value;
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::fmt;

/// Identifier of a registered function (index into the registry)
pub type FuncId = usize;

/// Declared type of a function parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Str,
    Int,
}

/// A registered function: name, signature, and evaluator
#[derive(Clone)]
pub struct FuncDef {
    pub name: &'static str,
    pub params: &'static [ParamType],
    eval: fn(&[Value]) -> Option<Value<'static>>,
}

impl FuncDef {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

// Manual Debug implementation (the evaluator field is a bare fn pointer)
impl fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Registry of callable functions
#[derive(Debug, Clone)]
pub struct FuncRegistry {
    funcs: Vec<FuncDef>,
    by_name: FxHashMap<&'static str, FuncId>,
}

impl FuncRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            funcs: Vec::new(),
            by_name: FxHashMap::default(),
        }
    }

    /// The standard builtin set
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(FuncDef {
            name: "strlen",
            params: &[ParamType::Str],
            eval: bi_strlen,
        });
        registry.register(FuncDef {
            name: "lowercase",
            params: &[ParamType::Str],
            eval: bi_lowercase,
        });
        registry.register(FuncDef {
            name: "prefix",
            params: &[ParamType::Str, ParamType::Str],
            eval: bi_prefix,
        });
        registry.register(FuncDef {
            name: "suffix",
            params: &[ParamType::Str, ParamType::Str],
            eval: bi_suffix,
        });
        registry.register(FuncDef {
            name: "abs",
            params: &[ParamType::Int],
            eval: bi_abs,
        });
        registry
    }

    /// Register a function; later registrations shadow earlier names
    pub fn register(&mut self, def: FuncDef) -> FuncId {
        let id = self.funcs.len();
        self.by_name.insert(def.name, id);
        self.funcs.push(def);
        id
    }

    /// Look up a function by name
    pub fn lookup(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    /// Definition of a registered function
    pub fn def(&self, id: FuncId) -> &FuncDef {
        &self.funcs[id]
    }

    /// Call a registered function with resolved arguments
    pub fn call(&self, id: FuncId, args: &[Value]) -> Option<Value<'static>> {
        debug_assert_eq!(args.len(), self.funcs[id].arity());
        (self.funcs[id].eval)(args)
    }
}

impl Default for FuncRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn arg_str<'a>(args: &'a [Value], i: usize) -> Option<&'a str> {
    match &args[i] {
        Value::Str(s) => Some(s.as_ref()),
        _ => None,
    }
}

fn arg_int(args: &[Value], i: usize) -> Option<i64> {
    match args[i] {
        Value::Int(n) => Some(n),
        _ => None,
    }
}

fn bi_strlen(args: &[Value]) -> Option<Value<'static>> {
    Some(Value::Int(arg_str(args, 0)?.chars().count() as i64))
}

fn bi_lowercase(args: &[Value]) -> Option<Value<'static>> {
    Some(Value::Str(Cow::Owned(arg_str(args, 0)?.to_lowercase())))
}

fn bi_prefix(args: &[Value]) -> Option<Value<'static>> {
    Some(Value::Bool(
        arg_str(args, 0)?.starts_with(arg_str(args, 1)?),
    ))
}

fn bi_suffix(args: &[Value]) -> Option<Value<'static>> {
    Some(Value::Bool(arg_str(args, 0)?.ends_with(arg_str(args, 1)?)))
}

fn bi_abs(args: &[Value]) -> Option<Value<'static>> {
    Some(Value::Int(arg_int(args, 0)?.abs()))
}
