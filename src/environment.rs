//! Evaluation environments
//!
//! An `Environment` is one compiled, executable query: its pattern list,
//! instruction program, evaluation tree, optional global constraint, match
//! selector, search context, and bound-variable table. Environments are
//! owned exclusively by the `EnvironmentManager`, an index arena with an
//! active nesting stack; other components borrow one for the duration of a
//! single call. Limits on pattern-list size and environment count guard
//! against pathological queries.

use crate::constraint::Constraint;
use crate::context::Context;
use crate::pattern::{Avs, ConcatMode, EvalTree};
use crate::vm::Instruction;
use rustc_hash::FxHashMap;

/// Identifier of an environment (index into the manager's arena)
pub type EnvId = usize;

/// Default cap on the pattern list of a single query
pub const MAX_PATTERNS: usize = 5000;

/// Default cap on simultaneously live environments
pub const MAX_ENVIRONMENT: usize = 10;

/// Which pattern-list elements act as target and keyword of a match
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchSelector {
    pub target: Option<usize>,
    pub keyword: Option<usize>,
}

/// One compiled, executable query instance
#[derive(Debug, Clone)]
pub struct Environment {
    /// The pattern list (AVS elements referenced by the evaltree)
    pub patterns: Vec<Avs>,
    /// The evaluation tree over pattern-list indices
    pub evaltree: EvalTree,
    /// Instruction program for standard (token-regex) queries
    pub program: Vec<Instruction>,
    /// Number of repeat-counter registers the program uses
    pub counters: usize,
    /// Constraint applied once per candidate match
    pub gconstraint: Option<Constraint>,
    pub selector: MatchSelector,
    /// The `within` search scope
    pub search_context: Option<Context>,
    variables: FxHashMap<String, Vec<String>>,
    /// Enclosing environment for nested sub-queries
    pub parent: Option<EnvId>,
}

impl Environment {
    fn new(parent: Option<EnvId>) -> Self {
        Self {
            patterns: Vec::new(),
            evaltree: EvalTree::Concat {
                mode: ConcatMode::Greedy,
                items: Vec::new(),
            },
            // an uncompiled environment matches the empty span everywhere
            program: vec![Instruction::Match],
            counters: 0,
            gconstraint: None,
            selector: MatchSelector::default(),
            search_context: None,
            variables: FxHashMap::default(),
            parent,
        }
    }

    /// Bind a named word list usable from `Var` operands
    pub fn define_variable(&mut self, name: &str, words: Vec<String>) {
        self.variables.insert(name.to_string(), words);
    }

    /// Look up a bound variable
    pub fn variable(&self, name: &str) -> Option<&[String]> {
        self.variables.get(name).map(|w| w.as_slice())
    }
}

/// Arena of environments plus the active nesting stack
#[derive(Debug)]
pub struct EnvironmentManager {
    slots: Vec<Option<Environment>>,
    stack: Vec<EnvId>,
    max_patterns: usize,
    max_environments: usize,
}

impl EnvironmentManager {
    pub fn new() -> Self {
        Self::with_limits(MAX_PATTERNS, MAX_ENVIRONMENT)
    }

    /// Override the resource limits (mainly for tests)
    pub fn with_limits(max_patterns: usize, max_environments: usize) -> Self {
        Self {
            slots: Vec::new(),
            stack: Vec::new(),
            max_patterns,
            max_environments,
        }
    }

    pub fn max_patterns(&self) -> usize {
        self.max_patterns
    }

    pub fn max_environments(&self) -> usize {
        self.max_environments
    }

    /// Number of live environments
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Allocate a fresh environment nested under the current one and make
    /// it current. `None` if the environment limit is reached.
    pub fn next_environment(&mut self) -> Option<EnvId> {
        if self.live() >= self.max_environments {
            return None;
        }
        let parent = self.stack.last().copied();
        let env = Environment::new(parent);
        let id = match self.slots.iter().position(|s| s.is_none()) {
            Some(vacant) => {
                self.slots[vacant] = Some(env);
                vacant
            }
            None => {
                self.slots.push(Some(env));
                self.slots.len() - 1
            }
        };
        self.stack.push(id);
        Some(id)
    }

    /// Leave the current nesting scope; the environment stays live
    pub fn pop_environment(&mut self) -> Option<EnvId> {
        self.stack.pop()
    }

    /// The innermost environment on the nesting stack
    pub fn current(&self) -> Option<EnvId> {
        self.stack.last().copied()
    }

    pub fn get(&self, id: EnvId) -> Option<&Environment> {
        self.slots.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Environment> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Free one environment; false if it was not live
    pub fn free_environment(&mut self, id: EnvId) -> bool {
        match self.slots.get_mut(id) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.stack.retain(|&e| e != id);
                true
            }
            _ => false,
        }
    }

    /// Bulk teardown at query-session end
    pub fn free_all(&mut self) {
        self.slots.clear();
        self.stack.clear();
    }
}

impl Default for EnvironmentManager {
    fn default() -> Self {
        Self::new()
    }
}
