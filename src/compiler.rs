//! Query compilation
//!
//! Turns an externally produced parse tree into a populated evaluation
//! environment: attribute and function names are resolved against the
//! corpus schema and registry, regexes are compiled, repetition bounds and
//! target/keyword markers are validated, region elements are lowered to
//! their enter/wait/emit triple, and the evaluation tree is emitted as an
//! instruction program. Compilation allocates the environment but never
//! executes matching; on any error every partially built environment is
//! released before the error is returned.

use crate::builtins::{FuncId, FuncRegistry};
use crate::constraint::{CmpOp, Constraint, Operand, StrPattern, ValueTest};
use crate::context::{Context, CtxDirection, CtxUnit};
use crate::corpus::Corpus;
use crate::environment::{EnvId, EnvironmentManager, MatchSelector};
use crate::matchlist::CoocWindow;
use crate::pattern::{Avs, ConcatMode, EvalTree, RegionOp, TableColumn, TargetNature};
use crate::query::{
    Query, QueryNode, RawColumn, RawScope, RawUnit, RawValueTest, RawWindow, TokenConstraint,
    TokenOperand,
};
use crate::vm::Instruction;
use lasso::{Key, Spur};
use thiserror::Error;

/// Error during query compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unknown positional attribute: {0}")]
    UnknownAttribute(String),

    #[error("unknown structural attribute: {0}")]
    UnknownStructure(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("function {name} expects {expected} argument(s), got {got}: {node}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
        node: String,
    },

    #[error("invalid regular expression \"{pattern}\": {source}")]
    BadRegex {
        pattern: String,
        source: regex::Error,
    },

    #[error("invalid repetition bounds {{{min},{max}}}")]
    InvalidRepetition { min: u32, max: u32 },

    #[error("invalid distance bounds {{{min},{max}}}")]
    InvalidDistance { min: u32, max: u32 },

    #[error("more than one target marker in query")]
    DuplicateTarget,

    #[error("more than one keyword marker in query")]
    DuplicateKeyword,

    #[error("comparison is not defined here: {node}")]
    InvalidComparison { node: String },

    #[error("query exceeds the pattern limit ({limit})")]
    TooManyPatterns { limit: usize },

    #[error("nested query limit exceeded ({limit} environments)")]
    TooManyEnvironments { limit: usize },

    #[error("matchall column #{column} is not allowed in a tabular query")]
    MatchAllColumn { column: usize },

    #[error("tabular query has no columns")]
    EmptyTable,

    #[error("{form} query is only allowed at the top level")]
    MisplacedQueryForm { form: &'static str },

    #[error("meet/union operands must be token expressions or nested meet/union")]
    InvalidMeetOperand,
}

/// Compile a complete query into a fresh environment.
pub fn compile(
    corpus: &Corpus,
    funcs: &FuncRegistry,
    query: &Query,
    envs: &mut EnvironmentManager,
) -> Result<EnvId, CompileError> {
    compile_parts(
        corpus,
        funcs,
        &query.pattern,
        query.within.as_ref(),
        query.global.as_ref(),
        envs,
    )
}

/// Compile a bare pattern (no search scope, no global constraint).
pub fn compile_pattern(
    corpus: &Corpus,
    funcs: &FuncRegistry,
    pattern: &QueryNode,
    envs: &mut EnvironmentManager,
) -> Result<EnvId, CompileError> {
    compile_parts(corpus, funcs, pattern, None, None, envs)
}

fn compile_parts(
    corpus: &Corpus,
    funcs: &FuncRegistry,
    pattern: &QueryNode,
    within: Option<&RawScope>,
    global: Option<&TokenConstraint>,
    envs: &mut EnvironmentManager,
) -> Result<EnvId, CompileError> {
    let limit = envs.max_environments();
    let env = envs
        .next_environment()
        .ok_or(CompileError::TooManyEnvironments { limit })?;

    let mut compiler = Compiler {
        corpus,
        funcs,
        envs,
        created: vec![env],
    };
    let result = compiler.compile_into(env, pattern, within, global);
    let Compiler { envs, created, .. } = compiler;
    match result {
        Ok(()) => {
            envs.pop_environment();
            Ok(env)
        }
        Err(e) => {
            // release every partially built environment, children included
            for id in created {
                envs.free_environment(id);
            }
            Err(e)
        }
    }
}

/// Pattern list and marker state accumulated while compiling one
/// environment
#[derive(Default)]
struct EnvBuild {
    patterns: Vec<Avs>,
    selector: MatchSelector,
    has_target: bool,
    has_keyword: bool,
}

struct Compiler<'a> {
    corpus: &'a Corpus,
    funcs: &'a FuncRegistry,
    envs: &'a mut EnvironmentManager,
    /// All environments allocated by this compilation, for error cleanup
    created: Vec<EnvId>,
}

impl Compiler<'_> {
    fn compile_into(
        &mut self,
        env: EnvId,
        pattern: &QueryNode,
        within: Option<&RawScope>,
        global: Option<&TokenConstraint>,
    ) -> Result<(), CompileError> {
        let mut build = EnvBuild::default();

        let evaltree = match pattern {
            QueryNode::MeetUnion { .. } => self.compile_mu(&mut build, pattern)?,
            QueryNode::Table(cols) => self.compile_table(&mut build, cols)?,
            _ => self.compile_node(&mut build, pattern, ConcatMode::Greedy)?,
        };

        let search_context = match within {
            Some(RawScope::Words(n)) => Some(Context::word(CtxDirection::Both, *n)),
            Some(RawScope::Structure(name)) => {
                let s = self.resolve_structure(name)?;
                Some(Context::structure(CtxDirection::Both, s, 1))
            }
            None => None,
        };
        let gconstraint = global.map(|g| self.compile_constraint(g)).transpose()?;

        let (program, counters) = match &evaltree {
            // meet/union and tabular trees are driven by the searcher, not
            // the token automaton
            EvalTree::MeetUnion { .. } | EvalTree::Table(_) => (vec![Instruction::Match], 0),
            tree => emit_program(tree),
        };

        let e = self
            .envs
            .get_mut(env)
            .expect("environment allocated by this compilation");
        e.patterns = build.patterns;
        e.selector = build.selector;
        e.evaltree = evaltree;
        e.program = program;
        e.counters = counters;
        e.search_context = search_context;
        e.gconstraint = gconstraint;
        Ok(())
    }

    fn compile_node(
        &mut self,
        build: &mut EnvBuild,
        node: &QueryNode,
        mode: ConcatMode,
    ) -> Result<EvalTree, CompileError> {
        match node {
            QueryNode::Seq { mode: m, items } => {
                let items = items
                    .iter()
                    .map(|item| self.compile_node(build, item, *m))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(EvalTree::Concat { mode: *m, items })
            }

            QueryNode::Alt(items) => {
                let items = items
                    .iter()
                    .map(|item| self.compile_node(build, item, mode))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(EvalTree::Disj(items))
            }

            QueryNode::Repeat { item, min, max } => {
                if let Some(max) = max {
                    if min > max {
                        return Err(CompileError::InvalidRepetition {
                            min: *min,
                            max: *max,
                        });
                    }
                }
                let item = self.compile_node(build, item, mode)?;
                Ok(EvalTree::Repeat {
                    item: Box::new(item),
                    min: *min,
                    max: *max,
                    // the enclosing concatenation's mode decides
                    greedy: mode == ConcatMode::Greedy,
                })
            }

            QueryNode::Token { constraint, nature } => {
                self.note_nature(build, *nature)?;
                let avs = match constraint {
                    Some(c) => Avs::Pattern {
                        constraint: self.compile_constraint(c)?,
                        nature: *nature,
                    },
                    None => Avs::MatchAll { nature: *nature },
                };
                let idx = self.push_pattern(build, avs)?;
                self.record_selector(build, *nature, idx);
                Ok(EvalTree::Leaf(idx))
            }

            QueryNode::Tag {
                name,
                is_closing,
                value,
                negated,
            } => {
                let attr = self.resolve_structure(name)?;
                let value = match value {
                    Some(RawValueTest::Literal(s)) => Some(ValueTest::Literal(s.clone())),
                    Some(RawValueTest::Pattern(p)) => {
                        Some(ValueTest::Pattern(self.compile_regex(p)?))
                    }
                    None => None,
                };
                let idx = self.push_pattern(
                    build,
                    Avs::Tag {
                        attr,
                        is_closing: *is_closing,
                        value,
                        negated: *negated,
                    },
                )?;
                Ok(EvalTree::Leaf(idx))
            }

            QueryNode::Anchor { nature } => {
                self.note_nature(build, *nature)?;
                let idx = self.push_pattern(build, Avs::Anchor { nature: *nature })?;
                self.record_selector(build, *nature, idx);
                Ok(EvalTree::Leaf(idx))
            }

            QueryNode::Region {
                name,
                constraint,
                nature,
            } => {
                self.note_nature(build, *nature)?;
                let attr = self.resolve_structure(name)?;
                let aggregate = constraint
                    .as_ref()
                    .map(|c| self.compile_constraint(c))
                    .transpose()?;

                // lower `<<name>>` to its enter (wait)* emit loop
                let enter = self.push_pattern(
                    build,
                    Avs::Region {
                        attr,
                        op: RegionOp::Enter,
                        constraint: None,
                        nature: *nature,
                    },
                )?;
                self.record_selector(build, *nature, enter);
                let wait = self.push_pattern(
                    build,
                    Avs::Region {
                        attr,
                        op: RegionOp::Wait,
                        constraint: None,
                        nature: TargetNature::NotTarget,
                    },
                )?;
                let emit = self.push_pattern(
                    build,
                    Avs::Region {
                        attr,
                        op: RegionOp::Emit,
                        constraint: aggregate,
                        nature: TargetNature::NotTarget,
                    },
                )?;
                Ok(EvalTree::Concat {
                    mode,
                    items: vec![
                        EvalTree::Leaf(enter),
                        EvalTree::Repeat {
                            item: Box::new(EvalTree::Leaf(wait)),
                            min: 0,
                            max: None,
                            greedy: true,
                        },
                        EvalTree::Leaf(emit),
                    ],
                })
            }

            QueryNode::MeetUnion { .. } => Err(CompileError::MisplacedQueryForm {
                form: "meet/union",
            }),
            QueryNode::Table(_) => Err(CompileError::MisplacedQueryForm { form: "tabular" }),
        }
    }

    fn compile_mu(
        &mut self,
        build: &mut EnvBuild,
        node: &QueryNode,
    ) -> Result<EvalTree, CompileError> {
        match node {
            QueryNode::MeetUnion {
                op,
                window,
                negated,
                left,
                right,
            } => {
                let window = match window {
                    RawWindow::Offsets { left, right } => CoocWindow::Offsets {
                        left: *left,
                        right: *right,
                    },
                    RawWindow::Structure(name) => {
                        CoocWindow::Structure(self.resolve_structure(name)?)
                    }
                };
                let left = self.compile_mu(build, left)?;
                let right = self.compile_mu(build, right)?;
                Ok(EvalTree::MeetUnion {
                    op: *op,
                    window,
                    negated: *negated,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            QueryNode::Token { constraint, .. } => {
                let avs = match constraint {
                    Some(c) => Avs::Pattern {
                        constraint: self.compile_constraint(c)?,
                        nature: TargetNature::NotTarget,
                    },
                    None => Avs::MatchAll {
                        nature: TargetNature::NotTarget,
                    },
                };
                let idx = self.push_pattern(build, avs)?;
                Ok(EvalTree::Leaf(idx))
            }
            _ => Err(CompileError::InvalidMeetOperand),
        }
    }

    fn compile_table(
        &mut self,
        build: &mut EnvBuild,
        cols: &[RawColumn],
    ) -> Result<EvalTree, CompileError> {
        if cols.is_empty() {
            return Err(CompileError::EmptyTable);
        }
        let mut columns = Vec::with_capacity(cols.len());
        for (i, col) in cols.iter().enumerate() {
            let constraint = col
                .constraint
                .as_ref()
                .ok_or(CompileError::MatchAllColumn { column: i + 1 })?;
            if let Some(max) = col.max_dist {
                if col.min_dist > max {
                    return Err(CompileError::InvalidDistance {
                        min: col.min_dist,
                        max,
                    });
                }
            }
            let compiled_constraint = self.compile_constraint(constraint)?;
            let idx = self.push_pattern(
                build,
                Avs::Pattern {
                    constraint: compiled_constraint,
                    nature: TargetNature::NotTarget,
                },
            )?;
            columns.push(TableColumn {
                pat: idx,
                min_dist: col.min_dist,
                max_dist: col.max_dist,
            });
        }
        Ok(EvalTree::Table(columns))
    }

    fn compile_constraint(&mut self, c: &TokenConstraint) -> Result<Constraint, CompileError> {
        match c {
            TokenConstraint::And(l, r) => Ok(Constraint::And(
                Box::new(self.compile_constraint(l)?),
                Box::new(self.compile_constraint(r)?),
            )),
            TokenConstraint::Or(l, r) => Ok(Constraint::Or(
                Box::new(self.compile_constraint(l)?),
                Box::new(self.compile_constraint(r)?),
            )),
            TokenConstraint::Implies(l, r) => Ok(Constraint::Implies(
                Box::new(self.compile_constraint(l)?),
                Box::new(self.compile_constraint(r)?),
            )),
            TokenConstraint::Not(inner) => {
                Ok(Constraint::Not(Box::new(self.compile_constraint(inner)?)))
            }

            TokenConstraint::Cmp { op, lhs, rhs } => self.compile_cmp(c, *op, lhs, rhs),

            TokenConstraint::Exists(operand) => {
                Ok(Constraint::Exists(self.compile_operand(operand)?))
            }

            TokenConstraint::Within {
                direction,
                unit,
                span,
                test,
            } => {
                let unit = match unit {
                    RawUnit::Word => CtxUnit::Word,
                    RawUnit::Structure(name) => CtxUnit::Structure(self.resolve_structure(name)?),
                };
                Ok(Constraint::Lookaround {
                    window: Context {
                        direction: *direction,
                        unit,
                        span: *span,
                    },
                    test: Box::new(self.compile_constraint(test)?),
                })
            }

            TokenConstraint::Boundary {
                structure,
                is_closing,
            } => Ok(Constraint::Boundary {
                attr: self.resolve_structure(structure)?,
                is_closing: *is_closing,
            }),

            TokenConstraint::OneOf {
                attr,
                items,
                negated,
            } => {
                let attr = self.resolve_attr(attr)?;
                // words absent from the lexicon can never match; drop them
                let mut ids: Vec<Spur> = items
                    .iter()
                    .filter_map(|w| self.corpus.intern_id(w))
                    .collect();
                ids.sort_unstable_by_key(|s| s.into_usize());
                ids.dedup();
                Ok(Constraint::IdList {
                    attr,
                    ids,
                    negated: *negated,
                })
            }

            TokenConstraint::Call { name, args } => {
                let (func, args) = self.compile_call(c.to_string(), name, args)?;
                Ok(Constraint::Call { func, args })
            }

            TokenConstraint::Subquery(q) => Ok(Constraint::Subquery(self.compile_child(q)?)),
        }
    }

    fn compile_cmp(
        &mut self,
        node: &TokenConstraint,
        op: CmpOp,
        lhs: &TokenOperand,
        rhs: &TokenOperand,
    ) -> Result<Constraint, CompileError> {
        // regexes and variables only make sense on the right of = / !=
        if matches!(lhs, TokenOperand::Pattern(_) | TokenOperand::Var(_)) {
            return Err(CompileError::InvalidComparison {
                node: node.to_string(),
            });
        }
        let rhs_is_membership = matches!(rhs, TokenOperand::Pattern(_) | TokenOperand::Var(_));
        if rhs_is_membership && !matches!(op, CmpOp::Eq | CmpOp::Ne) {
            return Err(CompileError::InvalidComparison {
                node: node.to_string(),
            });
        }

        let lhs = self.compile_operand(lhs)?;
        let rhs = self.compile_operand(rhs)?;

        // ordering on a known string literal can never hold
        let stringy = |o: &Operand| matches!(o, Operand::Str(_));
        if !matches!(op, CmpOp::Eq | CmpOp::Ne) && (stringy(&lhs) || stringy(&rhs)) {
            return Err(CompileError::InvalidComparison {
                node: node.to_string(),
            });
        }

        Ok(Constraint::Cmp { op, lhs, rhs })
    }

    fn compile_operand(&mut self, operand: &TokenOperand) -> Result<Operand, CompileError> {
        match operand {
            TokenOperand::Attr(name) => Ok(Operand::PosAttr(self.resolve_attr(name)?)),
            TokenOperand::StructAttr(name) => {
                Ok(Operand::StructAttr(self.resolve_structure(name)?))
            }
            TokenOperand::Str(s) => Ok(Operand::Str(s.clone())),
            TokenOperand::Pattern(p) => Ok(Operand::Pat(self.compile_regex(p)?)),
            TokenOperand::Int(n) => Ok(Operand::Int(*n)),
            TokenOperand::Float(x) => Ok(Operand::Float(*x)),
            TokenOperand::Var(v) => Ok(Operand::Var(v.clone())),
            TokenOperand::Call { name, args } => {
                let (func, args) = self.compile_call(operand.to_string(), name, args)?;
                Ok(Operand::Call { func, args })
            }
        }
    }

    fn compile_call(
        &mut self,
        node: String,
        name: &str,
        args: &[TokenOperand],
    ) -> Result<(FuncId, Vec<Operand>), CompileError> {
        let func = self
            .funcs
            .lookup(name)
            .ok_or_else(|| CompileError::UnknownFunction(name.to_string()))?;
        let expected = self.funcs.def(func).arity();
        if args.len() != expected {
            return Err(CompileError::ArityMismatch {
                name: name.to_string(),
                expected,
                got: args.len(),
                node,
            });
        }
        let args = args
            .iter()
            .map(|a| self.compile_operand(a))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((func, args))
    }

    /// Compile a nested sub-query into a child environment
    fn compile_child(&mut self, pattern: &QueryNode) -> Result<EnvId, CompileError> {
        let limit = self.envs.max_environments();
        let child = self
            .envs
            .next_environment()
            .ok_or(CompileError::TooManyEnvironments { limit })?;
        self.created.push(child);
        self.compile_into(child, pattern, None, None)?;
        self.envs.pop_environment();
        Ok(child)
    }

    fn resolve_attr(&self, name: &str) -> Result<usize, CompileError> {
        self.corpus
            .attr(name)
            .ok_or_else(|| CompileError::UnknownAttribute(name.to_string()))
    }

    fn resolve_structure(&self, name: &str) -> Result<usize, CompileError> {
        self.corpus
            .structure(name)
            .ok_or_else(|| CompileError::UnknownStructure(name.to_string()))
    }

    fn compile_regex(&self, source: &str) -> Result<StrPattern, CompileError> {
        StrPattern::new(source).map_err(|e| CompileError::BadRegex {
            pattern: source.to_string(),
            source: e,
        })
    }

    fn push_pattern(&self, build: &mut EnvBuild, avs: Avs) -> Result<usize, CompileError> {
        if build.patterns.len() >= self.envs.max_patterns() {
            return Err(CompileError::TooManyPatterns {
                limit: self.envs.max_patterns(),
            });
        }
        build.patterns.push(avs);
        Ok(build.patterns.len() - 1)
    }

    fn note_nature(&self, build: &mut EnvBuild, nature: TargetNature) -> Result<(), CompileError> {
        match nature {
            TargetNature::Target => {
                if build.has_target {
                    return Err(CompileError::DuplicateTarget);
                }
                build.has_target = true;
            }
            TargetNature::Keyword => {
                if build.has_keyword {
                    return Err(CompileError::DuplicateKeyword);
                }
                build.has_keyword = true;
            }
            TargetNature::NotTarget => {}
        }
        Ok(())
    }

    fn record_selector(&self, build: &mut EnvBuild, nature: TargetNature, idx: usize) {
        match nature {
            TargetNature::Target => build.selector.target = Some(idx),
            TargetNature::Keyword => build.selector.keyword = Some(idx),
            TargetNature::NotTarget => {}
        }
    }
}

/// Emit the instruction program for a standard (token-regex) evaluation
/// tree. Returns the program and the number of repeat-counter registers.
fn emit_program(tree: &EvalTree) -> (Vec<Instruction>, usize) {
    let mut program = Vec::new();
    let mut counters = 0;
    emit(tree, &mut program, &mut counters);
    program.push(Instruction::Match);
    (program, counters)
}

fn emit(tree: &EvalTree, program: &mut Vec<Instruction>, counters: &mut usize) {
    match tree {
        EvalTree::Leaf(pat) => program.push(Instruction::Avs(*pat)),

        EvalTree::Concat { items, .. } => {
            for item in items {
                emit(item, program, counters);
            }
        }

        EvalTree::Disj(items) => {
            if items.is_empty() {
                return; // empty disjunction is the empty pattern
            }
            let mut jump_sites = Vec::new();
            for (i, item) in items.iter().enumerate() {
                if i + 1 < items.len() {
                    let split_at = program.len();
                    program.push(Instruction::Split {
                        primary: split_at + 1,
                        alternate: 0, // patched below
                    });
                    emit(item, program, counters);
                    jump_sites.push(program.len());
                    program.push(Instruction::Jump(0)); // patched below
                    let alternate = program.len();
                    if let Instruction::Split { alternate: a, .. } = &mut program[split_at] {
                        *a = alternate;
                    }
                } else {
                    emit(item, program, counters);
                }
            }
            let end = program.len();
            for site in jump_sites {
                program[site] = Instruction::Jump(end);
            }
        }

        EvalTree::Repeat {
            item,
            min,
            max,
            greedy,
        } => {
            let reg = *counters;
            *counters += 1;
            program.push(Instruction::BeginRepeat(reg));
            let head = program.len();
            program.push(Instruction::Repeat {
                reg,
                min: *min,
                max: *max,
                body: head + 1,
                exit: 0, // patched below
                greedy: *greedy,
            });
            emit(item, program, counters);
            program.push(Instruction::IncRepeat(reg));
            program.push(Instruction::Jump(head));
            let exit_at = program.len();
            if let Instruction::Repeat { exit, .. } = &mut program[head] {
                *exit = exit_at;
            }
        }

        EvalTree::MeetUnion { .. } | EvalTree::Table(_) => {
            unreachable!("meet/union and tabular trees are not program-compiled")
        }
    }
}
