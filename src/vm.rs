//! Backtracking automaton for pattern matching
//!
//! Executes a compiled instruction program over corpus token positions.
//! Choice points are an explicit stack of state snapshots; counted
//! repetition uses per-loop counter registers with a progress guard so
//! zero-width loop bodies terminate. The scan driver retries failed start
//! positions one token further on and is restartable from any position.

use crate::constraint::{Binding, EvalCx, eval_bool};
use crate::context::RegionFrame;
use crate::pattern::{TargetNature, eval_avs};

/// VM instructions for pattern matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Evaluate a pattern-list element at the current position
    Avs(usize),
    /// Create a backtrack point at `alternate`, continue at `primary`
    Split { primary: usize, alternate: usize },
    Jump(usize),
    /// Reset a repeat-counter register
    BeginRepeat(usize),
    /// Loop head of a counted repetition
    Repeat {
        reg: usize,
        min: u32,
        max: Option<u32>,
        body: usize,
        exit: usize,
        greedy: bool,
    },
    IncRepeat(usize),
    /// Success - pattern matched
    Match,
}

/// Sentinel for "loop head not yet visited at any position"
const NO_POS: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RepeatCounter {
    count: u32,
    /// Position the loop head was last entered at (progress guard)
    last_cpos: usize,
}

impl RepeatCounter {
    fn reset() -> Self {
        Self {
            count: 0,
            last_cpos: NO_POS,
        }
    }
}

/// A choice point for backtracking: a full state snapshot plus the
/// instruction to resume at
#[derive(Debug, Clone)]
struct ChoicePoint {
    ip: usize,
    cpos: usize,
    counters: Vec<RepeatCounter>,
    regions: Vec<RegionFrame>,
    target: Option<usize>,
    keyword: Option<usize>,
}

/// VM execution state
#[derive(Debug)]
struct VmState {
    /// Instruction pointer
    ip: usize,
    /// Current corpus position
    cpos: usize,
    counters: Vec<RepeatCounter>,
    /// Stack of open region accumulations
    regions: Vec<RegionFrame>,
    target: Option<usize>,
    keyword: Option<usize>,
    /// Backtracking stack
    choices: Vec<ChoicePoint>,
}

impl VmState {
    fn new(start: usize, n_counters: usize) -> Self {
        Self {
            ip: 0,
            cpos: start,
            counters: vec![RepeatCounter::reset(); n_counters],
            regions: Vec::new(),
            target: None,
            keyword: None,
            choices: Vec::new(),
        }
    }

    fn snapshot(&self, ip: usize) -> ChoicePoint {
        ChoicePoint {
            ip,
            cpos: self.cpos,
            counters: self.counters.clone(),
            regions: self.regions.clone(),
            target: self.target,
            keyword: self.keyword,
        }
    }

    /// Pop to the most recent choice point; false if none remain
    fn backtrack(&mut self) -> bool {
        match self.choices.pop() {
            Some(choice) => {
                self.ip = choice.ip;
                self.cpos = choice.cpos;
                self.counters = choice.counters;
                self.regions = choice.regions;
                self.target = choice.target;
                self.keyword = choice.keyword;
                true
            }
            None => false,
        }
    }
}

/// One match: a half-open token span with optional target and keyword
/// anchor positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub start: usize,
    pub end: usize,
    pub target: Option<usize>,
    pub keyword: Option<usize>,
}

impl Match {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

fn within_boundary(boundary: Option<usize>, next_cpos: usize) -> bool {
    match boundary {
        Some(b) => next_cpos <= b + 1,
        None => true,
    }
}

/// Run the environment's program anchored at `start`; first successful
/// branch wins. A failure here never affects other start positions.
pub fn run_at(cx: &EvalCx<'_>, start: usize) -> Option<Match> {
    let env = cx.env();
    let program = &env.program;

    // the `within` scope bounds every position the match may consume
    let boundary = match &env.search_context {
        Some(scope) => Some(scope.right_boundary(cx.corpus, start)?),
        None => None,
    };

    let mut state = VmState::new(start, env.counters);
    loop {
        match &program[state.ip] {
            Instruction::Match => {
                if let Some(g) = &env.gconstraint {
                    if !eval_bool(cx, g, Binding::Token(start)) {
                        if !state.backtrack() {
                            return None;
                        }
                        continue;
                    }
                }
                return Some(Match {
                    start,
                    end: state.cpos,
                    target: state.target,
                    keyword: state.keyword,
                });
            }

            Instruction::Avs(i) => {
                let outcome = eval_avs(cx, &env.patterns[*i], state.cpos, state.regions.last());
                match outcome {
                    Some(ok) if within_boundary(boundary, ok.next_cpos) => {
                        if let Some(pos) = ok.mark {
                            match env.patterns[*i].nature() {
                                TargetNature::Target => state.target = Some(pos),
                                TargetNature::Keyword => state.keyword = Some(pos),
                                TargetNature::NotTarget => {}
                            }
                        }
                        if ok.close {
                            state.regions.pop();
                        }
                        if let Some(frame) = ok.open {
                            state.regions.push(frame);
                        }
                        state.cpos = ok.next_cpos;
                        state.ip += 1;
                    }
                    _ => {
                        if !state.backtrack() {
                            return None;
                        }
                    }
                }
            }

            Instruction::Split { primary, alternate } => {
                let choice = state.snapshot(*alternate);
                state.choices.push(choice);
                state.ip = *primary;
            }

            Instruction::Jump(target) => state.ip = *target,

            Instruction::BeginRepeat(reg) => {
                state.counters[*reg] = RepeatCounter::reset();
                state.ip += 1;
            }

            Instruction::IncRepeat(reg) => {
                state.counters[*reg].count += 1;
                state.ip += 1;
            }

            Instruction::Repeat {
                reg,
                min,
                max,
                body,
                exit,
                greedy,
            } => {
                let counter = state.counters[*reg];
                if counter.count < *min {
                    // mandatory iteration
                    state.counters[*reg].last_cpos = state.cpos;
                    state.ip = *body;
                } else if Some(counter.count) == *max || counter.last_cpos == state.cpos {
                    // bound reached, or no progress since the last iteration
                    state.ip = *exit;
                } else {
                    state.counters[*reg].last_cpos = state.cpos;
                    if *greedy {
                        let choice = state.snapshot(*exit);
                        state.choices.push(choice);
                        state.ip = *body;
                    } else {
                        let choice = state.snapshot(*body);
                        state.choices.push(choice);
                        state.ip = *exit;
                    }
                }
            }
        }
    }
}

/// Does the environment's pattern match anchored at `start`? (sub-query
/// constraints)
pub fn matches_at(cx: &EvalCx<'_>, start: usize) -> bool {
    run_at(cx, start).is_some()
}

/// Lazy iterator over matches: tries every start position in order,
/// advancing past each reported match (one token past each failure).
pub struct Matches<'a> {
    cx: EvalCx<'a>,
    next_start: usize,
}

impl<'a> Matches<'a> {
    pub fn new(cx: EvalCx<'a>) -> Self {
        Self { cx, next_start: 0 }
    }

    /// Restart a scan from an arbitrary position; no state from previous
    /// scans is carried over.
    pub fn starting_at(cx: EvalCx<'a>, start: usize) -> Self {
        Self {
            cx,
            next_start: start,
        }
    }
}

impl<'a> Iterator for Matches<'a> {
    type Item = Match;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_start < self.cx.corpus.len() {
            let start = self.next_start;
            if let Some(m) = run_at(&self.cx, start) {
                self.next_start = m.end.max(start + 1);
                return Some(m);
            }
            self.next_start = start + 1;
        }
        None
    }
}
