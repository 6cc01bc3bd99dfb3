//! Pattern elements and the evaluation tree
//!
//! The pattern list of a compiled query is a vector of AVS elements (token
//! expressions, tags, anchors, region phases); the evaluation tree arranges
//! their indices under regular-expression operators. `eval_avs` evaluates
//! one element at one corpus position: token expressions consume a token,
//! tags and anchors are zero-width, and region elements run the
//! enter/wait/emit accumulation protocol.

use crate::constraint::{Binding, Constraint, EvalCx, ValueTest, eval_bool};
use crate::context::RegionFrame;
use crate::corpus::StructHandle;
use crate::matchlist::CoocWindow;

/// Whether a pattern element marks the match's target or keyword position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetNature {
    #[default]
    NotTarget,
    Target,
    Keyword,
}

/// Phase of a region element's accumulation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOp {
    /// Open an accumulation at the start of a region
    Enter,
    /// Extend while the structural scope remains open
    Wait,
    /// Close and evaluate the accumulated span as one unit
    Emit,
}

/// Concatenation mode: greedy prefers longer repetitions first, lazy
/// prefers shorter ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatMode {
    Greedy,
    Lazy,
}

/// Meet/union combination operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoocOp {
    Meet,
    Union,
}

/// One element of the pattern list
#[derive(Debug, Clone, PartialEq)]
pub enum Avs {
    /// Token expression: consumes one token iff its constraint holds
    Pattern {
        constraint: Constraint,
        nature: TargetNature,
    },
    /// Zero-width structural tag, with an optional test on the region's
    /// annotated value
    Tag {
        attr: StructHandle,
        is_closing: bool,
        value: Option<ValueTest>,
        negated: bool,
    },
    /// Consumes any one token
    MatchAll { nature: TargetNature },
    /// Zero-width position marker
    Anchor { nature: TargetNature },
    /// One phase of a region element's accumulation loop
    Region {
        attr: StructHandle,
        op: RegionOp,
        constraint: Option<Constraint>,
        nature: TargetNature,
    },
}

impl Avs {
    /// Target/keyword role of this element (tags carry none)
    pub fn nature(&self) -> TargetNature {
        match self {
            Avs::Pattern { nature, .. }
            | Avs::MatchAll { nature }
            | Avs::Anchor { nature }
            | Avs::Region { nature, .. } => *nature,
            Avs::Tag { .. } => TargetNature::NotTarget,
        }
    }
}

/// One column of a tabular query
#[derive(Debug, Clone, PartialEq)]
pub struct TableColumn {
    /// Pattern-list index of the column's token expression
    pub pat: usize,
    /// Minimal distance to the previous column
    pub min_dist: u32,
    /// Maximal distance to the previous column (`None` = unbounded)
    pub max_dist: Option<u32>,
}

/// The compiled evaluation tree of a query
#[derive(Debug, Clone, PartialEq)]
pub enum EvalTree {
    /// Index into the pattern list
    Leaf(usize),
    Concat {
        mode: ConcatMode,
        items: Vec<EvalTree>,
    },
    /// Alternatives, explored in declaration order
    Disj(Vec<EvalTree>),
    /// Counted repetition; `max: None` is unbounded
    Repeat {
        item: Box<EvalTree>,
        min: u32,
        max: Option<u32>,
        greedy: bool,
    },
    /// Meet/union combination of two sub-trees over a window
    MeetUnion {
        op: CoocOp,
        window: CoocWindow,
        negated: bool,
        left: Box<EvalTree>,
        right: Box<EvalTree>,
    },
    /// Tabular query: a chain of columns with distance bounds
    Table(Vec<TableColumn>),
}

/// Result of a successful AVS evaluation: where the automaton continues,
/// which position (if any) to mark for target/keyword capture, and region
/// accumulation effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvsOk {
    pub next_cpos: usize,
    pub mark: Option<usize>,
    pub open: Option<RegionFrame>,
    pub close: bool,
}

impl AvsOk {
    fn step(next_cpos: usize, mark: Option<usize>) -> Self {
        Self {
            next_cpos,
            mark,
            open: None,
            close: false,
        }
    }
}

/// Evaluate one pattern element at one corpus position. `open_region` is
/// the innermost region accumulation currently open, if any. Returns
/// `None` on failure; never partial results.
pub fn eval_avs<'a>(
    cx: &EvalCx<'a>,
    avs: &'a Avs,
    cpos: usize,
    open_region: Option<&RegionFrame>,
) -> Option<AvsOk> {
    match avs {
        Avs::Pattern { constraint, .. } => {
            if cpos >= cx.corpus.len() {
                return None;
            }
            eval_bool(cx, constraint, Binding::Token(cpos))
                .then(|| AvsOk::step(cpos + 1, Some(cpos)))
        }

        Avs::MatchAll { .. } => (cpos < cx.corpus.len()).then(|| AvsOk::step(cpos + 1, Some(cpos))),

        Avs::Anchor { .. } => {
            // marks the next token to be consumed; at corpus end there is
            // nothing left to mark
            let mark = (cpos < cx.corpus.len()).then_some(cpos);
            Some(AvsOk::step(cpos, mark))
        }

        Avs::Tag {
            attr,
            is_closing,
            value,
            negated,
        } => {
            // a closing tag is tested against the last consumed position
            let probe = if *is_closing { cpos.checked_sub(1)? } else { cpos };
            let region = cx.corpus.region_at(*attr, probe)?;
            let at_boundary = if *is_closing {
                probe == region.end
            } else {
                probe == region.start
            };
            if !at_boundary {
                return None;
            }
            if value.is_some() || *negated {
                let mut ok = match (value, cx.corpus.region_value(*attr, probe)) {
                    (Some(test), Some(v)) => test.matches(v),
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                if *negated {
                    ok = !ok;
                }
                if !ok {
                    return None;
                }
            }
            Some(AvsOk::step(cpos, None))
        }

        Avs::Region {
            attr,
            op,
            constraint,
            ..
        } => match op {
            RegionOp::Enter => {
                let region = cx.corpus.region_at(*attr, cpos)?;
                (cpos == region.start).then_some(AvsOk {
                    next_cpos: cpos,
                    mark: Some(cpos),
                    open: Some(RegionFrame {
                        start: region.start,
                        end: region.end,
                    }),
                    close: false,
                })
            }
            RegionOp::Wait => {
                let frame = open_region?;
                (cpos < frame.end).then(|| AvsOk::step(cpos + 1, None))
            }
            RegionOp::Emit => {
                let frame = open_region?;
                if cpos != frame.end {
                    return None;
                }
                if let Some(c) = constraint {
                    let span = Binding::Span {
                        start: frame.start,
                        end: frame.end,
                    };
                    if !eval_bool(cx, c, span) {
                        return None;
                    }
                }
                Some(AvsOk {
                    next_cpos: frame.end + 1,
                    mark: None,
                    open: None,
                    close: true,
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::FuncRegistry;
    use crate::constraint::{CmpOp, Operand};
    use crate::corpus::Corpus;
    use crate::environment::{EnvId, EnvironmentManager};

    struct Fixture {
        corpus: Corpus,
        envs: EnvironmentManager,
        funcs: FuncRegistry,
        env: EnvId,
    }

    impl Fixture {
        fn cx(&self) -> EvalCx<'_> {
            EvalCx::new(&self.corpus, &self.envs, &self.funcs, self.env)
        }
    }

    /// "the quick brown fox jumps" with an np region [0,3] valued "subject"
    fn create_fixture() -> Fixture {
        let mut b = Corpus::builder();
        b.attribute("word");
        let np = b.structure("np");
        b.token(&["the"]);
        b.token(&["quick"]);
        b.token(&["brown"]);
        b.token(&["fox"]);
        b.token(&["jumps"]);
        b.region_with_value(np, 0, 3, "subject");
        let corpus = b.build();

        let mut envs = EnvironmentManager::new();
        let env = envs.next_environment().unwrap();
        Fixture {
            corpus,
            envs,
            funcs: FuncRegistry::standard(),
            env,
        }
    }

    fn word_eq(fx: &Fixture, value: &str) -> Constraint {
        Constraint::Cmp {
            op: CmpOp::Eq,
            lhs: Operand::PosAttr(fx.corpus.attr("word").unwrap()),
            rhs: Operand::Str(value.to_string()),
        }
    }

    #[test]
    fn test_pattern_consumes_one_token() {
        let fx = create_fixture();
        let cx = fx.cx();
        let avs = Avs::Pattern {
            constraint: word_eq(&fx, "fox"),
            nature: TargetNature::NotTarget,
        };

        let ok = eval_avs(&cx, &avs, 3, None).unwrap();
        assert_eq!(ok.next_cpos, 4);
        assert_eq!(ok.mark, Some(3));
        assert!(eval_avs(&cx, &avs, 0, None).is_none());
        assert!(eval_avs(&cx, &avs, 5, None).is_none()); // past the end
    }

    #[test]
    fn test_matchall_and_anchor() {
        let fx = create_fixture();
        let cx = fx.cx();

        let all = Avs::MatchAll {
            nature: TargetNature::NotTarget,
        };
        assert_eq!(eval_avs(&cx, &all, 2, None).unwrap().next_cpos, 3);
        assert!(eval_avs(&cx, &all, 5, None).is_none());

        let anchor = Avs::Anchor {
            nature: TargetNature::Target,
        };
        let ok = eval_avs(&cx, &anchor, 2, None).unwrap();
        assert_eq!(ok.next_cpos, 2); // zero-width
        assert_eq!(ok.mark, Some(2));

        // at corpus end the anchor succeeds but marks nothing
        let ok = eval_avs(&cx, &anchor, 5, None).unwrap();
        assert_eq!(ok.mark, None);
    }

    #[test]
    fn test_opening_tag() {
        let fx = create_fixture();
        let cx = fx.cx();
        let np = fx.corpus.structure("np").unwrap();

        let open = Avs::Tag {
            attr: np,
            is_closing: false,
            value: None,
            negated: false,
        };
        let ok = eval_avs(&cx, &open, 0, None).unwrap();
        assert_eq!(ok.next_cpos, 0);
        assert!(eval_avs(&cx, &open, 1, None).is_none()); // not at start
        assert!(eval_avs(&cx, &open, 4, None).is_none()); // outside region
    }

    #[test]
    fn test_closing_tag_tests_previous_position() {
        let fx = create_fixture();
        let cx = fx.cx();
        let np = fx.corpus.structure("np").unwrap();

        let close = Avs::Tag {
            attr: np,
            is_closing: true,
            value: None,
            negated: false,
        };
        // region ends at 3, so the closing tag matches once 4 tokens are consumed
        assert!(eval_avs(&cx, &close, 4, None).is_some());
        assert!(eval_avs(&cx, &close, 3, None).is_none());
        assert!(eval_avs(&cx, &close, 0, None).is_none());
    }

    #[test]
    fn test_tag_value_test() {
        let fx = create_fixture();
        let cx = fx.cx();
        let np = fx.corpus.structure("np").unwrap();

        let subject = Avs::Tag {
            attr: np,
            is_closing: false,
            value: Some(ValueTest::Literal("subject".to_string())),
            negated: false,
        };
        assert!(eval_avs(&cx, &subject, 0, None).is_some());

        let object = Avs::Tag {
            attr: np,
            is_closing: false,
            value: Some(ValueTest::Literal("object".to_string())),
            negated: false,
        };
        assert!(eval_avs(&cx, &object, 0, None).is_none());

        let not_object = Avs::Tag {
            attr: np,
            is_closing: false,
            value: Some(ValueTest::Literal("object".to_string())),
            negated: true,
        };
        assert!(eval_avs(&cx, &not_object, 0, None).is_some());
    }

    #[test]
    fn test_region_enter_wait_emit() {
        let fx = create_fixture();
        let cx = fx.cx();
        let np = fx.corpus.structure("np").unwrap();

        let enter = Avs::Region {
            attr: np,
            op: RegionOp::Enter,
            constraint: None,
            nature: TargetNature::NotTarget,
        };
        let wait = Avs::Region {
            attr: np,
            op: RegionOp::Wait,
            constraint: None,
            nature: TargetNature::NotTarget,
        };
        let emit = Avs::Region {
            attr: np,
            op: RegionOp::Emit,
            constraint: None,
            nature: TargetNature::NotTarget,
        };

        // enter only at the region start
        assert!(eval_avs(&cx, &enter, 1, None).is_none());
        let opened = eval_avs(&cx, &enter, 0, None).unwrap();
        let frame = opened.open.unwrap();
        assert_eq!((frame.start, frame.end), (0, 3));
        assert_eq!(opened.next_cpos, 0);

        // wait extends through the region, one token at a time
        let mut cpos = 0;
        let mut waits = 0;
        while let Some(ok) = eval_avs(&cx, &wait, cpos, Some(&frame)) {
            cpos = ok.next_cpos;
            waits += 1;
        }
        assert_eq!(waits, 3);
        assert_eq!(cpos, 3);

        // emit closes at the region end and jumps past it
        let emitted = eval_avs(&cx, &emit, cpos, Some(&frame)).unwrap();
        assert!(emitted.close);
        assert_eq!(emitted.next_cpos, 4);

        // without an open accumulation, wait and emit fail
        assert!(eval_avs(&cx, &wait, 0, None).is_none());
        assert!(eval_avs(&cx, &emit, 3, None).is_none());
    }

    #[test]
    fn test_region_emit_evaluates_aggregate() {
        let fx = create_fixture();
        let cx = fx.cx();
        let np = fx.corpus.structure("np").unwrap();
        let frame = RegionFrame { start: 0, end: 3 };

        // aggregate constraint sees the whole span; attributes resolve at
        // its start position
        let emit_the = Avs::Region {
            attr: np,
            op: RegionOp::Emit,
            constraint: Some(word_eq(&fx, "the")),
            nature: TargetNature::NotTarget,
        };
        assert!(eval_avs(&cx, &emit_the, 3, Some(&frame)).is_some());

        let emit_fox = Avs::Region {
            attr: np,
            op: RegionOp::Emit,
            constraint: Some(word_eq(&fx, "fox")),
            nature: TargetNature::NotTarget,
        };
        assert!(eval_avs(&cx, &emit_fox, 3, Some(&frame)).is_none());
    }
}
