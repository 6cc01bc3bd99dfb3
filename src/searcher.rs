//! End-to-end query execution
//!
//! The complete pipeline over a compiled environment:
//! 1. Standard queries run the backtracking automaton over start positions,
//!    optionally seeded with candidates from an inverted index
//! 2. Meet/union queries evaluate matchlists bottom-up and combine them
//! 3. Tabular queries run the greedy column-chaining algorithm
//!
//! All three yield the same match-record shape.

use crate::builtins::FuncRegistry;
use crate::compiler::{CompileError, compile};
use crate::constraint::{Binding, CmpOp, Constraint, EvalCx, Operand, eval_bool};
use crate::corpus::Corpus;
use crate::environment::{EnvId, EnvironmentManager};
use crate::index::CorpusIndex;
use crate::matchlist::Matchlist;
use crate::pattern::{Avs, CoocOp, EvalTree, TableColumn};
use crate::query::Query;
use crate::vm::{Match, Matches, run_at};
use thiserror::Error;

/// Error during search
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
}

/// Iterator over the matches of one query
pub enum Hits<'a> {
    /// Lazy scan over start positions (standard queries)
    Scan(Matches<'a>),
    /// Index-seeded scan: only candidate start positions are tried
    Seeded {
        cx: EvalCx<'a>,
        candidates: Vec<usize>,
        idx: usize,
        next_allowed: usize,
    },
    /// Precomputed results (meet/union and tabular queries)
    List(std::vec::IntoIter<Match>),
}

impl Iterator for Hits<'_> {
    type Item = Match;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Hits::Scan(matches) => matches.next(),
            Hits::Seeded {
                cx,
                candidates,
                idx,
                next_allowed,
            } => {
                while *idx < candidates.len() {
                    let start = candidates[*idx];
                    *idx += 1;
                    if start < *next_allowed {
                        continue;
                    }
                    if let Some(m) = run_at(cx, start) {
                        *next_allowed = m.end.max(start + 1);
                        return Some(m);
                    }
                }
                None
            }
            Hits::List(list) => list.next(),
        }
    }
}

/// Run a compiled environment against the corpus.
pub fn search<'a>(
    corpus: &'a Corpus,
    envs: &'a EnvironmentManager,
    funcs: &'a FuncRegistry,
    env: EnvId,
) -> Hits<'a> {
    search_from(corpus, envs, funcs, env, 0)
}

/// Run a compiled environment, considering no start position before
/// `start`. A fresh scan carries no state from previous scans.
pub fn search_from<'a>(
    corpus: &'a Corpus,
    envs: &'a EnvironmentManager,
    funcs: &'a FuncRegistry,
    env: EnvId,
    start: usize,
) -> Hits<'a> {
    let cx = EvalCx::new(corpus, envs, funcs, env);
    match &cx.env().evaltree {
        EvalTree::MeetUnion { .. } => {
            let tree = &cx.env().evaltree;
            let list = eval_mu_tree(&cx, tree);
            let matches: Vec<Match> = list
                .positions()
                .iter()
                .filter(|&&p| p >= start)
                .map(|&p| Match {
                    start: p,
                    end: p + 1,
                    target: None,
                    keyword: None,
                })
                .collect();
            Hits::List(matches.into_iter())
        }
        EvalTree::Table(columns) => {
            let matches: Vec<Match> = eval_tab(&cx, columns)
                .into_iter()
                .filter(|m| m.start >= start)
                .collect();
            Hits::List(matches.into_iter())
        }
        _ => Hits::Scan(Matches::starting_at(cx, start)),
    }
}

/// Like [`search`], but seeds standard queries with candidate start
/// positions from an inverted index when the first mandatory pattern has
/// an indexable equality constraint.
pub fn search_indexed<'a>(
    corpus: &'a Corpus,
    index: &CorpusIndex,
    envs: &'a EnvironmentManager,
    funcs: &'a FuncRegistry,
    env: EnvId,
) -> Hits<'a> {
    let cx = EvalCx::new(corpus, envs, funcs, env);
    match &cx.env().evaltree {
        EvalTree::MeetUnion { .. } | EvalTree::Table(_) => search(corpus, envs, funcs, env),
        tree => match seed_candidates(&cx, index, tree) {
            Some(candidates) => Hits::Seeded {
                cx,
                candidates,
                idx: 0,
                next_allowed: 0,
            },
            None => Hits::Scan(Matches::new(cx)),
        },
    }
}

/// Compile and run in one step, collecting all matches.
pub fn search_query(
    corpus: &Corpus,
    funcs: &FuncRegistry,
    query: &Query,
    envs: &mut EnvironmentManager,
) -> Result<Vec<Match>, SearchError> {
    let env = compile(corpus, funcs, query, envs)?;
    Ok(search(corpus, envs, funcs, env).collect())
}

/// Candidate start positions for the scan: the first pattern the match
/// must begin with, if it has an indexable equality constraint.
fn seed_candidates(cx: &EvalCx<'_>, index: &CorpusIndex, tree: &EvalTree) -> Option<Vec<usize>> {
    let first = first_mandatory_leaf(tree)?;
    match &cx.env().patterns[first] {
        Avs::Pattern { constraint, .. } => indexed_positions(cx, index, constraint),
        _ => None,
    }
}

fn first_mandatory_leaf(tree: &EvalTree) -> Option<usize> {
    match tree {
        EvalTree::Leaf(pat) => Some(*pat),
        EvalTree::Concat { items, .. } => first_mandatory_leaf(items.first()?),
        EvalTree::Repeat { item, min, .. } if *min >= 1 => first_mandatory_leaf(item),
        _ => None,
    }
}

/// Index lookup for an equality constraint, like the most selective
/// conjunct of an `and`
fn indexed_positions(
    cx: &EvalCx<'_>,
    index: &CorpusIndex,
    constraint: &Constraint,
) -> Option<Vec<usize>> {
    match constraint {
        Constraint::Cmp {
            op: CmpOp::Eq,
            lhs: Operand::PosAttr(attr),
            rhs: Operand::Str(value),
        } => match cx.corpus.intern_id(value) {
            Some(id) => Some(index.positions(*attr, id).unwrap_or(&[]).to_vec()),
            // not in the lexicon: no position can ever match
            None => Some(Vec::new()),
        },
        Constraint::And(l, r) => {
            indexed_positions(cx, index, l).or_else(|| indexed_positions(cx, index, r))
        }
        _ => None,
    }
}

/// Positions satisfying one pattern-list element (the initial matchlist
/// of a meet/union or tabular leaf).
fn initial_matchlist<'a>(cx: &EvalCx<'a>, avs: &'a Avs) -> Matchlist {
    match avs {
        Avs::Pattern { constraint, .. } => Matchlist::from_positions(
            (0..cx.corpus.len())
                .filter(|&p| eval_bool(cx, constraint, Binding::Token(p)))
                .collect(),
        ),
        Avs::MatchAll { .. } => Matchlist::from_positions((0..cx.corpus.len()).collect()),
        _ => Matchlist::new(),
    }
}

/// Recursive meet/union evaluation over matchlists.
fn eval_mu_tree<'a>(cx: &EvalCx<'a>, tree: &'a EvalTree) -> Matchlist {
    match tree {
        EvalTree::Leaf(pat) => initial_matchlist(cx, &cx.env().patterns[*pat]),
        EvalTree::MeetUnion {
            op,
            window,
            negated,
            left,
            right,
        } => {
            let mut list = eval_mu_tree(cx, left);
            let other = eval_mu_tree(cx, right);
            match op {
                CoocOp::Meet => list.meet(&other, *window, cx.corpus, *negated),
                CoocOp::Union => list.union(&other),
            }
            list
        }
        _ => Matchlist::new(),
    }
}

/// Greedy tabular evaluation: for each first-column position, fix the
/// nearest item of every following column within its distance range.
/// Items of later columns are not consumed; nested matches are discarded.
fn eval_tab<'a>(cx: &EvalCx<'a>, columns: &'a [TableColumn]) -> Vec<Match> {
    let env = cx.env();
    let lists: Vec<Matchlist> = columns
        .iter()
        .map(|c| initial_matchlist(cx, &env.patterns[c.pat]))
        .collect();
    if lists.iter().any(|l| l.is_empty()) {
        return Vec::new();
    }

    let mut positions = vec![0usize; columns.len()];
    let mut result: Vec<Match> = Vec::new();

    while positions[0] < lists[0].len() {
        let first = lists[0].positions()[positions[0]];
        positions[0] += 1;

        // right boundary for the whole row, from the search scope
        let boundary = match &env.search_context {
            Some(scope) => match scope.right_boundary(cx.corpus, first) {
                Some(b) => b,
                None => continue,
            },
            None => cx.corpus.len() - 1,
        };

        let mut this_pos = first;
        let mut complete = true;
        for (col, column) in columns.iter().enumerate().skip(1) {
            let lo = this_pos + column.min_dist as usize;
            if lo > boundary {
                complete = false;
                break;
            }
            let hi = match column.max_dist {
                Some(max) => (this_pos + max as usize).min(boundary),
                None => boundary,
            };
            // windows are non-decreasing, so the pointer only moves forward
            while positions[col] < lists[col].len() && lists[col].positions()[positions[col]] < lo
            {
                positions[col] += 1;
            }
            if positions[col] >= lists[col].len() {
                complete = false;
                break;
            }
            let next_pos = lists[col].positions()[positions[col]];
            if next_pos > hi {
                complete = false;
                break;
            }
            this_pos = next_pos;
        }

        if complete {
            // discard nested matches (same or earlier end than the last row)
            if result.last().is_none_or(|m| this_pos + 1 > m.end) {
                result.push(Match {
                    start: first,
                    end: this_pos + 1,
                    target: None,
                    keyword: None,
                });
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_pattern;
    use crate::pattern::TargetNature;
    use crate::query::{QueryNode, RawColumn, RawWindow, TokenConstraint as TC};

    /// "the quick brown fox jumps over the lazy dog"
    fn create_test_corpus() -> Corpus {
        let mut b = Corpus::builder();
        b.attribute("word");
        let s = b.structure("s");
        for w in [
            "the", "quick", "brown", "fox", "jumps", "over", "the", "lazy", "dog",
        ] {
            b.token(&[w]);
        }
        b.region(s, 0, 8);
        b.build()
    }

    fn setup() -> (Corpus, FuncRegistry, EnvironmentManager) {
        (
            create_test_corpus(),
            FuncRegistry::standard(),
            EnvironmentManager::new(),
        )
    }

    #[test]
    fn test_scenario_target_anchored_repetition() {
        // AVS(any word, target) {1,2} followed by [word = "fox"]:
        // greedy longest prefix ending at "fox", target on the last
        // pre-"fox" token
        let (corpus, funcs, mut envs) = setup();
        let q = QueryNode::seq(vec![
            QueryNode::matchall()
                .with_nature(TargetNature::Target)
                .repeat(1, Some(2)),
            QueryNode::token(TC::attr_eq("word", "fox")),
        ]);
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let matches: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].start, matches[0].end), (1, 4));
        assert_eq!(matches[0].target, Some(2));
        assert_eq!(matches[0].keyword, None);
    }

    #[test]
    fn test_target_unset_when_zero_repetitions() {
        // the declared target consumes zero tokens under {0,0}
        let (corpus, funcs, mut envs) = setup();
        let q = QueryNode::seq(vec![
            QueryNode::matchall()
                .with_nature(TargetNature::Target)
                .repeat(0, Some(0)),
            QueryNode::token(TC::attr_eq("word", "fox")),
        ]);
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let matches: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].start, matches[0].end), (3, 4));
        assert_eq!(matches[0].target, None);
    }

    #[test]
    fn test_search_from_is_restartable() {
        let (corpus, funcs, mut envs) = setup();
        let q = QueryNode::token(TC::attr_eq("word", "the"));
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let all: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].start, 0);
        assert_eq!(all[1].start, 6);

        let tail: Vec<Match> = search_from(&corpus, &envs, &funcs, env, 1).collect();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].start, 6);
    }

    #[test]
    fn test_indexed_search_matches_plain_scan() {
        let (corpus, funcs, mut envs) = setup();
        let index = CorpusIndex::build(&corpus);
        let q = QueryNode::seq(vec![
            QueryNode::token(TC::attr_eq("word", "the")),
            QueryNode::matchall(),
        ]);
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let scanned: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        let seeded: Vec<Match> = search_indexed(&corpus, &index, &envs, &funcs, env).collect();
        assert_eq!(scanned, seeded);
        assert!(matches!(
            search_indexed(&corpus, &index, &envs, &funcs, env),
            Hits::Seeded { .. }
        ));
    }

    #[test]
    fn test_indexed_search_falls_back_without_equality() {
        let (corpus, funcs, mut envs) = setup();
        let index = CorpusIndex::build(&corpus);
        let q = QueryNode::matchall();
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        assert!(matches!(
            search_indexed(&corpus, &index, &envs, &funcs, env),
            Hits::Scan(_)
        ));
    }

    #[test]
    fn test_region_query_aggregates_five_tokens() {
        // a structure spanning 5 tokens is emitted as one evaluated unit
        let mut b = Corpus::builder();
        b.attribute("word");
        let np = b.structure("np");
        for w in ["the", "quick", "brown", "fox", "cub", "ran"] {
            b.token(&[w]);
        }
        b.region(np, 0, 4);
        let corpus = b.build();
        let funcs = FuncRegistry::standard();
        let mut envs = EnvironmentManager::new();

        let q = QueryNode::Region {
            name: "np".to_string(),
            constraint: Some(TC::attr_eq("word", "the")),
            nature: TargetNature::NotTarget,
        };
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let matches: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].start, matches[0].end), (0, 5));
        assert_eq!(matches[0].len(), 5);
    }

    #[test]
    fn test_meet_query() {
        let (corpus, funcs, mut envs) = setup();
        // "the" with "fox" within three tokens to the right: only the
        // first "the"
        let q = QueryNode::MeetUnion {
            op: CoocOp::Meet,
            window: RawWindow::Offsets { left: 0, right: 3 },
            negated: false,
            left: Box::new(QueryNode::token(TC::attr_eq("word", "the"))),
            right: Box::new(QueryNode::token(TC::attr_eq("word", "fox"))),
        };
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let matches: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].start, matches[0].end), (0, 1));
    }

    #[test]
    fn test_union_query() {
        let (corpus, funcs, mut envs) = setup();
        let q = QueryNode::MeetUnion {
            op: CoocOp::Union,
            window: RawWindow::Offsets { left: 0, right: 0 },
            negated: false,
            left: Box::new(QueryNode::token(TC::attr_eq("word", "fox"))),
            right: Box::new(QueryNode::token(TC::attr_eq("word", "dog"))),
        };
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let starts: Vec<usize> = search(&corpus, &envs, &funcs, env)
            .map(|m| m.start)
            .collect();
        assert_eq!(starts, vec![3, 8]);
    }

    #[test]
    fn test_tabular_greedy_chaining() {
        // a .. a .. b .. c .. b .. c: the greedy algorithm fixes the
        // nearest b and c for the first a; the second a reuses b1/c1 and
        // is discarded as a nested match
        let mut b = Corpus::builder();
        b.attribute("word");
        for w in ["a", "x", "a", "b", "c", "b", "c"] {
            b.token(&[w]);
        }
        let corpus = b.build();
        let funcs = FuncRegistry::standard();
        let mut envs = EnvironmentManager::new();

        let q = QueryNode::Table(vec![
            RawColumn {
                constraint: Some(TC::attr_eq("word", "a")),
                min_dist: 1,
                max_dist: None,
            },
            RawColumn {
                constraint: Some(TC::attr_eq("word", "b")),
                min_dist: 1,
                max_dist: None,
            },
            RawColumn {
                constraint: Some(TC::attr_eq("word", "c")),
                min_dist: 1,
                max_dist: None,
            },
        ]);
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let matches: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].start, matches[0].end), (0, 5)); // a0-b3-c4
    }

    #[test]
    fn test_tabular_distance_bounds() {
        let mut b = Corpus::builder();
        b.attribute("word");
        for w in ["a", "x", "x", "x", "b", "a", "b"] {
            b.token(&[w]);
        }
        let corpus = b.build();
        let funcs = FuncRegistry::standard();
        let mut envs = EnvironmentManager::new();

        // b must follow a within two tokens: only the second pair fits
        let q = QueryNode::Table(vec![
            RawColumn {
                constraint: Some(TC::attr_eq("word", "a")),
                min_dist: 1,
                max_dist: None,
            },
            RawColumn {
                constraint: Some(TC::attr_eq("word", "b")),
                min_dist: 1,
                max_dist: Some(2),
            },
        ]);
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let matches: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].start, matches[0].end), (5, 7));
    }

    #[test]
    fn test_subquery_constraint() {
        let (corpus, funcs, mut envs) = setup();
        // tokens at which an independent "fox jumps" pattern matches
        let sub = QueryNode::seq(vec![
            QueryNode::token(TC::attr_eq("word", "fox")),
            QueryNode::token(TC::attr_eq("word", "jumps")),
        ]);
        let q = QueryNode::token(TC::Subquery(Box::new(sub)));
        let env = compile_pattern(&corpus, &funcs, &q, &mut envs).unwrap();

        let matches: Vec<Match> = search(&corpus, &envs, &funcs, env).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].start, 3);
    }

    #[test]
    fn test_search_query_reports_compile_errors() {
        let (corpus, funcs, mut envs) = setup();
        let query = Query::new(QueryNode::token(TC::attr_eq("lemma", "fox")));

        let err = search_query(&corpus, &funcs, &query, &mut envs).unwrap_err();
        assert!(matches!(
            err,
            SearchError::Compile(CompileError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn test_search_query_with_within_scope() {
        let mut b = Corpus::builder();
        b.attribute("word");
        let s = b.structure("s");
        for w in ["a", "b", "a", "b"] {
            b.token(&[w]);
        }
        b.region(s, 0, 1);
        b.region(s, 2, 3);
        let corpus = b.build();
        let funcs = FuncRegistry::standard();
        let mut envs = EnvironmentManager::new();

        // "a b" within one sentence matches twice; "b a" would cross
        let inside = Query::new(QueryNode::seq(vec![
            QueryNode::token(TC::attr_eq("word", "a")),
            QueryNode::token(TC::attr_eq("word", "b")),
        ]))
        .within_structure("s");
        let matches = search_query(&corpus, &funcs, &inside, &mut envs).unwrap();
        assert_eq!(matches.len(), 2);

        let crossing = Query::new(QueryNode::seq(vec![
            QueryNode::token(TC::attr_eq("word", "b")),
            QueryNode::token(TC::attr_eq("word", "a")),
        ]))
        .within_structure("s");
        let matches = search_query(&corpus, &funcs, &crossing, &mut envs).unwrap();
        assert!(matches.is_empty());
    }
}
