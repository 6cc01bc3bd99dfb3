//! Match position lists and their set operations
//!
//! A `Matchlist` is a sorted, deduplicated list of corpus positions, the
//! working representation for meet/union query evaluation. `meet` has
//! filtering semantics: an item of the left list survives iff at least one
//! item of the right list falls inside its window; right-hand items are not
//! consumed and may license several left-hand items.

use crate::corpus::{Corpus, StructHandle};

/// Window for meet combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoocWindow {
    /// Token offsets `[left, right]` relative to each left-list position
    Offsets { left: i64, right: i64 },
    /// The region of a structural attribute enclosing each left-list position
    Structure(StructHandle),
}

/// A sorted list of match positions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matchlist {
    positions: Vec<usize>,
}

impl Matchlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary positions; sorts and deduplicates
    pub fn from_positions(mut positions: Vec<usize>) -> Self {
        positions.sort_unstable();
        positions.dedup();
        Self { positions }
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Merge another sorted list into this one
    pub fn union(&mut self, other: &Matchlist) {
        let mut merged = Vec::with_capacity(self.positions.len() + other.positions.len());
        let (mut i, mut j) = (0, 0);
        while i < self.positions.len() && j < other.positions.len() {
            let (a, b) = (self.positions[i], other.positions[j]);
            if a <= b {
                merged.push(a);
                i += 1;
                if a == b {
                    j += 1;
                }
            } else {
                merged.push(b);
                j += 1;
            }
        }
        merged.extend_from_slice(&self.positions[i..]);
        merged.extend_from_slice(&other.positions[j..]);
        self.positions = merged;
    }

    /// Filter this list against `other`: keep a position iff at least one
    /// `other` position lies in its window (or none does, when `negated`).
    ///
    /// Both lists are sorted and the windows are non-decreasing, so a single
    /// forward pass over `other` suffices.
    pub fn meet(&mut self, other: &Matchlist, window: CoocWindow, corpus: &Corpus, negated: bool) {
        if other.positions.is_empty() {
            // an empty right list licenses nothing and rejects nothing
            if !negated {
                self.positions.clear();
            }
            return;
        }

        let len = corpus.len() as i64;
        let mut j = 0;
        let mut result = Vec::with_capacity(self.positions.len());

        for &a in &self.positions {
            let win = match window {
                CoocWindow::Offsets { left, right } => {
                    let mut start = a as i64 + left;
                    let mut end = a as i64 + right;
                    // a maximum-distance side is clamped to the corpus; a
                    // minimum-distance side falling outside it means no
                    // match is possible at this position
                    if left <= 0 {
                        start = start.max(0);
                    }
                    if right >= 0 {
                        end = end.min(len - 1);
                    }
                    if start < 0 || start >= len || end < 0 {
                        None
                    } else {
                        Some((start as usize, end.min(len - 1) as usize))
                    }
                }
                CoocWindow::Structure(s) => corpus.region_at(s, a).map(|r| (r.start, r.end)),
            };

            let found = match win {
                Some((start, end)) if start <= end => {
                    while j < other.positions.len() && other.positions[j] < start {
                        j += 1;
                    }
                    j < other.positions.len() && other.positions[j] <= end
                }
                _ => false,
            };

            if found != negated {
                result.push(a);
            }
        }

        self.positions = result;
    }
}
