//! Inverted index for candidate lookup
//!
//! Maps interned attribute values to the positions carrying them, so a
//! scan can start from the positions that might satisfy a query's first
//! mandatory pattern instead of sweeping the whole corpus.

use crate::corpus::{AttrHandle, Corpus};
use lasso::Spur;
use rustc_hash::FxHashMap;

/// Inverted index over every positional attribute of a corpus
#[derive(Debug, Clone)]
pub struct CorpusIndex {
    /// One value → positions map per attribute handle
    by_value: Vec<FxHashMap<Spur, Vec<usize>>>,
}

impl CorpusIndex {
    /// Build an index from a corpus
    pub fn build(corpus: &Corpus) -> Self {
        let mut by_value: Vec<FxHashMap<Spur, Vec<usize>>> =
            vec![FxHashMap::default(); corpus.attr_count()];

        for (attr, map) in by_value.iter_mut().enumerate() {
            for pos in 0..corpus.len() {
                if let Some(id) = corpus.value_id(attr, pos) {
                    map.entry(id).or_default().push(pos);
                }
            }
        }

        Self { by_value }
    }

    /// Positions whose attribute carries the interned value
    pub fn positions(&self, attr: AttrHandle, id: Spur) -> Option<&[usize]> {
        self.by_value.get(attr)?.get(&id).map(|v| v.as_slice())
    }

    /// Positions whose attribute carries the given string value
    pub fn positions_for(
        &self,
        corpus: &Corpus,
        attr: AttrHandle,
        value: &str,
    ) -> Option<&[usize]> {
        self.positions(attr, corpus.intern_id(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_building() {
        let mut b = Corpus::builder();
        b.attribute("word");
        b.attribute("pos");
        b.token(&["the", "DET"]);
        b.token(&["dog", "NOUN"]);
        b.token(&["saw", "VERB"]);
        b.token(&["the", "DET"]);
        b.token(&["cat", "NOUN"]);
        let corpus = b.build();
        let index = CorpusIndex::build(&corpus);

        let word = corpus.attr("word").unwrap();
        let pos = corpus.attr("pos").unwrap();

        assert_eq!(index.positions_for(&corpus, word, "the").unwrap(), &[0, 3]);
        assert_eq!(index.positions_for(&corpus, pos, "NOUN").unwrap(), &[1, 4]);
        assert!(index.positions_for(&corpus, word, "unicorn").is_none());
    }

    #[test]
    fn test_positions_are_sorted() {
        let mut b = Corpus::builder();
        b.attribute("word");
        for w in ["a", "b", "a", "b", "a"] {
            b.token(&[w]);
        }
        let corpus = b.build();
        let index = CorpusIndex::build(&corpus);
        let word = corpus.attr("word").unwrap();

        let positions = index.positions_for(&corpus, word, "a").unwrap();
        assert_eq!(positions, &[0, 2, 4]);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}
