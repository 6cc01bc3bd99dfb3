//! In-memory annotated corpus
//!
//! The corpus the query engine evaluates against: a sequence of tokens
//! carrying named positional attributes (word, lemma, pos, ...) plus named
//! structural attributes whose regions mark up token spans (sentences,
//! phrases, documents). Attribute values are interned; every lookup returns
//! an `Option` so that a missing value is data, not an error.

use lasso::{Rodeo, Spur};
use rustc_hash::FxHashMap;

/// Handle for a positional attribute (index in declaration order).
pub type AttrHandle = usize;

/// Handle for a structural attribute.
pub type StructHandle = usize;

/// One region of a structural attribute: an inclusive token span with an
/// optional annotated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub(crate) value: Option<Spur>,
}

/// A column of interned values, one per token.
#[derive(Debug, Clone)]
struct PosAttr {
    name: String,
    values: Vec<Spur>,
}

/// A structural attribute: regions sorted by start, non-overlapping.
#[derive(Debug, Clone)]
struct StructAttr {
    name: String,
    regions: Vec<Region>,
}

/// An immutable annotated corpus.
#[derive(Debug)]
pub struct Corpus {
    interner: Rodeo,
    attrs: Vec<PosAttr>,
    attr_ids: FxHashMap<String, AttrHandle>,
    structs: Vec<StructAttr>,
    struct_ids: FxHashMap<String, StructHandle>,
    len: usize,
}

impl Corpus {
    /// Start building a corpus
    pub fn builder() -> CorpusBuilder {
        CorpusBuilder::new()
    }

    /// Number of tokens in the corpus
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resolve a positional attribute name to its handle
    pub fn attr(&self, name: &str) -> Option<AttrHandle> {
        self.attr_ids.get(name).copied()
    }

    /// Number of declared positional attributes
    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }

    /// Name of a positional attribute
    pub fn attr_name(&self, attr: AttrHandle) -> &str {
        &self.attrs[attr].name
    }

    /// Resolve a structural attribute name to its handle
    pub fn structure(&self, name: &str) -> Option<StructHandle> {
        self.struct_ids.get(name).copied()
    }

    /// Name of a structural attribute
    pub fn structure_name(&self, s: StructHandle) -> &str {
        &self.structs[s].name
    }

    /// Value of a positional attribute at a token position
    pub fn value(&self, attr: AttrHandle, pos: usize) -> Option<&str> {
        self.value_id(attr, pos).map(|id| self.interner.resolve(&id))
    }

    /// Interned key of a positional attribute value at a token position
    pub fn value_id(&self, attr: AttrHandle, pos: usize) -> Option<Spur> {
        self.attrs.get(attr)?.values.get(pos).copied()
    }

    /// Look up the interned key of a string without adding it to the lexicon
    pub fn intern_id(&self, value: &str) -> Option<Spur> {
        self.interner.get(value)
    }

    /// Resolve an interned key back to its string
    pub fn resolve(&self, id: Spur) -> &str {
        self.interner.resolve(&id)
    }

    /// All regions of a structural attribute, sorted by start position
    pub fn regions(&self, s: StructHandle) -> &[Region] {
        &self.structs[s].regions
    }

    /// Index of the region of `s` containing `pos`, if any
    pub fn region_index(&self, s: StructHandle, pos: usize) -> Option<usize> {
        let regions = &self.structs[s].regions;
        // partition_point: first region with start > pos, so the candidate
        // is the one just before it
        let i = regions.partition_point(|r| r.start <= pos);
        if i == 0 {
            return None;
        }
        let r = regions[i - 1];
        (pos <= r.end).then_some(i - 1)
    }

    /// The region of `s` containing `pos`, if any
    pub fn region_at(&self, s: StructHandle, pos: usize) -> Option<Region> {
        self.region_index(s, pos)
            .map(|i| self.structs[s].regions[i])
    }

    /// Annotated value of the region of `s` containing `pos`
    pub fn region_value(&self, s: StructHandle, pos: usize) -> Option<&str> {
        self.region_at(s, pos)?
            .value
            .map(|id| self.interner.resolve(&id))
    }

    /// Is `pos` an opening (or, with `closing`, a closing) boundary of `s`?
    pub fn is_boundary(&self, s: StructHandle, pos: usize, closing: bool) -> bool {
        match self.region_at(s, pos) {
            Some(r) => {
                if closing {
                    pos == r.end
                } else {
                    pos == r.start
                }
            }
            None => false,
        }
    }
}

/// Builder for [`Corpus`]: declare attributes first, then feed token rows
/// and regions.
#[derive(Debug)]
pub struct CorpusBuilder {
    interner: Rodeo,
    attrs: Vec<PosAttr>,
    attr_ids: FxHashMap<String, AttrHandle>,
    structs: Vec<StructAttr>,
    struct_ids: FxHashMap<String, StructHandle>,
    len: usize,
}

impl CorpusBuilder {
    pub fn new() -> Self {
        Self {
            interner: Rodeo::default(),
            attrs: Vec::new(),
            attr_ids: FxHashMap::default(),
            structs: Vec::new(),
            struct_ids: FxHashMap::default(),
            len: 0,
        }
    }

    /// Declare a positional attribute; rows added later must supply one
    /// value per declared attribute, in declaration order.
    pub fn attribute(&mut self, name: &str) -> AttrHandle {
        assert_eq!(self.len, 0, "attributes must be declared before tokens");
        let handle = self.attrs.len();
        self.attrs.push(PosAttr {
            name: name.to_string(),
            values: Vec::new(),
        });
        self.attr_ids.insert(name.to_string(), handle);
        handle
    }

    /// Declare a structural attribute
    pub fn structure(&mut self, name: &str) -> StructHandle {
        let handle = self.structs.len();
        self.structs.push(StructAttr {
            name: name.to_string(),
            regions: Vec::new(),
        });
        self.struct_ids.insert(name.to_string(), handle);
        handle
    }

    /// Append one token row; returns its position
    pub fn token(&mut self, values: &[&str]) -> usize {
        assert_eq!(
            values.len(),
            self.attrs.len(),
            "token row must supply one value per declared attribute"
        );
        for (attr, value) in self.attrs.iter_mut().zip(values) {
            attr.values.push(self.interner.get_or_intern(value));
        }
        let pos = self.len;
        self.len += 1;
        pos
    }

    /// Add a region (inclusive span) to a structural attribute
    pub fn region(&mut self, s: StructHandle, start: usize, end: usize) {
        self.region_entry(s, start, end, None);
    }

    /// Add a region with an annotated value
    pub fn region_with_value(&mut self, s: StructHandle, start: usize, end: usize, value: &str) {
        let id = self.interner.get_or_intern(value);
        self.region_entry(s, start, end, Some(id));
    }

    fn region_entry(&mut self, s: StructHandle, start: usize, end: usize, value: Option<Spur>) {
        assert!(start <= end, "region start must not exceed its end");
        self.structs[s].regions.push(Region { start, end, value });
    }

    pub fn build(mut self) -> Corpus {
        for s in &mut self.structs {
            s.regions.sort_by_key(|r| r.start);
        }
        Corpus {
            interner: self.interner,
            attrs: self.attrs,
            attr_ids: self.attr_ids,
            structs: self.structs,
            struct_ids: self.struct_ids,
            len: self.len,
        }
    }
}

impl Default for CorpusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Corpus: "the quick brown fox jumps" with word + pos attributes and
    /// one sentence region covering everything, one np region over 0..=3.
    fn create_test_corpus() -> Corpus {
        let mut b = Corpus::builder();
        b.attribute("word");
        b.attribute("pos");
        let s = b.structure("s");
        let np = b.structure("np");
        b.token(&["the", "DET"]);
        b.token(&["quick", "ADJ"]);
        b.token(&["brown", "ADJ"]);
        b.token(&["fox", "NOUN"]);
        b.token(&["jumps", "VERB"]);
        b.region(s, 0, 4);
        b.region_with_value(np, 0, 3, "subject");
        b.build()
    }

    #[test]
    fn test_attribute_lookup() {
        let corpus = create_test_corpus();
        let word = corpus.attr("word").unwrap();
        let pos = corpus.attr("pos").unwrap();

        assert_eq!(corpus.len(), 5);
        assert_eq!(corpus.value(word, 0), Some("the"));
        assert_eq!(corpus.value(word, 3), Some("fox"));
        assert_eq!(corpus.value(pos, 4), Some("VERB"));
        assert_eq!(corpus.value(word, 5), None); // out of range
        assert!(corpus.attr("lemma").is_none());
    }

    #[test]
    fn test_interned_identity() {
        let mut b = Corpus::builder();
        b.attribute("word");
        b.attribute("lemma");
        b.token(&["run", "run"]);
        b.token(&["runs", "run"]);
        let corpus = b.build();

        let word = corpus.attr("word").unwrap();
        let lemma = corpus.attr("lemma").unwrap();

        // same string, same key, across attributes
        assert_eq!(corpus.value_id(word, 0), corpus.value_id(lemma, 0));
        assert_ne!(corpus.value_id(word, 1), corpus.value_id(lemma, 1));
        assert_eq!(corpus.intern_id("run"), corpus.value_id(word, 0));
        assert_eq!(corpus.intern_id("cat"), None);
    }

    #[test]
    fn test_region_lookup() {
        let corpus = create_test_corpus();
        let np = corpus.structure("np").unwrap();

        let r = corpus.region_at(np, 2).unwrap();
        assert_eq!((r.start, r.end), (0, 3));
        assert!(corpus.region_at(np, 4).is_none());
        assert_eq!(corpus.region_value(np, 1), Some("subject"));
    }

    #[test]
    fn test_boundaries() {
        let corpus = create_test_corpus();
        let s = corpus.structure("s").unwrap();
        let np = corpus.structure("np").unwrap();

        assert!(corpus.is_boundary(s, 0, false));
        assert!(corpus.is_boundary(s, 4, true));
        assert!(!corpus.is_boundary(s, 2, false));
        assert!(corpus.is_boundary(np, 3, true));
        assert!(!corpus.is_boundary(np, 4, true)); // outside the region
    }

    #[test]
    fn test_multiple_regions() {
        let mut b = Corpus::builder();
        b.attribute("word");
        let s = b.structure("s");
        for w in ["a", "b", "c", "d", "e", "f"] {
            b.token(&[w]);
        }
        // declared out of order; build() sorts
        b.region(s, 3, 5);
        b.region(s, 0, 2);
        let corpus = b.build();
        let s = corpus.structure("s").unwrap();

        assert_eq!(corpus.region_index(s, 1), Some(0));
        assert_eq!(corpus.region_index(s, 3), Some(1));
        assert_eq!(corpus.regions(s).len(), 2);
    }
}
