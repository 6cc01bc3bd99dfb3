//! Query parse-tree input
//!
//! The AST an external query parser hands to the compiler. Attribute,
//! structure, function and variable references are still names here; the
//! compiler resolves them against the corpus schema and function registry.
//! `Display` renders nodes compactly for diagnostics.

use crate::constraint::CmpOp;
use crate::context::CtxDirection;
use crate::pattern::{ConcatMode, CoocOp, TargetNature};
use std::fmt;

/// One node of a query parse tree
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    /// Ordered sequence of sub-patterns; `mode` selects greedy or lazy
    /// repetition for repeats appearing directly under it
    Seq {
        mode: ConcatMode,
        items: Vec<QueryNode>,
    },
    /// Disjunction, explored in declaration order
    Alt(Vec<QueryNode>),
    /// Bounded or unbounded repetition (`max: None` = unbounded)
    Repeat {
        item: Box<QueryNode>,
        min: u32,
        max: Option<u32>,
    },
    /// Token expression; `None` constraint is a matchall
    Token {
        constraint: Option<TokenConstraint>,
        nature: TargetNature,
    },
    /// Opening or closing tag of a structural attribute, with an optional
    /// test on the region's annotated value
    Tag {
        name: String,
        is_closing: bool,
        value: Option<RawValueTest>,
        negated: bool,
    },
    /// Zero-width marker for the target or keyword position
    Anchor { nature: TargetNature },
    /// A whole region of a structural attribute, matched as one unit
    Region {
        name: String,
        constraint: Option<TokenConstraint>,
        nature: TargetNature,
    },
    /// Meet/union combination of two sub-queries over a window
    MeetUnion {
        op: CoocOp,
        window: RawWindow,
        negated: bool,
        left: Box<QueryNode>,
        right: Box<QueryNode>,
    },
    /// Tabular query: columns of token patterns with distance bounds
    Table(Vec<RawColumn>),
}

/// One column of a tabular query; distances constrain the gap to the
/// previous column (ignored on the first)
#[derive(Debug, Clone, PartialEq)]
pub struct RawColumn {
    pub constraint: Option<TokenConstraint>,
    pub min_dist: u32,
    pub max_dist: Option<u32>,
}

/// Window specification for meet/union queries
#[derive(Debug, Clone, PartialEq)]
pub enum RawWindow {
    /// Token offsets relative to the left operand's position
    Offsets { left: i64, right: i64 },
    /// The enclosing region of a structural attribute
    Structure(String),
}

/// Literal-or-pattern test on an annotated value
#[derive(Debug, Clone, PartialEq)]
pub enum RawValueTest {
    Literal(String),
    Pattern(String),
}

/// Boolean constraint over one token (or aggregated region)
#[derive(Debug, Clone, PartialEq)]
pub enum TokenConstraint {
    And(Box<TokenConstraint>, Box<TokenConstraint>),
    Or(Box<TokenConstraint>, Box<TokenConstraint>),
    Implies(Box<TokenConstraint>, Box<TokenConstraint>),
    Not(Box<TokenConstraint>),
    Cmp {
        op: CmpOp,
        lhs: TokenOperand,
        rhs: TokenOperand,
    },
    /// True iff the operand resolves to a defined value
    Exists(TokenOperand),
    /// Look-around: true iff `test` holds somewhere in the window
    Within {
        direction: CtxDirection,
        unit: RawUnit,
        span: u32,
        test: Box<TokenConstraint>,
    },
    /// True iff the current position is a structure boundary
    Boundary { structure: String, is_closing: bool },
    /// Membership of an attribute's value in a literal set
    OneOf {
        attr: String,
        items: Vec<String>,
        negated: bool,
    },
    /// Function call in boolean position
    Call {
        name: String,
        args: Vec<TokenOperand>,
    },
    /// True iff an independent sub-query matches at the current position
    Subquery(Box<QueryNode>),
}

/// Window unit for look-around constraints
#[derive(Debug, Clone, PartialEq)]
pub enum RawUnit {
    Word,
    Structure(String),
}

/// Operand of a comparison or function call
#[derive(Debug, Clone, PartialEq)]
pub enum TokenOperand {
    /// Positional attribute of the current token, by name
    Attr(String),
    /// Annotated value of the enclosing region, by structure name
    StructAttr(String),
    Str(String),
    /// Regular-expression pattern literal
    Pattern(String),
    Int(i64),
    Float(f64),
    /// Reference into the environment's bound-variable table
    Var(String),
    Call {
        name: String,
        args: Vec<TokenOperand>,
    },
}

/// Search scope of a query (the `within` clause)
#[derive(Debug, Clone, PartialEq)]
pub enum RawScope {
    /// A window of at most `n` tokens from the match start
    Words(u32),
    /// A single region of the named structural attribute
    Structure(String),
}

/// A complete query: the pattern plus an optional search scope and an
/// optional global constraint evaluated once per candidate match
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub pattern: QueryNode,
    pub within: Option<RawScope>,
    pub global: Option<TokenConstraint>,
}

impl Query {
    pub fn new(pattern: QueryNode) -> Self {
        Self {
            pattern,
            within: None,
            global: None,
        }
    }

    /// Restrict matches to a single region of a structural attribute
    pub fn within_structure(mut self, name: &str) -> Self {
        self.within = Some(RawScope::Structure(name.to_string()));
        self
    }

    /// Restrict matches to a window of `n` tokens
    pub fn within_words(mut self, n: u32) -> Self {
        self.within = Some(RawScope::Words(n));
        self
    }

    /// Attach a global constraint
    pub fn with_global(mut self, constraint: TokenConstraint) -> Self {
        self.global = Some(constraint);
        self
    }
}

impl QueryNode {
    /// A token expression with a constraint
    pub fn token(constraint: TokenConstraint) -> Self {
        QueryNode::Token {
            constraint: Some(constraint),
            nature: TargetNature::NotTarget,
        }
    }

    /// A matchall token, `[]`
    pub fn matchall() -> Self {
        QueryNode::Token {
            constraint: None,
            nature: TargetNature::NotTarget,
        }
    }

    /// A greedy (order-dependent) sequence
    pub fn seq(items: Vec<QueryNode>) -> Self {
        QueryNode::Seq {
            mode: ConcatMode::Greedy,
            items,
        }
    }

    /// A lazy (order-independent) sequence
    pub fn seq_lazy(items: Vec<QueryNode>) -> Self {
        QueryNode::Seq {
            mode: ConcatMode::Lazy,
            items,
        }
    }

    /// Wrap this node in a repetition
    pub fn repeat(self, min: u32, max: Option<u32>) -> Self {
        QueryNode::Repeat {
            item: Box::new(self),
            min,
            max,
        }
    }

    /// Mark a token, anchor, or region node as target or keyword
    pub fn with_nature(mut self, n: TargetNature) -> Self {
        match &mut self {
            QueryNode::Token { nature, .. }
            | QueryNode::Anchor { nature }
            | QueryNode::Region { nature, .. } => *nature = n,
            _ => {}
        }
        self
    }
}

impl TokenConstraint {
    /// `attr = "value"`
    pub fn attr_eq(attr: &str, value: &str) -> Self {
        TokenConstraint::Cmp {
            op: CmpOp::Eq,
            lhs: TokenOperand::Attr(attr.to_string()),
            rhs: TokenOperand::Str(value.to_string()),
        }
    }

    /// `attr = "pattern"` with regular-expression semantics
    pub fn attr_match(attr: &str, pattern: &str) -> Self {
        TokenConstraint::Cmp {
            op: CmpOp::Eq,
            lhs: TokenOperand::Attr(attr.to_string()),
            rhs: TokenOperand::Pattern(pattern.to_string()),
        }
    }

    pub fn and(self, other: TokenConstraint) -> Self {
        TokenConstraint::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: TokenConstraint) -> Self {
        TokenConstraint::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        TokenConstraint::Not(Box::new(self))
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, name: &str, args: &[TokenOperand]) -> fmt::Result {
    write!(f, "{}(", name)?;
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", a)?;
    }
    write!(f, ")")
}

impl fmt::Display for TokenOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenOperand::Attr(name) | TokenOperand::StructAttr(name) => write!(f, "{}", name),
            TokenOperand::Str(s) | TokenOperand::Pattern(s) => write!(f, "\"{}\"", s),
            TokenOperand::Int(n) => write!(f, "{}", n),
            TokenOperand::Float(x) => write!(f, "{}", x),
            TokenOperand::Var(v) => write!(f, "${}", v),
            TokenOperand::Call { name, args } => write_args(f, name, args),
        }
    }
}

impl fmt::Display for TokenConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenConstraint::And(l, r) => write!(f, "({} & {})", l, r),
            TokenConstraint::Or(l, r) => write!(f, "({} | {})", l, r),
            TokenConstraint::Implies(l, r) => write!(f, "({} -> {})", l, r),
            TokenConstraint::Not(c) => write!(f, "!{}", c),
            TokenConstraint::Cmp { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
            TokenConstraint::Exists(operand) => write!(f, "{}", operand),
            TokenConstraint::Within { test, span, .. } => write!(f, "within({}, {})", test, span),
            TokenConstraint::Boundary {
                structure,
                is_closing,
            } => {
                if *is_closing {
                    write!(f, "</{}>", structure)
                } else {
                    write!(f, "<{}>", structure)
                }
            }
            TokenConstraint::OneOf {
                attr,
                items,
                negated,
            } => {
                write!(f, "{}{} in (", attr, if *negated { " not" } else { "" })?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "\"{}\"", item)?;
                }
                write!(f, ")")
            }
            TokenConstraint::Call { name, args } => write_args(f, name, args),
            TokenConstraint::Subquery(_) => write!(f, "matches(...)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let q = QueryNode::seq(vec![
            QueryNode::matchall().repeat(1, Some(2)),
            QueryNode::token(TokenConstraint::attr_eq("word", "fox")),
        ]);

        match q {
            QueryNode::Seq { mode, items } => {
                assert_eq!(mode, ConcatMode::Greedy);
                assert_eq!(items.len(), 2);
                assert!(matches!(items[0], QueryNode::Repeat { min: 1, .. }));
            }
            _ => panic!("expected Seq"),
        }
    }

    #[test]
    fn test_with_nature() {
        let q = QueryNode::matchall().with_nature(TargetNature::Target);
        assert!(matches!(
            q,
            QueryNode::Token {
                nature: TargetNature::Target,
                ..
            }
        ));

        // nature is ignored on nodes that cannot carry it
        let q = QueryNode::seq(vec![]).with_nature(TargetNature::Target);
        assert!(matches!(q, QueryNode::Seq { .. }));
    }

    #[test]
    fn test_display_rendering() {
        let call = TokenConstraint::Call {
            name: "prefix".to_string(),
            args: vec![
                TokenOperand::Attr("word".to_string()),
                TokenOperand::Str("f".to_string()),
            ],
        };
        let c = TokenConstraint::attr_eq("word", "fox").and(call);
        assert_eq!(format!("{}", c), r#"(word = "fox" & prefix(word, "f"))"#);

        let b = TokenConstraint::Boundary {
            structure: "s".to_string(),
            is_closing: true,
        };
        assert_eq!(format!("{}", b), "</s>");

        let o = TokenConstraint::OneOf {
            attr: "word".to_string(),
            items: vec!["a".to_string(), "b".to_string()],
            negated: true,
        };
        assert_eq!(format!("{}", o), r#"word not in ("a" "b")"#);
    }
}
