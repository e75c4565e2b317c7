//! Declarative instruction-run patterns.
//!
//! A [`Pattern`] is a small regular language over opcodes. [`Pattern::compile`]
//! validates it and lowers every one-instruction class (single opcode,
//! wildcard, alternation of classes, negation) to an opcode set; the
//! resulting [`Matcher`] is a set-based automaton over the live window, so
//! matching never backtracks and always reports the longest run.

use std::collections::BTreeSet;
use std::ops::{BitOr, Not};

use codeweave_ops::Opcode;
use thiserror::Error;

/// Invalid pattern descriptions, reported by [`Pattern::compile`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// `seq([])`.
    #[error("empty sequence pattern")]
    EmptySequence,
    /// `or([])`.
    #[error("empty alternation pattern")]
    EmptyAlternation,
    /// `between(n, m)` with `n > m`.
    #[error("inverted repetition range {min}..={max}")]
    InvertedRange {
        /// Lower bound.
        min: usize,
        /// Upper bound.
        max: usize,
    },
    /// A repetition that can only ever match zero instructions.
    #[error("repetition bounded by zero never consumes an instruction")]
    ZeroRepeat,
    /// `!p` where `p` spans more than one instruction.
    #[error("only single-instruction patterns can be negated")]
    NegatedRun,
}

/// Uncompiled pattern tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// One instruction of this opcode.
    Op(Opcode),
    /// One instruction of any opcode.
    Any,
    /// One instruction not matched by the inner class.
    Not(Box<Pattern>),
    /// Each part in order.
    Seq(Vec<Pattern>),
    /// Any one of the alternatives.
    Or(Vec<Pattern>),
    /// `inner` repeated between `min` and `max` (unbounded when `None`) times.
    Repeat {
        /// Repeated pattern.
        inner: Box<Pattern>,
        /// Minimum count.
        min: usize,
        /// Maximum count.
        max: Option<usize>,
    },
}

/// One instruction of `opcode`.
pub const fn op(opcode: Opcode) -> Pattern { Pattern::Op(opcode) }

/// One instruction of any opcode.
pub const fn any() -> Pattern { Pattern::Any }

/// Sequence of patterns.
pub fn seq(parts: impl IntoIterator<Item = Pattern>) -> Pattern { Pattern::Seq(parts.into_iter().collect()) }

/// Alternation; nested alternations are flattened.
pub fn or(alternatives: impl IntoIterator<Item = Pattern>) -> Pattern {
    alternatives.into_iter().fold(Pattern::Or(Vec::new()), |acc, p| acc | p)
}

impl Pattern {
    /// Zero or one.
    pub fn optional(self) -> Self { self.between(0, 1) }

    /// Zero or more.
    pub fn star(self) -> Self { self.at_least(0) }

    /// One or more.
    pub fn plus(self) -> Self { self.at_least(1) }

    /// Exactly `n` times.
    pub fn exactly(self, n: usize) -> Self { self.between(n, n) }

    /// `n` or more times.
    pub fn at_least(self, n: usize) -> Self { Self::Repeat { inner: Box::new(self), min: n, max: None } }

    /// Between `min` and `max` times, inclusive.
    pub fn between(self, min: usize, max: usize) -> Self {
        Self::Repeat { inner: Box::new(self), min, max: Some(max) }
    }

    /// Validates and lowers the pattern.
    pub fn compile(&self) -> Result<Matcher, PatternError> { Ok(Matcher { root: lower(self)? }) }
}

impl BitOr for Pattern {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        let mut alternatives = match self {
            Self::Or(items) => items,
            other => vec![other],
        };
        match rhs {
            Self::Or(items) => alternatives.extend(items),
            other => alternatives.push(other),
        }
        Self::Or(alternatives)
    }
}

impl Not for Pattern {
    type Output = Self;

    fn not(self) -> Self { Self::Not(Box::new(self)) }
}

impl From<Opcode> for Pattern {
    fn from(opcode: Opcode) -> Self { Self::Op(opcode) }
}

/* ─────────────────────────── Compiled form ─────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct OpSet([u64; 4]);

impl OpSet {
    const ALL: Self = Self([u64::MAX; 4]);

    fn single(opcode: Opcode) -> Self {
        let mut set = Self::default();
        let byte = opcode as u8;
        set.0[usize::from(byte / 64)] |= 1 << (byte % 64);
        set
    }

    fn contains(self, opcode: Opcode) -> bool {
        let byte = opcode as u8;
        self.0[usize::from(byte / 64)] & (1 << (byte % 64)) != 0
    }

    fn union(self, other: Self) -> Self {
        Self([self.0[0] | other.0[0], self.0[1] | other.0[1], self.0[2] | other.0[2], self.0[3] | other.0[3]])
    }

    fn complement(self) -> Self { Self([!self.0[0], !self.0[1], !self.0[2], !self.0[3]]) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Class(OpSet),
    Seq(Vec<Node>),
    Alt(Vec<Node>),
    Repeat { node: Box<Node>, min: usize, max: Option<usize> },
}

fn lower(pattern: &Pattern) -> Result<Node, PatternError> {
    Ok(match pattern {
        Pattern::Op(opcode) => Node::Class(OpSet::single(*opcode)),
        Pattern::Any => Node::Class(OpSet::ALL),
        Pattern::Not(inner) => match lower(inner)? {
            Node::Class(set) => Node::Class(set.complement()),
            _ => return Err(PatternError::NegatedRun),
        },
        Pattern::Seq(parts) => {
            let mut nodes = parts.iter().map(lower).collect::<Result<Vec<_>, _>>()?;
            match nodes.len() {
                0 => return Err(PatternError::EmptySequence),
                1 => nodes.remove(0),
                _ => Node::Seq(nodes),
            }
        }
        Pattern::Or(alternatives) => {
            let mut nodes = alternatives.iter().map(lower).collect::<Result<Vec<_>, _>>()?;
            if nodes.is_empty() {
                return Err(PatternError::EmptyAlternation);
            }
            let classes: Option<Vec<OpSet>> =
                nodes.iter().map(|n| if let Node::Class(set) = n { Some(*set) } else { None }).collect();
            match classes {
                Some(sets) => Node::Class(sets.into_iter().fold(OpSet::default(), OpSet::union)),
                None if nodes.len() == 1 => nodes.remove(0),
                None => Node::Alt(nodes),
            }
        }
        Pattern::Repeat { inner, min, max } => {
            if let Some(max) = *max {
                if *min > max {
                    return Err(PatternError::InvertedRange { min: *min, max });
                }
                if max == 0 {
                    return Err(PatternError::ZeroRepeat);
                }
            }
            Node::Repeat { node: Box::new(lower(inner)?), min: *min, max: *max }
        }
    })
}

impl Node {
    /// Every window position at which a match starting at `start` can end.
    fn ends(&self, window: &[Opcode], start: usize) -> BTreeSet<usize> {
        match self {
            Self::Class(set) => {
                window.get(start).filter(|opcode| set.contains(**opcode)).map(|_| start + 1).into_iter().collect()
            }
            Self::Seq(nodes) => nodes.iter().fold(BTreeSet::from([start]), |positions, node| {
                positions.iter().flat_map(|&p| node.ends(window, p)).collect()
            }),
            Self::Alt(nodes) => nodes.iter().flat_map(|node| node.ends(window, start)).collect(),
            Self::Repeat { node, min, max } => {
                let mut out = BTreeSet::new();
                if *min == 0 {
                    out.insert(start);
                }
                let mut frontier = BTreeSet::from([start]);
                let mut seen = BTreeSet::new();
                let mut count = 0;
                while max.map_or(true, |max| count < max) {
                    count += 1;
                    let next: BTreeSet<usize> = frontier.iter().flat_map(|&p| node.ends(window, p)).collect();
                    if count < *min {
                        if next.is_empty() {
                            break;
                        }
                        frontier = next;
                        continue;
                    }
                    out.extend(next.iter().copied());
                    let fresh: BTreeSet<usize> = next.difference(&seen).copied().collect();
                    seen.extend(next);
                    if fresh.is_empty() {
                        break;
                    }
                    frontier = fresh;
                }
                out
            }
        }
    }
}

/// Compiled, immutable form of a [`Pattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    root: Node,
}

impl Matcher {
    /// Length of the longest run matched at the start of `window`.
    ///
    /// Zero-length matches are reported as no match.
    pub fn longest_match(&self, window: &[Opcode]) -> Option<usize> {
        self.root.ends(window, 0).last().copied().filter(|&len| len > 0)
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use Opcode::{BINARY_ADD, LOAD_CONST, LOAD_FAST, NOP, POP_TOP, RETURN_VALUE};

    fn m(p: Pattern) -> Matcher { p.compile().unwrap() }

    #[test]
    fn single_and_sequence() {
        let window = [LOAD_FAST, LOAD_CONST, BINARY_ADD, RETURN_VALUE];
        assert_eq!(m(op(LOAD_FAST)).longest_match(&window), Some(1));
        assert_eq!(m(op(LOAD_CONST)).longest_match(&window), None);
        assert_eq!(m(seq([op(LOAD_FAST), any(), op(BINARY_ADD)])).longest_match(&window), Some(3));
        assert_eq!(m(seq([op(LOAD_FAST), op(BINARY_ADD)])).longest_match(&window), None);
    }

    #[test]
    fn alternation_flattens_and_lowers() {
        let p = op(LOAD_FAST) | op(LOAD_CONST) | (op(NOP) | op(POP_TOP));
        let Pattern::Or(items) = &p else { panic!("expected an alternation") };
        assert_eq!(items.len(), 4);
        assert!(matches!(p.compile().unwrap().root, Node::Class(_)));
        assert_eq!(or([op(NOP)]), Pattern::Or(vec![op(NOP)]));
    }

    #[test]
    fn negation_of_a_class() {
        let window = [NOP, RETURN_VALUE];
        assert_eq!(m(!op(RETURN_VALUE)).longest_match(&window), Some(1));
        assert_eq!(m(!(op(NOP) | op(POP_TOP))).longest_match(&window), None);
        assert_eq!(m((!op(RETURN_VALUE)).star()).longest_match(&[NOP, NOP, RETURN_VALUE]), Some(2));
    }

    #[test]
    fn quantifiers_take_the_longest_run() {
        let window = [NOP, NOP, NOP, POP_TOP];
        assert_eq!(m(op(NOP).star()).longest_match(&window), Some(3));
        assert_eq!(m(op(NOP).plus()).longest_match(&window), Some(3));
        assert_eq!(m(op(NOP).exactly(2)).longest_match(&window), Some(2));
        assert_eq!(m(op(NOP).exactly(4)).longest_match(&window), None);
        assert_eq!(m(op(NOP).at_least(3)).longest_match(&window), Some(3));
        assert_eq!(m(op(NOP).between(1, 2)).longest_match(&window), Some(2));
        assert_eq!(m(seq([op(NOP).optional(), op(NOP), op(POP_TOP)])).longest_match(&window[1..]), Some(3));
        assert_eq!(m(seq([op(NOP).star(), op(POP_TOP)])).longest_match(&window), Some(4));
    }

    #[test]
    fn longest_alternative_wins() {
        let p = or([op(NOP), seq([op(NOP), op(NOP)])]);
        assert_eq!(m(p).longest_match(&[NOP, NOP]), Some(2));
    }

    #[test]
    fn zero_length_is_no_match() {
        assert_eq!(m(op(NOP).star()).longest_match(&[POP_TOP]), None);
        assert_eq!(m(op(NOP).optional()).longest_match(&[]), None);
        assert_eq!(m(op(NOP).optional().star()).longest_match(&[NOP, NOP]), Some(2));
    }

    #[test]
    fn invalid_patterns() {
        assert_eq!(seq([]).compile().unwrap_err(), PatternError::EmptySequence);
        assert_eq!(or([]).compile().unwrap_err(), PatternError::EmptyAlternation);
        assert_eq!(op(NOP).between(3, 1).compile().unwrap_err(), PatternError::InvertedRange { min: 3, max: 1 });
        assert_eq!(op(NOP).exactly(0).compile().unwrap_err(), PatternError::ZeroRepeat);
        assert_eq!((!seq([op(NOP), op(NOP)])).compile().unwrap_err(), PatternError::NegatedRun);
    }
}
