//! Rules and rule sets.

use std::fmt;
use std::sync::Arc;

use codeweave_ir::InstrId;
use smallvec::SmallVec;

use crate::{
    mode::Mode,
    pattern::{Matcher, Pattern, PatternError},
    transform::{Rewrite, RewriteError},
};

/// Replacement callback: receives the matched run, returns the handles to
/// splice in its place (possibly empty, possibly reusing matched handles).
pub type Handler<S> =
    Arc<dyn Fn(&mut Rewrite<'_, S>, &[InstrId]) -> Result<Vec<InstrId>, RewriteError> + Send + Sync>;

/// Named `(pattern, modes, handler)` triple.
pub struct Rule<S> {
    name: String,
    pattern: Pattern,
    matcher: Matcher,
    modes: SmallVec<[Mode; 2]>,
    handler: Handler<S>,
}

impl<S> Rule<S> {
    /// Compiles `pattern`; the rule is active in [`Mode::DEFAULT`] only.
    pub fn new<F>(name: impl Into<String>, pattern: Pattern, handler: F) -> Result<Self, PatternError>
    where
        F: Fn(&mut Rewrite<'_, S>, &[InstrId]) -> Result<Vec<InstrId>, RewriteError> + Send + Sync + 'static,
    {
        let matcher = pattern.compile()?;
        Ok(Self {
            name: name.into(),
            pattern,
            matcher,
            modes: SmallVec::from_elem(Mode::DEFAULT, 1),
            handler: Arc::new(handler),
        })
    }

    /// Replaces the modes the rule is active in.
    #[must_use]
    pub fn in_modes(mut self, modes: impl IntoIterator<Item = Mode>) -> Self {
        self.modes = modes.into_iter().collect();
        self
    }

    /// Rule name, the key for overriding.
    pub fn name(&self) -> &str { &self.name }

    /// Source pattern.
    pub const fn pattern(&self) -> &Pattern { &self.pattern }

    /// Compiled pattern.
    pub const fn matcher(&self) -> &Matcher { &self.matcher }

    /// Modes the rule is active in.
    pub fn modes(&self) -> &[Mode] { &self.modes }

    /// True when the rule may fire in `mode`.
    pub fn applies_in(&self, mode: Mode) -> bool { self.modes.contains(&mode) }

    pub(crate) fn handler(&self) -> &Handler<S> { &self.handler }
}

impl<S> fmt::Debug for Rule<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("modes", &self.modes)
            .finish_non_exhaustive()
    }
}

/// Ordered rules; declaration order is match priority.
///
/// Cloning shares the rules.
pub struct RuleSet<S> {
    rules: Vec<Arc<Rule<S>>>,
}

impl<S> RuleSet<S> {
    /// Empty set.
    pub const fn new() -> Self { Self { rules: Vec::new() } }

    /// Appends `rule`, or replaces in place the rule already named like it.
    pub fn add(&mut self, rule: Rule<S>) -> &mut Self {
        let rule = Arc::new(rule);
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(slot) => *slot = rule,
            None => self.rules.push(rule),
        }
        self
    }

    /// Compiles and adds a default-mode rule.
    pub fn rule<F>(&mut self, name: impl Into<String>, pattern: Pattern, handler: F) -> Result<&mut Self, PatternError>
    where
        F: Fn(&mut Rewrite<'_, S>, &[InstrId]) -> Result<Vec<InstrId>, RewriteError> + Send + Sync + 'static,
    {
        Ok(self.add(Rule::new(name, pattern, handler)?))
    }

    /// Inherits from `base`: own rules keep priority, and base rules whose
    /// name is already declared here are dropped.
    pub fn extend(&mut self, base: &Self) -> &mut Self {
        let inherited: Vec<_> =
            base.rules.iter().filter(|r| self.get(&r.name).is_none()).map(Arc::clone).collect();
        self.rules.extend(inherited);
        self
    }

    /// Rule named `name`.
    pub fn get(&self, name: &str) -> Option<&Rule<S>> {
        self.rules.iter().find(|r| r.name == name).map(AsRef::as_ref)
    }

    /// Rules in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule<S>> + '_ { self.rules.iter().map(AsRef::as_ref) }

    /// Rule names in priority order.
    pub fn names(&self) -> Vec<&str> { self.iter().map(Rule::name).collect() }

    /// Number of rules.
    pub fn len(&self) -> usize { self.rules.len() }

    /// True when empty.
    pub fn is_empty(&self) -> bool { self.rules.is_empty() }
}

impl<S> Default for RuleSet<S> {
    fn default() -> Self { Self::new() }
}

impl<S> Clone for RuleSet<S> {
    fn clone(&self) -> Self { Self { rules: self.rules.clone() } }
}

impl<S> fmt::Debug for RuleSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_list().entries(self.iter()).finish() }
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::op;
    use codeweave_ops::Opcode;
    use pretty_assertions::assert_eq;

    fn keep(_: &mut Rewrite<'_, ()>, matched: &[InstrId]) -> Result<Vec<InstrId>, RewriteError> {
        Ok(matched.to_vec())
    }

    #[test]
    fn same_name_replaces_in_place() {
        let mut set = RuleSet::new();
        set.rule("a", op(Opcode::NOP), keep).unwrap();
        set.rule("b", op(Opcode::POP_TOP), keep).unwrap();
        set.rule("a", op(Opcode::ROT_TWO), keep).unwrap();
        assert_eq!(set.names(), vec!["a", "b"]);
        assert_eq!(set.get("a").unwrap().pattern(), &op(Opcode::ROT_TWO));
    }

    #[test]
    fn extend_prefers_own_rules() {
        let mut base = RuleSet::new();
        base.rule("shared", op(Opcode::NOP), keep).unwrap();
        base.rule("base_only", op(Opcode::POP_TOP), keep).unwrap();

        let mut derived = RuleSet::new();
        derived.rule("own", op(Opcode::DUP_TOP), keep).unwrap();
        derived.rule("shared", op(Opcode::ROT_TWO), keep).unwrap();
        derived.extend(&base);

        assert_eq!(derived.names(), vec!["own", "shared", "base_only"]);
        assert_eq!(derived.get("shared").unwrap().pattern(), &op(Opcode::ROT_TWO));
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn modes_gate_rules() {
        let rule: Rule<()> = Rule::new("r", op(Opcode::NOP), keep).unwrap().in_modes([Mode(1), Mode(3)]);
        assert!(!rule.applies_in(Mode::DEFAULT));
        assert!(rule.applies_in(Mode(3)));
        assert!(Rule::<()>::new("bad", crate::pattern::seq([]), keep).is_err());
    }
}
