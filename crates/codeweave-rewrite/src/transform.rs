//! The rewrite dispatcher.
//!
//! A pass first rewrites every distinct nested unit found among the constants,
//! depth first and once each, then scans the instruction sequence left to right. At each position
//! the first rule (in priority order, among those active in the current mode)
//! whose pattern matches wins: its handler's output is spliced in and the scan
//! resumes after the matched source run. Unmatched instructions are copied.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use codeweave_core::{Const, Encoding, RawCode};
use codeweave_ir::{
    decode, encode, Code, CodeParts, ConstructionError, DecodeError, EncodeError, EncodeOptions, InstrId,
    Instruction, Operand, PeepholeOptimizer,
};
use codeweave_ops::Opcode;
use thiserror::Error;

use crate::{
    mode::{Mode, ModeStack},
    pattern::PatternError,
    rules::RuleSet,
};

/// Failures of a rewrite pass.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// Invalid pattern.
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// Invalid instruction or unit built by a handler.
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    /// Nested unit that does not decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Unit that does not encode, e.g. a jump left dangling by a handler.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Handle unknown to the unit's pool.
    #[error("instruction {0} does not belong to this unit")]
    UnknownInstr(InstrId),
    /// Error raised by a handler.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// Name and filename overrides for the rewritten unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// New routine name.
    pub name: Option<String>,
    /// New source file.
    pub filename: Option<String>,
}

/// Encoding knobs used whenever the transformer re-encodes a unit.
#[derive(Clone, Default)]
pub struct TransformOptions {
    /// Output encoding; the unit's own when `None`.
    pub encoding: Option<Encoding>,
    /// Peephole pass run on every encoded unit.
    pub optimizer: Option<Arc<dyn PeepholeOptimizer + Send + Sync>>,
}

impl TransformOptions {
    fn encode_options(&self) -> EncodeOptions<'_> {
        EncodeOptions {
            encoding: self.encoding,
            optimizer: self.optimizer.as_deref().map(|o| o as &dyn PeepholeOptimizer),
        }
    }
}

impl fmt::Debug for TransformOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformOptions")
            .field("encoding", &self.encoding)
            .field("optimizer", &self.optimizer.is_some())
            .finish()
    }
}

/// Owns a rule set, user state and the mode stack of its passes.
///
/// Passes need `&mut self`; threads share a [`RuleSet`] and build one
/// transformer each.
pub struct Transformer<S = ()> {
    rules: RuleSet<S>,
    state: S,
    modes: ModeStack,
    options: TransformOptions,
}

impl<S> Transformer<S> {
    /// Transformer over `rules` with initial `state`.
    pub const fn new(rules: RuleSet<S>, state: S) -> Self {
        Self { rules, state, modes: ModeStack::new(), options: TransformOptions { encoding: None, optimizer: None } }
    }

    /// Replaces the encoding options.
    #[must_use]
    pub fn with_options(mut self, options: TransformOptions) -> Self {
        self.options = options;
        self
    }

    /// Rules in use.
    pub const fn rules(&self) -> &RuleSet<S> { &self.rules }

    /// User state.
    pub const fn state(&self) -> &S { &self.state }

    /// User state, mutably.
    pub fn state_mut(&mut self) -> &mut S { &mut self.state }

    /// Gives the state back.
    pub fn into_state(self) -> S { self.state }

    /// Passes in progress; zero between calls.
    pub fn depth(&self) -> usize { self.modes.depth() }

    /// Rewrites `code`, keeping its name and filename.
    pub fn transform(&mut self, code: &Code) -> Result<Code, RewriteError> {
        self.transform_with(code, &Overrides::default())
    }

    /// Rewrites `code`, applying `overrides` to the result.
    #[tracing::instrument(level = "debug", skip_all, fields(name = %code.name(), instrs = code.len()))]
    pub fn transform_with(&mut self, code: &Code, overrides: &Overrides) -> Result<Code, RewriteError> {
        run_pass(&self.rules, &mut self.state, &mut self.modes, &self.options, code, overrides)
    }

    /// Decodes `raw`, rewrites it and encodes the result.
    pub fn transform_raw(&mut self, raw: &RawCode, encoding: Encoding) -> Result<RawCode, RewriteError> {
        let code = decode(raw, encoding)?;
        let out = self.transform(&code)?;
        Ok(encode(&out, &self.options.encode_options())?)
    }
}

impl<S> fmt::Debug for Transformer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("rules", &self.rules.names())
            .field("depth", &self.modes.depth())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn run_pass<S>(
    rules: &RuleSet<S>,
    state: &mut S,
    modes: &mut ModeStack,
    options: &TransformOptions,
    code: &Code,
    overrides: &Overrides,
) -> Result<Code, RewriteError> {
    let mut guard = modes.enter();
    let mut parts = code.clone().into_parts();

    // nested units arrive in the parent's encoding and leave in the target one
    let source_encoding = parts.encoding;
    parts.encoding = options.encoding.unwrap_or(source_encoding);

    let mut done: HashMap<Const, Const> = HashMap::new();
    for id in parts.instrs.clone() {
        let Some(Operand::Const(original)) = parts.pool.get(id).map(Instruction::operand).cloned() else { continue };
        let Const::Code(raw) = &original else { continue };
        let replacement = if let Some(seen) = done.get(&original) {
            seen.clone()
        } else {
            tracing::debug!(parent = %parts.name, nested = %raw.name, "rewriting nested unit");
            let rewritten = rewrite_nested(rules, state, &mut *guard, options, raw, source_encoding)?;
            let rewritten = Const::Code(Box::new(rewritten));
            done.insert(original.clone(), rewritten.clone());
            rewritten
        };
        parts.pool.replace_operand(id, Operand::Const(replacement))?;
    }

    let source = parts.instrs.clone();
    let opcodes: Vec<Opcode> = source.iter().map(|&id| parts.pool[id].opcode()).collect();
    let mut out = Vec::with_capacity(source.len());
    let mut pos = 0;
    while pos < source.len() {
        let mode = guard.current();
        let hit = rules
            .iter()
            .filter(|rule| rule.applies_in(mode))
            .find_map(|rule| rule.matcher().longest_match(&opcodes[pos..]).map(|len| (rule, len)));
        let Some((rule, len)) = hit else {
            out.push(source[pos]);
            pos += 1;
            continue;
        };

        let matched = &source[pos..pos + len];
        tracing::debug!(rule = rule.name(), at = pos, len, %mode, "match");
        let replacement = {
            let mut rw = Rewrite { parts: &mut parts, state: &mut *state, modes: &mut *guard, rules, options };
            (rule.handler())(&mut rw, matched)?
        };
        carry_line(&mut parts, matched, &replacement);
        out.extend(replacement);
        pos += len;
    }

    parts.instrs = out;
    if let Some(name) = &overrides.name {
        parts.name.clone_from(name);
    }
    if let Some(filename) = &overrides.filename {
        parts.filename.clone_from(filename);
    }
    let code = Code::new(parts)?;
    tracing::debug!(instrs = code.len(), "pass done");
    Ok(code)
}

fn rewrite_nested<S>(
    rules: &RuleSet<S>,
    state: &mut S,
    modes: &mut ModeStack,
    options: &TransformOptions,
    raw: &RawCode,
    encoding: Encoding,
) -> Result<RawCode, RewriteError> {
    let code = decode(raw, encoding)?;
    let out = run_pass(rules, state, modes, options, &code, &Overrides::default())?;
    Ok(encode(&out, &options.encode_options())?)
}

/// Gives the first replacement the line of the first matched instruction
/// when that instruction is dropped without being stolen.
fn carry_line(parts: &mut CodeParts, matched: &[InstrId], replacement: &[InstrId]) {
    let (Some(&first), Some(&head)) = (matched.first(), replacement.first()) else { return };
    if replacement.contains(&first) || parts.pool.stolen_by(first).is_some() {
        return;
    }
    if let Some(&line) = parts.lines.get(&first) {
        parts.lines.entry(head).or_insert(line);
    }
}

/* ─────────────────────────── Handler context ─────────────────────────── */

/// What a handler sees while its rule fires.
pub struct Rewrite<'r, S> {
    parts: &'r mut CodeParts,
    state: &'r mut S,
    modes: &'r mut ModeStack,
    rules: &'r RuleSet<S>,
    options: &'r TransformOptions,
}

impl<S> Rewrite<'_, S> {
    /// Transformer state.
    pub fn state(&self) -> &S { &*self.state }

    /// Transformer state, mutably.
    pub fn state_mut(&mut self) -> &mut S { &mut *self.state }

    /// Unit under rewrite; `instrs` is the sequence as it was before the pass.
    pub fn code(&self) -> &CodeParts { &*self.parts }

    /// Instruction behind `id`.
    pub fn instr(&self, id: InstrId) -> Result<&Instruction, RewriteError> {
        self.parts.pool.get(id).ok_or(RewriteError::UnknownInstr(id))
    }

    /// Opcode of `id`.
    pub fn opcode(&self, id: InstrId) -> Result<Opcode, RewriteError> { self.instr(id).map(Instruction::opcode) }

    /// Operand of `id`.
    pub fn operand(&self, id: InstrId) -> Result<&Operand, RewriteError> { self.instr(id).map(Instruction::operand) }

    /// Line started by `id`, if any.
    pub fn line(&self, id: InstrId) -> Option<u32> { self.parts.lines.get(&id).copied() }

    /// Marks `id` as starting `line`.
    pub fn set_line(&mut self, id: InstrId, line: u32) { self.parts.lines.insert(id, line); }

    /// Creates `opcode operand`; the handler decides where it goes.
    pub fn emit(&mut self, opcode: Opcode, operand: impl Into<Operand>) -> Result<InstrId, RewriteError> {
        self.emit_with(Instruction::new(opcode, operand.into())?)
    }

    /// Adds a prepared instruction to the pool.
    pub fn emit_with(&mut self, instr: Instruction) -> Result<InstrId, RewriteError> {
        Ok(self.parts.pool.insert(instr)?)
    }

    /// `LOAD_CONST value`.
    pub fn load_const(&mut self, value: Const) -> Result<InstrId, RewriteError> {
        self.emit(Opcode::LOAD_CONST, value)
    }

    /// Jump instruction to `target`.
    pub fn jump(&mut self, opcode: Opcode, target: InstrId) -> Result<InstrId, RewriteError> {
        self.emit(opcode, Operand::Jump(target))
    }

    /// Moves every jump into `victim` onto `thief`.
    pub fn steal(&mut self, thief: InstrId, victim: InstrId) -> Result<(), RewriteError> {
        Ok(self.parts.pool.steal(thief, victim)?)
    }

    /// Switches the pass to `mode` for the rest of its scan.
    pub fn begin(&mut self, mode: Mode) {
        tracing::trace!(%mode, "begin");
        self.modes.set_current(mode);
    }

    /// Current mode.
    pub fn mode(&self) -> Mode { self.modes.current() }

    /// Runs the same rules over a nested unit and returns it re-encoded.
    pub fn transform_nested(&mut self, raw: &RawCode) -> Result<RawCode, RewriteError> {
        rewrite_nested(self.rules, self.state, self.modes, self.options, raw, self.parts.encoding)
    }
}

impl<S> fmt::Debug for Rewrite<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rewrite")
            .field("unit", &self.parts.name)
            .field("mode", &self.modes.current())
            .finish_non_exhaustive()
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{op, seq};
    use codeweave_ir::CodeBuilder;
    use pretty_assertions::assert_eq;

    fn unit() -> Code {
        let mut b = CodeBuilder::new();
        b.name("f").args(["a"]).unwrap();
        b.line(1).push(Opcode::LOAD_FAST, Operand::Local("a".into())).unwrap();
        b.line(2).push_bare(Opcode::UNARY_NEGATIVE).unwrap();
        b.push_bare(Opcode::RETURN_VALUE).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn no_rules_copies_the_unit() {
        let code = unit();
        let out = Transformer::new(RuleSet::<()>::new(), ()).transform(&code).unwrap();
        assert_eq!(out.opcodes(), code.opcodes());
        assert_eq!(out.to_raw().unwrap(), code.to_raw().unwrap());
    }

    #[test]
    fn dropped_instruction_passes_its_line_on() {
        let mut rules = RuleSet::new();
        rules
            .rule("neg_to_not", op(Opcode::UNARY_NEGATIVE), |rw: &mut Rewrite<'_, ()>, _: &[InstrId]| {
                Ok(vec![rw.emit(Opcode::UNARY_NOT, Operand::None)?])
            })
            .unwrap();
        let code = unit();
        let out = Transformer::new(rules, ()).transform(&code).unwrap();
        assert_eq!(out.opcodes(), vec![Opcode::LOAD_FAST, Opcode::UNARY_NOT, Opcode::RETURN_VALUE]);
        assert_eq!(out.line_of(out.instrs()[1]), Some(2));
        assert_eq!(code.opcodes()[1], Opcode::UNARY_NEGATIVE);
    }

    #[test]
    fn overrides_and_state() {
        let mut rules = RuleSet::new();
        rules
            .rule("count", seq([op(Opcode::LOAD_FAST), op(Opcode::UNARY_NEGATIVE)]), |rw: &mut Rewrite<'_, usize>, m: &[InstrId]| {
                *rw.state_mut() += 1;
                Ok(m.to_vec())
            })
            .unwrap();
        let mut t = Transformer::new(rules, 0usize);
        let overrides = Overrides { name: Some("g".into()), filename: Some("g.src".into()) };
        let out = t.transform_with(&unit(), &overrides).unwrap();
        assert_eq!((out.name(), out.filename()), ("g", "g.src"));
        assert_eq!(*t.state(), 1);
        assert_eq!(t.depth(), 0);
    }

    #[test]
    fn handler_errors_surface() {
        let mut rules = RuleSet::new();
        rules
            .rule("boom", op(Opcode::RETURN_VALUE), |_: &mut Rewrite<'_, ()>, _: &[InstrId]| {
                Err(anyhow::anyhow!("refused").into())
            })
            .unwrap();
        let mut t = Transformer::new(rules, ());
        let err = t.transform(&unit()).unwrap_err();
        assert!(matches!(err, RewriteError::Handler(_)));
        assert_eq!(err.to_string(), "refused");
        assert_eq!(t.depth(), 0);
    }
}
