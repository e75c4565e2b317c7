//! Code units: an ordered instruction sequence plus metadata.
//!
//! Constants, names and local variable names are not stored. They are
//! derived from the instruction operands every time the unit is encoded:
//!
//! - constants: first-seen order of constant operands,
//! - names: sorted, deduplicated name operands,
//! - varnames: argument names, then sorted local operands that are not arguments.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use codeweave_core::{CodeFlags, Const, Encoding};
use codeweave_ops::Opcode;
use indexmap::IndexSet;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    error::ConstructionError,
    instr::{InstrId, InstrPool, Instruction, Operand},
};

/* ─────────────────────────── Signature ─────────────────────────── */

/// Argument-name layout of a routine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Signature {
    /// Positional parameters.
    pub positional: Vec<String>,
    /// `*name` parameter.
    pub varargs: Option<String>,
    /// Keyword-only parameters.
    pub kwonly: Vec<String>,
    /// `**name` parameter.
    pub varkw: Option<String>,
}

impl Signature {
    /// Parses the textual form, e.g. `["a", "*args", "k", "**kw"]`.
    ///
    /// Names after `*x` (or a bare `*`) are keyword-only.
    pub fn parse<I, S>(names: I) -> Result<Self, ConstructionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sig = Self::default();
        let mut star_seen = false;
        for name in names {
            let name = name.as_ref();
            if let Some(rest) = name.strip_prefix("**") {
                if sig.varkw.is_some() {
                    return Err(ConstructionError::DuplicateVarkw(name.to_owned()));
                }
                sig.varkw = Some(rest.to_owned());
                continue;
            }
            if sig.varkw.is_some() {
                return Err(ConstructionError::ArgAfterVarkw(name.to_owned()));
            }
            if let Some(rest) = name.strip_prefix('*') {
                if star_seen {
                    return Err(ConstructionError::DuplicateVarargs(name.to_owned()));
                }
                star_seen = true;
                if !rest.is_empty() {
                    sig.varargs = Some(rest.to_owned());
                }
            } else if star_seen {
                sig.kwonly.push(name.to_owned());
            } else {
                sig.positional.push(name.to_owned());
            }
        }
        Ok(sig)
    }

    /// Rebuilds the layout from raw counts, flags and the variable table.
    pub(crate) fn from_layout(
        argcount: usize,
        kwonly: usize,
        flags: CodeFlags,
        varnames: &[String],
    ) -> Result<Self, (usize, usize)> {
        let varargs = flags.contains(CodeFlags::VARARGS);
        let varkw = flags.contains(CodeFlags::VARKEYWORDS);
        let needed = argcount + kwonly + usize::from(varargs) + usize::from(varkw);
        if varnames.len() < needed {
            return Err((needed, varnames.len()));
        }
        let mut it = varnames.iter().cloned();
        let positional = it.by_ref().take(argcount).collect();
        let kwonly = it.by_ref().take(kwonly).collect();
        Ok(Self {
            positional,
            kwonly,
            varargs: if varargs { it.next() } else { None },
            varkw: if varkw { it.next() } else { None },
        })
    }

    /// Textual form accepted by [`Signature::parse`].
    pub fn argnames(&self) -> Vec<String> {
        let mut out = self.positional.clone();
        match &self.varargs {
            Some(v) => out.push(format!("*{v}")),
            None if !self.kwonly.is_empty() => out.push("*".to_owned()),
            None => {}
        }
        out.extend(self.kwonly.iter().cloned());
        if let Some(k) = &self.varkw {
            out.push(format!("**{k}"));
        }
        out
    }

    /// Parameter names in variable-slot order: positional, keyword-only, `*`, `**`.
    pub fn varnames(&self) -> impl Iterator<Item = &str> + '_ {
        self.positional
            .iter()
            .chain(&self.kwonly)
            .chain(&self.varargs)
            .chain(&self.varkw)
            .map(String::as_str)
    }

    /// Positional parameter count.
    pub fn argcount(&self) -> usize { self.positional.len() }

    /// Keyword-only parameter count.
    pub fn kwonlyargcount(&self) -> usize { self.kwonly.len() }
}

/* ─────────────────────────── Code ─────────────────────────── */

/// Everything a [`Code`] is built from.
#[derive(Debug, Clone, Default)]
pub struct CodeParts {
    /// Arena owning every instruction (live or not).
    pub pool: InstrPool,
    /// Execution order.
    pub instrs: Vec<InstrId>,
    /// Argument layout.
    pub signature: Signature,
    /// Cell variable names.
    pub cellvars: Vec<String>,
    /// Free variable names.
    pub freevars: Vec<String>,
    /// Routine name.
    pub name: String,
    /// Source file.
    pub filename: String,
    /// First source line.
    pub firstlineno: u32,
    /// Instructions that start a new source line.
    pub lines: BTreeMap<InstrId, u32>,
    /// Explicit flags; derived from the body when `None`.
    pub flags: Option<CodeFlags>,
    /// Encoding used when no other is requested.
    pub encoding: Encoding,
}

/// A decoded compiled unit.
#[derive(Debug, Clone)]
pub struct Code {
    parts: CodeParts,
    flags: CodeFlags,
}

impl Code {
    /// Validates `parts` and builds the unit.
    ///
    /// Fails on unknown or repeated instruction handles and on free/cell
    /// operands that name a variable in neither table.
    pub fn new(mut parts: CodeParts) -> Result<Self, ConstructionError> {
        let mut seen = HashSet::with_capacity(parts.instrs.len());
        for &id in &parts.instrs {
            let instr = parts.pool.get(id).ok_or(ConstructionError::UnknownInstr(id))?;
            if !seen.insert(id) {
                return Err(ConstructionError::DuplicateInstr(id));
            }
            if let Operand::Free(name) = instr.operand() {
                if !parts.cellvars.contains(name) && !parts.freevars.contains(name) {
                    return Err(ConstructionError::UnknownFreeVar {
                        opcode: instr.opcode(),
                        name: name.clone(),
                    });
                }
            }
        }
        let flags = match parts.flags {
            Some(flags) => flags,
            None => derive_flags(&parts),
        };
        parts.flags = Some(flags);
        Ok(Self { parts, flags })
    }

    /// Gives the parts back, e.g. to rebuild a rewritten unit.
    pub fn into_parts(self) -> CodeParts { self.parts }

    /// Instruction arena.
    pub const fn pool(&self) -> &InstrPool { &self.parts.pool }

    /// Instruction handles in execution order.
    pub fn instrs(&self) -> &[InstrId] { &self.parts.instrs }

    /// Instruction behind `id`.
    pub fn instr(&self, id: InstrId) -> Option<&Instruction> { self.parts.pool.get(id) }

    /// `(handle, instruction)` pairs in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (InstrId, &Instruction)> + '_ {
        self.parts.instrs.iter().map(|&id| (id, &self.parts.pool[id]))
    }

    /// Opcodes in execution order.
    pub fn opcodes(&self) -> Vec<Opcode> { self.iter().map(|(_, i)| i.opcode()).collect() }

    /// Number of instructions.
    pub fn len(&self) -> usize { self.parts.instrs.len() }

    /// True for an empty body.
    pub fn is_empty(&self) -> bool { self.parts.instrs.is_empty() }

    /// Position of `id` in the sequence.
    pub fn index_of(&self, id: InstrId) -> Option<usize> { self.parts.instrs.iter().position(|&i| i == id) }

    /// Argument layout.
    pub const fn signature(&self) -> &Signature { &self.parts.signature }

    /// Textual argument list.
    pub fn argnames(&self) -> Vec<String> { self.parts.signature.argnames() }

    /// Cell variable names.
    pub fn cellvars(&self) -> &[String] { &self.parts.cellvars }

    /// Free variable names.
    pub fn freevars(&self) -> &[String] { &self.parts.freevars }

    /// Routine name.
    pub fn name(&self) -> &str { &self.parts.name }

    /// Source file.
    pub fn filename(&self) -> &str { &self.parts.filename }

    /// First source line.
    pub const fn firstlineno(&self) -> u32 { self.parts.firstlineno }

    /// Default encoding of the unit.
    pub const fn encoding(&self) -> Encoding { self.parts.encoding }

    /// Flags mask.
    pub const fn flags(&self) -> CodeFlags { self.flags }

    /// Generator flag.
    pub const fn is_generator(&self) -> bool { self.flags.contains(CodeFlags::GENERATOR) }

    /// Coroutine flag.
    pub const fn is_coroutine(&self) -> bool { self.flags.contains(CodeFlags::COROUTINE) }

    /// Iterable-coroutine flag.
    pub const fn is_iterable_coroutine(&self) -> bool { self.flags.contains(CodeFlags::ITERABLE_COROUTINE) }

    /// Nested flag.
    pub const fn is_nested(&self) -> bool { self.flags.contains(CodeFlags::NESTED) }

    /// New-locals flag.
    pub const fn constructs_new_locals(&self) -> bool { self.flags.contains(CodeFlags::NEWLOCALS) }

    /// Ordered-dedup of constant operands.
    pub fn consts(&self) -> IndexSet<Const> {
        self.operands()
            .filter_map(|op| match op {
                Operand::Const(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sorted-dedup of name operands.
    pub fn names(&self) -> IndexSet<String> {
        self.operands()
            .filter_map(|op| match op {
                Operand::Name(n) => Some(n.as_str()),
                _ => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Argument names, then the sorted-dedup of other local operands.
    pub fn varnames(&self) -> IndexSet<String> {
        let mut out: IndexSet<String> = self.parts.signature.varnames().map(str::to_owned).collect();
        let locals: BTreeSet<&str> = self
            .operands()
            .filter_map(|op| match op {
                Operand::Local(n) => Some(n.as_str()),
                _ => None,
            })
            .collect();
        for local in locals {
            if !out.contains(local) {
                out.insert(local.to_owned());
            }
        }
        out
    }

    /// Largest prefix sum of stack effects over the sequence.
    pub fn stacksize(&self) -> u32 {
        let mut depth = 0i64;
        let mut max = 0i64;
        for (_, instr) in self.iter() {
            depth += i64::from(instr.stack_effect());
            max = max.max(depth);
        }
        u32::try_from(max).unwrap_or(u32::MAX)
    }

    /// Raw line starts, keyed by instruction.
    pub const fn lines(&self) -> &BTreeMap<InstrId, u32> { &self.parts.lines }

    /// Line starts of live instructions, in execution order.
    pub fn line_starts(&self) -> Vec<(InstrId, u32)> {
        self.parts
            .instrs
            .iter()
            .filter_map(|id| self.parts.lines.get(id).map(|&line| (*id, line)))
            .collect()
    }

    /// Source line in effect at `id`.
    pub fn line_of(&self, id: InstrId) -> Option<u32> {
        let mut line = self.parts.firstlineno;
        for &cur in &self.parts.instrs {
            if let Some(&l) = self.parts.lines.get(&cur) {
                line = l;
            }
            if cur == id {
                return Some(line);
            }
        }
        None
    }

    fn operands(&self) -> impl Iterator<Item = &Operand> + '_ { self.iter().map(|(_, i)| i.operand()) }
}

fn derive_flags(parts: &CodeParts) -> CodeFlags {
    let mut flags = CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS;
    flags.set(CodeFlags::VARARGS, parts.signature.varargs.is_some());
    flags.set(CodeFlags::VARKEYWORDS, parts.signature.varkw.is_some());
    let body = parts.instrs.iter().filter_map(|&id| parts.pool.get(id));
    let (mut generator, mut uses_free) = (false, false);
    for instr in body {
        generator |= instr.opcode().is_yield();
        uses_free |= instr.opcode().uses_free();
    }
    flags.set(CodeFlags::GENERATOR, generator);
    flags.set(CodeFlags::NOFREE, !uses_free);
    flags
}

/* ─────────────────────────── Builder ─────────────────────────── */

/// Forward jump target; resolved to the next pushed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(InstrId);

impl Label {
    /// Placeholder handle to use as a jump operand.
    pub const fn id(self) -> InstrId { self.0 }
}

/// Programmatic construction of a [`Code`].
#[derive(Debug, Default)]
pub struct CodeBuilder {
    parts: CodeParts,
    pending_labels: Vec<Label>,
    pending_line: Option<u32>,
}

impl CodeBuilder {
    /// Empty builder (`<code>`, `<codeweave>`, first line 1).
    pub fn new() -> Self {
        Self {
            parts: CodeParts {
                name: "<code>".to_owned(),
                filename: "<codeweave>".to_owned(),
                firstlineno: 1,
                ..CodeParts::default()
            },
            ..Self::default()
        }
    }

    /// Routine name.
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.parts.name = name.into();
        self
    }

    /// Source file.
    pub fn filename(&mut self, filename: impl Into<String>) -> &mut Self {
        self.parts.filename = filename.into();
        self
    }

    /// First source line.
    pub fn firstlineno(&mut self, line: u32) -> &mut Self {
        self.parts.firstlineno = line;
        self
    }

    /// Encoding recorded on the unit.
    pub fn encoding(&mut self, encoding: Encoding) -> &mut Self {
        self.parts.encoding = encoding;
        self
    }

    /// Explicit flags (otherwise derived).
    pub fn flags(&mut self, flags: CodeFlags) -> &mut Self {
        self.parts.flags = Some(flags);
        self
    }

    /// Argument layout in textual form.
    pub fn args<I, S>(&mut self, names: I) -> Result<&mut Self, ConstructionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.parts.signature = Signature::parse(names)?;
        Ok(self)
    }

    /// Cell variable names.
    pub fn cellvars<I: IntoIterator<Item = S>, S: Into<String>>(&mut self, names: I) -> &mut Self {
        self.parts.cellvars = names.into_iter().map(Into::into).collect();
        self
    }

    /// Free variable names.
    pub fn freevars<I: IntoIterator<Item = S>, S: Into<String>>(&mut self, names: I) -> &mut Self {
        self.parts.freevars = names.into_iter().map(Into::into).collect();
        self
    }

    /// Next pushed instruction starts `line`.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.pending_line = Some(line);
        self
    }

    /// Fresh, unplaced label.
    pub fn label(&mut self) -> Result<Label, ConstructionError> {
        let placeholder = self.parts.pool.insert(Instruction::bare(Opcode::NOP)?)?;
        Ok(Label(placeholder))
    }

    /// Binds `label` to the next pushed instruction.
    pub fn place(&mut self, label: Label) -> &mut Self {
        self.pending_labels.push(label);
        self
    }

    /// Appends `opcode operand`.
    pub fn push(&mut self, opcode: Opcode, operand: impl Into<Operand>) -> Result<InstrId, ConstructionError> {
        self.push_instr(Instruction::new(opcode, operand.into())?)
    }

    /// Appends an instruction without operand.
    pub fn push_bare(&mut self, opcode: Opcode) -> Result<InstrId, ConstructionError> {
        self.push(opcode, Operand::None)
    }

    /// Appends a prepared instruction.
    ///
    /// A jump to an already placed label is redirected to the instruction the
    /// label resolved to.
    pub fn push_instr(&mut self, instr: Instruction) -> Result<InstrId, ConstructionError> {
        let instr = match instr.jump_target() {
            Some(target) => Instruction::new(instr.opcode(), Operand::Jump(self.parts.pool.resolve(target)))?,
            None => instr,
        };
        let id = self.parts.pool.insert(instr)?;
        for label in self.pending_labels.drain(..) {
            self.parts.pool.steal(id, label.0)?;
        }
        if let Some(line) = self.pending_line.take() {
            self.parts.lines.insert(id, line);
        }
        self.parts.instrs.push(id);
        Ok(id)
    }

    /// Finishes the unit.
    pub fn build(&mut self) -> Result<Code, ConstructionError> {
        if !self.pending_labels.is_empty() {
            return Err(ConstructionError::TrailingLabel);
        }
        Code::new(core::mem::take(&mut self.parts))
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn signature_parse_and_layout() {
        let sig = Signature::parse(["a", "b", "*args", "k", "**kw"]).unwrap();
        assert_eq!(sig.positional, vec!["a", "b"]);
        assert_eq!(sig.varargs.as_deref(), Some("args"));
        assert_eq!(sig.kwonly, vec!["k"]);
        assert_eq!(sig.varkw.as_deref(), Some("kw"));
        assert_eq!(sig.varnames().collect::<Vec<_>>(), vec!["a", "b", "k", "args", "kw"]);
        assert_eq!(sig.argnames(), vec!["a", "b", "*args", "k", "**kw"]);

        let bare_star = Signature::parse(["a", "*", "k"]).unwrap();
        assert_eq!(bare_star.varargs, None);
        assert_eq!(bare_star.argnames(), vec!["a", "*", "k"]);
    }

    #[test]
    fn signature_rejects_duplicates() {
        assert_eq!(
            Signature::parse(["*a", "*b"]),
            Err(ConstructionError::DuplicateVarargs("*b".into()))
        );
        assert_eq!(Signature::parse(["**a", "b"]), Err(ConstructionError::ArgAfterVarkw("b".into())));
        assert_eq!(Signature::parse(["**a", "**b"]), Err(ConstructionError::DuplicateVarkw("**b".into())));
    }

    #[test]
    fn derived_tables() {
        let mut b = CodeBuilder::new();
        b.args(["x"]).unwrap();
        b.push(Opcode::LOAD_CONST, Const::Int(2)).unwrap();
        b.push(Opcode::LOAD_GLOBAL, Operand::Name("zeta".into())).unwrap();
        b.push(Opcode::LOAD_GLOBAL, Operand::Name("alpha".into())).unwrap();
        b.push(Opcode::STORE_FAST, Operand::Local("tmp".into())).unwrap();
        b.push(Opcode::LOAD_FAST, Operand::Local("x".into())).unwrap();
        b.push(Opcode::LOAD_CONST, Const::Int(1)).unwrap();
        b.push(Opcode::LOAD_CONST, Const::Int(2)).unwrap();
        b.push(Opcode::LOAD_CONST, Const::Bool(true)).unwrap();
        b.push_bare(Opcode::RETURN_VALUE).unwrap();
        let code = b.build().unwrap();

        let consts: Vec<_> = code.consts().into_iter().collect();
        assert_eq!(consts, vec![Const::Int(2), Const::Int(1), Const::Bool(true)]);
        let names: Vec<_> = code.names().into_iter().collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        let vars: Vec<_> = code.varnames().into_iter().collect();
        assert_eq!(vars, vec!["x", "tmp"]);
    }

    #[test]
    fn stacksize_is_max_prefix_sum() {
        let mut b = CodeBuilder::new();
        for v in 0..3 {
            b.push(Opcode::LOAD_CONST, Const::Int(v)).unwrap();
        }
        b.push(Opcode::BUILD_TUPLE, Operand::Int(3)).unwrap();
        b.push_bare(Opcode::RETURN_VALUE).unwrap();
        assert_eq!(b.build().unwrap().stacksize(), 3);
    }

    #[test]
    fn flags_are_derived() {
        let mut b = CodeBuilder::new();
        b.args(["*a"]).unwrap().cellvars(["c"]);
        b.push(Opcode::LOAD_DEREF, Operand::Free("c".into())).unwrap();
        b.push_bare(Opcode::YIELD_VALUE).unwrap();
        let code = b.build().unwrap();
        let f = code.flags();
        assert!(f.contains(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS | CodeFlags::VARARGS));
        assert!(code.is_generator());
        assert!(!f.contains(CodeFlags::NOFREE));
        assert!(!f.contains(CodeFlags::VARKEYWORDS));
    }

    #[test]
    fn free_operand_must_be_declared() {
        let mut b = CodeBuilder::new();
        b.push(Opcode::LOAD_DEREF, Operand::Free("nope".into())).unwrap();
        assert_eq!(
            b.build().unwrap_err(),
            ConstructionError::UnknownFreeVar { opcode: Opcode::LOAD_DEREF, name: "nope".into() }
        );
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let mut b = CodeBuilder::new();
        let top = b.label().unwrap();
        let end = b.label().unwrap();
        b.place(top);
        let head = b.push(Opcode::LOAD_FAST, Operand::Local("x".into())).unwrap();
        let test = b.push(Opcode::POP_JUMP_IF_FALSE, end.id()).unwrap();
        let back = b.push(Opcode::JUMP_ABSOLUTE, top.id()).unwrap();
        b.place(end);
        let ret = b.push(Opcode::LOAD_CONST, Const::None).unwrap();
        b.push_bare(Opcode::RETURN_VALUE).unwrap();
        let code = b.build().unwrap();

        assert_eq!(code.pool()[test].jump_target(), Some(ret));
        assert_eq!(code.pool()[back].jump_target(), Some(head));
        assert_eq!(code.pool().target_of(head), &[back]);
    }

    #[test]
    fn trailing_label_is_rejected() {
        let mut b = CodeBuilder::new();
        let l = b.label().unwrap();
        b.push_bare(Opcode::NOP).unwrap();
        b.place(l);
        assert_eq!(b.build().unwrap_err(), ConstructionError::TrailingLabel);
    }

    #[test]
    fn line_of_forward_fills() {
        let mut b = CodeBuilder::new();
        b.firstlineno(10);
        let a = b.push_bare(Opcode::NOP).unwrap();
        b.line(12);
        let c = b.push_bare(Opcode::NOP).unwrap();
        let d = b.push_bare(Opcode::NOP).unwrap();
        let code = b.build().unwrap();
        assert_eq!(code.line_of(a), Some(10));
        assert_eq!(code.line_of(c), Some(12));
        assert_eq!(code.line_of(d), Some(12));
        assert_eq!(code.index_of(d), Some(2));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn signature_serializes() {
        let sig = Signature::parse(["a", "*rest", "k", "**kw"]).unwrap();
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(serde_json::from_str::<Signature>(&json).unwrap(), sig);
    }
}
