//! [`Code`] → raw unit.

use std::collections::{BTreeMap, HashMap};

use codeweave_core::{lnotab, Const, Encoding, LineStart, RawCode};
use codeweave_ops::OperandClass;

use crate::{
    code::Code,
    error::EncodeError,
    instr::{InstrId, Operand},
};

/// Host peephole optimizer, run on the encoded bytes.
///
/// Its failures are surfaced unchanged by [`encode`].
pub trait PeepholeOptimizer {
    /// Returns the optimized instruction bytes.
    fn optimize(&self, code: &[u8], consts: &[Const], names: &[String], lnotab: &[u8]) -> anyhow::Result<Vec<u8>>;
}

impl<F> PeepholeOptimizer for F
where
    F: Fn(&[u8], &[Const], &[String], &[u8]) -> anyhow::Result<Vec<u8>>,
{
    fn optimize(&self, code: &[u8], consts: &[Const], names: &[String], lnotab: &[u8]) -> anyhow::Result<Vec<u8>> {
        self(code, consts, names, lnotab)
    }
}

/// Knobs of [`encode`].
#[derive(Clone, Copy, Default)]
pub struct EncodeOptions<'a> {
    /// Overrides the unit's own encoding.
    pub encoding: Option<Encoding>,
    /// Optional pass over the final bytes.
    pub optimizer: Option<&'a dyn PeepholeOptimizer>,
}

impl core::fmt::Debug for EncodeOptions<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EncodeOptions")
            .field("encoding", &self.encoding)
            .field("optimizer", &self.optimizer.is_some())
            .finish()
    }
}

/// Byte offset of every live instruction.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    /// Offsets in execution order.
    pub offsets: Vec<u32>,
    /// Offset per handle.
    pub by_id: HashMap<InstrId, u32>,
    /// Total byte length.
    pub size: u32,
}

/// Computes instruction offsets under `encoding`.
pub fn layout(code: &Code, encoding: Encoding) -> Result<Layout, EncodeError> {
    let mut out = Layout { offsets: Vec::with_capacity(code.len()), ..Layout::default() };
    let mut offset = 0usize;
    for (id, instr) in code.iter() {
        let at = u32::try_from(offset).map_err(|_| EncodeError::TooLarge(offset))?;
        out.offsets.push(at);
        out.by_id.insert(id, at);
        offset += encoding.instr_width(instr.opcode().has_arg());
    }
    out.size = u32::try_from(offset).map_err(|_| EncodeError::TooLarge(offset))?;
    Ok(out)
}

/// Encodes `code` into the host's raw form.
#[tracing::instrument(level = "debug", skip_all, fields(name = %code.name(), instrs = code.len()))]
pub fn encode(code: &Code, options: &EncodeOptions<'_>) -> Result<RawCode, EncodeError> {
    let encoding = options.encoding.unwrap_or_else(|| code.encoding());
    let consts = code.consts();
    let names = code.names();
    let varnames = code.varnames();
    let layout = layout(code, encoding)?;

    let mut bytes = Vec::with_capacity(layout.size as usize);
    for ((id, instr), &offset) in code.iter().zip(&layout.offsets) {
        let opcode = instr.opcode();
        let width = encoding.instr_width(opcode.has_arg()) as u32;
        let arg: u64 = match instr.operand() {
            Operand::None => 0,
            Operand::Int(v) => u64::from(*v),
            Operand::Const(c) => index(consts.get_index_of(c)),
            Operand::Name(n) => index(names.get_index_of(n)),
            Operand::Local(n) => index(varnames.get_index_of(n)),
            Operand::Free(n) => {
                let pos = code
                    .cellvars()
                    .iter()
                    .position(|c| c == n)
                    .or_else(|| code.freevars().iter().position(|f| f == n).map(|p| p + code.cellvars().len()))
                    .ok_or_else(|| EncodeError::UnknownFreeVar { opcode, name: n.clone() })?;
                pos as u64
            }
            Operand::Jump(target) => {
                let target_off = *layout
                    .by_id
                    .get(target)
                    .ok_or(EncodeError::UnresolvedJump { from: id, opcode, target: *target })?;
                if opcode.operand_class() == OperandClass::JumpRel {
                    let next = offset + width;
                    if target_off < next {
                        return Err(EncodeError::BackwardRelativeJump { from: id, opcode, target: *target });
                    }
                    u64::from(target_off - next)
                } else {
                    u64::from(target_off)
                }
            }
        };
        let max = encoding.max_operand();
        if arg > u64::from(max) {
            return Err(EncodeError::OperandOverflow { offset, opcode, operand: arg, max });
        }

        bytes.push(opcode as u8);
        match encoding {
            Encoding::Legacy if opcode.has_arg() => bytes.extend_from_slice(&(arg as u16).to_le_bytes()),
            Encoding::Legacy => {}
            Encoding::Wordcode => bytes.push(arg as u8),
        }
    }

    let lnotab = lnotab::encode(&line_starts(code, &layout), code.firstlineno(), encoding.line_format())?;
    let signature = code.signature();
    let mut raw = RawCode {
        argcount: signature.argcount() as u32,
        kwonlyargcount: signature.kwonlyargcount() as u32,
        nlocals: varnames.len() as u32,
        stacksize: code.stacksize(),
        flags: code.flags().bits(),
        code: bytes,
        consts: consts.into_iter().collect(),
        names: names.into_iter().collect(),
        varnames: varnames.into_iter().collect(),
        filename: code.filename().to_owned(),
        name: code.name().to_owned(),
        firstlineno: code.firstlineno(),
        lnotab,
        freevars: code.freevars().to_vec(),
        cellvars: code.cellvars().to_vec(),
    };

    if let Some(optimizer) = options.optimizer {
        tracing::debug!(len = raw.code.len(), "running peephole optimizer");
        raw.code = optimizer.optimize(&raw.code, &raw.consts, &raw.names, &raw.lnotab)?;
    }
    Ok(raw)
}

impl Code {
    /// Shorthand for [`encode`] with default options.
    pub fn to_raw(&self) -> Result<RawCode, EncodeError> { encode(self, &EncodeOptions::default()) }
}

// Derived tables always hold every operand of the unit.
fn index(pos: Option<usize>) -> u64 { pos.map_or(u64::MAX, |p| p as u64) }

/// Line starts by final offset. A line owned by an instruction that left the
/// sequence moves to the live instruction that stole it, unless that one
/// starts a line of its own.
fn line_starts(code: &Code, layout: &Layout) -> Vec<LineStart> {
    let mut direct = BTreeMap::new();
    let mut moved = Vec::new();
    for (&id, &line) in code.lines() {
        if let Some(&offset) = layout.by_id.get(&id) {
            direct.insert(offset, line);
        } else if let Some(heir) = code.pool().successor(id, |c| layout.by_id.contains_key(&c)) {
            tracing::trace!(from = %id, to = %heir, line, "line ownership moved to stealing instruction");
            moved.push((layout.by_id[&heir], line));
        }
    }
    for (offset, line) in moved {
        direct.entry(offset).or_insert(line);
    }
    direct.into_iter().map(|(offset, line)| LineStart::new(offset, line)).collect()
}

/* ─────────────────────────── Tests ─────────────────────────── */
