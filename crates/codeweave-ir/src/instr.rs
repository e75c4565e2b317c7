//! Instructions and the arena that gives them identity.
//!
//! Jumps reference their target by [`InstrId`]. The pool keeps, for every
//! instruction, the set of instructions jumping to it (`target_of`) so that
//! [`InstrPool::steal`] can retarget them in one step.

use core::{fmt, ops::Index};

use codeweave_core::Const;
use codeweave_ops::{Opcode, OperandClass};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ConstructionError;

/// Identity of an instruction inside one [`InstrPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InstrId(u32);

impl InstrId {
    /// Position of the instruction in its pool.
    pub const fn index(self) -> usize { self.0 as usize }

    pub(crate) const fn from_index(index: usize) -> Self { Self(index as u32) }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// Resolved operand: never a raw table index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Operand {
    /// No operand.
    None,
    /// Raw integer operand.
    Int(u32),
    /// Constant value.
    Const(Const),
    /// Global/attribute name.
    Name(String),
    /// Local variable name.
    Local(String),
    /// Cell or free variable name.
    Free(String),
    /// Jump target.
    Jump(InstrId),
}

impl Operand {
    /// Short label of the operand kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Int(_) => "int",
            Self::Const(_) => "const",
            Self::Name(_) => "name",
            Self::Local(_) => "local",
            Self::Free(_) => "free",
            Self::Jump(_) => "jump",
        }
    }

    const fn fits(&self, class: OperandClass) -> bool {
        matches!(
            (self, class),
            (Self::None, OperandClass::None)
                | (Self::Int(_), OperandClass::Int)
                | (Self::Const(_), OperandClass::Const)
                | (Self::Name(_), OperandClass::Name)
                | (Self::Local(_), OperandClass::Local)
                | (Self::Free(_), OperandClass::Free)
                | (Self::Jump(_), OperandClass::JumpAbs | OperandClass::JumpRel)
        )
    }

    /// Jump target, if any.
    pub const fn jump_target(&self) -> Option<InstrId> {
        match self {
            Self::Jump(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<Const> for Operand {
    fn from(value: Const) -> Self { Self::Const(value) }
}

impl From<InstrId> for Operand {
    fn from(target: InstrId) -> Self { Self::Jump(target) }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Int(v) => write!(f, "{v}"),
            Self::Const(c) => write!(f, "{c}"),
            Self::Name(s) | Self::Local(s) | Self::Free(s) => f.write_str(s),
            Self::Jump(id) => write!(f, "{id}"),
        }
    }
}

/// One operation: an opcode and its resolved operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    opcode: Opcode,
    operand: Operand,
}

impl Instruction {
    /// Builds an instruction, checking the operand against the opcode's class.
    pub fn new(opcode: Opcode, operand: Operand) -> Result<Self, ConstructionError> {
        let expected = opcode.operand_class();
        if operand.fits(expected) {
            Ok(Self { opcode, operand })
        } else {
            Err(ConstructionError::OperandMismatch { opcode, expected, found: operand.kind() })
        }
    }

    /// Instruction without operand.
    pub fn bare(opcode: Opcode) -> Result<Self, ConstructionError> { Self::new(opcode, Operand::None) }

    /// Opcode.
    pub const fn opcode(&self) -> Opcode { self.opcode }

    /// Resolved operand.
    pub const fn operand(&self) -> &Operand { &self.operand }

    /// Jump target, if this is a jump.
    pub const fn jump_target(&self) -> Option<InstrId> { self.operand.jump_target() }

    /// Net stack effect.
    pub fn stack_effect(&self) -> i32 {
        let oparg = match self.operand {
            Operand::Int(v) => v,
            _ => 0,
        };
        self.opcode.stack_effect(oparg)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            ref operand => write!(f, "{} {operand}", self.opcode),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    instr: Instruction,
    target_of: SmallVec<[InstrId; 2]>,
    stolen_by: Option<InstrId>,
}

/// Append-only arena of instructions.
#[derive(Debug, Clone, Default)]
pub struct InstrPool {
    slots: Vec<Slot>,
}

impl InstrPool {
    /// Empty pool.
    pub const fn new() -> Self { Self { slots: Vec::new() } }

    /// Number of instructions ever allocated.
    pub fn len(&self) -> usize { self.slots.len() }

    /// True when nothing was allocated.
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    /// Handle the next [`InstrPool::insert`] will return.
    pub fn next_id(&self) -> InstrId { InstrId::from_index(self.slots.len()) }

    /// True if `id` was allocated by this pool.
    pub fn contains(&self, id: InstrId) -> bool { id.index() < self.slots.len() }

    /// Instruction behind `id`.
    pub fn get(&self, id: InstrId) -> Option<&Instruction> { self.slots.get(id.index()).map(|s| &s.instr) }

    /// Allocates one instruction. A jump must target an existing instruction.
    pub fn insert(&mut self, instr: Instruction) -> Result<InstrId, ConstructionError> {
        if let Some(target) = instr.jump_target() {
            self.check(target)?;
        }
        let id = self.push(instr);
        self.link(id);
        Ok(id)
    }

    /// Allocates a batch whose jumps may point anywhere inside the batch.
    ///
    /// The batch receives consecutive handles starting at [`InstrPool::next_id`].
    pub fn insert_many(
        &mut self,
        instrs: impl IntoIterator<Item = Instruction>,
    ) -> Result<Vec<InstrId>, ConstructionError> {
        let start = self.slots.len();
        let ids: Vec<InstrId> = instrs.into_iter().map(|instr| self.push(instr)).collect();
        for &id in &ids {
            if let Some(target) = self.slots[id.index()].instr.jump_target() {
                if let Err(e) = self.check(target) {
                    self.slots.truncate(start);
                    return Err(e);
                }
            }
        }
        for &id in &ids {
            self.link(id);
        }
        Ok(ids)
    }

    /// Instructions whose jump operand is `id`.
    pub fn target_of(&self, id: InstrId) -> &[InstrId] {
        self.slots.get(id.index()).map_or(&[], |s| s.target_of.as_slice())
    }

    /// Instruction that took over `id`'s incoming jumps, if any.
    pub fn stolen_by(&self, id: InstrId) -> Option<InstrId> { self.slots.get(id.index()).and_then(|s| s.stolen_by) }

    /// Replaces the operand of `id`, keeping back-edges in sync.
    pub fn replace_operand(&mut self, id: InstrId, operand: Operand) -> Result<(), ConstructionError> {
        self.check(id)?;
        let opcode = self.slots[id.index()].instr.opcode;
        let instr = Instruction::new(opcode, operand)?;
        if let Some(target) = instr.jump_target() {
            self.check(target)?;
        }
        self.unlink(id);
        self.slots[id.index()].instr = instr;
        self.link(id);
        Ok(())
    }

    /// Moves every incoming jump of `victim` onto `thief`.
    ///
    /// Afterwards `victim.target_of` is empty and `victim` records `thief`
    /// as its successor for line-table ownership.
    pub fn steal(&mut self, thief: InstrId, victim: InstrId) -> Result<(), ConstructionError> {
        self.check(thief)?;
        self.check(victim)?;
        if thief == victim {
            return Ok(());
        }
        let incoming = core::mem::take(&mut self.slots[victim.index()].target_of);
        for &jumper in &incoming {
            self.slots[jumper.index()].instr.operand = Operand::Jump(thief);
        }
        let target_of = &mut self.slots[thief.index()].target_of;
        for jumper in incoming {
            if !target_of.contains(&jumper) {
                target_of.push(jumper);
            }
        }
        self.slots[victim.index()].stolen_by = Some(thief);
        tracing::trace!(%thief, %victim, "steal");
        Ok(())
    }

    /// Last instruction in the `stolen_by` chain starting at `id`.
    pub fn resolve(&self, id: InstrId) -> InstrId {
        let mut cur = id;
        for _ in 0..self.slots.len() {
            match self.stolen_by(cur) {
                Some(next) => cur = next,
                None => break,
            }
        }
        cur
    }

    /// Follows `stolen_by` links from `id` until `accept` holds.
    pub fn successor(&self, id: InstrId, mut accept: impl FnMut(InstrId) -> bool) -> Option<InstrId> {
        let mut cur = self.stolen_by(id)?;
        for _ in 0..self.slots.len() {
            if accept(cur) {
                return Some(cur);
            }
            cur = self.stolen_by(cur)?;
        }
        None
    }

    fn push(&mut self, instr: Instruction) -> InstrId {
        let id = self.next_id();
        self.slots.push(Slot { instr, target_of: SmallVec::new(), stolen_by: None });
        id
    }

    fn check(&self, id: InstrId) -> Result<(), ConstructionError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(ConstructionError::UnknownInstr(id))
        }
    }

    fn link(&mut self, id: InstrId) {
        if let Some(target) = self.slots[id.index()].instr.jump_target() {
            let edges = &mut self.slots[target.index()].target_of;
            if !edges.contains(&id) {
                edges.push(id);
            }
        }
    }

    fn unlink(&mut self, id: InstrId) {
        if let Some(target) = self.slots[id.index()].instr.jump_target() {
            self.slots[target.index()].target_of.retain(|j| *j != id);
        }
    }
}

impl Index<InstrId> for InstrPool {
    type Output = Instruction;

    fn index(&self, id: InstrId) -> &Instruction { &self.slots[id.index()].instr }
}

/* ─────────────────────────── Tests ─────────────────────────── */
