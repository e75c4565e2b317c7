//! Error types of the IR layer.

use codeweave_core::LineTableError;
use codeweave_ops::{Opcode, OperandClass};
use thiserror::Error;

use crate::instr::InstrId;

/// Raised eagerly while building instructions or code units.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstructionError {
    /// Operand kind does not match the opcode's operand class.
    #[error("{opcode} expects a {expected:?} operand, got {found}")]
    OperandMismatch {
        /// Opcode being built.
        opcode: Opcode,
        /// Class required by the catalog.
        expected: OperandClass,
        /// Kind of the operand supplied.
        found: &'static str,
    },
    /// Second `*name` in an argument list.
    #[error("cannot specify *args more than once (`{0}`)")]
    DuplicateVarargs(String),
    /// Second `**name` in an argument list.
    #[error("cannot specify **kwargs more than once (`{0}`)")]
    DuplicateVarkw(String),
    /// Argument listed after `**name`.
    #[error("argument `{0}` follows **kwargs")]
    ArgAfterVarkw(String),
    /// Free/cell instruction whose variable is in neither table.
    #[error("{opcode} uses `{name}`, which is neither a cell nor a free variable")]
    UnknownFreeVar {
        /// Offending opcode.
        opcode: Opcode,
        /// Variable name.
        name: String,
    },
    /// The same instruction appears twice in one sequence.
    #[error("instruction {0} appears more than once")]
    DuplicateInstr(InstrId),
    /// Handle not allocated by this pool.
    #[error("unknown instruction {0}")]
    UnknownInstr(InstrId),
    /// A label was placed after the last instruction.
    #[error("can't end with a label")]
    TrailingLabel,
}

/// Fatal errors while decoding a raw unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Byte outside the instruction catalog.
    #[error("unknown opcode {byte} at offset {offset}")]
    UnknownOpcode {
        /// Offset of the opcode byte.
        offset: usize,
        /// Raw byte.
        byte: u8,
    },
    /// The byte stream ends inside an instruction.
    #[error("truncated instruction at offset {offset}")]
    Truncated {
        /// Offset of the opcode byte.
        offset: usize,
    },
    /// Operand indexes past the end of its side table.
    #[error("{opcode} at offset {offset}: index {index} out of range for {table} (len {len})")]
    OperandOutOfRange {
        /// Offset of the instruction.
        offset: usize,
        /// Instruction opcode.
        opcode: Opcode,
        /// Side table name.
        table: &'static str,
        /// Raw index.
        index: u32,
        /// Table length.
        len: usize,
    },
    /// Jump to an offset where no instruction starts.
    #[error("{opcode} at offset {offset} jumps to {target}, which is not an instruction boundary")]
    MisalignedJump {
        /// Offset of the jump.
        offset: usize,
        /// Instruction opcode.
        opcode: Opcode,
        /// Computed target offset.
        target: usize,
    },
    /// Line table points between instructions.
    #[error("line table entry at offset {offset} is not an instruction boundary")]
    MisalignedLineStart {
        /// Offending offset.
        offset: u32,
    },
    /// `varnames` is shorter than the argument counts require.
    #[error("argument layout needs {needed} variable names, only {found} present")]
    ArgumentLayout {
        /// Names required by the counts and flags.
        needed: usize,
        /// Names present.
        found: usize,
    },
    /// Broken line table.
    #[error(transparent)]
    LineTable(#[from] LineTableError),
    /// The decoded pieces do not form a valid unit.
    #[error(transparent)]
    Construction(#[from] ConstructionError),
}

/// Errors while encoding a code unit back to raw form.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A live jump references an instruction missing from the final sequence.
    #[error("unresolved jump: {opcode} {from} targets {target}, which is not in the sequence")]
    UnresolvedJump {
        /// Jumping instruction.
        from: InstrId,
        /// Its opcode.
        opcode: Opcode,
        /// Missing target.
        target: InstrId,
    },
    /// Relative jumps can only go forward.
    #[error("{opcode} {from} jumps backwards to {target}")]
    BackwardRelativeJump {
        /// Jumping instruction.
        from: InstrId,
        /// Its opcode.
        opcode: Opcode,
        /// Target instruction.
        target: InstrId,
    },
    /// Operand does not fit the encoding's operand field.
    #[error("{opcode} at offset {offset}: operand {operand} exceeds {max}")]
    OperandOverflow {
        /// Offset of the instruction.
        offset: u32,
        /// Its opcode.
        opcode: Opcode,
        /// Operand value.
        operand: u64,
        /// Largest value that fits.
        max: u32,
    },
    /// Free/cell variable not found in either table.
    #[error("{opcode} uses unknown free variable `{name}`")]
    UnknownFreeVar {
        /// Its opcode.
        opcode: Opcode,
        /// Variable name.
        name: String,
    },
    /// Unit larger than the 32-bit offset space.
    #[error("code too large ({0} bytes)")]
    TooLarge(usize),
    /// Lines could not be encoded.
    #[error(transparent)]
    LineTable(#[from] LineTableError),
    /// Failure reported by the peephole optimizer, unchanged.
    #[error(transparent)]
    Optimizer(#[from] anyhow::Error),
}
