//! Raw unit → [`Code`].
//!
//! Two passes over the bytes. The first records one entry per instruction
//! together with its raw operand and a byte-offset slot table, so that a
//! jump can be resolved to the instruction starting at its target offset.
//! The second resolves every operand against its side table.

use std::collections::BTreeMap;

use codeweave_core::{lnotab, CodeFlags, Encoding, RawCode};
use codeweave_ops::{Opcode, OperandClass};

use crate::{
    code::{Code, CodeParts, Signature},
    error::DecodeError,
    instr::{InstrId, InstrPool, Instruction, Operand},
};

struct RawInstr {
    offset: usize,
    opcode: Opcode,
    arg: u32,
    width: usize,
}

/// Decodes `raw`, whose bytes use `encoding`.
#[tracing::instrument(level = "debug", skip(raw), fields(name = %raw.name, len = raw.code.len()))]
pub fn decode(raw: &RawCode, encoding: Encoding) -> Result<Code, DecodeError> {
    let walked = walk(&raw.code, encoding)?;

    // slots[offset] = index of the instruction starting there
    let mut slots = vec![None; raw.code.len() + 1];
    for (k, ri) in walked.iter().enumerate() {
        slots[ri.offset] = Some(k);
    }

    let mut pool = InstrPool::new();
    let base = pool.next_id().index();
    let id_at = |k: usize| InstrId::from_index(base + k);

    let mut instrs = Vec::with_capacity(walked.len());
    for ri in &walked {
        let operand = resolve(raw, ri, &slots, id_at)?;
        instrs.push(Instruction::new(ri.opcode, operand)?);
    }
    let ids = pool.insert_many(instrs)?;

    let mut lines = BTreeMap::new();
    if !ids.is_empty() {
        for start in lnotab::decode(&raw.lnotab, raw.firstlineno, encoding.line_format())? {
            let k = slots
                .get(start.offset as usize)
                .copied()
                .flatten()
                .ok_or(DecodeError::MisalignedLineStart { offset: start.offset })?;
            lines.insert(ids[k], start.line);
        }
    }

    let flags = CodeFlags::from_bits_retain(raw.flags);
    let signature = Signature::from_layout(
        raw.argcount as usize,
        raw.kwonlyargcount as usize,
        flags,
        &raw.varnames,
    )
    .map_err(|(needed, found)| DecodeError::ArgumentLayout { needed, found })?;

    tracing::debug!(instrs = ids.len(), lines = lines.len(), "decoded");
    Ok(Code::new(CodeParts {
        pool,
        instrs: ids,
        signature,
        cellvars: raw.cellvars.clone(),
        freevars: raw.freevars.clone(),
        name: raw.name.clone(),
        filename: raw.filename.clone(),
        firstlineno: raw.firstlineno,
        lines,
        flags: Some(flags),
        encoding,
    })?)
}

impl Code {
    /// Shorthand for [`decode`].
    pub fn from_raw(raw: &RawCode, encoding: Encoding) -> Result<Self, DecodeError> { decode(raw, encoding) }
}

fn walk(code: &[u8], encoding: Encoding) -> Result<Vec<RawInstr>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let byte = code[offset];
        let opcode = Opcode::from_byte(byte).map_err(|_| DecodeError::UnknownOpcode { offset, byte })?;
        let width = encoding.instr_width(opcode.has_arg());
        let bytes = code.get(offset..offset + width).ok_or(DecodeError::Truncated { offset })?;
        let arg = match (encoding, opcode.has_arg()) {
            (_, false) => 0,
            (Encoding::Legacy, true) => u32::from(u16::from_le_bytes([bytes[1], bytes[2]])),
            (Encoding::Wordcode, true) => u32::from(bytes[1]),
        };
        out.push(RawInstr { offset, opcode, arg, width });
        offset += width;
    }
    Ok(out)
}

fn resolve(
    raw: &RawCode,
    ri: &RawInstr,
    slots: &[Option<usize>],
    id_at: impl Fn(usize) -> InstrId,
) -> Result<Operand, DecodeError> {
    let index = ri.arg as usize;
    let out_of_range = |table: &'static str, len: usize| DecodeError::OperandOutOfRange {
        offset: ri.offset,
        opcode: ri.opcode,
        table,
        index: ri.arg,
        len,
    };
    let jump = |target: usize| {
        slots
            .get(target)
            .copied()
            .flatten()
            .map(|k| Operand::Jump(id_at(k)))
            .ok_or(DecodeError::MisalignedJump { offset: ri.offset, opcode: ri.opcode, target })
    };

    Ok(match ri.opcode.operand_class() {
        OperandClass::None => Operand::None,
        OperandClass::Int => Operand::Int(ri.arg),
        OperandClass::Const => Operand::Const(
            raw.consts.get(index).cloned().ok_or_else(|| out_of_range("consts", raw.consts.len()))?,
        ),
        OperandClass::Name => Operand::Name(
            raw.names.get(index).cloned().ok_or_else(|| out_of_range("names", raw.names.len()))?,
        ),
        OperandClass::Local => Operand::Local(
            raw.varnames.get(index).cloned().ok_or_else(|| out_of_range("varnames", raw.varnames.len()))?,
        ),
        OperandClass::Free => {
            let ncell = raw.cellvars.len();
            let name = if index < ncell {
                raw.cellvars.get(index)
            } else {
                raw.freevars.get(index - ncell)
            };
            Operand::Free(
                name.cloned().ok_or_else(|| out_of_range("cellvars+freevars", ncell + raw.freevars.len()))?,
            )
        }
        OperandClass::JumpAbs => jump(index)?,
        OperandClass::JumpRel => jump(ri.offset + ri.width + index)?,
    })
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use codeweave_core::Const;
    use pretty_assertions::assert_eq;

    fn unit(code: Vec<u8>) -> RawCode {
        RawCode {
            code,
            consts: vec![Const::Int(3), Const::Int(4)],
            names: vec!["g".into()],
            varnames: vec!["a".into(), "b".into()],
            argcount: 2,
            nlocals: 2,
            cellvars: vec!["c".into()],
            freevars: vec!["f".into()],
            name: "t".into(),
            filename: "t.src".into(),
            firstlineno: 1,
            ..RawCode::default()
        }
    }

    #[test]
    fn resolves_operands_by_class() {
        let raw = unit(vec![100, 1, 116, 0, 124, 1, 136, 0, 136, 1, 83, 0]);
        let code = decode(&raw, Encoding::Wordcode).unwrap();
        let operands: Vec<_> = code.iter().map(|(_, i)| i.operand().clone()).collect();
        assert_eq!(
            operands,
            vec![
                Operand::Const(Const::Int(4)),
                Operand::Name("g".into()),
                Operand::Local("b".into()),
                Operand::Free("c".into()),
                Operand::Free("f".into()),
                Operand::None,
            ]
        );
        assert_eq!(code.signature().positional, vec!["a", "b"]);
    }

    #[test]
    fn resolves_jumps_to_instructions() {
        // 0 LOAD_FAST a; 2 POP_JUMP_IF_FALSE 8; 4 JUMP_FORWARD +2 (-> 8); 6 NOP; 8 RETURN_VALUE
        let raw = unit(vec![124, 0, 114, 8, 110, 2, 9, 0, 83, 0]);
        let code = decode(&raw, Encoding::Wordcode).unwrap();
        let ids = code.instrs();
        assert_eq!(code.pool()[ids[1]].jump_target(), Some(ids[4]));
        assert_eq!(code.pool()[ids[2]].jump_target(), Some(ids[4]));
        assert_eq!(code.pool().target_of(ids[4]), &[ids[1], ids[2]]);
    }

    #[test]
    fn legacy_operands_are_two_bytes() {
        // LOAD_CONST 1; JUMP_ABSOLUTE 7; NOP; RETURN_VALUE
        let raw = unit(vec![100, 1, 0, 113, 7, 0, 9, 83]);
        let code = decode(&raw, Encoding::Legacy).unwrap();
        assert_eq!(code.len(), 4);
        let ids = code.instrs();
        assert_eq!(code.pool()[ids[1]].jump_target(), Some(ids[3]));
    }

    #[test]
    fn malformed_input_is_fatal() {
        assert_eq!(
            decode(&unit(vec![0, 0]), Encoding::Wordcode).unwrap_err(),
            DecodeError::UnknownOpcode { offset: 0, byte: 0 }
        );
        assert!(matches!(
            decode(&unit(vec![100, 9]), Encoding::Wordcode),
            Err(DecodeError::OperandOutOfRange { table: "consts", index: 9, .. })
        ));
        assert!(matches!(
            decode(&unit(vec![113, 3, 83, 0]), Encoding::Wordcode),
            Err(DecodeError::MisalignedJump { target: 3, .. })
        ));
        assert_eq!(decode(&unit(vec![100, 0]), Encoding::Legacy).unwrap_err(), DecodeError::Truncated {
            offset: 0
        });
    }

    #[test]
    fn line_table_maps_to_instructions() {
        let mut raw = unit(vec![9, 0, 9, 0, 83, 0]);
        raw.lnotab = vec![4, 2];
        let code = decode(&raw, Encoding::Wordcode).unwrap();
        let ids = code.instrs();
        assert_eq!(code.line_starts(), vec![(ids[0], 1), (ids[2], 3)]);

        raw.lnotab = vec![3, 1];
        assert_eq!(
            decode(&raw, Encoding::Wordcode).unwrap_err(),
            DecodeError::MisalignedLineStart { offset: 3 }
        );
    }
}
