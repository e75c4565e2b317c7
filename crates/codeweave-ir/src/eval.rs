//! Reference interpreter over raw encoded units.
//!
//! Covers constants, locals, stack shuffles, arithmetic, comparisons, jumps,
//! tuples and `RETURN_VALUE`; anything else stops with
//! [`EvalError::Unsupported`]. Integers are `i64` with checked arithmetic.

use std::cmp::Ordering;

use codeweave_core::{Const, Encoding, RawCode};
use codeweave_ops::{Opcode, OperandClass};
use thiserror::Error;

/// Evaluation knobs.
#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    /// Instructions executed before giving up.
    pub max_steps: usize,
    /// Encoding of the unit's bytes.
    pub encoding: Encoding,
}

impl Default for EvalOptions {
    fn default() -> Self { Self { max_steps: 100_000, encoding: Encoding::default() } }
}

/// Result of a completed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutput {
    /// Value returned by the unit.
    pub value: Const,
    /// Instructions executed.
    pub steps: usize,
    /// Deepest value stack observed.
    pub max_depth: usize,
}

/// Evaluation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// Wrong number of arguments.
    #[error("expected {expected} arguments, got {found}")]
    ArgCount {
        /// Positional plus keyword-only count.
        expected: usize,
        /// Supplied.
        found: usize,
    },
    /// Byte outside the catalog.
    #[error("unknown opcode {byte} at offset {offset}")]
    UnknownOpcode {
        /// Offset.
        offset: usize,
        /// Raw byte.
        byte: u8,
    },
    /// Instruction cut short by the end of the bytes.
    #[error("truncated instruction at offset {offset}")]
    Truncated {
        /// Offset.
        offset: usize,
    },
    /// Opcode outside the evaluated subset.
    #[error("{opcode} at offset {offset} is not supported")]
    Unsupported {
        /// Offset.
        offset: usize,
        /// Opcode.
        opcode: Opcode,
    },
    /// Operand index outside its table.
    #[error("{opcode} at offset {offset}: operand {index} out of range")]
    BadOperand {
        /// Offset.
        offset: usize,
        /// Opcode.
        opcode: Opcode,
        /// Raw operand.
        index: u32,
    },
    /// Pop from an empty stack.
    #[error("stack underflow in {opcode} at offset {offset}")]
    StackUnderflow {
        /// Offset.
        offset: usize,
        /// Opcode.
        opcode: Opcode,
    },
    /// Operands of the wrong type.
    #[error("{opcode}: {detail}")]
    TypeError {
        /// Opcode.
        opcode: Opcode,
        /// Description.
        detail: String,
    },
    /// Division or modulo by zero.
    #[error("division by zero at offset {offset}")]
    ZeroDivision {
        /// Offset.
        offset: usize,
    },
    /// Integer result outside `i64`.
    #[error("integer overflow in {opcode}")]
    Overflow {
        /// Opcode.
        opcode: Opcode,
    },
    /// Read of a local before assignment.
    #[error("local variable `{0}` referenced before assignment")]
    UnboundLocal(String),
    /// Budget exhausted.
    #[error("step limit of {0} reached")]
    StepLimit(usize),
    /// Execution ran past the last instruction.
    #[error("execution fell off the end of the code")]
    FellOffEnd,
}

/// Runs `raw` with `args` bound to its parameters.
#[tracing::instrument(level = "debug", skip_all, fields(name = %raw.name))]
pub fn eval(raw: &RawCode, args: &[Const], options: &EvalOptions) -> Result<EvalOutput, EvalError> {
    let expected = (raw.argcount + raw.kwonlyargcount) as usize;
    if args.len() != expected {
        return Err(EvalError::ArgCount { expected, found: args.len() });
    }
    let mut frame = Frame {
        raw,
        locals: vec![None; raw.varnames.len().max(expected)],
        stack: Vec::new(),
        max_depth: 0,
    };
    for (slot, arg) in frame.locals.iter_mut().zip(args) {
        *slot = Some(arg.clone());
    }

    let mut pc = 0;
    for steps in 1..=options.max_steps {
        let fetched = fetch(&raw.code, pc, options.encoding)?;
        match frame.step(&fetched)? {
            Flow::Goto(next) => pc = next,
            Flow::Return(value) => {
                tracing::debug!(steps, max_depth = frame.max_depth, "returned");
                return Ok(EvalOutput { value, steps, max_depth: frame.max_depth });
            }
        }
    }
    Err(EvalError::StepLimit(options.max_steps))
}

struct Fetched {
    offset: usize,
    opcode: Opcode,
    arg: u32,
    next: usize,
}

enum Flow {
    Goto(usize),
    Return(Const),
}

fn fetch(code: &[u8], offset: usize, encoding: Encoding) -> Result<Fetched, EvalError> {
    let byte = *code.get(offset).ok_or(EvalError::FellOffEnd)?;
    let opcode = Opcode::from_byte(byte).map_err(|_| EvalError::UnknownOpcode { offset, byte })?;
    let width = encoding.instr_width(opcode.has_arg());
    let bytes = code.get(offset..offset + width).ok_or(EvalError::Truncated { offset })?;
    let arg = match (encoding, opcode.has_arg()) {
        (_, false) => 0,
        (Encoding::Legacy, true) => u32::from(u16::from_le_bytes([bytes[1], bytes[2]])),
        (Encoding::Wordcode, true) => u32::from(bytes[1]),
    };
    Ok(Fetched { offset, opcode, arg, next: offset + width })
}

struct Frame<'a> {
    raw: &'a RawCode,
    locals: Vec<Option<Const>>,
    stack: Vec<Const>,
    max_depth: usize,
}

impl Frame<'_> {
    fn push(&mut self, value: Const) {
        self.stack.push(value);
        self.max_depth = self.max_depth.max(self.stack.len());
    }

    fn pop(&mut self, at: &Fetched) -> Result<Const, EvalError> {
        self.stack.pop().ok_or(EvalError::StackUnderflow { offset: at.offset, opcode: at.opcode })
    }

    fn peek(&self, at: &Fetched, depth: usize) -> Result<&Const, EvalError> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| self.stack.get(i))
            .ok_or(EvalError::StackUnderflow { offset: at.offset, opcode: at.opcode })
    }

    fn local_slot(&self, at: &Fetched) -> Result<usize, EvalError> {
        let index = at.arg as usize;
        if index < self.locals.len() {
            Ok(index)
        } else {
            Err(EvalError::BadOperand { offset: at.offset, opcode: at.opcode, index: at.arg })
        }
    }

    fn step(&mut self, at: &Fetched) -> Result<Flow, EvalError> {
        use Opcode::*;

        let target = match at.opcode.operand_class() {
            OperandClass::JumpAbs => at.arg as usize,
            OperandClass::JumpRel => at.next + at.arg as usize,
            _ => at.next,
        };

        match at.opcode {
            NOP => {}
            POP_TOP => {
                self.pop(at)?;
            }
            ROT_TWO => {
                let top = self.pop(at)?;
                let second = self.pop(at)?;
                self.push(top);
                self.push(second);
            }
            ROT_THREE => {
                let top = self.pop(at)?;
                let second = self.pop(at)?;
                let third = self.pop(at)?;
                self.push(top);
                self.push(third);
                self.push(second);
            }
            DUP_TOP => {
                let top = self.peek(at, 0)?.clone();
                self.push(top);
            }
            DUP_TOP_TWO => {
                let second = self.peek(at, 1)?.clone();
                let top = self.peek(at, 0)?.clone();
                self.push(second);
                self.push(top);
            }
            UNARY_POSITIVE | UNARY_NEGATIVE | UNARY_NOT => {
                let value = self.pop(at)?;
                self.push(unary(at.opcode, value)?);
            }
            BINARY_ADD | BINARY_SUBTRACT | BINARY_MULTIPLY | BINARY_TRUE_DIVIDE | BINARY_FLOOR_DIVIDE
            | BINARY_MODULO | BINARY_POWER | INPLACE_ADD | INPLACE_SUBTRACT | INPLACE_MULTIPLY
            | INPLACE_TRUE_DIVIDE | INPLACE_FLOOR_DIVIDE | INPLACE_MODULO | INPLACE_POWER => {
                let rhs = self.pop(at)?;
                let lhs = self.pop(at)?;
                self.push(binary(at, lhs, rhs)?);
            }
            COMPARE_OP => {
                let rhs = self.pop(at)?;
                let lhs = self.pop(at)?;
                self.push(Const::Bool(compare(at, &lhs, &rhs)?));
            }
            LOAD_CONST => {
                let value = self.raw.consts.get(at.arg as usize).cloned().ok_or(EvalError::BadOperand {
                    offset: at.offset,
                    opcode: at.opcode,
                    index: at.arg,
                })?;
                self.push(value);
            }
            LOAD_FAST => {
                let slot = self.local_slot(at)?;
                let value = self.locals[slot].clone().ok_or_else(|| {
                    EvalError::UnboundLocal(self.raw.varnames.get(slot).cloned().unwrap_or_default())
                })?;
                self.push(value);
            }
            STORE_FAST => {
                let slot = self.local_slot(at)?;
                self.locals[slot] = Some(self.pop(at)?);
            }
            DELETE_FAST => {
                let slot = self.local_slot(at)?;
                self.locals[slot] = None;
            }
            BUILD_TUPLE => {
                let n = at.arg as usize;
                let start = self
                    .stack
                    .len()
                    .checked_sub(n)
                    .ok_or(EvalError::StackUnderflow { offset: at.offset, opcode: at.opcode })?;
                let items = self.stack.split_off(start);
                self.push(Const::Tuple(items));
            }
            JUMP_FORWARD | JUMP_ABSOLUTE => return Ok(Flow::Goto(target)),
            POP_JUMP_IF_FALSE | POP_JUMP_IF_TRUE => {
                let jump_when = at.opcode == POP_JUMP_IF_TRUE;
                if truthy(&self.pop(at)?) == jump_when {
                    return Ok(Flow::Goto(target));
                }
            }
            JUMP_IF_FALSE_OR_POP | JUMP_IF_TRUE_OR_POP => {
                let jump_when = at.opcode == JUMP_IF_TRUE_OR_POP;
                if truthy(self.peek(at, 0)?) == jump_when {
                    return Ok(Flow::Goto(target));
                }
                self.pop(at)?;
            }
            RETURN_VALUE => return Ok(Flow::Return(self.pop(at)?)),
            opcode => return Err(EvalError::Unsupported { offset: at.offset, opcode }),
        }
        Ok(Flow::Goto(at.next))
    }
}

/* ─────────────────────────── Values ─────────────────────────── */

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Const) -> Option<Self> {
        match *value {
            Const::Bool(b) => Some(Self::Int(i64::from(b))),
            Const::Int(v) => Some(Self::Int(v)),
            Const::Float(v) => Some(Self::Float(v)),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn float(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
}

impl Arith {
    fn of(opcode: Opcode) -> Option<Self> {
        use Opcode::*;
        Some(match opcode {
            BINARY_ADD | INPLACE_ADD => Self::Add,
            BINARY_SUBTRACT | INPLACE_SUBTRACT => Self::Sub,
            BINARY_MULTIPLY | INPLACE_MULTIPLY => Self::Mul,
            BINARY_TRUE_DIVIDE | INPLACE_TRUE_DIVIDE => Self::TrueDiv,
            BINARY_FLOOR_DIVIDE | INPLACE_FLOOR_DIVIDE => Self::FloorDiv,
            BINARY_MODULO | INPLACE_MODULO => Self::Mod,
            BINARY_POWER | INPLACE_POWER => Self::Pow,
            _ => return None,
        })
    }
}

fn truthy(value: &Const) -> bool {
    match value {
        Const::None => false,
        Const::Bool(b) => *b,
        Const::Int(v) => *v != 0,
        Const::Float(v) => *v != 0.0,
        Const::Str(s) => !s.is_empty(),
        Const::Bytes(b) => !b.is_empty(),
        Const::Tuple(items) => !items.is_empty(),
        Const::Ellipsis | Const::Code(_) => true,
    }
}

fn type_error(opcode: Opcode, detail: String) -> EvalError { EvalError::TypeError { opcode, detail } }

fn unary(opcode: Opcode, value: Const) -> Result<Const, EvalError> {
    if opcode == Opcode::UNARY_NOT {
        return Ok(Const::Bool(!truthy(&value)));
    }
    let negate = opcode == Opcode::UNARY_NEGATIVE;
    match Num::of(&value) {
        Some(Num::Int(v)) if negate => v.checked_neg().map(Const::Int).ok_or(EvalError::Overflow { opcode }),
        Some(Num::Int(v)) => Ok(Const::Int(v)),
        Some(Num::Float(v)) => Ok(Const::Float(if negate { -v } else { v })),
        None => Err(type_error(opcode, format!("bad operand type: {}", value.type_name()))),
    }
}

fn binary(at: &Fetched, lhs: Const, rhs: Const) -> Result<Const, EvalError> {
    let opcode = at.opcode;
    let op = Arith::of(opcode).ok_or(EvalError::Unsupported { offset: at.offset, opcode })?;
    let mismatch =
        || type_error(opcode, format!("unsupported operand types: {} and {}", lhs.type_name(), rhs.type_name()));

    match (Num::of(&lhs), Num::of(&rhs)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => int_arith(at, op, a, b),
        (Some(a), Some(b)) => float_arith(at, op, a.float(), b.float()),
        _ => match (op, &lhs, &rhs) {
            (Arith::Add, Const::Str(a), Const::Str(b)) => Ok(Const::Str(format!("{a}{b}"))),
            (Arith::Add, Const::Bytes(a), Const::Bytes(b)) => Ok(Const::Bytes([a.as_slice(), b.as_slice()].concat())),
            (Arith::Add, Const::Tuple(a), Const::Tuple(b)) => Ok(Const::Tuple([a.as_slice(), b.as_slice()].concat())),
            (Arith::Mul, Const::Str(s), Const::Int(n)) | (Arith::Mul, Const::Int(n), Const::Str(s)) => {
                Ok(Const::Str(s.repeat(usize::try_from(*n).unwrap_or(0))))
            }
            _ => Err(mismatch()),
        },
    }
}

fn int_arith(at: &Fetched, op: Arith, a: i64, b: i64) -> Result<Const, EvalError> {
    let overflow = EvalError::Overflow { opcode: at.opcode };
    let zero = EvalError::ZeroDivision { offset: at.offset };
    if b == 0 && matches!(op, Arith::TrueDiv | Arith::FloorDiv | Arith::Mod) {
        return Err(zero);
    }
    let value = match op {
        Arith::Add => a.checked_add(b),
        Arith::Sub => a.checked_sub(b),
        Arith::Mul => a.checked_mul(b),
        Arith::TrueDiv => return float_arith(at, op, Num::Int(a).float(), Num::Int(b).float()),
        Arith::FloorDiv => a.checked_div(b).map(|q| if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }),
        Arith::Mod => a.checked_rem(b).map(|r| if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }),
        Arith::Pow => match u32::try_from(b) {
            Ok(exp) => a.checked_pow(exp),
            Err(_) => return float_arith(at, op, Num::Int(a).float(), Num::Int(b).float()),
        },
    };
    value.map(Const::Int).ok_or(overflow)
}

fn float_arith(at: &Fetched, op: Arith, a: f64, b: f64) -> Result<Const, EvalError> {
    if b == 0.0 && matches!(op, Arith::TrueDiv | Arith::FloorDiv | Arith::Mod) {
        return Err(EvalError::ZeroDivision { offset: at.offset });
    }
    Ok(Const::Float(match op {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
        Arith::TrueDiv => a / b,
        Arith::FloorDiv => (a / b).floor(),
        Arith::Mod => {
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
        }
        Arith::Pow => a.powf(b),
    }))
}

fn compare(at: &Fetched, lhs: &Const, rhs: &Const) -> Result<bool, EvalError> {
    let ordering = match (Num::of(lhs), Num::of(rhs)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
        (Some(a), Some(b)) => a.float().partial_cmp(&b.float()),
        _ => match (lhs, rhs) {
            (Const::Str(a), Const::Str(b)) => Some(a.cmp(b)),
            (Const::Bytes(a), Const::Bytes(b)) => Some(a.cmp(b)),
            _ if lhs == rhs => Some(Ordering::Equal),
            _ => None,
        },
    };
    let ordered = || {
        ordering.ok_or_else(|| {
            type_error(at.opcode, format!("cannot order {} and {}", lhs.type_name(), rhs.type_name()))
        })
    };
    Ok(match at.arg {
        0 => ordered()? == Ordering::Less,
        1 => ordered()? != Ordering::Greater,
        2 => ordering == Some(Ordering::Equal),
        3 => ordering != Some(Ordering::Equal),
        4 => ordered()? == Ordering::Greater,
        5 => ordered()? != Ordering::Less,
        8 => lhs == rhs,
        9 => lhs != rhs,
        _ => return Err(EvalError::Unsupported { offset: at.offset, opcode: at.opcode }),
    })
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use pretty_assertions::assert_eq;

    fn run(source: &str, args: &[Const]) -> Result<Const, EvalError> {
        let code = assemble(source).unwrap();
        let options = EvalOptions { encoding: code.encoding(), ..EvalOptions::default() };
        eval(&code.to_raw().unwrap(), args, &options).map(|out| out.value)
    }

    const SUM: &str = "
        .args n
            LOAD_CONST 0
            STORE_FAST total
        top:
            LOAD_FAST n
            LOAD_CONST 0
            COMPARE_OP 4
            POP_JUMP_IF_FALSE done
            LOAD_FAST total
            LOAD_FAST n
            INPLACE_ADD
            STORE_FAST total
            LOAD_FAST n
            LOAD_CONST 1
            INPLACE_SUBTRACT
            STORE_FAST n
            JUMP_ABSOLUTE top
        done:
            LOAD_FAST total
            RETURN_VALUE
    ";

    #[test]
    fn adds_arguments() {
        let src = ".args a, b\nLOAD_FAST a\nLOAD_FAST b\nBINARY_ADD\nRETURN_VALUE\n";
        assert_eq!(run(src, &[Const::Int(3), Const::Int(4)]).unwrap(), Const::Int(7));
        assert_eq!(run(src, &[Const::Int(1), Const::Float(0.5)]).unwrap(), Const::Float(1.5));
        assert_eq!(run(src, &[Const::Str("ab".into()), Const::Str("c".into())]).unwrap(), Const::Str("abc".into()));
        assert!(matches!(run(src, &[Const::Int(1), Const::None]), Err(EvalError::TypeError { .. })));
    }

    #[test]
    fn loops_under_both_encodings() {
        assert_eq!(run(SUM, &[Const::Int(10)]).unwrap(), Const::Int(55));
        let legacy = format!(".encoding legacy\n{SUM}");
        assert_eq!(run(&legacy, &[Const::Int(10)]).unwrap(), Const::Int(55));
    }

    #[test]
    fn floor_semantics() {
        let div = ".args a, b\nLOAD_FAST a\nLOAD_FAST b\nBINARY_FLOOR_DIVIDE\nRETURN_VALUE\n";
        let rem = ".args a, b\nLOAD_FAST a\nLOAD_FAST b\nBINARY_MODULO\nRETURN_VALUE\n";
        assert_eq!(run(div, &[Const::Int(-7), Const::Int(2)]).unwrap(), Const::Int(-4));
        assert_eq!(run(rem, &[Const::Int(-7), Const::Int(2)]).unwrap(), Const::Int(1));
        assert_eq!(run(div, &[Const::Int(1), Const::Int(0)]), Err(EvalError::ZeroDivision { offset: 4 }));
    }

    #[test]
    fn tuples_and_shuffles() {
        let src = "LOAD_CONST 1\nLOAD_CONST 'x'\nROT_TWO\nDUP_TOP\nBUILD_TUPLE 3\nRETURN_VALUE\n";
        assert_eq!(
            run(src, &[]).unwrap(),
            Const::Tuple(vec![Const::Str("x".into()), Const::Int(1), Const::Int(1)])
        );
    }

    #[test]
    fn failures() {
        assert_eq!(run("top:\nJUMP_ABSOLUTE top\n", &[]), Err(EvalError::StepLimit(100_000)));
        assert!(matches!(run("LOAD_GLOBAL g\nRETURN_VALUE\n", &[]), Err(EvalError::Unsupported { .. })));
        assert_eq!(run("NOP\n", &[]), Err(EvalError::FellOffEnd));
        assert_eq!(run("POP_TOP\n", &[]), Err(EvalError::StackUnderflow { offset: 0, opcode: Opcode::POP_TOP }));
        assert_eq!(run(".args a\nLOAD_FAST a\nRETURN_VALUE\n", &[]), Err(EvalError::ArgCount { expected: 1, found: 0 }));
        assert_eq!(
            run("LOAD_FAST later\nRETURN_VALUE\n", &[]),
            Err(EvalError::UnboundLocal("later".into()))
        );
    }

    #[test]
    fn reports_steps_and_depth() {
        let raw = assemble("LOAD_CONST 1\nLOAD_CONST 2\nPOP_TOP\nRETURN_VALUE\n").unwrap().to_raw().unwrap();
        let out = eval(&raw, &[], &EvalOptions::default()).unwrap();
        assert_eq!(out, EvalOutput { value: Const::Int(1), steps: 4, max_depth: 2 });
    }
}
