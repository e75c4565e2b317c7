//! Line-table codec.
//!
//! The table is a flat byte string of `(byte_delta, line_delta)` pairs read
//! relative to `(0, firstlineno)`. Each pair field is capped; larger deltas
//! spill over into extra pairs (`(cap, 0)` for offsets, `(0, cap)` for lines).

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-pair caps of a line table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LineTableFormat {
    /// Largest byte-offset delta stored in one pair.
    pub max_addr_delta: u8,
    /// Largest line delta stored in one pair.
    pub max_line_delta: u8,
}

impl LineTableFormat {
    /// Unsigned line deltas up to 255.
    pub const LEGACY: Self = Self { max_addr_delta: 255, max_line_delta: 255 };
    /// Line deltas are signed bytes, so a pair carries at most 127 lines.
    pub const WORDCODE: Self = Self { max_addr_delta: 255, max_line_delta: 127 };

    const fn signed_lines(self) -> bool { self.max_line_delta < 128 }
}

impl Default for LineTableFormat {
    fn default() -> Self { Self::WORDCODE }
}

/// One entry of the decoded table: the instruction at `offset` starts `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LineStart {
    /// Byte offset of the instruction.
    pub offset: u32,
    /// Source line.
    pub line: u32,
}

impl LineStart {
    /// Shorthand constructor.
    pub const fn new(offset: u32, line: u32) -> Self { Self { offset, line } }
}

/// Line-table codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineTableError {
    /// The encoded table holds a dangling half pair.
    #[error("line table has odd length {0}")]
    OddLength(usize),
    /// Line starts must be given in strictly increasing offset order.
    #[error("line start at offset {offset} follows offset {previous}")]
    UnorderedOffset {
        /// Offending offset.
        offset: u32,
        /// Offset of the previous start.
        previous: u32,
    },
    /// Legacy tables cannot move a line backwards.
    #[error("line {line} at offset {offset} is before line {previous}")]
    BackwardsLine {
        /// Offset of the offending start.
        offset: u32,
        /// Offending line.
        line: u32,
        /// Line in effect before it.
        previous: u32,
    },
    /// Decoding walked below line zero.
    #[error("line table underflows at offset {offset}")]
    Underflow {
        /// Accumulated offset at the failing pair.
        offset: u32,
    },
}

/// Encodes line starts into a table.
///
/// `starts` must be sorted by offset. A start whose line equals the line
/// already in effect emits nothing. Wordcode tables carry signed line deltas,
/// so a line may move backwards there; legacy tables reject it with
/// [`LineTableError::BackwardsLine`].
pub fn encode(
    starts: &[LineStart],
    firstlineno: u32,
    format: LineTableFormat,
) -> Result<Vec<u8>, LineTableError> {
    let addr_cap = u32::from(format.max_addr_delta);
    let (line_min, line_max) = if format.signed_lines() {
        (-0x80, i64::from(format.max_line_delta))
    } else {
        (0, i64::from(format.max_line_delta))
    };
    let mut out = Vec::with_capacity(starts.len() * 2);
    let mut prev_addr = 0u32;
    let mut prev_line = firstlineno;
    let mut last_offset: Option<u32> = None;

    for start in starts {
        if let Some(previous) = last_offset {
            if start.offset <= previous {
                return Err(LineTableError::UnorderedOffset { offset: start.offset, previous });
            }
        }
        last_offset = Some(start.offset);

        if start.line == prev_line {
            continue;
        }
        if start.line < prev_line && line_min == 0 {
            return Err(LineTableError::BackwardsLine {
                offset: start.offset,
                line: start.line,
                previous: prev_line,
            });
        }

        let mut addr_delta = start.offset - prev_addr;
        while addr_delta > addr_cap {
            out.extend_from_slice(&[format.max_addr_delta, 0]);
            addr_delta -= addr_cap;
        }
        let mut line_delta = i64::from(start.line) - i64::from(prev_line);
        let mut addr_byte = addr_delta as u8;
        while line_delta != 0 {
            let chunk = line_delta.clamp(line_min, line_max);
            // two's complement byte for negative chunks
            out.extend_from_slice(&[addr_byte, chunk.rem_euclid(0x100) as u8]);
            line_delta -= chunk;
            addr_byte = 0;
        }

        prev_addr = start.offset;
        prev_line = start.line;
    }
    Ok(out)
}

/// Decodes a table back into line starts.
///
/// The result always begins at offset 0. A line is reported once, at the
/// first offset where it is in effect.
pub fn decode(
    table: &[u8],
    firstlineno: u32,
    format: LineTableFormat,
) -> Result<Vec<LineStart>, LineTableError> {
    if table.len() % 2 != 0 {
        return Err(LineTableError::OddLength(table.len()));
    }
    let mut out = Vec::new();
    let mut last_line: Option<i64> = None;
    let mut line = i64::from(firstlineno);
    let mut addr = 0u32;

    let emit = |addr: u32, line: i64, out: &mut Vec<LineStart>| -> Result<(), LineTableError> {
        let line = u32::try_from(line).map_err(|_| LineTableError::Underflow { offset: addr })?;
        out.push(LineStart::new(addr, line));
        Ok(())
    };

    for pair in table.chunks_exact(2) {
        let (byte_incr, line_incr) = (pair[0], pair[1]);
        if byte_incr != 0 {
            if last_line != Some(line) {
                emit(addr, line, &mut out)?;
                last_line = Some(line);
            }
            addr += u32::from(byte_incr);
        }
        line += if format.signed_lines() && line_incr >= 0x80 {
            i64::from(line_incr) - 0x100
        } else {
            i64::from(line_incr)
        };
    }
    if last_line != Some(line) {
        emit(addr, line, &mut out)?;
    }
    Ok(out)
}

/* ─────────────────────────── Tests ─────────────────────────── */
