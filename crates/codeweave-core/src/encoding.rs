//! Instruction encoding versions.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::lnotab::LineTableFormat;

/// How instructions are laid out in the code bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Encoding {
    /// One opcode byte, followed by a 2-byte LE operand only when the opcode takes one.
    Legacy,
    /// Every instruction is two bytes: opcode, then a 1-byte operand (zero when unused).
    #[default]
    Wordcode,
}

impl Encoding {
    /// Width of the operand field, in bytes.
    pub const fn arg_width(self) -> usize {
        match self {
            Self::Legacy => 2,
            Self::Wordcode => 1,
        }
    }

    /// Width of one instruction, in bytes.
    pub const fn instr_width(self, has_arg: bool) -> usize {
        match self {
            Self::Legacy if has_arg => 3,
            Self::Legacy => 1,
            Self::Wordcode => 2,
        }
    }

    /// Largest operand that fits the operand field.
    pub const fn max_operand(self) -> u32 {
        match self {
            Self::Legacy => u16::MAX as u32,
            Self::Wordcode => u8::MAX as u32,
        }
    }

    /// Caps of the line table written alongside this encoding.
    pub const fn line_format(self) -> LineTableFormat {
        match self {
            Self::Legacy => LineTableFormat::LEGACY,
            Self::Wordcode => LineTableFormat::WORDCODE,
        }
    }

    /// Container tag.
    pub const fn tag(self) -> u8 {
        match self {
            Self::Legacy => 0,
            Self::Wordcode => 1,
        }
    }

    /// Inverse of [`Encoding::tag`].
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Legacy),
            1 => Some(Self::Wordcode),
            _ => None,
        }
    }

    /// Parses the assembler spelling (`legacy` / `wordcode`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "legacy" => Some(Self::Legacy),
            "wordcode" => Some(Self::Wordcode),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Legacy => "legacy",
            Self::Wordcode => "wordcode",
        })
    }
}
