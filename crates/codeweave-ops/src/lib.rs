//! codeweave-ops: catalogue fermé des instructions
//!
//! Une table unique déclare, pour chaque opcode : sa valeur d'octet, son nom
//! (majuscules) et sa classe d'opérande. L'effet sur la pile est une fonction
//! pure de l'opérande brut.
//!
//! ```
//! use codeweave_ops::{Opcode, OperandClass};
//!
//! let op = Opcode::from_name("LOAD_CONST").unwrap();
//! assert_eq!(op as u8, 100);
//! assert_eq!(op.operand_class(), OperandClass::Const);
//! assert_eq!(op.stack_effect(0), 1);
//! ```

#![deny(missing_docs)]

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First opcode that takes an operand.
pub const HAVE_ARGUMENT: u8 = 90;

/// Which side table (if any) an operand resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OperandClass {
    /// No operand.
    None,
    /// Raw integer.
    Int,
    /// Index into the constant table.
    Const,
    /// Index into the name table.
    Name,
    /// Index into the local variable table.
    Local,
    /// Index into cell variables, then free variables.
    Free,
    /// Absolute byte offset of the target.
    JumpAbs,
    /// Byte distance from the end of this instruction to the target.
    JumpRel,
}

impl OperandClass {
    /// True unless the class is [`OperandClass::None`].
    pub const fn has_arg(self) -> bool { !matches!(self, Self::None) }
    /// True for both jump classes.
    pub const fn is_jump(self) -> bool { matches!(self, Self::JumpAbs | Self::JumpRel) }
}

/// Lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidOpcode {
    /// Byte outside the catalog.
    #[error("unknown opcode byte {0}")]
    Byte(u8),
    /// Name outside the catalog.
    #[error("unknown opcode name `{0}`")]
    Name(String),
}

macro_rules! opcodes {
    ($( $name:ident = $byte:literal : $class:ident ),* $(,)?) => {
        /// Closed set of instructions.
        #[allow(non_camel_case_types, missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[repr(u8)]
        pub enum Opcode {
            $( $name = $byte, )*
        }

        impl Opcode {
            /// Every opcode, in byte order.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Looks an opcode up by byte value.
            pub const fn from_byte(byte: u8) -> Result<Self, InvalidOpcode> {
                match byte {
                    $( $byte => Ok(Self::$name), )*
                    other => Err(InvalidOpcode::Byte(other)),
                }
            }

            /// Looks an opcode up by its upper-case name.
            pub fn from_name(name: &str) -> Result<Self, InvalidOpcode> {
                match name {
                    $( stringify!($name) => Ok(Self::$name), )*
                    other => Err(InvalidOpcode::Name(other.to_owned())),
                }
            }

            /// Upper-case name.
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                }
            }

            /// Operand class.
            pub const fn operand_class(self) -> OperandClass {
                match self {
                    $( Self::$name => OperandClass::$class, )*
                }
            }
        }
    };
}

opcodes! {
    POP_TOP = 1 : None,
    ROT_TWO = 2 : None,
    ROT_THREE = 3 : None,
    DUP_TOP = 4 : None,
    DUP_TOP_TWO = 5 : None,
    NOP = 9 : None,
    UNARY_POSITIVE = 10 : None,
    UNARY_NEGATIVE = 11 : None,
    UNARY_NOT = 12 : None,
    UNARY_INVERT = 15 : None,
    BINARY_MATRIX_MULTIPLY = 16 : None,
    INPLACE_MATRIX_MULTIPLY = 17 : None,
    BINARY_POWER = 19 : None,
    BINARY_MULTIPLY = 20 : None,
    BINARY_MODULO = 22 : None,
    BINARY_ADD = 23 : None,
    BINARY_SUBTRACT = 24 : None,
    BINARY_SUBSCR = 25 : None,
    BINARY_FLOOR_DIVIDE = 26 : None,
    BINARY_TRUE_DIVIDE = 27 : None,
    INPLACE_FLOOR_DIVIDE = 28 : None,
    INPLACE_TRUE_DIVIDE = 29 : None,
    GET_AITER = 50 : None,
    GET_ANEXT = 51 : None,
    BEFORE_ASYNC_WITH = 52 : None,
    INPLACE_ADD = 55 : None,
    INPLACE_SUBTRACT = 56 : None,
    INPLACE_MULTIPLY = 57 : None,
    INPLACE_MODULO = 59 : None,
    STORE_SUBSCR = 60 : None,
    DELETE_SUBSCR = 61 : None,
    BINARY_LSHIFT = 62 : None,
    BINARY_RSHIFT = 63 : None,
    BINARY_AND = 64 : None,
    BINARY_XOR = 65 : None,
    BINARY_OR = 66 : None,
    INPLACE_POWER = 67 : None,
    GET_ITER = 68 : None,
    GET_YIELD_FROM_ITER = 69 : None,
    PRINT_EXPR = 70 : None,
    LOAD_BUILD_CLASS = 71 : None,
    YIELD_FROM = 72 : None,
    GET_AWAITABLE = 73 : None,
    INPLACE_LSHIFT = 75 : None,
    INPLACE_RSHIFT = 76 : None,
    INPLACE_AND = 77 : None,
    INPLACE_XOR = 78 : None,
    INPLACE_OR = 79 : None,
    BREAK_LOOP = 80 : None,
    WITH_CLEANUP_START = 81 : None,
    WITH_CLEANUP_FINISH = 82 : None,
    RETURN_VALUE = 83 : None,
    IMPORT_STAR = 84 : None,
    SETUP_ANNOTATIONS = 85 : None,
    YIELD_VALUE = 86 : None,
    POP_BLOCK = 87 : None,
    END_FINALLY = 88 : None,
    POP_EXCEPT = 89 : None,
    STORE_NAME = 90 : Name,
    DELETE_NAME = 91 : Name,
    UNPACK_SEQUENCE = 92 : Int,
    FOR_ITER = 93 : JumpRel,
    UNPACK_EX = 94 : Int,
    STORE_ATTR = 95 : Name,
    DELETE_ATTR = 96 : Name,
    STORE_GLOBAL = 97 : Name,
    DELETE_GLOBAL = 98 : Name,
    LOAD_CONST = 100 : Const,
    LOAD_NAME = 101 : Name,
    BUILD_TUPLE = 102 : Int,
    BUILD_LIST = 103 : Int,
    BUILD_SET = 104 : Int,
    BUILD_MAP = 105 : Int,
    LOAD_ATTR = 106 : Name,
    COMPARE_OP = 107 : Int,
    IMPORT_NAME = 108 : Name,
    IMPORT_FROM = 109 : Name,
    JUMP_FORWARD = 110 : JumpRel,
    JUMP_IF_FALSE_OR_POP = 111 : JumpAbs,
    JUMP_IF_TRUE_OR_POP = 112 : JumpAbs,
    JUMP_ABSOLUTE = 113 : JumpAbs,
    POP_JUMP_IF_FALSE = 114 : JumpAbs,
    POP_JUMP_IF_TRUE = 115 : JumpAbs,
    LOAD_GLOBAL = 116 : Name,
    CONTINUE_LOOP = 119 : JumpAbs,
    SETUP_LOOP = 120 : JumpRel,
    SETUP_EXCEPT = 121 : JumpRel,
    SETUP_FINALLY = 122 : JumpRel,
    LOAD_FAST = 124 : Local,
    STORE_FAST = 125 : Local,
    DELETE_FAST = 126 : Local,
    STORE_ANNOTATION = 127 : Name,
    RAISE_VARARGS = 130 : Int,
    CALL_FUNCTION = 131 : Int,
    MAKE_FUNCTION = 132 : Int,
    BUILD_SLICE = 133 : Int,
    LOAD_CLOSURE = 135 : Free,
    LOAD_DEREF = 136 : Free,
    STORE_DEREF = 137 : Free,
    DELETE_DEREF = 138 : Free,
    CALL_FUNCTION_KW = 141 : Int,
    CALL_FUNCTION_EX = 142 : Int,
    SETUP_WITH = 143 : JumpRel,
    LIST_APPEND = 145 : Int,
    SET_ADD = 146 : Int,
    MAP_ADD = 147 : Int,
    LOAD_CLASSDEREF = 148 : Free,
    BUILD_LIST_UNPACK = 149 : Int,
    BUILD_MAP_UNPACK = 150 : Int,
    BUILD_MAP_UNPACK_WITH_CALL = 151 : Int,
    BUILD_TUPLE_UNPACK = 152 : Int,
    BUILD_SET_UNPACK = 153 : Int,
    SETUP_ASYNC_WITH = 154 : JumpRel,
    FORMAT_VALUE = 155 : Int,
    BUILD_CONST_KEY_MAP = 156 : Int,
    BUILD_STRING = 157 : Int,
    BUILD_TUPLE_UNPACK_WITH_CALL = 158 : Int,
}

impl Opcode {
    /// True when the opcode carries an operand.
    pub const fn has_arg(self) -> bool { self as u8 >= HAVE_ARGUMENT }

    /// True for absolute and relative jumps.
    pub const fn is_jump(self) -> bool { self.operand_class().is_jump() }

    /// True for instructions that make the enclosing routine a generator.
    pub const fn is_yield(self) -> bool { matches!(self, Self::YIELD_VALUE | Self::YIELD_FROM) }

    /// True for instructions that address cell/free variables.
    pub const fn uses_free(self) -> bool { matches!(self.operand_class(), OperandClass::Free) }

    /// Net change of the operand stack depth.
    ///
    /// For branching instructions the value is the effect on the fall-through
    /// path, except block setups which reserve room for the handler frame.
    #[allow(clippy::cast_possible_wrap)]
    pub fn stack_effect(self, oparg: u32) -> i32 {
        let n = oparg as i32;
        let bit = |mask: u32| i32::from(oparg & mask != 0);
        match self {
            Self::NOP
            | Self::ROT_TWO
            | Self::ROT_THREE
            | Self::UNARY_POSITIVE
            | Self::UNARY_NEGATIVE
            | Self::UNARY_NOT
            | Self::UNARY_INVERT
            | Self::GET_ITER
            | Self::GET_YIELD_FROM_ITER
            | Self::GET_AITER
            | Self::GET_AWAITABLE
            | Self::BREAK_LOOP
            | Self::SETUP_ANNOTATIONS
            | Self::YIELD_VALUE
            | Self::POP_BLOCK
            | Self::POP_EXCEPT
            | Self::DELETE_NAME
            | Self::DELETE_GLOBAL
            | Self::DELETE_FAST
            | Self::DELETE_DEREF
            | Self::LOAD_ATTR
            | Self::JUMP_FORWARD
            | Self::JUMP_ABSOLUTE
            | Self::JUMP_IF_FALSE_OR_POP
            | Self::JUMP_IF_TRUE_OR_POP
            | Self::CONTINUE_LOOP
            | Self::SETUP_LOOP => 0,

            Self::DUP_TOP
            | Self::LOAD_BUILD_CLASS
            | Self::GET_ANEXT
            | Self::BEFORE_ASYNC_WITH
            | Self::WITH_CLEANUP_START
            | Self::FOR_ITER
            | Self::LOAD_CONST
            | Self::LOAD_NAME
            | Self::LOAD_GLOBAL
            | Self::LOAD_FAST
            | Self::LOAD_CLOSURE
            | Self::LOAD_DEREF
            | Self::LOAD_CLASSDEREF
            | Self::IMPORT_FROM => 1,

            Self::DUP_TOP_TWO => 2,

            Self::POP_TOP
            | Self::BINARY_MATRIX_MULTIPLY
            | Self::INPLACE_MATRIX_MULTIPLY
            | Self::BINARY_POWER
            | Self::BINARY_MULTIPLY
            | Self::BINARY_MODULO
            | Self::BINARY_ADD
            | Self::BINARY_SUBTRACT
            | Self::BINARY_SUBSCR
            | Self::BINARY_FLOOR_DIVIDE
            | Self::BINARY_TRUE_DIVIDE
            | Self::INPLACE_FLOOR_DIVIDE
            | Self::INPLACE_TRUE_DIVIDE
            | Self::INPLACE_ADD
            | Self::INPLACE_SUBTRACT
            | Self::INPLACE_MULTIPLY
            | Self::INPLACE_MODULO
            | Self::BINARY_LSHIFT
            | Self::BINARY_RSHIFT
            | Self::BINARY_AND
            | Self::BINARY_XOR
            | Self::BINARY_OR
            | Self::INPLACE_POWER
            | Self::INPLACE_LSHIFT
            | Self::INPLACE_RSHIFT
            | Self::INPLACE_AND
            | Self::INPLACE_XOR
            | Self::INPLACE_OR
            | Self::PRINT_EXPR
            | Self::YIELD_FROM
            | Self::WITH_CLEANUP_FINISH
            | Self::RETURN_VALUE
            | Self::IMPORT_STAR
            | Self::END_FINALLY
            | Self::STORE_NAME
            | Self::DELETE_ATTR
            | Self::STORE_GLOBAL
            | Self::COMPARE_OP
            | Self::IMPORT_NAME
            | Self::POP_JUMP_IF_FALSE
            | Self::POP_JUMP_IF_TRUE
            | Self::STORE_FAST
            | Self::STORE_DEREF
            | Self::STORE_ANNOTATION
            | Self::LIST_APPEND
            | Self::SET_ADD => -1,

            Self::DELETE_SUBSCR | Self::STORE_ATTR | Self::MAP_ADD => -2,
            Self::STORE_SUBSCR => -3,

            Self::SETUP_EXCEPT | Self::SETUP_FINALLY | Self::SETUP_ASYNC_WITH => 6,
            Self::SETUP_WITH => 7,

            Self::UNPACK_SEQUENCE => n - 1,
            Self::UNPACK_EX => (n & 0xFF) + (n >> 8),

            Self::BUILD_TUPLE
            | Self::BUILD_LIST
            | Self::BUILD_SET
            | Self::BUILD_STRING
            | Self::BUILD_LIST_UNPACK
            | Self::BUILD_TUPLE_UNPACK
            | Self::BUILD_TUPLE_UNPACK_WITH_CALL
            | Self::BUILD_SET_UNPACK
            | Self::BUILD_MAP_UNPACK
            | Self::BUILD_MAP_UNPACK_WITH_CALL => 1 - n,
            Self::BUILD_MAP => 1 - 2 * n,
            Self::BUILD_CONST_KEY_MAP => -n,

            Self::RAISE_VARARGS | Self::CALL_FUNCTION => -n,
            Self::CALL_FUNCTION_KW => -n - 1,
            Self::CALL_FUNCTION_EX => -1 - bit(0x01),
            Self::MAKE_FUNCTION => -1 - bit(0x01) - bit(0x02) - bit(0x04) - bit(0x08),
            Self::BUILD_SLICE => {
                if oparg == 3 {
                    -2
                } else {
                    -1
                }
            }
            Self::FORMAT_VALUE => -bit(0x04),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcode;
    fn try_from(byte: u8) -> Result<Self, Self::Error> { Self::from_byte(byte) }
}

impl core::str::FromStr for Opcode {
    type Err = InvalidOpcode;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::from_name(s) }
}

/* ─────────────────────────── Tests ─────────────────────────── */
