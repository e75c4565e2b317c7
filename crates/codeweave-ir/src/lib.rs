//! codeweave-ir: représentation décodée d'une unité compilée
//!
//! Fournit :
//! - `InstrPool` / `InstrId` : arène d'instructions, sauts résolus par identité
//! - `Code` / `CodeBuilder` : séquence ordonnée + métadonnées, tables dérivées
//! - `decode` / `encode` : aller-retour avec la forme brute (`RawCode`)
//! - `asm` / `disasm` : assembleur texte et listing lisible
//! - `eval` : petit interpréteur de référence sur les octets encodés
//!
//! ```
//! use codeweave_core::Const;
//! use codeweave_ir::{CodeBuilder, Operand};
//! use codeweave_ops::Opcode;
//!
//! let mut b = CodeBuilder::new();
//! b.push(Opcode::LOAD_CONST, Const::Int(7)).unwrap();
//! b.push(Opcode::RETURN_VALUE, Operand::None).unwrap();
//! let raw = b.build().unwrap().to_raw().unwrap();
//! assert_eq!(raw.code, vec![100, 0, 83, 0]);
//! ```

#![deny(missing_docs)]

/// Assembleur texte.
pub mod asm;
/// Unités de code et builder.
pub mod code;
/// Décodage des unités brutes.
pub mod decode;
/// Listing lisible.
pub mod disasm;
/// Encodage vers la forme brute.
pub mod encode;
/// Erreurs de la couche IR.
pub mod error;
/// Interpréteur de référence.
pub mod eval;
/// Instructions et arène.
pub mod instr;

pub use asm::{assemble, AsmError, AsmErrorKind};
pub use code::{Code, CodeBuilder, CodeParts, Label, Signature};
pub use decode::decode;
pub use disasm::disassemble;
pub use encode::{encode, layout, EncodeOptions, Layout, PeepholeOptimizer};
pub use error::{ConstructionError, DecodeError, EncodeError};
pub use eval::{eval, EvalError, EvalOptions, EvalOutput};
pub use instr::{InstrId, InstrPool, Instruction, Operand};

/// Prélude pratique.
pub mod prelude {
    pub use super::{
        decode, encode, Code, CodeBuilder, ConstructionError, DecodeError, EncodeError, EncodeOptions, InstrId,
        InstrPool, Instruction, Operand, Signature,
    };
    pub use codeweave_core::{CodeFlags, Const, Encoding, RawCode};
    pub use codeweave_ops::{Opcode, OperandClass};
}
