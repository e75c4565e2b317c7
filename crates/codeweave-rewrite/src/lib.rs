//! codeweave-rewrite: moteur de réécriture d'unités de code
//!
//! Fournit :
//! - `Pattern` / `Matcher` : motifs déclaratifs sur des suites d'instructions
//! - `Rule` / `RuleSet` : règles nommées, filtrées par mode, avec héritage
//! - `Transformer` : passe gauche → droite, récursive sur les unités imbriquées
//! - `ModeStack` : pile de modes restaurée à la sortie de chaque passe
//!
//! ```
//! use codeweave_ir::{assemble, InstrId, Operand};
//! use codeweave_ops::Opcode;
//! use codeweave_rewrite::{op, Rewrite, RuleSet, Transformer};
//!
//! let mut rules = RuleSet::new();
//! rules
//!     .rule("add2mul", op(Opcode::BINARY_ADD), |rw: &mut Rewrite<'_, ()>, _: &[InstrId]| {
//!         Ok(vec![rw.emit(Opcode::BINARY_MULTIPLY, Operand::None)?])
//!     })
//!     .unwrap();
//!
//! let code = assemble(".args a, b\nLOAD_FAST a\nLOAD_FAST b\nBINARY_ADD\nRETURN_VALUE\n").unwrap();
//! let out = Transformer::new(rules, ()).transform(&code).unwrap();
//! assert_eq!(out.opcodes()[2], Opcode::BINARY_MULTIPLY);
//! ```

#![deny(missing_docs)]

/// Pile de modes.
pub mod mode;
/// Motifs et leur forme compilée.
pub mod pattern;
/// Règles et jeux de règles.
pub mod rules;
/// Passe de réécriture et contexte des handlers.
pub mod transform;

pub use mode::{Mode, ModeGuard, ModeStack};
pub use pattern::{any, op, or, seq, Matcher, Pattern, PatternError};
pub use rules::{Handler, Rule, RuleSet};
pub use transform::{Overrides, Rewrite, RewriteError, TransformOptions, Transformer};

/// Prélude pratique.
pub mod prelude {
    pub use super::{
        any, op, or, seq, Mode, Overrides, Pattern, Rewrite, RewriteError, Rule, RuleSet, TransformOptions,
        Transformer,
    };
    pub use codeweave_ir::prelude::*;
}
