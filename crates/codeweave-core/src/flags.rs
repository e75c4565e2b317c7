//! Flags bitmask of a compiled unit, plus the keyword-complete boolean view.

use bitflags::bitflags;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// Raw flags bitmask as stored in a compiled unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CodeFlags: u32 {
        /// Locals are stored in fast slots.
        const OPTIMIZED              = 0x0000_0001;
        /// A fresh locals namespace is created on call.
        const NEWLOCALS              = 0x0000_0002;
        /// Accepts variadic positional arguments.
        const VARARGS                = 0x0000_0004;
        /// Accepts variadic keyword arguments.
        const VARKEYWORDS            = 0x0000_0008;
        /// Defined inside another routine.
        const NESTED                 = 0x0000_0010;
        /// Body contains a yield.
        const GENERATOR              = 0x0000_0020;
        /// No cell or free variables.
        const NOFREE                 = 0x0000_0040;
        /// Native coroutine.
        const COROUTINE              = 0x0000_0080;
        /// Generator usable as a coroutine.
        const ITERABLE_COROUTINE     = 0x0000_0100;
        /// Legacy feature bit: true division.
        const FUTURE_DIVISION        = 0x0000_2000;
        /// Legacy feature bit: absolute imports.
        const FUTURE_ABSOLUTE_IMPORT = 0x0000_4000;
        /// Legacy feature bit: with statement.
        const FUTURE_WITH_STATEMENT  = 0x0000_8000;
        /// Legacy feature bit: print function.
        const FUTURE_PRINT_FUNCTION  = 0x0001_0000;
        /// Legacy feature bit: unicode literals.
        const FUTURE_UNICODE_LITERALS = 0x0002_0000;
        /// Legacy feature bit: barry_as_FLUFL.
        const FUTURE_BARRY_AS_BDFL   = 0x0004_0000;
        /// Legacy feature bit: generator stop.
        const FUTURE_GENERATOR_STOP  = 0x0008_0000;
    }
}

/// Error returned by [`CodeFlags::unpack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlagsError {
    /// The mask is larger than the combination of every known flag.
    #[error("flags mask 0x{mask:x} exceeds the maximum 0x{max:x}")]
    TooLarge {
        /// Offending mask.
        mask: u32,
        /// Largest valid mask.
        max: u32,
    },
}

/// Boolean view of [`CodeFlags`], one field per flag.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlagSet {
    /// `OPTIMIZED` bit.
    pub optimized: bool,
    /// `NEWLOCALS` bit.
    pub newlocals: bool,
    /// `VARARGS` bit.
    pub varargs: bool,
    /// `VARKEYWORDS` bit.
    pub varkeywords: bool,
    /// `NESTED` bit.
    pub nested: bool,
    /// `GENERATOR` bit.
    pub generator: bool,
    /// `NOFREE` bit.
    pub nofree: bool,
    /// `COROUTINE` bit.
    pub coroutine: bool,
    /// `ITERABLE_COROUTINE` bit.
    pub iterable_coroutine: bool,
    /// `FUTURE_DIVISION` bit.
    pub future_division: bool,
    /// `FUTURE_ABSOLUTE_IMPORT` bit.
    pub future_absolute_import: bool,
    /// `FUTURE_WITH_STATEMENT` bit.
    pub future_with_statement: bool,
    /// `FUTURE_PRINT_FUNCTION` bit.
    pub future_print_function: bool,
    /// `FUTURE_UNICODE_LITERALS` bit.
    pub future_unicode_literals: bool,
    /// `FUTURE_BARRY_AS_BDFL` bit.
    pub future_barry_as_bdfl: bool,
    /// `FUTURE_GENERATOR_STOP` bit.
    pub future_generator_stop: bool,
}

impl FlagSet {
    /// Packs every field into a mask.
    pub fn pack(&self) -> CodeFlags {
        [
            (CodeFlags::OPTIMIZED, self.optimized),
            (CodeFlags::NEWLOCALS, self.newlocals),
            (CodeFlags::VARARGS, self.varargs),
            (CodeFlags::VARKEYWORDS, self.varkeywords),
            (CodeFlags::NESTED, self.nested),
            (CodeFlags::GENERATOR, self.generator),
            (CodeFlags::NOFREE, self.nofree),
            (CodeFlags::COROUTINE, self.coroutine),
            (CodeFlags::ITERABLE_COROUTINE, self.iterable_coroutine),
            (CodeFlags::FUTURE_DIVISION, self.future_division),
            (CodeFlags::FUTURE_ABSOLUTE_IMPORT, self.future_absolute_import),
            (CodeFlags::FUTURE_WITH_STATEMENT, self.future_with_statement),
            (CodeFlags::FUTURE_PRINT_FUNCTION, self.future_print_function),
            (CodeFlags::FUTURE_UNICODE_LITERALS, self.future_unicode_literals),
            (CodeFlags::FUTURE_BARRY_AS_BDFL, self.future_barry_as_bdfl),
            (CodeFlags::FUTURE_GENERATOR_STOP, self.future_generator_stop),
        ]
        .into_iter()
        .filter(|&(_, on)| on)
        .fold(CodeFlags::empty(), |acc, (flag, _)| acc | flag)
    }
}

impl CodeFlags {
    /// Expands a raw mask into a [`FlagSet`].
    ///
    /// Masks above the combination of every flag are rejected. Bits inside
    /// that range which name no flag are dropped.
    pub fn unpack(mask: u32) -> Result<FlagSet, FlagsError> {
        let max = Self::all().bits();
        if mask > max {
            return Err(FlagsError::TooLarge { mask, max });
        }
        let flags = Self::from_bits_truncate(mask);
        Ok(FlagSet {
            optimized: flags.contains(Self::OPTIMIZED),
            newlocals: flags.contains(Self::NEWLOCALS),
            varargs: flags.contains(Self::VARARGS),
            varkeywords: flags.contains(Self::VARKEYWORDS),
            nested: flags.contains(Self::NESTED),
            generator: flags.contains(Self::GENERATOR),
            nofree: flags.contains(Self::NOFREE),
            coroutine: flags.contains(Self::COROUTINE),
            iterable_coroutine: flags.contains(Self::ITERABLE_COROUTINE),
            future_division: flags.contains(Self::FUTURE_DIVISION),
            future_absolute_import: flags.contains(Self::FUTURE_ABSOLUTE_IMPORT),
            future_with_statement: flags.contains(Self::FUTURE_WITH_STATEMENT),
            future_print_function: flags.contains(Self::FUTURE_PRINT_FUNCTION),
            future_unicode_literals: flags.contains(Self::FUTURE_UNICODE_LITERALS),
            future_barry_as_bdfl: flags.contains(Self::FUTURE_BARRY_AS_BDFL),
            future_generator_stop: flags.contains(Self::FUTURE_GENERATOR_STOP),
        })
    }

    /// Shorthand for `self.bits()` used by the raw unit.
    pub const fn mask(self) -> u32 { self.bits() }
}

impl From<FlagSet> for CodeFlags {
    fn from(set: FlagSet) -> Self { set.pack() }
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn max_mask_is_accepted_and_above_is_rejected() {
        let max = CodeFlags::all().bits();
        assert_eq!(max, 0x000F_E1FF);
        let all = CodeFlags::unpack(max).unwrap();
        assert!(all.optimized && all.future_generator_stop);
        assert_eq!(
            CodeFlags::unpack(max + 1),
            Err(FlagsError::TooLarge { mask: max + 1, max })
        );
    }

    #[test]
    fn pack_matches_constants() {
        let set = FlagSet { optimized: true, newlocals: true, generator: true, ..FlagSet::default() };
        assert_eq!(set.pack(), CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS | CodeFlags::GENERATOR);
        assert_eq!(set.pack().mask(), 0x23);
    }

    proptest! {
        #[test]
        fn unpack_inverts_pack(bits in proptest::array::uniform16(any::<bool>())) {
            let set = FlagSet {
                optimized: bits[0],
                newlocals: bits[1],
                varargs: bits[2],
                varkeywords: bits[3],
                nested: bits[4],
                generator: bits[5],
                nofree: bits[6],
                coroutine: bits[7],
                iterable_coroutine: bits[8],
                future_division: bits[9],
                future_absolute_import: bits[10],
                future_with_statement: bits[11],
                future_print_function: bits[12],
                future_unicode_literals: bits[13],
                future_barry_as_bdfl: bits[14],
                future_generator_stop: bits[15],
            };
            prop_assert_eq!(CodeFlags::unpack(set.pack().bits()).unwrap(), set);
        }
    }
}
