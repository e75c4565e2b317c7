//! Mode ("start code") stack.
//!
//! Every pass pushes a fresh frame in [`Mode::DEFAULT`] through
//! [`ModeStack::enter`]; the returned guard pops it on drop, including when
//! the pass leaves early with an error.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Rule gating state. Rules only match while the current mode is one of theirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Mode(pub u32);

impl Mode {
    /// Mode every pass starts in.
    pub const DEFAULT: Self = Self(0);
}

impl From<u32> for Mode {
    fn from(value: u32) -> Self { Self(value) }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "mode {}", self.0) }
}

/// One frame per pass in progress, innermost last.
#[derive(Debug, Clone, Default)]
pub struct ModeStack {
    frames: Vec<Mode>,
}

impl ModeStack {
    /// Empty stack.
    pub const fn new() -> Self { Self { frames: Vec::new() } }

    /// Mode of the innermost pass, [`Mode::DEFAULT`] outside any pass.
    pub fn current(&self) -> Mode { self.frames.last().copied().unwrap_or_default() }

    /// Number of passes in progress.
    pub fn depth(&self) -> usize { self.frames.len() }

    /// Starts a pass; the frame is popped when the guard drops.
    pub fn enter(&mut self) -> ModeGuard<'_> {
        self.frames.push(Mode::DEFAULT);
        tracing::trace!(depth = self.frames.len(), "enter pass");
        ModeGuard { stack: self }
    }

    pub(crate) fn set_current(&mut self, mode: Mode) {
        if let Some(top) = self.frames.last_mut() {
            *top = mode;
        }
    }
}

/// Scope of one pass on a [`ModeStack`].
#[derive(Debug)]
pub struct ModeGuard<'a> {
    stack: &'a mut ModeStack,
}

impl ModeGuard<'_> {
    /// Switches the innermost pass to `mode` for the rest of its scan.
    pub fn begin(&mut self, mode: Mode) {
        tracing::trace!(%mode, "begin");
        self.stack.set_current(mode);
    }
}

impl Deref for ModeGuard<'_> {
    type Target = ModeStack;

    fn deref(&self) -> &ModeStack { self.stack }
}

impl DerefMut for ModeGuard<'_> {
    fn deref_mut(&mut self) -> &mut ModeStack { self.stack }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.stack.frames.pop();
        tracing::trace!(depth = self.stack.frames.len(), "leave pass");
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frames_nest_and_unwind() {
        let mut stack = ModeStack::new();
        assert_eq!(stack.current(), Mode::DEFAULT);
        {
            let mut outer = stack.enter();
            outer.begin(Mode(2));
            assert_eq!(outer.current(), Mode(2));
            {
                let mut inner = outer.enter();
                assert_eq!(inner.depth(), 2);
                assert_eq!(inner.current(), Mode::DEFAULT);
                inner.begin(Mode(5));
                assert_eq!(inner.current(), Mode(5));
            }
            assert_eq!(outer.depth(), 1);
            assert_eq!(outer.current(), Mode(2));
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn early_exit_still_pops() {
        fn pass(stack: &mut ModeStack) -> Result<(), &'static str> {
            let mut guard = stack.enter();
            guard.begin(Mode(1));
            Err("handler failed")
        }
        let mut stack = ModeStack::new();
        assert_eq!(pass(&mut stack), Err("handler failed"));
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.current(), Mode::DEFAULT);
    }
}
