//! # Task Context Representation
//!
//! Two ways to hold a suspended task's machine state:
//!
//! - [`linear`]: one contiguous frame on the task's own stack, described
//!   per architecture by a [`FrameLayout`].
//! - [`segmented`]: fixed-size segments drawn from a global free list and
//!   linked through their first word; the task stack keeps only the head
//!   handle and the saved critical nesting.
//!
//! Either way a restore reproduces the status word, program counter and
//! general-purpose registers bit for bit, and hands the task's saved
//! critical nesting back to the core.

pub mod linear;
pub mod segmented;

pub use linear::{C29Frame, CortexM4Frame, FrameLayout, LinearFrame, Rh850Frame, Slot};
pub use segmented::{ContextPool, SegmentHandle, SegmentPool};

/// What a restore hands back to the switch engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restored {
    /// Critical nesting the task was suspended with.
    pub critical_nesting: u32,
    /// Interrupt enable state encoded in the restored status word.
    pub interrupts_enabled: bool,
}
