//! # Critical Sections
//!
//! Composable, interrupt-safe critical sections for task context.
//!
//! Each core owns one [`CriticalNesting`] counter. The first `enter` masks
//! interrupts and moves the counter 0 → 1; nested calls only count; `exit`
//! unmasks again only when the counter lands on exactly 0.
//!
//! Interrupt handlers must not touch the counter. They use
//! [`IsrCriticalSection`], which saves and restores the raw mask state
//! instead.
//!
//! ```ignore
//! critical::critical_section(&core.critical, &hw, || {
//!     // shared kernel state
//! });
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::INITIAL_CRITICAL_NESTING;
use crate::error::{fatal, Violation};
use crate::interrupt::{InterruptMask, SavedMask};

/// Per-core critical section nesting depth.
///
/// Starts at [`INITIAL_CRITICAL_NESTING`] so that interrupts stay masked
/// through boot, and is reset to 0 exactly once when the scheduler starts.
/// Only the owning core touches it, so relaxed ordering is enough; the
/// atomic only makes the descriptor shareable between cores.
#[derive(Debug)]
pub struct CriticalNesting {
    depth: AtomicU32,
}

impl CriticalNesting {
    /// A counter holding the boot sentinel.
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(INITIAL_CRITICAL_NESTING),
        }
    }

    /// Current depth. 0 means interrupts are enabled at task level.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Overwrite the depth. Used when a restored task brings its own
    /// saved nesting value back onto the core.
    #[inline]
    pub fn set_depth(&self, depth: u32) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// Drop the boot sentinel. Called once from `start_scheduler`.
    pub fn reset_for_scheduler_start(&self) {
        self.set_depth(0);
    }

    /// Mask interrupts and count one level of nesting. Returns the new depth.
    pub fn enter<M: InterruptMask + ?Sized>(&self, mask: &M) -> u32 {
        mask.disable();
        let depth = self.depth().wrapping_add(1);
        self.set_depth(depth);
        depth
    }

    /// Leave one level; unmask when the outermost level closes.
    ///
    /// An exit without a matching enter halts with
    /// [`Violation::UnmatchedCriticalExit`].
    pub fn exit<M: InterruptMask + ?Sized>(&self, mask: &M) -> u32 {
        let depth = self.depth();
        if depth == 0 {
            fatal(Violation::UnmatchedCriticalExit);
        }
        let depth = depth - 1;
        self.set_depth(depth);
        if depth == 0 {
            mask.enable();
        }
        depth
    }
}

impl Default for CriticalNesting {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute a closure inside a task-level critical section.
///
/// Keep the closure short: it runs with the local core's interrupts masked.
#[inline]
pub fn critical_section<M, F, R>(nesting: &CriticalNesting, mask: &M, f: F) -> R
where
    M: InterruptMask + ?Sized,
    F: FnOnce() -> R,
{
    nesting.enter(mask);
    let result = f();
    nesting.exit(mask);
    result
}

/// Interrupt-context critical section.
///
/// Masks on construction and puts back the previous state on drop. Does
/// not touch any nesting counter, so it is safe at any interrupt depth.
pub struct IsrCriticalSection<'a, M: InterruptMask + ?Sized> {
    mask: &'a M,
    saved: Option<SavedMask>,
}

impl<'a, M: InterruptMask + ?Sized> IsrCriticalSection<'a, M> {
    pub fn new(mask: &'a M) -> Self {
        let saved = mask.set_mask();
        Self {
            mask,
            saved: Some(saved),
        }
    }
}

impl<M: InterruptMask + ?Sized> Drop for IsrCriticalSection<'_, M> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.mask.clear_mask(saved);
        }
    }
}
