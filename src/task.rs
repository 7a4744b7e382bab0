//! # Task Storage
//!
//! The part of a task the port layer owns: its stack memory and the
//! private word through which the switch engine finds its suspended
//! context. Everything else about a task (state, priority, lists) belongs
//! to the scheduler.
//!
//! ## Memory Layout
//!
//! [`TaskContext`] is `repr(C)` with the saved top of stack as its first
//! field, so assembly can load it through the context pointer without
//! knowing the rest of the structure.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{fatal, Violation};

/// One machine word of stack.
pub type StackWord = usize;

/// Signature of a task entry point.
///
/// The parameter arrives exactly as the architecture's calling convention
/// delivers a first argument. A task must never return; if it does, the
/// return address planted in its initial frame lands in
/// [`task_exit_trap`].
pub type TaskFunction = extern "C" fn(*mut c_void);

/// Direction in which a task stack grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackGrowth {
    /// Pushes move toward lower addresses.
    Descending,
    /// Pushes move toward higher addresses.
    Ascending,
}

/// Private per-task context storage.
///
/// For linear frames `top_of_stack` addresses the saved frame itself. For
/// segmented frames it addresses the two link words (frame handle, then
/// critical nesting) pushed below the task's live stack pointer.
#[repr(C)]
#[derive(Debug)]
pub struct TaskContext {
    top_of_stack: AtomicPtr<StackWord>,
}

impl TaskContext {
    /// Storage for a task that has not been initialized yet.
    pub const fn new() -> Self {
        Self {
            top_of_stack: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn top_of_stack(&self) -> *mut StackWord {
        self.top_of_stack.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_top_of_stack(&self, top: *mut StackWord) {
        self.top_of_stack.store(top, Ordering::Release);
    }

    /// Whether an initial frame has been written for this task.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.top_of_stack().is_null()
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Statically sized task stack, aligned to 8 bytes as AAPCS requires.
#[repr(C, align(8))]
pub struct TaskStack<const WORDS: usize> {
    words: [StackWord; WORDS],
}

impl<const WORDS: usize> TaskStack<WORDS> {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Capacity in words.
    pub const fn len(&self) -> usize {
        WORDS
    }

    pub const fn is_empty(&self) -> bool {
        WORDS == 0
    }

    /// Where the first push lands for a stack growing in `growth`
    /// direction: one past the aligned end when descending, the base when
    /// ascending.
    pub fn initial_top(&mut self, growth: StackGrowth) -> *mut StackWord {
        let base = self.words.as_mut_ptr();
        match growth {
            StackGrowth::Ascending => base,
            StackGrowth::Descending => {
                let end = base as usize + WORDS * core::mem::size_of::<StackWord>();
                let aligned = end & !0x07;
                let words = (aligned - base as usize) / core::mem::size_of::<StackWord>();
                // SAFETY: `words <= WORDS`, so this stays one-past-the-end at most.
                unsafe { base.add(words) }
            }
        }
    }

    /// Stack contents, lowest address first.
    pub fn as_slice(&self) -> &[StackWord] {
        &self.words
    }

    /// Whether `ptr` lies inside this stack (one-past-the-end included).
    pub fn contains(&self, ptr: *const StackWord) -> bool {
        let base = self.words.as_ptr() as usize;
        let end = base + WORDS * core::mem::size_of::<StackWord>();
        (base..=end).contains(&(ptr as usize))
    }
}

impl<const WORDS: usize> Default for TaskStack<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

/// Landing pad for task functions that return.
///
/// A task must delete itself instead of returning; there is nothing to
/// return to. Reaching this is a protocol violation.
pub extern "C" fn task_exit_trap() {
    task_returned();
}

fn task_returned() -> ! {
    fatal(Violation::TaskReturned)
}

/// Address of [`task_exit_trap`] as a stack word.
#[inline]
pub fn task_exit_trap_address() -> StackWord {
    task_exit_trap as usize
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
