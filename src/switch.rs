//! # Context Switch Engine
//!
//! Runs save → select → restore on one core. Entered only from interrupt
//! or trap context; the task being switched out never calls it directly.
//!
//! ```text
//!   Running(T) ──save T──► Switching ──select──► restore T′ ──► Running(T′)
//! ```
//!
//! The architecture supplies the [`ContextSwitch`] primitive pair; the
//! engine owns ordering, critical nesting handoff and the per-core state
//! machine.

use crate::context::Restored;
use crate::interrupt::InterruptMask;
use crate::percpu::{CoreDescriptor, CoreId, CoreState};
use crate::scheduler::Scheduler;
use crate::task::TaskContext;

/// Number of kernel call frames between the trap entry and the switch.
///
/// Linear-frame backends ignore it. Segmented backends walk `depth - 1`
/// links from the core's chain register before splicing, so a switch deep
/// inside a syscall handler returns through the handler's frames into the
/// new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDepth(u8);

impl CallDepth {
    /// A plain interrupt: splice at the top of the chain.
    pub const INTERRUPT: Self = Self(0);

    pub const fn new(depth: u8) -> Self {
        Self(depth)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

/// Opaque save/restore primitives of one architecture.
pub trait ContextSwitch {
    /// Write the running task's full context into `task`, together with the
    /// core's critical nesting.
    ///
    /// # Safety
    /// Local interrupts must be masked and `task` must be the context
    /// current on `core`.
    unsafe fn save_context(&self, core: CoreId, task: &TaskContext, critical_nesting: u32, depth: CallDepth);

    /// Make `task` the context `core` resumes on return from the trap.
    ///
    /// # Safety
    /// Local interrupts must be masked and `task` must hold a context
    /// produced by `save_context` or an initial-frame builder.
    unsafe fn restore_context(&self, core: CoreId, task: &TaskContext, depth: CallDepth) -> Restored;

    /// Pend the software interrupt whose handler runs the engine at
    /// syscall depth.
    fn trigger_switch(&self, core: CoreId);
}

impl<C: ContextSwitch + ?Sized> ContextSwitch for &C {
    unsafe fn save_context(&self, core: CoreId, task: &TaskContext, critical_nesting: u32, depth: CallDepth) {
        (**self).save_context(core, task, critical_nesting, depth)
    }

    unsafe fn restore_context(&self, core: CoreId, task: &TaskContext, depth: CallDepth) -> Restored {
        (**self).restore_context(core, task, depth)
    }

    fn trigger_switch(&self, core: CoreId) {
        (**self).trigger_switch(core)
    }
}

/// Borrowed view of everything one switch needs.
pub struct SwitchEngine<'a, M: ?Sized, C: ?Sized, S: ?Sized> {
    mask: &'a M,
    context: &'a C,
    scheduler: &'a S,
}

impl<'a, M, C, S> SwitchEngine<'a, M, C, S>
where
    M: InterruptMask + ?Sized,
    C: ContextSwitch + ?Sized,
    S: Scheduler + ?Sized,
{
    pub fn new(mask: &'a M, context: &'a C, scheduler: &'a S) -> Self {
        Self {
            mask,
            context,
            scheduler,
        }
    }

    /// Save the current task, let the scheduler choose, restore its choice.
    ///
    /// Halts if the core is not `Running` (switch before scheduler start, or
    /// a re-entered switch).
    pub fn switch(&self, core: &CoreDescriptor, depth: CallDepth) -> Restored {
        self.mask.disable();
        core.begin_switch();

        let id = core.id();
        let current = self.scheduler.current_task_context(id);
        // SAFETY: interrupts are masked and `current` is this core's task.
        unsafe {
            self.context
                .save_context(id, current, core.critical.depth(), depth)
        };

        self.scheduler.select_next_task(id);

        let next = self.scheduler.current_task_context(id);
        let restored = self.resume(core, next, depth);
        core.stats().record_switch();
        log::trace!(
            "core {}: switch {:p} -> {:p} (depth {})",
            id,
            current,
            next,
            depth.get()
        );
        restored
    }

    /// Restore the current task without saving anything. Used once per
    /// core to enter the first task.
    pub fn start_first(&self, core: &CoreDescriptor, depth: CallDepth) -> Restored {
        self.mask.disable();
        let task = self.scheduler.current_task_context(core.id());
        log::debug!("core {}: starting first task {:p}", core.id(), task);
        self.resume(core, task, depth)
    }

    fn resume(&self, core: &CoreDescriptor, task: &TaskContext, depth: CallDepth) -> Restored {
        // SAFETY: interrupts are masked; the scheduler only hands out
        // contexts that were initialized or saved.
        let restored = unsafe { self.context.restore_context(core.id(), task, depth) };
        core.critical.set_depth(restored.critical_nesting);
        core.set_state(CoreState::Running);
        // A task suspended inside a critical section resumes masked.
        if restored.interrupts_enabled && restored.critical_nesting == 0 {
            self.mask.enable();
        }
        restored
    }
}
