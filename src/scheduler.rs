//! # Scheduler Boundary
//!
//! The port layer never decides which task runs. It drives an external
//! scheduler through three calls and nothing else:
//!
//! - [`increment_tick`](Scheduler::increment_tick) from the tick ISR, with
//!   local interrupts masked;
//! - [`select_next_task`](Scheduler::select_next_task) between save and
//!   restore;
//! - [`current_task_context`](Scheduler::current_task_context) to locate the
//!   storage the engine saves into and restores from.
//!
//! Methods take `&self`; implementations keep their ready structures behind
//! whatever interior mutability fits. Interrupts are masked around every
//! call; on multicore the ISR-domain lock is also held around
//! `increment_tick`.

use crate::percpu::CoreId;
use crate::task::TaskContext;

pub trait Scheduler {
    /// Advance time by one tick. Returns whether a switch is due now.
    fn increment_tick(&self) -> bool;

    /// Make some ready task current on `core`; may keep the same one.
    /// Must not mask or unmask interrupts.
    fn select_next_task(&self, core: CoreId);

    /// Context storage of the task current on `core`.
    fn current_task_context(&self, core: CoreId) -> &TaskContext;
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    fn increment_tick(&self) -> bool {
        (**self).increment_tick()
    }

    fn select_next_task(&self, core: CoreId) {
        (**self).select_next_task(core)
    }

    fn current_task_context(&self, core: CoreId) -> &TaskContext {
        (**self).current_task_context(core)
    }
}
