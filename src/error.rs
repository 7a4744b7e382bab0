//! # Errors
//!
//! The port layer distinguishes two kinds of failure:
//!
//! - [`PortError`]: resource conditions the caller can recover from, such as
//!   running out of context segments while creating a task.
//! - [`Violation`]: protocol violations after which the interrupt-mask or
//!   lock state is unknown. These never return; [`fatal`] logs and halts.

use core::fmt;

/// Recoverable failures, surfaced to the scheduler as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// Fewer than two free context segments were left at task creation.
    SegmentsExhausted,
    /// The context is still the current task of some core.
    ContextInUse,
    /// The deferred reclamation queue has no free slot.
    ReclaimQueueFull,
    /// The task is already parked in the reclamation queue.
    AlreadyDeferred,
    /// A core id outside the configured core count.
    InvalidCore(usize),
    /// The task stack cannot hold an initial frame.
    StackTooSmall { needed: usize, available: usize },
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentsExhausted => write!(f, "no free context segments"),
            Self::ContextInUse => write!(f, "context is still running on a core"),
            Self::ReclaimQueueFull => write!(f, "reclaim queue is full"),
            Self::AlreadyDeferred => write!(f, "task is already awaiting reclamation"),
            Self::InvalidCore(id) => write!(f, "core {} is not configured", id),
            Self::StackTooSmall { needed, available } => write!(
                f,
                "stack too small for initial frame ({} words needed, {} available)",
                needed, available
            ),
        }
    }
}

/// Fatal protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// `exit_critical` with the nesting counter already at 0.
    UnmatchedCriticalExit,
    /// Task-level `enter_critical` issued from interrupt context.
    CriticalFromIsr,
    /// Recursive lock released more often than acquired.
    UnheldLockRelease,
    /// A task function returned instead of deleting itself.
    TaskReturned,
    /// Interrupt nesting went past `MAX_INTERRUPT_NESTING`.
    InterruptNestingExceeded,
    /// Exit from an interrupt that was never entered.
    UnmatchedInterruptExit,
    /// Restoring a context whose segments are on the free list.
    ReleasedContextRestored,
    /// Returning segments to the pool that are already free.
    ReleasedContextReclaimed,
    /// The switch engine was entered while already switching on this core.
    SwitchReentered,
    /// A switch path ran before `start_scheduler`.
    SchedulerNotStarted,
    /// The executing core has no descriptor.
    UnknownCore,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::UnmatchedCriticalExit => "unmatched critical section exit",
            Self::CriticalFromIsr => "task critical section entered from interrupt",
            Self::UnheldLockRelease => "release of unheld recursive lock",
            Self::TaskReturned => "task function returned",
            Self::InterruptNestingExceeded => "interrupt nesting limit exceeded",
            Self::UnmatchedInterruptExit => "unmatched interrupt exit",
            Self::ReleasedContextRestored => "restore of released context",
            Self::ReleasedContextReclaimed => "reclaim of released context",
            Self::SwitchReentered => "context switch re-entered",
            Self::SchedulerNotStarted => "scheduler not started",
            Self::UnknownCore => "executing core is not configured",
        };
        f.write_str(msg)
    }
}

/// Report a protocol violation and halt.
///
/// Continuing would run with an unknown interrupt-mask or lock state, so
/// there is no recovery path. On the target the panic handler parks the
/// core; on the host the panic is observable from tests.
#[cold]
#[inline(never)]
pub fn fatal(violation: Violation) -> ! {
    log::error!("fatal: {}", violation);
    panic!("{}", violation);
}
