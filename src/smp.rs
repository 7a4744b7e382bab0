//! # Multicore Coordination
//!
//! Cross-core exclusion and signaling for configurations with more than
//! one core sharing a scheduler.
//!
//! - [`ExclusiveLock`]: a spinlock on one bit of a shared test-and-set word.
//!   Waiters back off with the architecture's low-power wait between tries.
//! - [`RecursiveLock`]: the spinlock plus a per-core, per-domain nesting
//!   counter. One bit per [`LockDomain`], so task-level and ISR-level
//!   holders on different cores serialize independently.
//! - [`InterProcessor`]: the IPI send/clear register pair used for
//!   cross-core yield requests.
//!
//! Masking interrupts only protects the local core; shared kernel state is
//! protected by these locks instead.

use core::sync::atomic::Ordering;

use crate::error::{fatal, Violation};
use crate::interrupt::InterruptMask;
use crate::percpu::{CoreDescriptor, CoreId};

/// Shared atomic test-and-set memory.
pub trait ExclusiveAccess {
    /// Atomically set `bit`. Returns `true` if it was clear, meaning the
    /// caller now owns it.
    fn test_and_set(&self, bit: u32) -> bool;

    /// Atomically clear `bit`.
    fn clear(&self, bit: u32);

    /// Back off between failed attempts.
    fn snooze(&self) {
        core::hint::spin_loop();
    }
}

impl<A: ExclusiveAccess + ?Sized> ExclusiveAccess for &A {
    fn test_and_set(&self, bit: u32) -> bool {
        (**self).test_and_set(bit)
    }

    fn clear(&self, bit: u32) {
        (**self).clear(bit)
    }

    fn snooze(&self) {
        (**self).snooze()
    }
}

/// Busy-wait lock on a single exclusive-access bit.
pub struct ExclusiveLock<'a, A: ?Sized> {
    hw: &'a A,
    bit: u32,
}

impl<'a, A: ExclusiveAccess + ?Sized> ExclusiveLock<'a, A> {
    pub fn new(hw: &'a A, bit: u32) -> Self {
        Self { hw, bit }
    }

    pub fn lock(&self) {
        while !self.hw.test_and_set(self.bit) {
            self.hw.snooze();
        }
    }

    pub fn unlock(&self) {
        self.hw.clear(self.bit);
    }
}

/// Context class a lock is taken from. Each domain has its own bit.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDomain {
    Task = 0,
    Isr = 1,
}

impl LockDomain {
    /// Exclusive-access bit guarding this domain.
    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// The domain matching where `core` is executing right now.
    pub fn current(core: &CoreDescriptor) -> Self {
        if core.in_interrupt() {
            Self::Isr
        } else {
            Self::Task
        }
    }
}

/// Recursive cross-core lock.
///
/// The hardware bit is held from the first `acquire` on a (core, domain)
/// pair to the matching last `release`. Counter updates run with local
/// interrupts masked.
pub struct RecursiveLock<'a, A: ?Sized, M: ?Sized> {
    hw: &'a A,
    mask: &'a M,
}

impl<'a, A, M> RecursiveLock<'a, A, M>
where
    A: ExclusiveAccess + ?Sized,
    M: InterruptMask + ?Sized,
{
    pub fn new(hw: &'a A, mask: &'a M) -> Self {
        Self { hw, mask }
    }

    pub fn acquire(&self, core: &CoreDescriptor, domain: LockDomain) {
        let saved = self.mask.set_mask();
        let nesting = core.lock_nesting(domain);
        if nesting.load(Ordering::Relaxed) == 0 {
            ExclusiveLock::new(self.hw, domain.bit()).lock();
        }
        nesting.fetch_add(1, Ordering::Relaxed);
        self.mask.clear_mask(saved);
    }

    /// Halts with [`Violation::UnheldLockRelease`] on a release past the
    /// matching acquire count.
    pub fn release(&self, core: &CoreDescriptor, domain: LockDomain) {
        let saved = self.mask.set_mask();
        let nesting = core.lock_nesting(domain);
        let held = nesting.load(Ordering::Relaxed);
        if held == 0 {
            fatal(Violation::UnheldLockRelease);
        }
        nesting.store(held - 1, Ordering::Relaxed);
        if held == 1 {
            ExclusiveLock::new(self.hw, domain.bit()).unlock();
        }
        self.mask.clear_mask(saved);
    }

    /// Run `f` with the lock held in `domain`.
    pub fn with<R>(&self, core: &CoreDescriptor, domain: LockDomain, f: impl FnOnce() -> R) -> R {
        self.acquire(core, domain);
        let result = f();
        self.release(core, domain);
        result
    }
}

/// Inter-processor interrupt controller.
pub trait InterProcessor {
    /// Id of the executing core.
    fn core_id(&self) -> CoreId;

    /// Raise the IPI on `target`.
    fn send_ipi(&self, target: CoreId);

    /// Acknowledge every IPI request pending on the executing core.
    fn clear_ipi(&self);
}

impl<P: InterProcessor + ?Sized> InterProcessor for &P {
    fn core_id(&self) -> CoreId {
        (**self).core_id()
    }

    fn send_ipi(&self, target: CoreId) {
        (**self).send_ipi(target)
    }

    fn clear_ipi(&self) {
        (**self).clear_ipi()
    }
}
