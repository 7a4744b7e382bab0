//! # Deferred Segment Reclamation
//!
//! A deleted task's segment chain may only go back to the free list once
//! it is provably not the chain some core is executing on. Deletions that
//! cannot be settled immediately are parked here and retried by whatever
//! background work the scheduler designates (typically the idle task).
//!
//! Reclaiming reads the head handle the task saved on its stack, so a
//! parked task is retried only after it has been switched out.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::config::RECLAIM_QUEUE_DEPTH;
use crate::context::SegmentPool;
use crate::error::PortError;
use crate::interrupt::InterruptMask;
use crate::task::TaskContext;

/// What happened to a deleted task's segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclamation {
    /// Returned to the free list now.
    Reclaimed,
    /// Parked until the task is no longer current.
    Deferred,
}

/// Fixed-capacity queue of deleted task contexts.
pub struct ReclaimQueue<const N: usize> {
    slots: [AtomicPtr<TaskContext>; N],
}

/// The queue sized by the build configuration.
pub type TaskReclaimQueue = ReclaimQueue<RECLAIM_QUEUE_DEPTH>;

impl<const N: usize> ReclaimQueue<N> {
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; N],
        }
    }

    /// Park `task` for a later [`drain`](Self::drain). A task already
    /// parked is refused, so its chain is reclaimed at most once.
    ///
    /// # Safety
    /// The storage behind `task` must stay valid until a drain reclaims it.
    pub unsafe fn defer(&self, task: &TaskContext) -> Result<(), PortError> {
        let entry = task as *const TaskContext as *mut TaskContext;
        if self.slots.iter().any(|slot| slot.load(Ordering::Acquire) == entry) {
            return Err(PortError::AlreadyDeferred);
        }
        for slot in &self.slots {
            if slot
                .compare_exchange(ptr::null_mut(), entry, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                log::warn!("reclaim: task {:p} still current, deferred", task);
                return Ok(());
            }
        }
        Err(PortError::ReclaimQueueFull)
    }

    /// Number of parked tasks.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
            .count()
    }

    /// Reclaim every parked task for which `is_current` is false; keep the
    /// rest. Returns how many chains went back to the pool.
    pub fn drain<M, F, const S: usize, const C: usize>(
        &self,
        pool: &SegmentPool<S, C>,
        mask: &M,
        is_current: F,
    ) -> usize
    where
        M: InterruptMask + ?Sized,
        F: Fn(&TaskContext) -> bool,
    {
        let mut reclaimed = 0;
        for slot in &self.slots {
            let entry = slot.load(Ordering::Acquire);
            if entry.is_null() {
                continue;
            }
            // SAFETY: `defer` requires the storage to outlive the entry.
            let task = unsafe { &*entry };
            if is_current(task) {
                continue;
            }
            if slot
                .compare_exchange(entry, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            // SAFETY: not current anywhere, so its last save is on its stack.
            let head = unsafe { SegmentPool::<S, C>::saved_head(task) };
            pool.reclaim_chain(mask, head);
            reclaimed += 1;
        }
        reclaimed
    }
}

impl<const N: usize> Default for ReclaimQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
