//! # Segmented Frames
//!
//! Context save areas for architectures that spill register state into a
//! global pool of fixed 16-word segments instead of onto the stack.
//!
//! Word 0 of every segment is a link word: a 20-bit handle of the next
//! segment plus two flag bits ([`PcxiFlags`]). Free segments form one
//! singly linked free list; a suspended task is a chain starting at its
//! lower-context segment, linked to its upper-context segment, linked to
//! whatever call frames the task had open.
//!
//! ```text
//!  task stack            segments
//!  ┌──────────┐          ┌───────────┐   ┌───────────┐   ┌───────────┐
//!  │ head  ───┼────────► │ lower ctx ├──►│ upper ctx ├──►│ call frame├──► 0
//!  │ nesting  │          └───────────┘   └───────────┘   └───────────┘
//!  └──────────┘
//! ```
//!
//! Save and restore never copy registers. They move the head handle
//! between the core's link register and the task's stack, splicing it in
//! at the right call depth when the switch runs below a chain of kernel
//! frames.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::config::{CONTEXT_SEGMENTS, MAX_CORES};
use crate::context::Restored;
use crate::error::{fatal, PortError, Violation};
use crate::interrupt::InterruptMask;
use crate::switch::CallDepth;
use crate::task::{task_exit_trap_address, StackWord, TaskContext, TaskFunction};

/// Words per segment, link word included.
pub const SEGMENT_WORDS: usize = 16;

/// Handle bits of a link word.
pub const HANDLE_MASK: u32 = 0x000F_FFFF;

/// Supervisor mode, register set 0, call depth counting disabled.
pub const INITIAL_PSW: StackWord = 0x0000_08FF;

/// Upper context word holding the status word.
pub const UPPER_PSW: usize = 1;
/// Upper context word holding the stack pointer (A10).
pub const UPPER_SP: usize = 2;
/// Upper context word holding the return address (A11).
pub const UPPER_RA: usize = 3;
/// Lower context word holding the resume address (A11).
pub const LOWER_PC: usize = 1;
/// Lower context word holding the first address argument (A4).
pub const LOWER_ARG: usize = 8;

bitflags! {
    /// Flag bits carried in a link word next to the handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcxiFlags: u32 {
        /// The linked segment holds an upper context.
        const UL = 1 << 20;
        /// Interrupts were enabled in the context the link returns to.
        const PIE = 1 << 21;
    }
}

/// A raw link word: segment handle plus flags. Handle 0 terminates a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentHandle(u32);

impl SegmentHandle {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    const fn for_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    /// Pool index of the linked segment, `None` at the end of a chain.
    pub fn index(self) -> Option<usize> {
        match self.0 & HANDLE_MASK {
            0 => None,
            h => Some(h as usize - 1),
        }
    }

    pub fn is_null(self) -> bool {
        self.0 & HANDLE_MASK == 0
    }

    pub fn flags(self) -> PcxiFlags {
        PcxiFlags::from_bits_truncate(self.0)
    }

    /// The handle with its flag bits stripped.
    pub fn address(self) -> Self {
        Self(self.0 & HANDLE_MASK)
    }

    pub fn with_flags(self, flags: PcxiFlags) -> Self {
        Self((self.0 & HANDLE_MASK) | flags.bits())
    }
}

type Segment = [StackWord; SEGMENT_WORDS];

/// Global pool of `N` context segments shared by `CORES` cores.
///
/// Each core has a link register holding the head of its live chain.
/// The free list is shared; every operation that takes or returns
/// segments does so under a short spin guard so cores can allocate
/// concurrently.
pub struct SegmentPool<const N: usize, const CORES: usize> {
    segments: UnsafeCell<[Segment; N]>,
    in_use: [AtomicBool; N],
    free_head: AtomicU32,
    free_guard: AtomicBool,
    link: [AtomicU32; CORES],
}

/// The pool sized by the build configuration.
pub type ContextPool = SegmentPool<CONTEXT_SEGMENTS, MAX_CORES>;

// SAFETY: segment words are only written by the core that owns the chain
// (interrupts masked) or under `free_guard` for free-list splicing.
unsafe impl<const N: usize, const CORES: usize> Sync for SegmentPool<N, CORES> {}

impl<const N: usize, const CORES: usize> SegmentPool<N, CORES> {
    /// A pool with every segment threaded onto the free list in index order.
    pub const fn new() -> Self {
        let mut segments = [[0; SEGMENT_WORDS]; N];
        let mut i = 0;
        while i + 1 < N {
            segments[i][0] = SegmentHandle::for_index(i + 1).0 as StackWord;
            i += 1;
        }
        Self {
            segments: UnsafeCell::new(segments),
            in_use: [const { AtomicBool::new(false) }; N],
            free_head: AtomicU32::new(if N > 0 { 1 } else { 0 }),
            free_guard: AtomicBool::new(false),
            link: [const { AtomicU32::new(0) }; CORES],
        }
    }

    fn slot(&self, handle: SegmentHandle) -> *mut Segment {
        let index = match handle.index() {
            Some(index) if index < N => index,
            _ => fatal(Violation::ReleasedContextRestored),
        };
        // SAFETY: index is in bounds of the array behind the cell.
        unsafe { (self.segments.get() as *mut Segment).add(index) }
    }

    fn word(&self, handle: SegmentHandle, word: usize) -> StackWord {
        // SAFETY: `slot` returns an in-bounds segment.
        unsafe { (*self.slot(handle))[word] }
    }

    fn set_word(&self, handle: SegmentHandle, word: usize, value: StackWord) {
        // SAFETY: see `word`; the caller owns the segment.
        unsafe { (*self.slot(handle))[word] = value }
    }

    fn next(&self, handle: SegmentHandle) -> SegmentHandle {
        SegmentHandle::from_raw(self.word(handle, 0) as u32)
    }

    /// Whether `handle` names a segment that is currently allocated.
    pub fn is_in_use(&self, handle: SegmentHandle) -> bool {
        match handle.index() {
            Some(index) if index < N => self.in_use[index].load(Ordering::Acquire),
            _ => false,
        }
    }

    fn with_free_list<R>(&self, f: impl FnOnce(&mut SegmentHandle) -> R) -> R {
        while self
            .free_guard
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let mut head = SegmentHandle::from_raw(self.free_head.load(Ordering::Relaxed));
        let result = f(&mut head);
        self.free_head.store(head.raw(), Ordering::Relaxed);
        self.free_guard.store(false, Ordering::Release);
        result
    }

    /// Head of the free list.
    pub fn free_head(&self) -> SegmentHandle {
        SegmentHandle::from_raw(self.free_head.load(Ordering::Acquire))
    }

    /// Number of segments on the free list.
    pub fn free_count(&self) -> usize {
        self.with_free_list(|head| {
            let mut count = 0;
            let mut cursor = *head;
            while !cursor.is_null() && count < N {
                count += 1;
                cursor = self.next(cursor);
            }
            count
        })
    }

    fn allocate(&self, count: usize) -> Result<[SegmentHandle; 2], PortError> {
        debug_assert!(count <= 2);
        self.with_free_list(|head| {
            let mut taken = [SegmentHandle::NULL; 2];
            let mut cursor = *head;
            for slot in taken.iter_mut().take(count) {
                if cursor.is_null() {
                    return Err(PortError::SegmentsExhausted);
                }
                *slot = cursor.address();
                cursor = self.next(cursor);
            }
            *head = cursor;
            for handle in taken.iter().take(count) {
                if let Some(index) = handle.index() {
                    self.in_use[index].store(true, Ordering::Release);
                }
            }
            Ok(taken)
        })
    }

    fn release(&self, handle: SegmentHandle) {
        let handle = handle.address();
        self.with_free_list(|head| {
            self.set_word(handle, 0, head.raw() as StackWord);
            *head = handle;
        });
        if let Some(index) = handle.index() {
            self.in_use[index].store(false, Ordering::Release);
        }
    }

    /// Head of `core`'s live chain (the core's link register).
    pub fn current(&self, core: usize) -> SegmentHandle {
        SegmentHandle::from_raw(self.link[core].load(Ordering::Relaxed))
    }

    pub fn set_current(&self, core: usize, head: SegmentHandle) {
        self.link[core].store(head.raw(), Ordering::Relaxed);
    }

    /// Copy of a segment's words.
    pub fn segment(&self, handle: SegmentHandle) -> Segment {
        // SAFETY: `slot` returns an in-bounds segment.
        unsafe { *self.slot(handle) }
    }

    /// Spill one context onto `core`'s live chain, as a call or interrupt
    /// entry does. The new segment links to the previous head; the core's
    /// link register then names the new segment with `UL` and `PIE` set
    /// from `upper` and `interrupts_enabled`.
    pub fn push(
        &self,
        core: usize,
        data: &[StackWord; SEGMENT_WORDS - 1],
        upper: bool,
        interrupts_enabled: bool,
    ) -> Result<SegmentHandle, PortError> {
        let [handle, _] = self.allocate(1)?;
        self.set_word(handle, 0, self.current(core).raw() as StackWord);
        for (i, value) in data.iter().enumerate() {
            self.set_word(handle, i + 1, *value);
        }
        let mut flags = PcxiFlags::empty();
        flags.set(PcxiFlags::UL, upper);
        flags.set(PcxiFlags::PIE, interrupts_enabled);
        self.set_current(core, handle.with_flags(flags));
        Ok(handle)
    }

    /// Reload the head of `core`'s live chain, as a return does: the
    /// segment goes back to the free list and the link register takes
    /// its link word.
    pub fn pop(&self, core: usize) -> Segment {
        let head = self.current(core);
        if !self.is_in_use(head) {
            fatal(Violation::ReleasedContextRestored);
        }
        let segment = self.segment(head);
        self.set_current(core, SegmentHandle::from_raw(segment[0] as u32));
        self.release(head);
        segment
    }

    /// Build the initial context of a new task from two free segments.
    ///
    /// The upper context holds the stack pointer `top`, the initial status
    /// word and the exit trap as return address; the lower context holds
    /// the entry point and `parameter`. Two words go onto the stack below
    /// `top`: the lower-context handle, then critical nesting 0.
    ///
    /// # Safety
    /// `top` must be the top of a descending stack with at least two free
    /// words below it.
    pub unsafe fn initialize_stack<M: InterruptMask + ?Sized>(
        &self,
        mask: &M,
        top: *mut StackWord,
        entry: TaskFunction,
        parameter: *mut c_void,
    ) -> Result<*mut StackWord, PortError> {
        let [lower, upper] = {
            let saved = mask.set_mask();
            let taken = self.allocate(2);
            mask.clear_mask(saved);
            taken?
        };

        let mut upper_ctx = [0; SEGMENT_WORDS];
        upper_ctx[0] = PcxiFlags::PIE.bits() as StackWord;
        upper_ctx[UPPER_PSW] = INITIAL_PSW;
        upper_ctx[UPPER_SP] = top as StackWord;
        upper_ctx[UPPER_RA] = task_exit_trap_address();
        *self.slot(upper) = upper_ctx;

        let mut lower_ctx = [0; SEGMENT_WORDS];
        lower_ctx[0] = upper.with_flags(PcxiFlags::UL | PcxiFlags::PIE).raw() as StackWord;
        lower_ctx[LOWER_PC] = entry as usize;
        lower_ctx[LOWER_ARG] = parameter as usize;
        *self.slot(lower) = lower_ctx;

        let top = top.sub(2);
        top.write(lower.raw() as StackWord);
        top.add(1).write(0);
        log::trace!("segments {:?}/{:?} for new task", lower, upper);
        Ok(top)
    }

    /// Segment whose link word leads to the task at `depth`: the first
    /// frame is the core's link register, each further level one link down.
    fn frame_at_depth(&self, core: usize, depth: CallDepth) -> SegmentHandle {
        let mut frame = self.current(core);
        for _ in 1..depth.get() {
            frame = self.next(frame);
        }
        frame
    }

    /// Record the task running on `core` into `task`.
    ///
    /// At depth 0 the core's link register already names the task's lower
    /// context; at depth `d` it is the link word of the `d`-th kernel frame.
    /// The head handle and `critical_nesting` are pushed below the task's
    /// stack pointer taken from its upper context.
    ///
    /// # Safety
    /// Interrupts must be masked and the chain at `depth` must hold a saved
    /// lower/upper pair whose stack pointer has two free words below it.
    pub unsafe fn save(&self, core: usize, task: &TaskContext, critical_nesting: u32, depth: CallDepth) {
        let lower = if depth.get() == 0 {
            self.current(core)
        } else {
            self.next(self.frame_at_depth(core, depth))
        };
        let upper = self.next(lower);
        let sp = self.word(upper, UPPER_SP) as *mut StackWord;
        let top = sp.sub(2);
        top.write(lower.address().raw() as StackWord);
        top.add(1).write(critical_nesting as StackWord);
        task.set_top_of_stack(top);
    }

    /// Make `task` the context `core` returns into at `depth`.
    ///
    /// Halts with [`Violation::ReleasedContextRestored`] if the task's head
    /// segment is on the free list.
    ///
    /// # Safety
    /// Interrupts must be masked and `task` must hold a top of stack written
    /// by [`save`](Self::save) or [`initialize_stack`](Self::initialize_stack).
    pub unsafe fn restore(&self, core: usize, task: &TaskContext, depth: CallDepth) -> Restored {
        let top = task.top_of_stack();
        let head = SegmentHandle::from_raw(top.read() as u32).address();
        let critical_nesting = top.add(1).read() as u32;
        if !self.is_in_use(head) {
            fatal(Violation::ReleasedContextRestored);
        }
        task.set_top_of_stack(top.add(2));

        if depth.get() == 0 {
            self.set_current(core, head);
        } else {
            let frame = self.frame_at_depth(core, depth);
            self.set_word(frame, 0, head.raw() as StackWord);
        }

        Restored {
            critical_nesting,
            interrupts_enabled: self.next(head).flags().contains(PcxiFlags::PIE),
        }
    }

    /// Head handle saved on a suspended task's stack.
    ///
    /// # Safety
    /// `task` must be suspended, with a top of stack written by
    /// [`save`](Self::save) or [`initialize_stack`](Self::initialize_stack).
    pub unsafe fn saved_head(task: &TaskContext) -> SegmentHandle {
        SegmentHandle::from_raw(task.top_of_stack().read() as u32).address()
    }

    /// Return a whole chain to the free list in one splice: the chain's
    /// tail is linked to the current free head and `head` becomes the new
    /// free head. Flag bits along the chain are cleared.
    ///
    /// The chain must not be any core's live chain. Halts with
    /// [`Violation::ReleasedContextReclaimed`] if any segment of it is
    /// already free.
    pub fn reclaim_chain<M: InterruptMask + ?Sized>(&self, mask: &M, head: SegmentHandle) {
        let head = head.address();
        if head.is_null() {
            return;
        }
        let mut cursor = head;
        let mut steps = 0;
        while !cursor.is_null() && steps < N {
            if !self.is_in_use(cursor) {
                fatal(Violation::ReleasedContextReclaimed);
            }
            cursor = self.next(cursor).address();
            steps += 1;
        }

        let mut tail = head;
        let mut released = 1;
        loop {
            if let Some(index) = tail.index() {
                self.in_use[index].store(false, Ordering::Release);
            }
            let next = self.next(tail);
            if next.is_null() || released >= N {
                break;
            }
            self.set_word(tail, 0, next.address().raw() as StackWord);
            tail = next.address();
            released += 1;
        }

        let saved = mask.set_mask();
        self.with_free_list(|free| {
            self.set_word(tail, 0, free.raw() as StackWord);
            *free = head;
        });
        mask.clear_mask(saved);
        log::debug!("reclaimed {} segments from {:?}", released, head);
    }

    /// Check pool integrity: every segment is reachable exactly once from
    /// the free list, a core's live chain, or one of `suspended` heads.
    pub fn audit(&self, suspended: &[SegmentHandle]) -> bool {
        let mut seen = [false; N];
        let mut visit = |start: SegmentHandle| -> bool {
            let mut cursor = start;
            let mut steps = 0;
            while !cursor.is_null() {
                let index = match cursor.index() {
                    Some(index) if index < N => index,
                    _ => return false,
                };
                if seen[index] || steps >= N {
                    return false;
                }
                seen[index] = true;
                steps += 1;
                cursor = self.next(cursor);
            }
            true
        };

        if !visit(self.free_head()) {
            return false;
        }
        for core in 0..CORES {
            if !visit(self.current(core)) {
                return false;
            }
        }
        for head in suspended {
            if !visit(*head) {
                return false;
            }
        }
        seen.iter().all(|s| *s)
    }
}

impl<const N: usize, const CORES: usize> Default for SegmentPool<N, CORES> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStack;
    use core::cell::Cell;

    struct Irq(Cell<bool>);

    impl InterruptMask for Irq {
        fn disable(&self) {
            self.0.set(false);
        }
        fn enable(&self) {
            self.0.set(true);
        }
        fn is_enabled(&self) -> bool {
            self.0.get()
        }
    }

    extern "C" fn entry(_: *mut c_void) {}

    fn new_task<const N: usize>(
        pool: &SegmentPool<N, 1>,
        stack: &mut TaskStack<32>,
        ctx: &TaskContext,
    ) -> Result<(), PortError> {
        let irq = Irq(Cell::new(true));
        let top = stack.initial_top(crate::task::StackGrowth::Descending);
        let top = unsafe { pool.initialize_stack(&irq, top, entry, 7usize as *mut c_void)? };
        ctx.set_top_of_stack(top);
        assert!(irq.is_enabled());
        Ok(())
    }

    #[test]
    fn configured_pool_threads_every_segment() {
        static POOL: ContextPool = ContextPool::new();
        assert_eq!(POOL.free_count(), CONTEXT_SEGMENTS);
        assert_eq!(POOL.current(MAX_CORES - 1), SegmentHandle::NULL);
        assert!(POOL.audit(&[]));
    }

    #[test]
    fn new_pool_is_all_free() {
        let pool = SegmentPool::<8, 1>::new();
        assert_eq!(pool.free_count(), 8);
        assert!(pool.audit(&[]));
    }

    #[test]
    fn initial_context_links_lower_to_upper() {
        let pool = SegmentPool::<8, 1>::new();
        let mut stack = TaskStack::<32>::new();
        let ctx = TaskContext::new();
        new_task(&pool, &mut stack, &ctx).unwrap();
        assert_eq!(pool.free_count(), 6);

        let head = unsafe { SegmentPool::<8, 1>::saved_head(&ctx) };
        let lower = pool.segment(head);
        let link = SegmentHandle::from_raw(lower[0] as u32);
        assert!(link.flags().contains(PcxiFlags::UL | PcxiFlags::PIE));
        assert_eq!(lower[LOWER_PC], entry as usize);
        assert_eq!(lower[LOWER_ARG], 7);

        let upper = pool.segment(link);
        assert_eq!(upper[UPPER_PSW], INITIAL_PSW);
        assert_eq!(upper[UPPER_RA], task_exit_trap_address());
        assert_eq!(upper[UPPER_SP], ctx.top_of_stack() as usize + 2 * core::mem::size_of::<StackWord>());
        assert!(SegmentHandle::from_raw(upper[0] as u32).is_null());
        assert!(pool.audit(&[head]));
    }

    #[test]
    fn exhaustion_leaves_pool_untouched() {
        let pool = SegmentPool::<3, 1>::new();
        let mut a = TaskStack::<32>::new();
        let mut b = TaskStack::<32>::new();
        let (ca, cb) = (TaskContext::new(), TaskContext::new());
        new_task(&pool, &mut a, &ca).unwrap();
        assert_eq!(new_task(&pool, &mut b, &cb), Err(PortError::SegmentsExhausted));
        assert_eq!(pool.free_count(), 1);
        assert!(!cb.is_initialized());
    }

    #[test]
    fn reclaim_returns_whole_chain() {
        let pool = SegmentPool::<8, 1>::new();
        let irq = Irq(Cell::new(true));
        let mut stack = TaskStack::<32>::new();
        let ctx = TaskContext::new();
        new_task(&pool, &mut stack, &ctx).unwrap();

        let head = unsafe { SegmentPool::<8, 1>::saved_head(&ctx) };
        pool.reclaim_chain(&irq, head);
        assert_eq!(pool.free_count(), 8);
        assert!(!pool.is_in_use(head));
        assert!(pool.audit(&[]));
        assert!(irq.is_enabled());
    }

    #[test]
    #[should_panic(expected = "reclaim of released context")]
    fn reclaiming_a_chain_twice_is_fatal() {
        let pool = SegmentPool::<8, 1>::new();
        let irq = Irq(Cell::new(true));
        let mut stack = TaskStack::<32>::new();
        let ctx = TaskContext::new();
        new_task(&pool, &mut stack, &ctx).unwrap();

        let head = unsafe { SegmentPool::<8, 1>::saved_head(&ctx) };
        pool.reclaim_chain(&irq, head);
        pool.reclaim_chain(&irq, head);
    }

    #[test]
    #[should_panic(expected = "reclaim of released context")]
    fn chain_running_into_free_segment_is_fatal() {
        let pool = SegmentPool::<8, 1>::new();
        let irq = Irq(Cell::new(true));
        let (mut sa, mut sb) = (TaskStack::<32>::new(), TaskStack::<32>::new());
        let (a, b) = (TaskContext::new(), TaskContext::new());
        new_task(&pool, &mut sa, &a).unwrap();
        new_task(&pool, &mut sb, &b).unwrap();

        // Free A's upper segment on its own, then reclaim the whole chain.
        let head = unsafe { SegmentPool::<8, 1>::saved_head(&a) };
        let upper = SegmentHandle::from_raw(pool.segment(head)[0] as u32).address();
        pool.reclaim_chain(&irq, upper);
        assert_eq!(pool.free_count(), 5);
        pool.reclaim_chain(&irq, head);
    }

    #[test]
    fn save_and_restore_at_interrupt_depth() {
        let pool = SegmentPool::<8, 1>::new();
        let mut sa = TaskStack::<32>::new();
        let mut sb = TaskStack::<32>::new();
        let (a, b) = (TaskContext::new(), TaskContext::new());
        new_task(&pool, &mut sa, &a).unwrap();
        new_task(&pool, &mut sb, &b).unwrap();

        let a_head = unsafe { SegmentPool::<8, 1>::saved_head(&a) };
        let restored = unsafe { pool.restore(0, &a, CallDepth::INTERRUPT) };
        assert_eq!(pool.current(0), a_head);
        assert_eq!(restored.critical_nesting, 0);
        assert!(restored.interrupts_enabled);

        unsafe { pool.save(0, &a, 3, CallDepth::INTERRUPT) };
        assert_eq!(unsafe { SegmentPool::<8, 1>::saved_head(&a) }, a_head);
        assert_eq!(unsafe { a.top_of_stack().add(1).read() }, 3);

        unsafe { pool.restore(0, &b, CallDepth::INTERRUPT) };
        let back = unsafe { pool.restore(0, &a, CallDepth::INTERRUPT) };
        assert_eq!(back.critical_nesting, 3);
    }

    #[test]
    fn deep_switch_splices_below_kernel_frames() {
        let pool = SegmentPool::<8, 1>::new();
        let mut sa = TaskStack::<32>::new();
        let mut sb = TaskStack::<32>::new();
        let (a, b) = (TaskContext::new(), TaskContext::new());
        new_task(&pool, &mut sa, &a).unwrap();
        new_task(&pool, &mut sb, &b).unwrap();
        let a_head = unsafe { SegmentPool::<8, 1>::saved_head(&a) };
        let b_head = unsafe { SegmentPool::<8, 1>::saved_head(&b) };

        // Task A is the live chain; two kernel frames sit on top of it.
        unsafe { pool.restore(0, &a, CallDepth::INTERRUPT) };
        let first = pool.push(0, &[0x11; 15], true, false).unwrap();
        pool.push(0, &[0x22; 15], true, false).unwrap();

        let depth = CallDepth::new(2);
        unsafe { pool.save(0, &a, 0, depth) };
        assert_eq!(unsafe { SegmentPool::<8, 1>::saved_head(&a) }, a_head);

        unsafe { pool.restore(0, &b, depth) };
        assert_eq!(SegmentHandle::from_raw(pool.segment(first)[0] as u32), b_head);

        // Unwinding the kernel frames lands in B.
        assert_eq!(pool.pop(0)[1], 0x22);
        assert_eq!(pool.pop(0)[1], 0x11);
        assert_eq!(pool.current(0), b_head);
        assert!(pool.audit(&[a_head]));
    }

    #[test]
    #[should_panic(expected = "restore of released context")]
    fn restoring_reclaimed_context_is_fatal() {
        let pool = SegmentPool::<8, 1>::new();
        let irq = Irq(Cell::new(true));
        let mut stack = TaskStack::<32>::new();
        let ctx = TaskContext::new();
        new_task(&pool, &mut stack, &ctx).unwrap();
        let head = unsafe { SegmentPool::<8, 1>::saved_head(&ctx) };
        pool.reclaim_chain(&irq, head);
        unsafe { pool.restore(0, &ctx, CallDepth::INTERRUPT) };
    }

    #[test]
    fn audit_detects_leaked_segment() {
        let pool = SegmentPool::<8, 1>::new();
        let mut stack = TaskStack::<32>::new();
        let ctx = TaskContext::new();
        new_task(&pool, &mut stack, &ctx).unwrap();
        // The task's chain is not reported, so two segments are unreachable.
        assert!(!pool.audit(&[]));
    }
}
