//! # Simulated Machine
//!
//! A host-side stand-in for the hardware the port drives, used by the unit
//! tests and available to downstream crates through the `sim` feature.
//!
//! One [`SimMachine`] models `CORES` cores on a shared bus:
//!
//! - per core: interrupt-enable bit, compare-match tick timer, software
//!   interrupt pending bit;
//! - shared: IPI request register (one bit per core) and the exclusive
//!   access word, both real atomics so the spinlock can be exercised from
//!   several host threads.
//!
//! Which core is "executing" is explicit: tests pick it with
//! [`SimMachine::run_as`].
//!
//! The register files of the two context flavours live next to it:
//! [`SimLinearContext`] for stack frames described by a
//! [`FrameLayout`], [`SimSegmentedContext`] for the segment pool.

use core::array;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::context::linear::MAX_FRAME_WORDS;
use crate::context::segmented::{LOWER_ARG, LOWER_PC, SEGMENT_WORDS, UPPER_RA, UPPER_SP};
use crate::context::{FrameLayout, LinearFrame, Restored, SegmentPool};
use crate::error::PortError;
use crate::interrupt::InterruptMask;
use crate::percpu::CoreId;
use crate::scheduler::Scheduler;
use crate::smp::{ExclusiveAccess, InterProcessor};
use crate::switch::{CallDepth, ContextSwitch};
use crate::task::{StackWord, TaskContext};
use crate::tick::TickTimer;

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SimTimer {
    counter: AtomicU32,
    compare: AtomicU32,
    pending: AtomicBool,
    running: AtomicBool,
}

#[derive(Debug, Default)]
struct SimCore {
    interrupts_enabled: AtomicBool,
    timer: SimTimer,
    swi_pending: AtomicBool,
}

/// Simulated multicore machine.
#[derive(Debug)]
pub struct SimMachine<const CORES: usize> {
    current: AtomicUsize,
    cores: [SimCore; CORES],
    ipi_requests: AtomicU32,
    exclusive: AtomicU32,
    snoozes: AtomicU32,
}

impl<const CORES: usize> SimMachine<CORES> {
    /// All cores reset: interrupts masked, timers stopped, core 0 executing.
    pub fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            cores: array::from_fn(|_| SimCore::default()),
            ipi_requests: AtomicU32::new(0),
            exclusive: AtomicU32::new(0),
            snoozes: AtomicU32::new(0),
        }
    }

    /// Make `core` the executing core.
    pub fn run_as(&self, core: CoreId) -> Result<(), PortError> {
        if core >= CORES {
            return Err(PortError::InvalidCore(core));
        }
        self.current.store(core, Ordering::Relaxed);
        Ok(())
    }

    fn local(&self) -> &SimCore {
        &self.cores[self.current.load(Ordering::Relaxed)]
    }

    /// Interrupt-enable bit of `core`.
    pub fn interrupts_enabled_on(&self, core: CoreId) -> bool {
        self.cores[core].interrupts_enabled.load(Ordering::Relaxed)
    }

    /// Let `cycles` pass on the executing core's timer. Sets the pending
    /// flag if the counter crosses the compare value.
    pub fn advance_timer(&self, cycles: u32) {
        let timer = &self.local().timer;
        let before = timer.counter.load(Ordering::Relaxed);
        let after = before.wrapping_add(cycles);
        timer.counter.store(after, Ordering::Relaxed);
        let until_compare = timer.compare.load(Ordering::Relaxed).wrapping_sub(before);
        if timer.running.load(Ordering::Relaxed) && until_compare <= cycles {
            timer.pending.store(true, Ordering::Relaxed);
        }
    }

    pub fn timer_pending(&self) -> bool {
        self.local().timer.pending.load(Ordering::Relaxed)
    }

    pub fn timer_running(&self) -> bool {
        self.local().timer.running.load(Ordering::Relaxed)
    }

    pub fn timer_compare(&self) -> u32 {
        self.local().timer.compare.load(Ordering::Relaxed)
    }

    /// Whether an IPI request is pending for `core`.
    pub fn ipi_pending(&self, core: CoreId) -> bool {
        self.ipi_requests.load(Ordering::Acquire) & (1 << core) != 0
    }

    /// Whether the exclusive-access `bit` is held.
    pub fn exclusive_held(&self, bit: u32) -> bool {
        self.exclusive.load(Ordering::Acquire) & (1 << bit) != 0
    }

    pub fn snoozes(&self) -> u32 {
        self.snoozes.load(Ordering::Relaxed)
    }
}

impl<const CORES: usize> Default for SimMachine<CORES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CORES: usize> InterruptMask for SimMachine<CORES> {
    fn disable(&self) {
        self.local().interrupts_enabled.store(false, Ordering::Relaxed);
    }

    fn enable(&self) {
        self.local().interrupts_enabled.store(true, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.local().interrupts_enabled.load(Ordering::Relaxed)
    }
}

impl<const CORES: usize> TickTimer for SimMachine<CORES> {
    fn start(&self, period: u32) {
        let timer = &self.local().timer;
        let now = timer.counter.load(Ordering::Relaxed);
        timer.compare.store(now.wrapping_add(period), Ordering::Relaxed);
        timer.pending.store(false, Ordering::Relaxed);
        timer.running.store(true, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.local().timer.running.store(false, Ordering::Relaxed);
    }

    fn clear_pending(&self) {
        self.local().timer.pending.store(false, Ordering::Relaxed);
    }

    fn advance_compare(&self, period: u32) -> Option<u32> {
        let timer = &self.local().timer;
        let compare = timer.compare.load(Ordering::Relaxed).wrapping_add(period);
        timer.compare.store(compare, Ordering::Relaxed);
        Some(compare.wrapping_sub(timer.counter.load(Ordering::Relaxed)))
    }
}

impl<const CORES: usize> ExclusiveAccess for SimMachine<CORES> {
    fn test_and_set(&self, bit: u32) -> bool {
        self.exclusive.fetch_or(1 << bit, Ordering::AcqRel) & (1 << bit) == 0
    }

    fn clear(&self, bit: u32) {
        self.exclusive.fetch_and(!(1 << bit), Ordering::Release);
    }

    fn snooze(&self) {
        self.snoozes.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }
}

impl<const CORES: usize> InterProcessor for SimMachine<CORES> {
    fn core_id(&self) -> CoreId {
        self.current.load(Ordering::Relaxed)
    }

    fn send_ipi(&self, target: CoreId) {
        self.ipi_requests.fetch_or(1 << target, Ordering::AcqRel);
    }

    fn clear_ipi(&self) {
        let me = self.core_id();
        self.ipi_requests.fetch_and(!(1 << me), Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Linear-frame register files
// ---------------------------------------------------------------------------

/// Per-core register files for a linear-frame architecture `L`.
///
/// Register `i` is the value that lands in slot `i` of a saved frame. The
/// stack pointer is kept separately.
pub struct SimLinearContext<L: FrameLayout, const CORES: usize> {
    registers: [[AtomicUsize; MAX_FRAME_WORDS]; CORES],
    sp: [AtomicPtr<StackWord>; CORES],
    swi_pending: [AtomicBool; CORES],
    _layout: PhantomData<L>,
}

impl<L: FrameLayout, const CORES: usize> SimLinearContext<L, CORES> {
    pub fn new() -> Self {
        assert!(LinearFrame::<L>::WORDS <= MAX_FRAME_WORDS);
        Self {
            registers: array::from_fn(|_| array::from_fn(|_| AtomicUsize::new(0))),
            sp: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            swi_pending: array::from_fn(|_| AtomicBool::new(false)),
            _layout: PhantomData,
        }
    }

    pub fn register(&self, core: CoreId, index: usize) -> StackWord {
        self.registers[core][index].load(Ordering::Relaxed)
    }

    pub fn set_register(&self, core: CoreId, index: usize, value: StackWord) {
        self.registers[core][index].store(value, Ordering::Relaxed);
    }

    /// Snapshot of the live registers of `core` in frame order.
    pub fn registers(&self, core: CoreId) -> [StackWord; MAX_FRAME_WORDS] {
        array::from_fn(|i| self.register(core, i))
    }

    pub fn program_counter(&self, core: CoreId) -> StackWord {
        self.register(core, LinearFrame::<L>::PROGRAM_COUNTER)
    }

    pub fn argument(&self, core: CoreId) -> StackWord {
        self.register(core, LinearFrame::<L>::ARGUMENT)
    }

    pub fn status(&self, core: CoreId) -> StackWord {
        self.register(core, LinearFrame::<L>::STATUS)
    }

    pub fn stack_pointer(&self, core: CoreId) -> *mut StackWord {
        self.sp[core].load(Ordering::Relaxed)
    }

    /// Pretend the running task executed for a while: every register except
    /// the status word takes a value derived from `seed`.
    pub fn scramble(&self, core: CoreId, seed: StackWord) {
        for i in 0..LinearFrame::<L>::WORDS {
            if i != LinearFrame::<L>::STATUS && i != LinearFrame::<L>::CRITICAL_NESTING {
                self.set_register(core, i, seed.wrapping_mul(31).wrapping_add(i));
            }
        }
    }

    /// Consume the software interrupt request of `core`.
    pub fn take_software_interrupt(&self, core: CoreId) -> bool {
        self.swi_pending[core].swap(false, Ordering::AcqRel)
    }
}

impl<L: FrameLayout, const CORES: usize> Default for SimLinearContext<L, CORES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: FrameLayout, const CORES: usize> ContextSwitch for SimLinearContext<L, CORES> {
    unsafe fn save_context(&self, core: CoreId, task: &TaskContext, critical_nesting: u32, _depth: CallDepth) {
        let registers = self.registers(core);
        let top = LinearFrame::<L>::push(
            self.stack_pointer(core),
            &registers[..LinearFrame::<L>::WORDS],
            critical_nesting,
        );
        task.set_top_of_stack(top);
    }

    unsafe fn restore_context(&self, core: CoreId, task: &TaskContext, _depth: CallDepth) -> Restored {
        let mut registers = [0; MAX_FRAME_WORDS];
        let (sp, critical_nesting) =
            LinearFrame::<L>::pop(task.top_of_stack(), &mut registers[..LinearFrame::<L>::WORDS]);
        for (i, value) in registers.iter().enumerate().take(LinearFrame::<L>::WORDS) {
            self.set_register(core, i, *value);
        }
        self.sp[core].store(sp, Ordering::Relaxed);
        Restored {
            critical_nesting,
            interrupts_enabled: L::interrupts_enabled(registers[LinearFrame::<L>::STATUS]),
        }
    }

    fn trigger_switch(&self, core: CoreId) {
        self.swi_pending[core].store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Segmented-frame register files
// ---------------------------------------------------------------------------

/// Per-core upper and lower register banks over a [`SegmentPool`].
///
/// `interrupt_entry`/`interrupt_return` and `call`/`ret` spill and reload
/// banks through the pool the way the hardware does on trap entry, call
/// and return.
pub struct SimSegmentedContext<const N: usize, const CORES: usize> {
    pool: SegmentPool<N, CORES>,
    upper: [[AtomicUsize; SEGMENT_WORDS]; CORES],
    lower: [[AtomicUsize; SEGMENT_WORDS]; CORES],
    swi_pending: [AtomicBool; CORES],
}

type Bank = [AtomicUsize; SEGMENT_WORDS];

fn spill(bank: &Bank) -> [StackWord; SEGMENT_WORDS - 1] {
    array::from_fn(|i| bank[i + 1].load(Ordering::Relaxed))
}

fn fill(bank: &Bank, segment: &[StackWord; SEGMENT_WORDS]) {
    for (register, value) in bank.iter().zip(segment).skip(1) {
        register.store(*value, Ordering::Relaxed);
    }
}

impl<const N: usize, const CORES: usize> SimSegmentedContext<N, CORES> {
    pub fn new() -> Self {
        Self {
            pool: SegmentPool::new(),
            upper: array::from_fn(|_| array::from_fn(|_| AtomicUsize::new(0))),
            lower: array::from_fn(|_| array::from_fn(|_| AtomicUsize::new(0))),
            swi_pending: array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    pub fn pool(&self) -> &SegmentPool<N, CORES> {
        &self.pool
    }

    /// Trap or interrupt entry: the upper bank, then the lower bank, go
    /// onto the live chain.
    pub fn interrupt_entry(&self, core: CoreId, interrupts_enabled: bool) -> Result<(), PortError> {
        self.pool.push(core, &spill(&self.upper[core]), true, interrupts_enabled)?;
        self.pool.push(core, &spill(&self.lower[core]), false, interrupts_enabled)?;
        Ok(())
    }

    /// Return from trap: reload the lower bank, then the upper bank.
    pub fn interrupt_return(&self, core: CoreId) {
        fill(&self.lower[core], &self.pool.pop(core));
        fill(&self.upper[core], &self.pool.pop(core));
    }

    /// A kernel function call: spill the upper bank.
    pub fn call(&self, core: CoreId) -> Result<(), PortError> {
        self.pool.push(core, &spill(&self.upper[core]), true, false)?;
        Ok(())
    }

    /// Return from a kernel function: reload the upper bank.
    pub fn ret(&self, core: CoreId) {
        fill(&self.upper[core], &self.pool.pop(core));
    }

    pub fn upper(&self, core: CoreId, word: usize) -> StackWord {
        self.upper[core][word].load(Ordering::Relaxed)
    }

    pub fn lower(&self, core: CoreId, word: usize) -> StackWord {
        self.lower[core][word].load(Ordering::Relaxed)
    }

    pub fn set_upper(&self, core: CoreId, word: usize, value: StackWord) {
        self.upper[core][word].store(value, Ordering::Relaxed);
    }

    pub fn set_lower(&self, core: CoreId, word: usize, value: StackWord) {
        self.lower[core][word].store(value, Ordering::Relaxed);
    }

    pub fn program_counter(&self, core: CoreId) -> StackWord {
        self.lower(core, LOWER_PC)
    }

    pub fn argument(&self, core: CoreId) -> StackWord {
        self.lower(core, LOWER_ARG)
    }

    pub fn return_address(&self, core: CoreId) -> StackWord {
        self.upper(core, UPPER_RA)
    }

    pub fn stack_pointer(&self, core: CoreId) -> StackWord {
        self.upper(core, UPPER_SP)
    }

    pub fn take_software_interrupt(&self, core: CoreId) -> bool {
        self.swi_pending[core].swap(false, Ordering::AcqRel)
    }
}

impl<const N: usize, const CORES: usize> Default for SimSegmentedContext<N, CORES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const CORES: usize> ContextSwitch for SimSegmentedContext<N, CORES> {
    unsafe fn save_context(&self, core: CoreId, task: &TaskContext, critical_nesting: u32, depth: CallDepth) {
        self.pool.save(core, task, critical_nesting, depth);
    }

    unsafe fn restore_context(&self, core: CoreId, task: &TaskContext, depth: CallDepth) -> Restored {
        self.pool.restore(core, task, depth)
    }

    fn trigger_switch(&self, core: CoreId) {
        self.swi_pending[core].store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Scheduler stand-in
// ---------------------------------------------------------------------------

/// Round-robin over a fixed task list per core.
pub struct SimScheduler<'t, const CORES: usize> {
    queues: [&'t [TaskContext]; CORES],
    current: [AtomicUsize; CORES],
    switch_due: AtomicBool,
    ticks: AtomicU32,
}

impl<'t, const CORES: usize> SimScheduler<'t, CORES> {
    /// `switch_due` is what every `increment_tick` reports.
    pub fn new(queues: [&'t [TaskContext]; CORES], switch_due: bool) -> Self {
        assert!(queues.iter().all(|q| !q.is_empty()));
        Self {
            queues,
            current: array::from_fn(|_| AtomicUsize::new(0)),
            switch_due: AtomicBool::new(switch_due),
            ticks: AtomicU32::new(0),
        }
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn set_switch_due(&self, due: bool) {
        self.switch_due.store(due, Ordering::Relaxed);
    }

    /// Index of the task current on `core`.
    pub fn current_index(&self, core: CoreId) -> usize {
        self.current[core].load(Ordering::Relaxed)
    }
}

impl<const CORES: usize> Scheduler for SimScheduler<'_, CORES> {
    fn increment_tick(&self) -> bool {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.switch_due.load(Ordering::Relaxed)
    }

    fn select_next_task(&self, core: CoreId) {
        let next = (self.current_index(core) + 1) % self.queues[core].len();
        self.current[core].store(next, Ordering::Relaxed);
    }

    fn current_task_context(&self, core: CoreId) -> &TaskContext {
        &self.queues[core][self.current_index(core)]
    }
}
