//! # Port API
//!
//! The surface a kernel calls into. [`Port`] ties one hardware backend, one
//! [`ContextSwitch`] implementation, the [`Scheduler`] and the per-core
//! descriptor table together and provides:
//!
//! - scheduler start/end;
//! - task-level critical sections and cross-core locks;
//! - yield, both local (software interrupt) and remote (IPI);
//! - the bodies of the tick ISR, the IPI ISR and the interrupt epilogue;
//! - deletion-time reclamation of segmented contexts.
//!
//! ## Interrupt flow
//!
//! ```text
//!  tick IRQ ─► enter_interrupt ─► tick_interrupt ─► exit_interrupt
//!                                  │ increment_tick  │ outermost and
//!                                  └ request_switch  └ pending? ─► engine
//! ```
//!
//! Every method acts on the executing core, found through
//! [`InterProcessor::core_id`].

use core::ptr;

use crate::config::SYSCALL_CALL_DEPTH;
use crate::context::{Restored, SegmentPool};
use crate::error::{fatal, PortError, Violation};
use crate::interrupt::InterruptMask;
use crate::percpu::{CoreDescriptor, CoreId, Cores, SwitchRequest};
use crate::reclaim::{ReclaimQueue, Reclamation};
use crate::scheduler::Scheduler;
use crate::smp::{ExclusiveAccess, InterProcessor, LockDomain, RecursiveLock};
use crate::switch::{CallDepth, ContextSwitch, SwitchEngine};
use crate::task::TaskContext;
use crate::tick::{TickConfig, TickSource, TickStatus, TickTimer};

/// Everything the port needs from the chip besides the context primitives.
pub trait Platform: InterruptMask + TickTimer + InterProcessor + ExclusiveAccess {}

impl<T> Platform for T where T: InterruptMask + TickTimer + InterProcessor + ExclusiveAccess + ?Sized {}

/// The port layer for `N` cores.
pub struct Port<'a, H: ?Sized, C: ?Sized, S: ?Sized, const N: usize> {
    hw: &'a H,
    context: &'a C,
    scheduler: &'a S,
    cores: &'a Cores<N>,
    tick: TickSource<&'a H>,
}

impl<'a, H, C, S, const N: usize> Port<'a, H, C, S, N>
where
    H: Platform + ?Sized,
    C: ContextSwitch + ?Sized,
    S: Scheduler + ?Sized,
{
    pub const fn new(hw: &'a H, context: &'a C, scheduler: &'a S, cores: &'a Cores<N>, tick: TickConfig) -> Self {
        Self {
            hw,
            context,
            scheduler,
            cores,
            tick: TickSource::new(hw, tick),
        }
    }

    pub fn cores(&self) -> &'a Cores<N> {
        self.cores
    }

    pub fn tick(&self) -> &TickSource<&'a H> {
        &self.tick
    }

    /// Descriptor of the executing core.
    pub fn local(&self) -> &'a CoreDescriptor {
        match self.cores.get(self.hw.core_id()) {
            Ok(core) => core,
            Err(_) => fatal(Violation::UnknownCore),
        }
    }

    fn engine(&self) -> SwitchEngine<'a, H, C, S> {
        SwitchEngine::new(self.hw, self.context, self.scheduler)
    }

    fn lock(&self) -> RecursiveLock<'a, H, H> {
        RecursiveLock::new(self.hw, self.hw)
    }

    /// Mask locally and, with more than one core, hold the ISR-domain lock.
    fn isr_section<R>(&self, core: &CoreDescriptor, f: impl FnOnce() -> R) -> R {
        let saved = self.hw.set_mask();
        let result = if N > 1 {
            self.lock().with(core, LockDomain::Isr, f)
        } else {
            f()
        };
        self.hw.clear_mask(saved);
        result
    }

    // -- Scheduler lifecycle -------------------------------------------------

    /// Start the tick, release the other cores and enter the first task
    /// on the calling core.
    ///
    /// The other cores pick up their first task from their IPI epilogue.
    /// The returned frame state is what the caller's start-first-task
    /// sequence hands to the hardware.
    pub fn start_scheduler(&self) -> Restored {
        self.hw.disable();
        let me = self.local();
        self.tick.start();

        for core in self.cores.iter().filter(|c| c.id() != me.id()) {
            core.pending.set(SwitchRequest::StartFirstTask);
            log::debug!("core {}: releasing core {}", me.id(), core.id());
            self.hw.send_ipi(core.id());
        }

        me.pending.set(SwitchRequest::NoRequest);
        me.critical.reset_for_scheduler_start();
        self.engine().start_first(me, CallDepth::INTERRUPT)
    }

    /// Stop the tick. Tasks keep their contexts.
    pub fn end_scheduler(&self) {
        self.tick.stop();
        log::debug!("core {}: scheduler ended", self.hw.core_id());
    }

    // -- Task-level exclusion ------------------------------------------------

    pub fn enter_critical(&self) {
        self.local().enter_critical(self.hw);
    }

    pub fn exit_critical(&self) {
        self.local().exit_critical(self.hw);
    }

    /// Take the cross-core lock for `domain` on the executing core.
    pub fn acquire_lock(&self, domain: LockDomain) {
        self.lock().acquire(self.local(), domain);
    }

    pub fn release_lock(&self, domain: LockDomain) {
        self.lock().release(self.local(), domain);
    }

    /// Take the cross-core lock guarding shared kernel state, in the task
    /// or ISR domain depending on where the executing core is running.
    /// Returns the domain to hand back to [`release_lock`](Self::release_lock).
    pub fn acquire_kernel_lock(&self) -> LockDomain {
        let core = self.local();
        let domain = LockDomain::current(core);
        self.lock().acquire(core, domain);
        domain
    }

    // -- Yield ---------------------------------------------------------------

    /// Ask for a switch on the executing core. The switch runs in the
    /// software interrupt handler, see [`software_interrupt`](Self::software_interrupt).
    pub fn yield_now(&self) {
        self.context.trigger_switch(self.hw.core_id());
    }

    /// Body of the software interrupt raised by [`yield_now`](Self::yield_now).
    pub fn software_interrupt(&self) -> Restored {
        self.engine().switch(self.local(), SYSCALL_CALL_DEPTH)
    }

    /// Request a switch on `target`: locally through the software
    /// interrupt, remotely through an IPI.
    pub fn yield_core(&self, target: CoreId) -> Result<(), PortError> {
        self.cores.get(target)?;
        if target == self.hw.core_id() {
            self.yield_now();
        } else {
            log::debug!("core {}: yield request to core {}", self.hw.core_id(), target);
            self.hw.send_ipi(target);
        }
        Ok(())
    }

    // -- Interrupt handling --------------------------------------------------

    /// Interrupt prologue: count one level of nesting.
    pub fn enter_interrupt(&self) -> u32 {
        self.local().enter_interrupt()
    }

    /// Tick ISR body.
    pub fn tick_interrupt(&self) -> TickStatus {
        let core = self.local();
        let status = self.tick.acknowledge();
        let due = self.isr_section(core, || self.scheduler.increment_tick());
        if due {
            core.request_switch();
        }
        log::trace!("core {}: tick, switch due: {}", core.id(), due);
        status
    }

    /// IPI ISR body. A core still waiting for its first task keeps that
    /// request.
    pub fn ipi_interrupt(&self) {
        let core = self.local();
        self.isr_section(core, || {
            core.request_switch();
            self.hw.clear_ipi();
        });
        log::debug!("core {}: ipi, pending {:?}", core.id(), core.pending.get());
    }

    /// Interrupt epilogue for architectures that can switch on the way out
    /// of any interrupt. Runs the engine when leaving the outermost level
    /// with a request pending and returns the resumed frame state.
    pub fn exit_interrupt(&self) -> Option<Restored> {
        let core = self.local();
        if !core.exit_interrupt() {
            return None;
        }
        match core.pending.take() {
            SwitchRequest::NoRequest => None,
            SwitchRequest::SwitchRequested => Some(self.engine().switch(core, CallDepth::INTERRUPT)),
            SwitchRequest::StartFirstTask => {
                core.critical.reset_for_scheduler_start();
                Some(self.engine().start_first(core, CallDepth::INTERRUPT))
            }
        }
    }

    /// Interrupt epilogue for architectures that switch only in a dedicated
    /// lowest-priority exception. A pending switch is handed on through
    /// [`ContextSwitch::trigger_switch`]; returns whether one was.
    pub fn exit_interrupt_pended(&self) -> bool {
        let core = self.local();
        if !core.exit_interrupt() {
            return false;
        }
        match core.pending.take() {
            SwitchRequest::NoRequest => false,
            SwitchRequest::SwitchRequested => {
                self.context.trigger_switch(core.id());
                true
            }
            SwitchRequest::StartFirstTask => {
                // Not consumable here; leave it for the next epilogue.
                core.pending.set(SwitchRequest::StartFirstTask);
                false
            }
        }
    }

    // -- Task deletion -------------------------------------------------------

    /// Whether `task` is the current task of any core.
    pub fn is_current(&self, task: &TaskContext) -> bool {
        self.cores
            .iter()
            .any(|core| ptr::eq(self.scheduler.current_task_context(core.id()), task))
    }

    /// Return a deleted task's segments to the pool, or park the task until
    /// no core runs it any more.
    ///
    /// # Safety
    /// `task` must hold a segmented context and its storage must stay valid
    /// until the queue drains it.
    pub unsafe fn reclaim_task<const SEGMENTS: usize, const Q: usize>(
        &self,
        pool: &SegmentPool<SEGMENTS, N>,
        queue: &ReclaimQueue<Q>,
        task: &TaskContext,
    ) -> Result<Reclamation, PortError> {
        if self.is_current(task) {
            queue.defer(task)?;
            return Ok(Reclamation::Deferred);
        }
        pool.reclaim_chain(self.hw, SegmentPool::<SEGMENTS, N>::saved_head(task));
        Ok(Reclamation::Reclaimed)
    }

    /// Like [`reclaim_task`](Self::reclaim_task) but refuses instead of
    /// deferring.
    ///
    /// # Safety
    /// `task` must hold a segmented context.
    pub unsafe fn reclaim_now<const SEGMENTS: usize>(
        &self,
        pool: &SegmentPool<SEGMENTS, N>,
        task: &TaskContext,
    ) -> Result<(), PortError> {
        if self.is_current(task) {
            return Err(PortError::ContextInUse);
        }
        pool.reclaim_chain(self.hw, SegmentPool::<SEGMENTS, N>::saved_head(task));
        Ok(())
    }

    /// Retry parked deletions. Meant for the scheduler's background task.
    pub fn drain_reclaim<const SEGMENTS: usize, const Q: usize>(
        &self,
        pool: &SegmentPool<SEGMENTS, N>,
        queue: &ReclaimQueue<Q>,
    ) -> usize {
        queue.drain(pool, self.hw, |task| self.is_current(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{SimLinearContext, SimMachine, SimScheduler, SimSegmentedContext};
    use crate::config::INITIAL_CRITICAL_NESTING;
    use crate::context::segmented::SegmentHandle;
    use crate::context::{CortexM4Frame, FrameLayout, LinearFrame, Rh850Frame};
    use crate::percpu::CoreState;
    use crate::task::{StackGrowth, TaskStack};
    use core::cell::Cell;
    use core::ffi::c_void;
    use core::sync::atomic::Ordering;

    const CLOCK: u32 = 16_000_000;
    const PERIOD: u32 = 16_000;

    fn tick_config() -> TickConfig {
        TickConfig::new(CLOCK, 1000)
    }

    extern "C" fn task_a(_: *mut c_void) {}
    extern "C" fn task_b(_: *mut c_void) {}
    extern "C" fn task_c(_: *mut c_void) {}

    fn spawn<L: FrameLayout>(stack: &mut TaskStack<128>, task: &TaskContext, entry: extern "C" fn(*mut c_void), arg: usize) {
        LinearFrame::<L>::initialize(stack, task, entry, arg as *mut c_void).unwrap();
    }

    fn spawn_segmented<const SEGMENTS: usize, const CORES: usize>(
        sim: &SimSegmentedContext<SEGMENTS, CORES>,
        hw: &SimMachine<CORES>,
        stack: &mut TaskStack<64>,
        task: &TaskContext,
        entry: extern "C" fn(*mut c_void),
        arg: usize,
    ) {
        let top = stack.initial_top(StackGrowth::Descending);
        let top = unsafe { sim.pool().initialize_stack(hw, top, entry, arg as *mut c_void) }.unwrap();
        task.set_top_of_stack(top);
    }

    /// One tick interrupt on the executing core, start to finish.
    fn fire_tick<H, C, S, const N: usize>(port: &Port<'_, H, C, S, N>, hw: &SimMachine<N>) -> Option<Restored>
    where
        H: Platform + ?Sized,
        C: ContextSwitch + ?Sized,
        S: Scheduler + ?Sized,
    {
        hw.advance_timer(PERIOD);
        assert!(hw.timer_pending());
        port.enter_interrupt();
        port.tick_interrupt();
        port.exit_interrupt()
    }

    #[test]
    fn ten_ticks_on_a_single_task() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<CortexM4Frame, 1>::new();
        let mut stack = TaskStack::<128>::new();
        let tasks = [TaskContext::new()];
        spawn::<CortexM4Frame>(&mut stack, &tasks[0], task_a, 0x55);
        let scheduler = SimScheduler::new([&tasks[..]], true);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());

        port.start_scheduler();
        let core = port.local();
        assert!(hw.is_enabled());
        assert_eq!(core.state(), CoreState::Running);

        for n in 1..=10 {
            hw.advance_timer(PERIOD);
            port.enter_interrupt();
            assert_eq!(port.tick_interrupt(), TickStatus::OnTime);
            assert_eq!(core.pending.get(), SwitchRequest::SwitchRequested);

            let restored = port.exit_interrupt().unwrap();
            assert!(restored.interrupts_enabled);
            assert_eq!(core.pending.get(), SwitchRequest::NoRequest);
            assert_eq!(core.stats().requests(), n);
            assert_eq!(core.stats().switches(), n);
            assert_eq!(sim.program_counter(0), CortexM4Frame::entry_address(task_a));
            assert_eq!(sim.argument(0), 0x55);
        }
        assert_eq!(scheduler.ticks(), 10);
        assert_eq!(scheduler.current_index(0), 0);
        assert_eq!(port.tick().late_ticks(), 0);
    }

    #[test]
    fn tick_without_switch_due_leaves_task_running() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<CortexM4Frame, 1>::new();
        let mut stack = TaskStack::<128>::new();
        let tasks = [TaskContext::new()];
        spawn::<CortexM4Frame>(&mut stack, &tasks[0], task_a, 0);
        let scheduler = SimScheduler::new([&tasks[..]], false);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.start_scheduler();

        assert!(fire_tick(&port, &hw).is_none());
        assert_eq!(port.local().stats().switches(), 0);
        assert_eq!(scheduler.ticks(), 1);
    }

    #[test]
    fn nested_interrupt_defers_switch_to_outermost_exit() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<CortexM4Frame, 1>::new();
        let mut stack = TaskStack::<128>::new();
        let tasks = [TaskContext::new()];
        spawn::<CortexM4Frame>(&mut stack, &tasks[0], task_a, 0);
        let scheduler = SimScheduler::new([&tasks[..]], true);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.start_scheduler();

        port.enter_interrupt();
        hw.advance_timer(PERIOD);
        port.enter_interrupt();
        port.tick_interrupt();
        assert!(port.exit_interrupt().is_none());
        assert_eq!(port.local().pending.get(), SwitchRequest::SwitchRequested);
        assert!(port.exit_interrupt().is_some());
        assert_eq!(port.local().stats().switches(), 1);
    }

    #[test]
    fn round_robin_preserves_each_task_exactly() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<Rh850Frame, 1>::new();
        let (mut sa, mut sb) = (TaskStack::<128>::new(), TaskStack::<128>::new());
        let tasks = [TaskContext::new(), TaskContext::new()];
        spawn::<Rh850Frame>(&mut sa, &tasks[0], task_a, 0xA);
        spawn::<Rh850Frame>(&mut sb, &tasks[1], task_b, 0xB);
        let scheduler = SimScheduler::new([&tasks[..]], true);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());

        port.start_scheduler();
        assert_eq!(sim.argument(0), 0xA);
        sim.scramble(0, 0x1000);
        let running_a = sim.registers(0);

        fire_tick(&port, &hw).unwrap();
        assert_eq!(sim.program_counter(0), Rh850Frame::entry_address(task_b));
        assert_eq!(sim.argument(0), 0xB);
        sim.scramble(0, 0x2000);
        let running_b = sim.registers(0);

        fire_tick(&port, &hw).unwrap();
        assert_eq!(sim.registers(0), running_a);
        fire_tick(&port, &hw).unwrap();
        assert_eq!(sim.registers(0), running_b);
    }

    #[test]
    fn yield_runs_engine_from_software_interrupt() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<CortexM4Frame, 1>::new();
        let (mut sa, mut sb) = (TaskStack::<128>::new(), TaskStack::<128>::new());
        let tasks = [TaskContext::new(), TaskContext::new()];
        spawn::<CortexM4Frame>(&mut sa, &tasks[0], task_a, 1);
        spawn::<CortexM4Frame>(&mut sb, &tasks[1], task_b, 2);
        let scheduler = SimScheduler::new([&tasks[..]], false);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.start_scheduler();

        port.yield_now();
        assert_eq!(port.local().stats().switches(), 0);
        assert!(sim.take_software_interrupt(0));
        port.software_interrupt();
        assert_eq!(sim.argument(0), 2);
        assert_eq!(scheduler.current_index(0), 1);

        port.yield_core(0).unwrap();
        assert!(sim.take_software_interrupt(0));
        port.software_interrupt();
        assert_eq!(sim.argument(0), 1);
        assert_eq!(port.local().stats().switches(), 2);
    }

    #[test]
    fn critical_nesting_travels_with_the_task() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<Rh850Frame, 1>::new();
        let (mut sa, mut sb) = (TaskStack::<128>::new(), TaskStack::<128>::new());
        let tasks = [TaskContext::new(), TaskContext::new()];
        spawn::<Rh850Frame>(&mut sa, &tasks[0], task_a, 0);
        spawn::<Rh850Frame>(&mut sb, &tasks[1], task_b, 0);
        let scheduler = SimScheduler::new([&tasks[..]], false);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.start_scheduler();

        port.enter_critical();
        port.yield_now();
        port.software_interrupt();
        assert_eq!(port.local().critical.depth(), 0);
        assert!(hw.is_enabled());

        port.yield_now();
        let restored = port.software_interrupt();
        assert_eq!(restored.critical_nesting, 1);
        assert_eq!(port.local().critical.depth(), 1);
        assert!(!hw.is_enabled());
        port.exit_critical();
        assert!(hw.is_enabled());
    }

    #[test]
    fn boot_sentinel_keeps_interrupts_masked_until_start() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<CortexM4Frame, 1>::new();
        let mut stack = TaskStack::<128>::new();
        let tasks = [TaskContext::new()];
        spawn::<CortexM4Frame>(&mut stack, &tasks[0], task_a, 0);
        let scheduler = SimScheduler::new([&tasks[..]], false);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());

        assert_eq!(port.local().critical.depth(), INITIAL_CRITICAL_NESTING);
        port.enter_critical();
        port.exit_critical();
        assert!(!hw.is_enabled());
        assert!(!hw.timer_running());

        port.start_scheduler();
        assert_eq!(port.local().critical.depth(), 0);
        assert!(hw.is_enabled());
        assert!(hw.timer_running());
        assert_eq!(hw.timer_compare(), PERIOD);
    }

    #[test]
    fn end_scheduler_stops_the_tick() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<CortexM4Frame, 1>::new();
        let mut stack = TaskStack::<128>::new();
        let tasks = [TaskContext::new()];
        spawn::<CortexM4Frame>(&mut stack, &tasks[0], task_a, 0);
        let scheduler = SimScheduler::new([&tasks[..]], true);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.start_scheduler();
        port.end_scheduler();

        assert!(!hw.timer_running());
        hw.advance_timer(PERIOD);
        assert!(!hw.timer_pending());
    }

    #[test]
    #[should_panic(expected = "scheduler not started")]
    fn switch_before_start_is_fatal() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<CortexM4Frame, 1>::new();
        let tasks = [TaskContext::new()];
        let scheduler = SimScheduler::new([&tasks[..]], true);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.software_interrupt();
    }

    #[test]
    fn pended_epilogue_hands_switch_to_software_interrupt() {
        let hw = SimMachine::<1>::new();
        let sim = SimLinearContext::<CortexM4Frame, 1>::new();
        let (mut sa, mut sb) = (TaskStack::<128>::new(), TaskStack::<128>::new());
        let tasks = [TaskContext::new(), TaskContext::new()];
        spawn::<CortexM4Frame>(&mut sa, &tasks[0], task_a, 1);
        spawn::<CortexM4Frame>(&mut sb, &tasks[1], task_b, 2);
        let scheduler = SimScheduler::new([&tasks[..]], true);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.start_scheduler();

        hw.advance_timer(PERIOD);
        port.enter_interrupt();
        port.tick_interrupt();
        assert!(port.exit_interrupt_pended());
        assert_eq!(port.local().stats().switches(), 0);
        assert!(sim.take_software_interrupt(0));
        port.software_interrupt();
        assert_eq!(sim.argument(0), 2);
    }

    #[test]
    fn remote_yield_switches_target_on_its_own_epilogue() {
        let hw = SimMachine::<2>::new();
        let sim = SimLinearContext::<CortexM4Frame, 2>::new();
        let mut stacks = [
            TaskStack::<128>::new(),
            TaskStack::<128>::new(),
            TaskStack::<128>::new(),
            TaskStack::<128>::new(),
        ];
        let first = [TaskContext::new(), TaskContext::new()];
        let second = [TaskContext::new(), TaskContext::new()];
        let [s0, s1, s2, s3] = &mut stacks;
        spawn::<CortexM4Frame>(s0, &first[0], task_a, 0x00);
        spawn::<CortexM4Frame>(s1, &first[1], task_b, 0x01);
        spawn::<CortexM4Frame>(s2, &second[0], task_a, 0x10);
        spawn::<CortexM4Frame>(s3, &second[1], task_b, 0x11);
        let scheduler = SimScheduler::new([&first[..], &second[..]], false);
        let cores = Cores::<2>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        let (core0, core1) = (cores.get(0).unwrap(), cores.get(1).unwrap());

        port.start_scheduler();
        assert_eq!(core1.pending.get(), SwitchRequest::StartFirstTask);
        assert!(hw.ipi_pending(1));

        // Core 1 boots from its IPI; the start request survives the handler.
        hw.run_as(1).unwrap();
        port.enter_interrupt();
        port.ipi_interrupt();
        assert_eq!(core1.pending.get(), SwitchRequest::StartFirstTask);
        assert!(!hw.ipi_pending(1));
        port.exit_interrupt().unwrap();
        assert_eq!(core1.state(), CoreState::Running);
        assert_eq!(core1.critical.depth(), 0);
        assert_eq!(sim.argument(1), 0x10);
        assert_eq!(core1.stats().switches(), 0);

        hw.run_as(0).unwrap();
        port.yield_core(1).unwrap();
        assert!(hw.ipi_pending(1));
        assert_eq!(core0.pending.get(), SwitchRequest::NoRequest);
        assert_eq!(core1.stats().switches(), 0);

        hw.run_as(1).unwrap();
        port.enter_interrupt();
        port.ipi_interrupt();
        assert_eq!(core1.pending.get(), SwitchRequest::SwitchRequested);
        assert_eq!(core0.pending.get(), SwitchRequest::NoRequest);
        port.exit_interrupt().unwrap();

        assert_eq!(core1.stats().switches(), 1);
        assert_eq!(core0.stats().switches(), 0);
        assert_eq!(sim.argument(1), 0x11);
        assert_eq!(sim.argument(0), 0x00);
        assert!(!hw.exclusive_held(LockDomain::Isr.bit()));
        assert_eq!(port.yield_core(5), Err(PortError::InvalidCore(5)));
    }

    struct LockProbe<'a, 't> {
        inner: SimScheduler<'t, 2>,
        hw: &'a SimMachine<2>,
        held: Cell<bool>,
        masked: Cell<bool>,
    }

    impl Scheduler for LockProbe<'_, '_> {
        fn increment_tick(&self) -> bool {
            self.held.set(self.hw.exclusive_held(LockDomain::Isr.bit()));
            self.masked.set(!self.hw.is_enabled());
            self.inner.increment_tick()
        }

        fn select_next_task(&self, core: CoreId) {
            self.inner.select_next_task(core)
        }

        fn current_task_context(&self, core: CoreId) -> &TaskContext {
            self.inner.current_task_context(core)
        }
    }

    #[test]
    fn multicore_tick_holds_isr_lock_around_increment() {
        let hw = SimMachine::<2>::new();
        let sim = SimLinearContext::<CortexM4Frame, 2>::new();
        let (mut sa, mut sb) = (TaskStack::<128>::new(), TaskStack::<128>::new());
        let first = [TaskContext::new()];
        let second = [TaskContext::new()];
        spawn::<CortexM4Frame>(&mut sa, &first[0], task_a, 0);
        spawn::<CortexM4Frame>(&mut sb, &second[0], task_b, 0);
        let probe = LockProbe {
            inner: SimScheduler::new([&first[..], &second[..]], false),
            hw: &hw,
            held: Cell::new(false),
            masked: Cell::new(false),
        };
        let cores = Cores::<2>::new();
        let port = Port::new(&hw, &sim, &probe, &cores, tick_config());
        port.start_scheduler();

        fire_tick(&port, &hw);
        assert!(probe.held.get());
        assert!(probe.masked.get());
        assert!(!hw.exclusive_held(LockDomain::Isr.bit()));
        assert_eq!(port.local().lock_nesting(LockDomain::Isr).load(Ordering::Relaxed), 0);
        assert!(hw.is_enabled());
    }

    #[test]
    fn task_lock_is_recursive_through_the_port() {
        let hw = SimMachine::<2>::new();
        let sim = SimLinearContext::<CortexM4Frame, 2>::new();
        let tasks = [TaskContext::new()];
        let scheduler = SimScheduler::new([&tasks[..], &tasks[..]], false);
        let cores = Cores::<2>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());

        port.acquire_lock(LockDomain::Task);
        port.acquire_lock(LockDomain::Task);
        port.release_lock(LockDomain::Task);
        assert!(hw.exclusive_held(LockDomain::Task.bit()));
        port.release_lock(LockDomain::Task);
        assert!(!hw.exclusive_held(LockDomain::Task.bit()));
    }

    #[test]
    fn kernel_lock_domain_follows_interrupt_depth() {
        let hw = SimMachine::<2>::new();
        let sim = SimLinearContext::<CortexM4Frame, 2>::new();
        let tasks = [TaskContext::new()];
        let scheduler = SimScheduler::new([&tasks[..], &tasks[..]], false);
        let cores = Cores::<2>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());

        let domain = port.acquire_kernel_lock();
        assert_eq!(domain, LockDomain::Task);
        assert!(hw.exclusive_held(LockDomain::Task.bit()));
        port.release_lock(domain);

        port.enter_interrupt();
        let domain = port.acquire_kernel_lock();
        assert_eq!(domain, LockDomain::Isr);
        assert!(hw.exclusive_held(LockDomain::Isr.bit()));
        assert!(!hw.exclusive_held(LockDomain::Task.bit()));
        port.release_lock(domain);
        assert!(!hw.exclusive_held(LockDomain::Isr.bit()));
        assert_eq!(port.exit_interrupt(), None);
    }

    #[test]
    fn syscall_depth_switch_returns_through_handler_frames() {
        let hw = SimMachine::<1>::new();
        let sim = SimSegmentedContext::<16, 1>::new();
        let (mut sa, mut sb) = (TaskStack::<64>::new(), TaskStack::<64>::new());
        let tasks = [TaskContext::new(), TaskContext::new()];
        spawn_segmented(&sim, &hw, &mut sa, &tasks[0], task_a, 0xA);
        spawn_segmented(&sim, &hw, &mut sb, &tasks[1], task_b, 0xB);
        let scheduler = SimScheduler::new([&tasks[..]], false);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());

        port.start_scheduler();
        sim.interrupt_return(0);
        assert_eq!(sim.argument(0), 0xA);
        sim.set_lower(0, 2, 0xAAAA);

        // Trap entry, then the trap handler and the dispatcher it calls.
        port.yield_now();
        assert!(sim.take_software_interrupt(0));
        sim.interrupt_entry(0, true).unwrap();
        sim.call(0).unwrap();
        sim.call(0).unwrap();
        assert_eq!(SYSCALL_CALL_DEPTH.get(), 2);
        port.software_interrupt();
        sim.ret(0);
        sim.ret(0);
        sim.interrupt_return(0);
        assert_eq!(sim.program_counter(0), task_b as usize);
        assert_eq!(sim.argument(0), 0xB);

        port.yield_now();
        sim.interrupt_entry(0, true).unwrap();
        sim.call(0).unwrap();
        sim.call(0).unwrap();
        port.software_interrupt();
        sim.ret(0);
        sim.ret(0);
        sim.interrupt_return(0);
        assert_eq!(sim.lower(0, 2), 0xAAAA);
        assert_eq!(sim.argument(0), 0xA);
        assert!(sim.pool().audit(&[unsafe { SegmentPool::<16, 1>::saved_head(&tasks[1]) }]));
    }

    #[test]
    fn deleted_chain_becomes_free_list_head() {
        let hw = SimMachine::<1>::new();
        let sim = SimSegmentedContext::<16, 1>::new();
        let mut stacks = [TaskStack::<64>::new(), TaskStack::<64>::new(), TaskStack::<64>::new()];
        let runnable = [TaskContext::new(), TaskContext::new()];
        let deleted = TaskContext::new();
        let [s0, s1, s2] = &mut stacks;
        spawn_segmented(&sim, &hw, s0, &runnable[0], task_a, 0);
        spawn_segmented(&sim, &hw, s1, &runnable[1], task_c, 0);
        spawn_segmented(&sim, &hw, s2, &deleted, task_b, 0);
        let scheduler = SimScheduler::new([&runnable[..]], true);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.start_scheduler();
        sim.interrupt_return(0);

        let pool = sim.pool();
        let queue = ReclaimQueue::<4>::new();
        let previous_free = pool.free_head();
        let head = unsafe { SegmentPool::<16, 1>::saved_head(&deleted) };

        let outcome = unsafe { port.reclaim_task(pool, &queue, &deleted) }.unwrap();
        assert_eq!(outcome, Reclamation::Reclaimed);
        assert_eq!(pool.free_head(), head.address());
        let upper = SegmentHandle::from_raw(pool.segment(head)[0] as u32);
        let tail_link = SegmentHandle::from_raw(pool.segment(upper)[0] as u32);
        assert_eq!(tail_link, previous_free);
        assert!(pool.audit(&[unsafe { SegmentPool::<16, 1>::saved_head(&runnable[1]) }]));
    }

    #[test]
    fn running_task_deletion_waits_for_switch() {
        let hw = SimMachine::<1>::new();
        let sim = SimSegmentedContext::<16, 1>::new();
        let (mut sa, mut sb) = (TaskStack::<64>::new(), TaskStack::<64>::new());
        let tasks = [TaskContext::new(), TaskContext::new()];
        spawn_segmented(&sim, &hw, &mut sa, &tasks[0], task_a, 0);
        spawn_segmented(&sim, &hw, &mut sb, &tasks[1], task_b, 0);
        let scheduler = SimScheduler::new([&tasks[..]], true);
        let cores = Cores::<1>::new();
        let port = Port::new(&hw, &sim, &scheduler, &cores, tick_config());
        port.start_scheduler();
        sim.interrupt_return(0);

        let pool = sim.pool();
        let queue = ReclaimQueue::<4>::new();
        assert_eq!(unsafe { port.reclaim_now(pool, &tasks[0]) }, Err(PortError::ContextInUse));
        let outcome = unsafe { port.reclaim_task(pool, &queue, &tasks[0]) }.unwrap();
        assert_eq!(outcome, Reclamation::Deferred);
        assert_eq!(port.drain_reclaim(pool, &queue), 0);

        // Tick away from the deleted task; its chain is now on its stack.
        sim.interrupt_entry(0, true).unwrap();
        fire_tick(&port, &hw).unwrap();
        sim.interrupt_return(0);
        assert_eq!(sim.program_counter(0), task_b as usize);

        assert_eq!(port.drain_reclaim(pool, &queue), 1);
        assert_eq!(queue.pending(), 0);
        // Only task B's frames were ever live, and they are popped.
        assert_eq!(pool.free_count(), 16);
        assert!(pool.audit(&[]));
    }
}
