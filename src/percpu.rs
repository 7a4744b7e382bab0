//! # Per-Core State
//!
//! Everything the port keeps per core lives in one [`CoreDescriptor`]:
//! critical nesting, the switch-pending flag, interrupt depth, the lock
//! nesting table and the switch engine's state. Descriptors are looked up
//! by core id through [`Cores`]; nothing is held in a free-standing
//! global array.
//!
//! Fields are atomics so a descriptor can sit in a shared `static`. Only
//! the owning core writes them, except [`SwitchPending`], which another
//! core's IPI handler path also reaches.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::config::MAX_INTERRUPT_NESTING;
use crate::critical::CriticalNesting;
use crate::error::{fatal, PortError, Violation};
use crate::interrupt::InterruptMask;
use crate::smp::LockDomain;

/// Index of a core, 0-based.
pub type CoreId = usize;

/// Value of a core's switch-pending flag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchRequest {
    NoRequest = 0,
    /// Run the switch engine on the next outermost interrupt return.
    SwitchRequested = 1,
    /// One-shot bring-up value: restore the first task, save nothing.
    StartFirstTask = 2,
}

impl SwitchRequest {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::SwitchRequested,
            2 => Self::StartFirstTask,
            _ => Self::NoRequest,
        }
    }
}

/// Tri-state switch-pending flag of one core.
#[derive(Debug)]
pub struct SwitchPending {
    state: AtomicU8,
}

impl SwitchPending {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(SwitchRequest::NoRequest as u8),
        }
    }

    pub fn get(&self) -> SwitchRequest {
        SwitchRequest::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, request: SwitchRequest) {
        self.state.store(request as u8, Ordering::Release);
    }

    /// Ask for a switch. `StartFirstTask` is never overwritten.
    ///
    /// Returns `true` only for the `NoRequest → SwitchRequested` transition.
    pub fn request(&self) -> bool {
        self.state
            .compare_exchange(
                SwitchRequest::NoRequest as u8,
                SwitchRequest::SwitchRequested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Consume the flag, leaving `NoRequest`.
    pub fn take(&self) -> SwitchRequest {
        SwitchRequest::from_u8(self.state.swap(SwitchRequest::NoRequest as u8, Ordering::AcqRel))
    }
}

impl Default for SwitchPending {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch engine state of one core.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    /// Scheduler not started on this core yet.
    NotStarted = 0,
    /// A task is running.
    Running = 1,
    /// Inside save → select → restore.
    Switching = 2,
}

impl CoreState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Switching,
            _ => Self::NotStarted,
        }
    }
}

/// Diagnostic counters.
#[derive(Debug)]
pub struct SwitchStats {
    requests: AtomicU32,
    switches: AtomicU32,
}

impl SwitchStats {
    const fn new() -> Self {
        Self {
            requests: AtomicU32::new(0),
            switches: AtomicU32::new(0),
        }
    }

    /// Number of `NoRequest → SwitchRequested` transitions.
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Number of completed save → select → restore runs.
    pub fn switches(&self) -> u32 {
        self.switches.load(Ordering::Relaxed)
    }

    pub(crate) fn record_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }
}

/// All per-core state of the port layer.
#[derive(Debug)]
pub struct CoreDescriptor {
    id: CoreId,
    pub critical: CriticalNesting,
    pub pending: SwitchPending,
    interrupt_nesting: AtomicU32,
    lock_nesting: [AtomicU32; 2],
    state: AtomicU8,
    stats: SwitchStats,
}

impl CoreDescriptor {
    pub const fn new(id: CoreId) -> Self {
        Self {
            id,
            critical: CriticalNesting::new(),
            pending: SwitchPending::new(),
            interrupt_nesting: AtomicU32::new(0),
            lock_nesting: [AtomicU32::new(0), AtomicU32::new(0)],
            state: AtomicU8::new(CoreState::NotStarted as u8),
            stats: SwitchStats::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn stats(&self) -> &SwitchStats {
        &self.stats
    }

    // -- Interrupt nesting ---------------------------------------------------

    /// Current interrupt nesting depth; 0 at task level.
    #[inline]
    pub fn interrupt_depth(&self) -> u32 {
        self.interrupt_nesting.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn in_interrupt(&self) -> bool {
        self.interrupt_depth() > 0
    }

    /// Record interrupt entry. Nesting beyond [`MAX_INTERRUPT_NESTING`] is
    /// a stack sizing defect and halts.
    pub fn enter_interrupt(&self) -> u32 {
        let depth = self.interrupt_nesting.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > MAX_INTERRUPT_NESTING {
            fatal(Violation::InterruptNestingExceeded);
        }
        depth
    }

    /// Record interrupt exit. Returns `true` when leaving the outermost level.
    pub fn exit_interrupt(&self) -> bool {
        let depth = self.interrupt_depth();
        if depth == 0 {
            fatal(Violation::UnmatchedInterruptExit);
        }
        self.interrupt_nesting.store(depth - 1, Ordering::Relaxed);
        depth == 1
    }

    // -- Critical sections ---------------------------------------------------

    /// Task-level critical section entry.
    ///
    /// Only the outermost entry is checked against interrupt context, so a
    /// fatal handler that itself enters a critical section cannot recurse.
    pub fn enter_critical<M: InterruptMask + ?Sized>(&self, mask: &M) {
        let depth = self.critical.enter(mask);
        if depth == 1 && self.in_interrupt() {
            fatal(Violation::CriticalFromIsr);
        }
    }

    pub fn exit_critical<M: InterruptMask + ?Sized>(&self, mask: &M) {
        self.critical.exit(mask);
    }

    // -- Switch pending ------------------------------------------------------

    /// Set the switch-pending flag, counting fresh requests.
    pub fn request_switch(&self) -> bool {
        let fresh = self.pending.request();
        if fresh {
            self.stats.requests.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    // -- Lock nesting --------------------------------------------------------

    /// Recursion counter of this core's lock in `domain`.
    pub fn lock_nesting(&self, domain: LockDomain) -> &AtomicU32 {
        &self.lock_nesting[domain as usize]
    }

    // -- Engine state --------------------------------------------------------

    pub fn state(&self) -> CoreState {
        CoreState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CoreState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `Running → Switching`. Any other starting state is fatal.
    pub(crate) fn begin_switch(&self) {
        if let Err(prev) = self.state.compare_exchange(
            CoreState::Running as u8,
            CoreState::Switching as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            match CoreState::from_u8(prev) {
                CoreState::NotStarted => fatal(Violation::SchedulerNotStarted),
                _ => fatal(Violation::SwitchReentered),
            }
        }
    }
}

/// Descriptor table for `N` cores.
#[derive(Debug)]
pub struct Cores<const N: usize> {
    cores: [CoreDescriptor; N],
}

impl<const N: usize> Cores<N> {
    pub const fn new() -> Self {
        let mut cores = [const { CoreDescriptor::new(0) }; N];
        let mut i = 0;
        while i < N {
            cores[i].id = i;
            i += 1;
        }
        Self { cores }
    }

    pub fn get(&self, id: CoreId) -> Result<&CoreDescriptor, PortError> {
        self.cores.get(id).ok_or(PortError::InvalidCore(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoreDescriptor> {
        self.cores.iter()
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<const N: usize> Default for Cores<N> {
    fn default() -> Self {
        Self::new()
    }
}
