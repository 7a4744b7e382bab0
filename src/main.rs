//! # rtport Demo Firmware
//!
//! Two tasks on a Cortex-M4, switched round-robin every [`TIME_SLICE`]
//! ticks and whenever one of them yields.
//!
//! | Task | Behavior |
//! |------|----------|
//! | `counter_task` | Counts forever, preempted by the tick |
//! | `yielding_task` | Does a short burst of work, then yields |

#![no_std]
#![no_main]

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use cortex_m_rt::{entry, exception};
use panic_halt as _;

use rtport::arch::cortex_m4::{self, CortexM4};
use rtport::config::{CPU_CLOCK_HZ, STACK_WORDS, TICK_RATE_HZ};
use rtport::context::{CortexM4Frame, LinearFrame};
use rtport::percpu::{CoreId, Cores};
use rtport::task::{TaskContext, TaskFunction, TaskStack};
use rtport::tick::TickConfig;
use rtport::{Port, Scheduler};

/// Ticks each task runs before it is preempted.
const TIME_SLICE: u32 = 10;

const TASKS: usize = 2;

// ---------------------------------------------------------------------------
// A minimal round-robin scheduler
// ---------------------------------------------------------------------------

struct RoundRobin {
    contexts: [TaskContext; TASKS],
    current: AtomicUsize,
    ticks: AtomicU32,
}

impl Scheduler for RoundRobin {
    fn increment_tick(&self) -> bool {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        ticks % TIME_SLICE == 0
    }

    fn select_next_task(&self, _core: CoreId) {
        let next = (self.current.load(Ordering::Relaxed) + 1) % TASKS;
        self.current.store(next, Ordering::Relaxed);
    }

    fn current_task_context(&self, _core: CoreId) -> &TaskContext {
        &self.contexts[self.current.load(Ordering::Relaxed)]
    }
}

static HW: CortexM4 = CortexM4::new();
static CORES: Cores<1> = Cores::new();
static SCHEDULER: RoundRobin = RoundRobin {
    contexts: [TaskContext::new(), TaskContext::new()],
    current: AtomicUsize::new(0),
    ticks: AtomicU32::new(0),
};
static PORT: Port<'static, CortexM4, CortexM4, RoundRobin, 1> = Port::new(
    &HW,
    &HW,
    &SCHEDULER,
    &CORES,
    TickConfig::new(CPU_CLOCK_HZ, TICK_RATE_HZ),
);

static mut STACKS: [TaskStack<STACK_WORDS>; TASKS] = [TaskStack::new(), TaskStack::new()];

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

/// Counts without ever giving up the CPU; only the tick preempts it.
extern "C" fn counter_task(_param: *mut c_void) {
    let mut counter: u32 = 0;
    loop {
        counter = counter.wrapping_add(1);
        PORT.enter_critical();
        // Shared state would be touched here.
        PORT.exit_critical();
    }
}

/// Works for a short burst, then hands the CPU back.
extern "C" fn yielding_task(param: *mut c_void) {
    let burst = param as usize as u32;
    loop {
        let mut work: u32 = 0;
        for _ in 0..burst {
            work = work.wrapping_add(1);
        }
        PORT.yield_now();
    }
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

#[exception]
fn SysTick() {
    PORT.enter_interrupt();
    PORT.tick_interrupt();
    PORT.exit_interrupt_pended();
}

#[no_mangle]
extern "C" fn rtport_pendsv() {
    PORT.software_interrupt();
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Builds both initial frames and starts the
/// scheduler. Does not return.
#[entry]
fn main() -> ! {
    cortex_m4::set_interrupt_priorities();

    // SAFETY: the only reference to the stacks, taken before any task runs.
    let stacks = unsafe { &mut *ptr::addr_of_mut!(STACKS) };
    let entries: [(TaskFunction, usize); TASKS] = [(counter_task, 0), (yielding_task, 2000)];
    for ((stack, context), (entry, param)) in stacks.iter_mut().zip(&SCHEDULER.contexts).zip(entries) {
        if let Err(err) = LinearFrame::<CortexM4Frame>::initialize(stack, context, entry, param as *mut c_void) {
            log::error!("task frame: {}", err);
            panic!("task frame: {}", err);
        }
    }

    PORT.start_scheduler();
    // SAFETY: called once, right after start_scheduler, still on MSP.
    unsafe { cortex_m4::start_first_task() }
}
