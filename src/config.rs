//! # Port Configuration
//!
//! Compile-time constants governing the port layer. Everything here is
//! fixed at build time; invalid combinations are rejected by the `const`
//! assertions at the bottom of this file rather than at runtime.

use crate::switch::CallDepth;

/// CPU clock feeding the tick timer, in Hz (STM32F4 HSI at 16 MHz).
pub const CPU_CLOCK_HZ: u32 = 16_000_000;

/// Tick interrupt frequency in Hz. One tick is the scheduler's time quantum.
pub const TICK_RATE_HZ: u32 = 1000;

/// Timer cycles between two tick interrupts.
pub const TICK_PERIOD: u32 = CPU_CLOCK_HZ / TICK_RATE_HZ;

/// Number of cores sharing one scheduler. Bounds the per-core tables and
/// the IPI request register (one bit per core).
pub const MAX_CORES: usize = 2;

/// Maximum interrupt nesting depth per core.
///
/// Interrupts run on the interrupted task's stack, so every extra level
/// has to be budgeted into every task stack at build time. Exceeding it
/// is a sizing defect and halts the core.
pub const MAX_INTERRUPT_NESTING: u32 = 2;

/// Critical nesting value before the scheduler starts.
///
/// Any non-zero value keeps interrupts masked across a matched
/// enter/exit pair during boot. Reset to 0 by `Port::start_scheduler`.
pub const INITIAL_CRITICAL_NESTING: u32 = 0xAAAA_AAAA;

/// Per-task stack size in machine words.
pub const STACK_WORDS: usize = 256;

/// Number of context segments in the global pool (segmented frames only).
pub const CONTEXT_SEGMENTS: usize = 64;

/// Call depth between the yield trap entry and the save/restore
/// primitives: trap handler, then the syscall dispatcher.
pub const SYSCALL_CALL_DEPTH: CallDepth = CallDepth::new(2);

/// Whether linear frames carry numeric-coprocessor state.
pub const HAS_FPU: bool = cfg!(feature = "fpu");

/// Capacity of the deferred segment reclamation queue.
pub const RECLAIM_QUEUE_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// Build-time validation
// ---------------------------------------------------------------------------

const _: () = assert!(TICK_RATE_HZ > 0, "TICK_RATE_HZ must be non-zero");
const _: () = assert!(
    CPU_CLOCK_HZ >= TICK_RATE_HZ,
    "TICK_RATE_HZ must not exceed CPU_CLOCK_HZ"
);
const _: () = assert!(
    MAX_CORES >= 1 && MAX_CORES <= 32,
    "MAX_CORES must fit the 32-bit IPI request register"
);
const _: () = assert!(MAX_INTERRUPT_NESTING > 0, "MAX_INTERRUPT_NESTING must be non-zero");
const _: () = assert!(
    INITIAL_CRITICAL_NESTING != 0,
    "the boot critical nesting value must be non-zero"
);
const _: () = assert!(CONTEXT_SEGMENTS >= 2, "a task needs two context segments");
const _: () = assert!(
    CONTEXT_SEGMENTS < (1 << 20),
    "segment handles are 20 bits wide"
);
