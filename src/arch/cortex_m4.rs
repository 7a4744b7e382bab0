//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2, `thumbv7em-none-eabi`).
//! [`CortexM4`] implements every hardware trait of the port: PRIMASK for
//! the interrupt mask, SysTick for the tick, PendSV for the context switch.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by tasks in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. The PendSV handler pushes R4–R11 and hands the
//! resulting stack pointer to the switch engine, which adds the critical
//! nesting word below it ([`CortexM4Frame`](crate::context::CortexM4Frame)).
//!
//! Switches only ever run in PendSV. Interrupt handlers use
//! [`Port::exit_interrupt_pended`](crate::port::Port::exit_interrupt_pended)
//! as their epilogue, and the application provides the PendSV body:
//!
//! ```ignore
//! #[no_mangle]
//! extern "C" fn rtport_pendsv() {
//!     PORT.software_interrupt();
//! }
//! ```
//!
//! ## Interrupt Priorities
//!
//! - SysTick: Priority 0xFF (lowest)
//! - PendSV: Priority 0xFF (lowest), runs only when no other ISR is active

use core::arch::{asm, naked_asm};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::register;

use crate::config::TICK_PERIOD;
use crate::context::Restored;
use crate::interrupt::InterruptMask;
use crate::percpu::CoreId;
use crate::smp::{ExclusiveAccess, InterProcessor};
use crate::switch::{CallDepth, ContextSwitch};
use crate::task::{StackWord, TaskContext};
use crate::tick::TickTimer;

/// SysTick reload register width.
const SYST_MAX_RELOAD: u32 = 0x00FF_FFFF;

const _: () = assert!(
    TICK_PERIOD - 1 <= SYST_MAX_RELOAD,
    "tick period does not fit the 24-bit SysTick reload"
);

/// Process stack pointer of the task PendSV is switching, pointing at the
/// saved R4. Valid only between PendSV entry and exit.
static ACTIVE_PSP: AtomicPtr<StackWord> = AtomicPtr::new(ptr::null_mut());

/// The single-core Cortex-M4 backend.
pub struct CortexM4 {
    exclusive: AtomicU32,
}

impl CortexM4 {
    pub const fn new() -> Self {
        Self {
            exclusive: AtomicU32::new(0),
        }
    }

    fn syst() -> cortex_m::peripheral::SYST {
        // SAFETY: SysTick is owned by the port; nothing else touches it.
        unsafe { cortex_m::Peripherals::steal() }.SYST
    }
}

impl Default for CortexM4 {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Interrupt mask (PRIMASK)
// ---------------------------------------------------------------------------

impl InterruptMask for CortexM4 {
    #[inline]
    fn disable(&self) {
        cortex_m::interrupt::disable();
    }

    #[inline]
    fn enable(&self) {
        // SAFETY: only called at the end of a critical section or switch.
        unsafe { cortex_m::interrupt::enable() }
    }

    #[inline]
    fn is_enabled(&self) -> bool {
        register::primask::read().is_active()
    }
}

// ---------------------------------------------------------------------------
// SysTick
// ---------------------------------------------------------------------------

impl TickTimer for CortexM4 {
    /// Fire every `period` core clock cycles.
    fn start(&self, period: u32) {
        debug_assert!(period >= 1 && period - 1 <= SYST_MAX_RELOAD);
        let mut syst = Self::syst();
        syst.set_reload(period - 1);
        syst.clear_current();
        syst.set_clock_source(SystClkSource::Core);
        syst.enable_counter();
        syst.enable_interrupt();
    }

    fn stop(&self) {
        let mut syst = Self::syst();
        syst.disable_interrupt();
        syst.disable_counter();
    }

    fn clear_pending(&self) {
        // Reading COUNTFLAG clears it.
        let _ = Self::syst().has_wrapped();
        // ICSR PENDSTCLR
        // SAFETY: write-one-to-clear bit of a system control register.
        unsafe { ptr::write_volatile(ICSR, 1 << 25) }
    }

    /// SysTick reloads in hardware; there is no compare value to advance.
    fn advance_compare(&self, _period: u32) -> Option<u32> {
        None
    }
}

// ---------------------------------------------------------------------------
// Multicore hooks (single core)
// ---------------------------------------------------------------------------

impl ExclusiveAccess for CortexM4 {
    fn test_and_set(&self, bit: u32) -> bool {
        self.exclusive.fetch_or(1 << bit, Ordering::AcqRel) & (1 << bit) == 0
    }

    fn clear(&self, bit: u32) {
        self.exclusive.fetch_and(!(1 << bit), Ordering::Release);
        cortex_m::asm::sev();
    }

    /// Sleep until the holder's `clear` signals an event.
    fn snooze(&self) {
        cortex_m::asm::wfe();
    }
}

impl InterProcessor for CortexM4 {
    fn core_id(&self) -> CoreId {
        0
    }

    fn send_ipi(&self, target: CoreId) {
        log::warn!("cortex-m4: no core {} to interrupt", target);
    }

    fn clear_ipi(&self) {}
}

// ---------------------------------------------------------------------------
// PendSV
// ---------------------------------------------------------------------------

/// Interrupt Control and State Register.
const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;

/// Pend a PendSV exception (ICSR PENDSVSET, bit 28).
#[inline]
pub fn trigger_pendsv() {
    // SAFETY: write-one-to-set bit of a system control register.
    unsafe { ptr::write_volatile(ICSR, 1 << 28) }
}

impl ContextSwitch for CortexM4 {
    /// Push the critical nesting below the R4–R11 block PendSV stacked.
    unsafe fn save_context(&self, _core: CoreId, task: &TaskContext, critical_nesting: u32, _depth: CallDepth) {
        let top = ACTIVE_PSP.load(Ordering::Relaxed).sub(1);
        top.write(critical_nesting as StackWord);
        task.set_top_of_stack(top);
    }

    /// Pop the nesting word and leave PSP at R4 for PendSV to unstack.
    /// Interrupts are re-enabled by the exception return path, never here.
    unsafe fn restore_context(&self, _core: CoreId, task: &TaskContext, _depth: CallDepth) -> Restored {
        let top = task.top_of_stack();
        let critical_nesting = top.read() as u32;
        ACTIVE_PSP.store(top.add(1), Ordering::Relaxed);
        Restored {
            critical_nesting,
            interrupts_enabled: false,
        }
    }

    fn trigger_switch(&self, _core: CoreId) {
        trigger_pendsv();
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest interrupt priority, so a switch
/// never preempts an application ISR.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Enter the task restored by `Port::start_scheduler`.
///
/// Switches Thread mode to PSP and unstacks the initial frame by hand
/// (there is no exception to return from yet).
///
/// # Safety
/// Must be called once, right after `start_scheduler`, from Thread mode
/// on MSP.
pub unsafe fn start_first_task() -> ! {
    let psp = ACTIVE_PSP.load(Ordering::Relaxed);
    asm!(
        "adds r0, #32",        // Skip R4-R11 (8×4 bytes), they hold no state yet
        "msr psp, r0",

        // CONTROL.SPSEL = 1: Thread mode uses PSP
        "movs r0, #2",
        "msr control, r0",
        "isb",

        "pop {{r0-r3, r12}}",  // R0 carries the task parameter
        "pop {{r4}}",          // LR: task exit trap
        "pop {{r5}}",          // PC: entry, stored with bit 0 clear
        "pop {{r6}}",          // xPSR
        "mov lr, r4",
        "orr r5, r5, #1",      // Thumb state for bx
        "cpsie i",
        "bx r5",
        in("r0") psp,
        options(noreturn)
    );
}

extern "C" {
    /// PendSV body supplied by the application, normally
    /// `PORT.software_interrupt()`.
    fn rtport_pendsv();
}

/// Runs the switch between the register pushes and pops of [`PendSV`].
extern "C" fn pendsv_switch(psp: *mut StackWord) -> *mut StackWord {
    ACTIVE_PSP.store(psp, Ordering::Relaxed);
    // SAFETY: provided by the application; runs the switch engine.
    unsafe { rtport_pendsv() };
    ACTIVE_PSP.load(Ordering::Relaxed)
}

/// PendSV exception handler.
///
/// ## Sequence
/// 1. Push R4–R11 onto the current task's stack (PSP)
/// 2. Run the switch engine, which saves the nesting word, asks the
///    scheduler and restores the next task's nesting word
/// 3. Pop R4–R11 from the new task's stack and set PSP
/// 4. Re-enable interrupts and return (hardware restores R0–R3, R12, LR,
///    PC, xPSR)
///
/// # Safety
/// Called by the NVIC only.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",             // r0 = next task's PSP at R4
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "cpsie i",
        // Return to Thread mode on PSP (EXC_RETURN = 0xFFFFFFFD)
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        switch = sym pendsv_switch,
    );
}
