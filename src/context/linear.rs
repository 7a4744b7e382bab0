//! # Linear Frames
//!
//! A linear frame is the whole register image written onto the task's own
//! stack. Each architecture describes its frame as a list of [`Slot`]s in
//! ascending address order; the generic code here builds initial frames
//! and moves register images in and out of them.
//!
//! ```text
//!   descending stack (Cortex-M4, RH850)      ascending stack (C29x)
//!
//!   high ┌──────────────┐ initial top        high ┌──────────────┐ saved top
//!        │  slot N-1    │                         │  slot N-1    │
//!        │  ...         │                         │  ...         │
//!        │  slot 0      │ ◄─ saved top            │  slot 0      │ ◄─ initial top
//!   low  └──────────────┘                    low  └──────────────┘
//! ```

use core::ffi::c_void;
use core::marker::PhantomData;

use crate::config::HAS_FPU;
use crate::error::PortError;
use crate::task::{task_exit_trap_address, StackGrowth, StackWord, TaskContext, TaskFunction, TaskStack};

/// Role of one word in a linear frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Saved critical nesting depth of the task.
    CriticalNesting,
    /// Processor status word carrying the interrupt-enable bit.
    Status,
    /// Resume address.
    ProgramCounter,
    /// Register carrying the first argument.
    Argument,
    /// Return address; initially the task exit trap.
    ReturnAddress,
    /// Numeric-coprocessor context flag.
    FpuFlag,
    /// Any other register, with its initial fill value.
    Word(StackWord),
}

/// Per-architecture description of a linear frame.
pub trait FrameLayout {
    /// Short architecture name for logs.
    const NAME: &'static str;
    /// Stack growth direction.
    const GROWTH: StackGrowth;
    /// Frame slots, lowest address first. `Status`, `ProgramCounter`,
    /// `Argument` and `CriticalNesting` must each appear exactly once.
    const SLOTS: &'static [Slot];
    /// Status word of a freshly created task: interrupts enabled, default
    /// privilege, default coprocessor state.
    const INITIAL_STATUS: StackWord;
    /// Initial value of the coprocessor flag, if the frame has one.
    const INITIAL_FPU_FLAG: StackWord = 0;

    /// Whether `status` has maskable interrupts enabled.
    fn interrupts_enabled(status: StackWord) -> bool;

    /// Encode an entry point as the architecture's resume address.
    fn entry_address(entry: TaskFunction) -> StackWord {
        entry as usize
    }
}

const fn slot_index(slots: &[Slot], wanted: Slot) -> usize {
    let mut i = 0;
    while i < slots.len() {
        if matches!(
            (slots[i], wanted),
            (Slot::CriticalNesting, Slot::CriticalNesting)
                | (Slot::Status, Slot::Status)
                | (Slot::ProgramCounter, Slot::ProgramCounter)
                | (Slot::Argument, Slot::Argument)
                | (Slot::ReturnAddress, Slot::ReturnAddress)
                | (Slot::FpuFlag, Slot::FpuFlag)
        ) {
            return i;
        }
        i += 1;
    }
    panic!("frame layout is missing a required slot");
}

/// Generic operations over a linear frame layout.
pub struct LinearFrame<L: FrameLayout>(PhantomData<L>);

impl<L: FrameLayout> LinearFrame<L> {
    /// Frame size in words.
    pub const WORDS: usize = L::SLOTS.len();
    pub const STATUS: usize = slot_index(L::SLOTS, Slot::Status);
    pub const PROGRAM_COUNTER: usize = slot_index(L::SLOTS, Slot::ProgramCounter);
    pub const ARGUMENT: usize = slot_index(L::SLOTS, Slot::Argument);
    pub const CRITICAL_NESTING: usize = slot_index(L::SLOTS, Slot::CriticalNesting);

    fn initial_value(slot: Slot, entry: TaskFunction, parameter: *mut c_void) -> StackWord {
        match slot {
            Slot::CriticalNesting => 0,
            Slot::Status => L::INITIAL_STATUS,
            Slot::ProgramCounter => L::entry_address(entry),
            Slot::Argument => parameter as usize,
            Slot::ReturnAddress => task_exit_trap_address(),
            Slot::FpuFlag => L::INITIAL_FPU_FLAG,
            Slot::Word(value) => value,
        }
    }

    /// Lowest address of the frame whose saved top of stack is `top`.
    #[inline]
    pub fn frame_base(top: *mut StackWord) -> *mut StackWord {
        match L::GROWTH {
            StackGrowth::Descending => top,
            StackGrowth::Ascending => top.wrapping_sub(Self::WORDS),
        }
    }

    /// Write an initial frame at `top` so that restoring it starts `entry`
    /// with `parameter` as its first argument. Returns the new top of stack.
    ///
    /// # Safety
    /// `top` must be the current top of a stack with at least
    /// [`WORDS`](Self::WORDS) writable words in its growth direction.
    pub unsafe fn initialize_stack(
        top: *mut StackWord,
        entry: TaskFunction,
        parameter: *mut c_void,
    ) -> *mut StackWord {
        let base = match L::GROWTH {
            StackGrowth::Descending => top.sub(Self::WORDS),
            StackGrowth::Ascending => top,
        };
        for (i, slot) in L::SLOTS.iter().enumerate() {
            base.add(i).write(Self::initial_value(*slot, entry, parameter));
        }
        match L::GROWTH {
            StackGrowth::Descending => base,
            StackGrowth::Ascending => base.add(Self::WORDS),
        }
    }

    /// Safe front end over [`initialize_stack`](Self::initialize_stack)
    /// for a statically sized stack; records the result in `context`.
    pub fn initialize<const N: usize>(
        stack: &mut TaskStack<N>,
        context: &TaskContext,
        entry: TaskFunction,
        parameter: *mut c_void,
    ) -> Result<(), PortError> {
        // One spare word covers the alignment trim at the descending end.
        let needed = Self::WORDS + 1;
        if N < needed {
            return Err(PortError::StackTooSmall {
                needed,
                available: N,
            });
        }
        let top = stack.initial_top(L::GROWTH);
        // SAFETY: the stack holds at least WORDS words past `top` in its
        // growth direction, checked above.
        let top = unsafe { Self::initialize_stack(top, entry, parameter) };
        context.set_top_of_stack(top);
        log::trace!("{}: initial frame at {:p}", L::NAME, top);
        Ok(())
    }

    /// Push a register image below live stack pointer `sp`. The nesting slot
    /// takes `critical_nesting`; `registers` supplies every other slot.
    /// Returns the top of stack to record in the task.
    ///
    /// # Safety
    /// `sp` must be a live stack pointer with room for a full frame.
    pub unsafe fn push(
        sp: *mut StackWord,
        registers: &[StackWord],
        critical_nesting: u32,
    ) -> *mut StackWord {
        let base = match L::GROWTH {
            StackGrowth::Descending => sp.sub(Self::WORDS),
            StackGrowth::Ascending => sp,
        };
        for i in 0..Self::WORDS {
            let value = if i == Self::CRITICAL_NESTING {
                critical_nesting as StackWord
            } else {
                registers[i]
            };
            base.add(i).write(value);
        }
        match L::GROWTH {
            StackGrowth::Descending => base,
            StackGrowth::Ascending => base.add(Self::WORDS),
        }
    }

    /// Pop the frame saved at `top` into `registers`. Returns the stack
    /// pointer the task resumes with and its saved critical nesting.
    ///
    /// # Safety
    /// `top` must be a top of stack produced by [`push`](Self::push) or
    /// [`initialize_stack`](Self::initialize_stack).
    pub unsafe fn pop(top: *mut StackWord, registers: &mut [StackWord]) -> (*mut StackWord, u32) {
        let base = Self::frame_base(top);
        let mut nesting = 0;
        for (i, register) in registers.iter_mut().enumerate().take(Self::WORDS) {
            let value = base.add(i).read();
            if i == Self::CRITICAL_NESTING {
                nesting = value as u32;
            } else {
                *register = value;
            }
        }
        let sp = match L::GROWTH {
            StackGrowth::Descending => base.add(Self::WORDS),
            StackGrowth::Ascending => base,
        };
        (sp, nesting)
    }

    /// Borrow the saved frame at `top` as a slice, lowest address first.
    ///
    /// # Safety
    /// `top` must address a complete frame that stays alive and unaliased
    /// for `'a`.
    pub unsafe fn frame<'a>(top: *mut StackWord) -> &'a [StackWord] {
        core::slice::from_raw_parts(Self::frame_base(top), Self::WORDS)
    }
}

// ---------------------------------------------------------------------------
// Cortex-M4
// ---------------------------------------------------------------------------

/// Cortex-M4 (Thumb-2): software-saved R4–R11 below the hardware
/// exception frame, plus the nesting word pushed last by PendSV.
pub struct CortexM4Frame;

/// xPSR with only the Thumb bit set.
const CM4_INITIAL_XPSR: StackWord = 0x0100_0000;

impl FrameLayout for CortexM4Frame {
    const NAME: &'static str = "cortex-m4";
    const GROWTH: StackGrowth = StackGrowth::Descending;
    const SLOTS: &'static [Slot] = &[
        Slot::CriticalNesting,
        // Software-saved context, R4..R11
        Slot::Word(0),
        Slot::Word(0),
        Slot::Word(0),
        Slot::Word(0),
        Slot::Word(0),
        Slot::Word(0),
        Slot::Word(0),
        Slot::Word(0),
        // Hardware-stacked frame
        Slot::Argument, // R0
        Slot::Word(0),  // R1
        Slot::Word(0),  // R2
        Slot::Word(0),  // R3
        Slot::Word(0),  // R12
        Slot::ReturnAddress,
        Slot::ProgramCounter,
        Slot::Status,
    ];
    const INITIAL_STATUS: StackWord = CM4_INITIAL_XPSR;

    // PRIMASK is not part of the frame: exception return always resumes
    // thread mode with interrupts unmasked.
    fn interrupts_enabled(_status: StackWord) -> bool {
        true
    }

    fn entry_address(entry: TaskFunction) -> StackWord {
        entry as usize & !1
    }
}

// ---------------------------------------------------------------------------
// RH850 (U2x)
// ---------------------------------------------------------------------------

/// RH850 G4MH: R1–R31 plus EI/CT system registers, optional FPU status.
pub struct Rh850Frame;

/// PSW.ID, set when maskable interrupts are disabled.
const RH850_PSW_ID: StackWord = 1 << 5;
/// PSW.CU0, coprocessor (FPU) usable.
const RH850_PSW_CU0: StackWord = 1 << 16;
/// FPSR flush-to-zero with round-to-nearest.
const RH850_INITIAL_FPSR: StackWord = 0x0002_0000;

/// Recognizable fill for Rn: 0x01010101 times n written as hex digits.
const fn rh850_fill(n: usize) -> StackWord {
    0x0101_0101 * ((n / 10) * 16 + n % 10)
}

const fn rh850_slots<const N: usize>(with_fpu: bool) -> [Slot; N] {
    let mut slots = [Slot::Word(0); N];
    let mut i = 0;
    slots[i] = Slot::CriticalNesting;
    i += 1;
    if with_fpu {
        slots[i] = Slot::Word(0); // FPEPC
        slots[i + 1] = Slot::Word(RH850_INITIAL_FPSR); // FPSR
        i += 2;
    }
    slots[i] = Slot::Word(0); // CTPC
    slots[i + 1] = Slot::Word(RH850_INITIAL_PSW); // CTPSW
    slots[i + 2] = Slot::Word(0); // EIIC
    slots[i + 3] = Slot::ProgramCounter; // EIPC
    slots[i + 4] = Slot::Status; // EIPSW, restored by eiret
    slots[i + 5] = Slot::Word(rh850_fill(2)); // R2
    slots[i + 6] = Slot::Word(rh850_fill(1)); // R1
    i += 7;
    let mut reg = 30;
    while reg >= 7 {
        slots[i] = Slot::Word(rh850_fill(reg));
        i += 1;
        reg -= 1;
    }
    slots[i] = Slot::Argument; // R6
    slots[i + 1] = Slot::Word(rh850_fill(5)); // R5 (TP)
    slots[i + 2] = Slot::ReturnAddress; // R31 (LP)
    slots
}

const RH850_INITIAL_PSW: StackWord = if HAS_FPU { RH850_PSW_CU0 } else { 0 };
const RH850_WORDS: usize = 1 + 5 + 2 + 24 + 3;
const RH850_SLOTS: [Slot; RH850_WORDS] = rh850_slots(false);
const RH850_FPU_SLOTS: [Slot; RH850_WORDS + 2] = rh850_slots(true);

impl FrameLayout for Rh850Frame {
    const NAME: &'static str = "rh850";
    const GROWTH: StackGrowth = StackGrowth::Descending;
    const SLOTS: &'static [Slot] = if HAS_FPU {
        &RH850_FPU_SLOTS
    } else {
        &RH850_SLOTS
    };
    const INITIAL_STATUS: StackWord = RH850_INITIAL_PSW;

    fn interrupts_enabled(status: StackWord) -> bool {
        status & RH850_PSW_ID == 0
    }
}

// ---------------------------------------------------------------------------
// C29x
// ---------------------------------------------------------------------------

/// TI C29x: ascending stack, DSTS/ESTS status, A/D/M register files and
/// an FPU-context flag.
///
/// The compiler touches FPU registers even in integer code, so the FPU
/// flag always starts set. This is a silicon/toolchain constraint and
/// deliberately ignores the `fpu` feature.
pub struct C29Frame;

/// DSTS with the low-priority interrupt enable bit set.
const C29_INITIAL_DSTS: StackWord = 0x07F9_0001;
const C29_DSTS_INT_ENABLE: StackWord = 0x0001_0000;
const C29_INITIAL_ESTS: StackWord = 0x0002_0101;
/// Saved A, D and M registers minus the two kept in the status block.
const C29_REGISTER_WORDS: usize = 16 + 16 + 32 - 2;
const C29_ARGUMENT_REGISTER: usize = 4;
const C29_WORDS: usize = 6 + C29_REGISTER_WORDS + 2;

const fn c29_slots() -> [Slot; C29_WORDS] {
    let mut slots = [Slot::Word(0xDEAD_DEAD); C29_WORDS];
    slots[0] = Slot::ReturnAddress;
    slots[1] = Slot::Word(C29_INITIAL_DSTS); // DSTS if RETI
    slots[2] = Slot::Word(0xABAB_ABAB); // A14
    slots[3] = Slot::ProgramCounter; // RPC
    slots[4] = Slot::Status; // DSTS
    slots[5] = Slot::Word(C29_INITIAL_ESTS); // ESTS
    slots[6 + C29_ARGUMENT_REGISTER] = Slot::Argument; // A4
    slots[6 + C29_REGISTER_WORDS] = Slot::FpuFlag;
    slots[7 + C29_REGISTER_WORDS] = Slot::CriticalNesting;
    slots
}

const C29_SLOTS: [Slot; C29_WORDS] = c29_slots();

impl FrameLayout for C29Frame {
    const NAME: &'static str = "c29x";
    const GROWTH: StackGrowth = StackGrowth::Ascending;
    const SLOTS: &'static [Slot] = &C29_SLOTS;
    const INITIAL_STATUS: StackWord = C29_INITIAL_DSTS;
    const INITIAL_FPU_FLAG: StackWord = 1;

    fn interrupts_enabled(status: StackWord) -> bool {
        status & C29_DSTS_INT_ENABLE != 0
    }

    fn entry_address(entry: TaskFunction) -> StackWord {
        entry as usize & !1
    }
}

/// Largest frame among the built-in layouts.
pub const MAX_FRAME_WORDS: usize = {
    let mut max = CortexM4Frame::SLOTS.len();
    if RH850_FPU_SLOTS.len() > max {
        max = RH850_FPU_SLOTS.len();
    }
    if C29_SLOTS.len() > max {
        max = C29_SLOTS.len();
    }
    max
};
