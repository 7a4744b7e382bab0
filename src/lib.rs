//! # rtport: Context-Switch Substrate
//!
//! The interrupt-driven layer beneath a preemptive, tick-based real-time
//! scheduler: how a task's machine state is laid out and initialized, how
//! critical sections nest, how the tick drives rescheduling, how one
//! save → select → restore switch runs, and how several cores sharing one
//! scheduler exclude each other and request yields.
//!
//! Which task runs next is not decided here. That is the [`Scheduler`]'s
//! job; this crate only calls `increment_tick`, `select_next_task` and
//! `current_task_context`.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Kernel / Scheduler                     │
//! ├────────────────────────────────────────────────────────┤
//! │                  Port API (port.rs)                     │
//! │  start_scheduler · yield_core · tick/ipi ISR bodies     │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │ Switch Engine│  Tick Source     │  Multicore           │
//! │ switch.rs    │  tick.rs         │  smp.rs · reclaim.rs │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │  Contexts (context/)      │  Per-core state (percpu.rs) │
//! │  linear · segmented       │  critical.rs · interrupt.rs │
//! ├────────────────────────────────────────────────────────┤
//! │  Backends (arch/): cortex_m4 (target) · sim (host)      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Contexts
//!
//! Two representations of a suspended task exist:
//!
//! - **Linear frames**: every register on the task's own stack, in the order
//!   a [`FrameLayout`](context::FrameLayout) describes. Cortex-M4, RH850 and
//!   C29 layouts are provided.
//! - **Segmented frames**: register banks spilled into a global pool of
//!   linked 16-word segments ([`SegmentPool`](context::SegmentPool)); the
//!   stack holds only the head handle.
//!
//! Both also carry the task's critical nesting depth, so a task suspended
//! inside a critical section resumes inside it.
//!
//! ## Memory Model
//!
//! - **No heap**: all state is statically sized
//! - **Per-core state** lives in one [`CoreDescriptor`](percpu::CoreDescriptor)
//!   per core, looked up by core id
//! - **Protocol violations halt** through [`error::fatal`]

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod context;
pub mod critical;
pub mod error;
pub mod interrupt;
pub mod percpu;
pub mod port;
pub mod reclaim;
pub mod scheduler;
pub mod smp;
pub mod switch;
pub mod task;
pub mod tick;

pub use error::{PortError, Violation};
pub use port::{Platform, Port};
pub use scheduler::Scheduler;
