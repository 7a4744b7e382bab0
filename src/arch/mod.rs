//! # Architecture Backends
//!
//! Hardware implementations of the port traits. `cortex_m4` drives real
//! silicon and is only built for bare-metal ARM targets; `sim` is a host
//! model of the same hardware surface, used by the tests.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(any(test, feature = "sim"))]
pub mod sim;
