//! `armvisor` — the stage-2 memory virtualization and UART proxy core of a
//! bare-metal ARMv8-A EL2 hypervisor.
//!
//! Three components, leaves first: [`pt`] owns the stage-2 translation
//! tables, [`hv`] decodes and dispatches guest data aborts against them, and
//! [`up`] multiplexes a framed request/reply/event protocol over one or more
//! UART-like devices. [`iodevice`], [`sync`], [`error`], and [`config`] are
//! the ambient plumbing the three lean on.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod hv;
pub mod iodevice;
pub mod macros;
pub mod pt;
pub mod sync;
pub mod up;
