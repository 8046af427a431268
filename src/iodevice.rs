//! The generic I/O-device abstraction UP multiplexes over, plus a concrete
//! PL011-style MMIO UART driver and an in-memory test double.
//!
//! Device identity is a small integer (spec §6.1); [`ConsoleUart`] is bound
//! to [`CONSOLE_IODEV`] by convention, the same fixed id the UART proxy uses
//! for its cold-boot BOOT reply.

use core::fmt;

/// Fixed device id for the boot console UART.
pub const CONSOLE_IODEV: usize = 0;

/// Byte-stream I/O device contract consumed by [`crate::up::UartProxy`].
///
/// `read`/`write` operate in terms of raw byte counts rather than `Result`
/// so that a short read (common when polling a device with no data ready)
/// is not forced through the error path; callers compare the returned count
/// against what they asked for.
pub trait IoDevice {
    /// Reads up to `buf.len()` bytes without blocking on `can_read() == false`
    /// devices; blocks until bytes or an I/O failure on devices that support
    /// blocking reads (used only during a proxy re-entry, per spec §4.3).
    /// Returns the number of bytes actually read, or `None` on I/O failure.
    fn read(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Writes `buf` immediately (no internal buffering across calls).
    fn write(&mut self, buf: &[u8]) -> Option<usize>;

    /// Buffers `buf` for a later `flush`, used by event emission so a header
    /// and its payload and checksum reach the wire as one burst.
    fn queue(&mut self, buf: &[u8]) -> Option<usize>;

    /// Flushes any data queued via `queue`.
    fn flush(&mut self);

    /// Returns whether a byte is currently available without blocking.
    fn can_read(&self) -> bool;

    /// Services any device-specific event plumbing (interrupt acks, etc).
    /// A no-op for devices that need none.
    fn handle_events(&mut self) {}

    /// Downcasting hook so test harnesses can inspect a concrete device
    /// behind `dyn IoDevice` (e.g. to read back what `MemDevice` recorded).
    fn as_any_mut(&mut self) -> &mut dyn core::any::Any;
}

/// PL011-style UART registers, matching the subset of fields the proxy and
/// console driver actually touch.
mod registers {
    use tock_registers::registers::{Aliased, ReadOnly};
    use tock_registers::{register_bitfields, register_structs};

    register_bitfields! [
        u32,
        pub DR_R [
            DATA OFFSET(0) NUMBITS(8) [],
        ],
        pub DR_W [
            DATA OFFSET(0) NUMBITS(8) [],
        ],
        pub FR [
            RXFE OFFSET(4) NUMBITS(1) [
                Empty = 1,
                NotEmpty = 0,
            ],
            TXFF OFFSET(5) NUMBITS(1) [
                Nonfull = 0,
                Full = 1,
            ],
        ],
    ];

    register_structs! {
        pub UartRegisters {
            (0x00 => pub dr: Aliased<u32, DR_R::Register, DR_W::Register>),
            (0x04 => _unused0),
            (0x18 => pub fr: ReadOnly<u32, FR::Register>),
            (0x1c => @END),
        }
    }
}

use registers::{UartRegisters, DR_R, DR_W, FR};
use tock_registers::interfaces::{Readable, Writeable};

/// A memory-mapped PL011-style console UART.
pub struct ConsoleUart {
    registers: *mut UartRegisters,
}

// SAFETY: the hypervisor is single-core; `ConsoleUart` is only ever touched
// from the one core that owns UP.
unsafe impl Send for ConsoleUart {}

impl ConsoleUart {
    /// Wraps a memory-mapped UART register block.
    ///
    /// # Safety
    /// `base` must point to a valid, exclusively-owned PL011-style UART
    /// register block for as long as the returned value lives.
    pub unsafe fn new(base: *mut u8) -> Self {
        Self {
            registers: base.cast(),
        }
    }

    fn regs(&self) -> &UartRegisters {
        // SAFETY: constructed from a caller-guaranteed valid pointer.
        unsafe { &*self.registers }
    }
}

impl IoDevice for ConsoleUart {
    fn read(&mut self, buf: &mut [u8]) -> Option<usize> {
        let mut n = 0;
        for slot in buf.iter_mut() {
            if self.regs().fr.matches_any(FR::RXFE::Empty) {
                break;
            }
            *slot = self.regs().dr.read(DR_R::DATA) as u8;
            n += 1;
        }
        Some(n)
    }

    fn write(&mut self, buf: &[u8]) -> Option<usize> {
        for &byte in buf {
            while self.regs().fr.matches_any(FR::TXFF::Full) {
                core::hint::spin_loop();
            }
            self.regs().dr.write(DR_W::DATA.val(byte.into()));
        }
        Some(buf.len())
    }

    fn queue(&mut self, buf: &[u8]) -> Option<usize> {
        self.write(buf)
    }

    fn flush(&mut self) {}

    fn can_read(&self) -> bool {
        !self.regs().fr.matches_any(FR::RXFE::Empty)
    }

    fn as_any_mut(&mut self) -> &mut dyn core::any::Any {
        self
    }
}

impl fmt::Write for ConsoleUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s.as_bytes()).map(|_| ()).ok_or(fmt::Error)
    }
}

/// An in-memory ring-buffer device used to drive UP in tests without real
/// hardware, mirroring the teacher's `arch_hal`/`uefi-test` host-testable
/// backend pattern.
#[derive(Default)]
pub struct MemDevice {
    inbound: alloc::collections::VecDeque<u8>,
    outbound: alloc::vec::Vec<u8>,
    queued: alloc::vec::Vec<u8>,
    fail_reads: bool,
}

impl MemDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes that will be returned from subsequent `read` calls.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    /// Returns everything written or flushed to this device so far.
    pub fn sent(&self) -> &[u8] {
        &self.outbound
    }

    /// Clears the record of bytes sent, for scenario tests that inspect one
    /// reply/event at a time.
    pub fn clear_sent(&mut self) {
        self.outbound.clear();
    }

    /// Makes subsequent `read` calls report I/O failure.
    pub fn fail_next_reads(&mut self) {
        self.fail_reads = true;
    }
}

impl IoDevice for MemDevice {
    fn read(&mut self, buf: &mut [u8]) -> Option<usize> {
        if self.fail_reads {
            return None;
        }
        let mut n = 0;
        for slot in buf.iter_mut() {
            match self.inbound.pop_front() {
                Some(byte) => {
                    *slot = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Some(n)
    }

    fn write(&mut self, buf: &[u8]) -> Option<usize> {
        self.outbound.extend_from_slice(buf);
        Some(buf.len())
    }

    fn queue(&mut self, buf: &[u8]) -> Option<usize> {
        self.queued.extend_from_slice(buf);
        Some(buf.len())
    }

    fn flush(&mut self) {
        let queued = core::mem::take(&mut self.queued);
        self.outbound.extend_from_slice(&queued);
    }

    fn can_read(&self) -> bool {
        !self.inbound.is_empty()
    }

    fn as_any_mut(&mut self) -> &mut dyn core::any::Any {
        self
    }
}
