//! Crate-wide error types.
//!
//! Programmer errors (category 1) and unhandled hypervisor faults (category
//! 4) are modeled as `enum`s instead of the raw negative integers a C
//! implementation would return. Transient wire errors (categories 2 and 3)
//! are never represented as Rust errors; they are always wire [`Status`]
//! values, since the host driver is expected to see and retry them.

use core::fmt;

/// Failure modes for [`crate::pt`] map/unmap requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtError {
    /// `from`/`size` violated the alignment rules of the requested mapping kind.
    Misaligned,
    /// The region straddles or exceeds the 36-bit IPA space.
    OutOfRange,
    /// The backing allocator could not produce a sub-table.
    OutOfMemory,
}

impl fmt::Display for PtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned => write!(f, "misaligned mapping request"),
            Self::OutOfRange => write!(f, "IPA range exceeds the 36-bit address space"),
            Self::OutOfMemory => write!(f, "out of memory allocating a sub-table"),
        }
    }
}

/// Category-4 errors from [`crate::hv`]: unhandled faults that are fatal to
/// the abort. The guest PC is never advanced when one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvFault {
    /// Stage-1 translation of `FAR` failed, or the resulting IPA is >= 2^36.
    FarTranslation,
    /// Stage-1 translation of `ELR` (to fetch the faulting instruction) failed.
    ElrTranslation,
    /// The walked PTE was a hardware entry; an abort should never trap to
    /// software for a page stage-2 already resolves.
    UnexpectedHardwareEntry,
    /// The IPA has no installed descriptor at all.
    Unmapped,
    /// The faulting instruction word did not match any decode rule, or
    /// matched but used `Rn == 31` as a writeback base register.
    UnsupportedInstruction,
    /// An in-hypervisor [`crate::pt::HookFn`] reported failure.
    HookFailed,
    /// The proxy RPC layer or exception proxy reported failure.
    ProxyFailed,
}

impl fmt::Display for HvFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::FarTranslation => "stage-1 translation of FAR failed",
            Self::ElrTranslation => "stage-1 translation of ELR failed",
            Self::UnexpectedHardwareEntry => "data abort on a hardware-resolved stage-2 entry",
            Self::Unmapped => "IPA has no stage-2 descriptor",
            Self::UnsupportedInstruction => "faulting instruction is not an emulatable encoding",
            Self::HookFailed => "in-hypervisor MMIO hook failed",
            Self::ProxyFailed => "proxy RPC layer failed",
        };
        write!(f, "{msg}")
    }
}

/// Wire-level reply status codes (spec §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    BadCmd = -1,
    Inval = -2,
    XfrErr = -3,
    CsumErr = -4,
}

impl Status {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}
