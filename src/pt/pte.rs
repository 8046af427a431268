//! Stage-2 page-table entry encoding (bit layout fixed by hardware: the root
//! L2 array is scanned directly by the CPU's translation table walker).

use bitfield_struct::bitfield;

/// A single 64-bit stage-2 PTE, valid at every level (L2/L3 hardware-visible,
/// L4 software-only).
#[bitfield(u64)]
pub struct Pte {
    /// `1` ⇒ this entry is resolved directly by hardware.
    pub valid: bool,
    /// At L2/L3: block(0)/table(1) when `valid`; at L3 when `!valid`: leaf(0)/
    /// sub-table(1). At L4 this bit is conventionally `1` but unused, since
    /// hardware never reaches L4.
    pub ty: bool,
    /// ARM lower attributes (access/shareability/memattr/AP), opaque to PT.
    #[bits(12)]
    pub lower_attr: u16,
    /// Output address, aligned to the level's granule.
    #[bits(36)]
    pub target: u64,
    /// Software entry kind, meaningful only when `!valid`.
    #[bits(3)]
    pub spte_type: u8,
    #[bits(8)]
    __reserved: u8,
    /// On trace, flush the I/O device after queuing the event.
    pub sync_trace: bool,
    /// Emit an `MMIOTRACE` event on writes.
    pub trace_write: bool,
    /// Emit an `MMIOTRACE` event on reads.
    pub trace_read: bool,
}

/// Software entry kinds (`SPTE_TYPE`, spec §3.3), valid only when `!valid()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpteKind {
    /// Redirect the access to another physical address held in `target`.
    Map = 0,
    /// Invoke an in-hypervisor callback whose address is `target`.
    Hook = 1,
    /// Reads go through the proxy; writes target the IPA directly.
    ProxyHookR = 2,
    /// Writes go through the proxy; reads target the IPA directly.
    ProxyHookW = 3,
    /// Both directions go through the proxy.
    ProxyHookRw = 4,
}

impl SpteKind {
    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Map),
            1 => Some(Self::Hook),
            2 => Some(Self::ProxyHookR),
            3 => Some(Self::ProxyHookW),
            4 => Some(Self::ProxyHookRw),
            _ => None,
        }
    }
}

impl Pte {
    /// The all-zero, unmapped entry.
    pub const UNMAPPED: Self = Self::new();

    pub fn is_unmapped(&self) -> bool {
        u64::from(*self) == 0
    }

    /// Whether hardware resolves this entry directly (block, page, or table).
    pub const fn is_hw(&self) -> bool {
        self.valid()
    }

    /// Whether this is a non-zero, hypervisor-interpreted entry.
    pub fn is_sw(&self) -> bool {
        !self.valid() && !self.is_unmapped()
    }

    /// Whether this L2 entry points at a dynamically allocated L3 table.
    pub const fn is_l2_table(&self) -> bool {
        self.valid() && self.ty()
    }

    /// Whether this L3 entry points at a dynamically allocated, software-only
    /// L4 table (invariant 3).
    pub const fn is_l3_sw_table(&self) -> bool {
        !self.valid() && self.ty()
    }

    /// The software kind of a non-table SW entry, or `None` if this is
    /// unmapped, a HW entry, or a sub-table pointer.
    pub const fn spte_kind(&self) -> Option<SpteKind> {
        if self.valid() || self.ty() {
            return None;
        }
        SpteKind::from_u8(self.spte_type())
    }

    /// A hardware block/page entry: `valid`, leaf (`ty = false`).
    pub const fn new_hw(target: u64, lower_attr: u16) -> Self {
        Self::new()
            .with_valid(true)
            .with_ty(false)
            .with_target(target)
            .with_lower_attr(lower_attr)
    }

    /// A hardware table entry (L2 → L3 only).
    pub const fn new_hw_table(target: u64) -> Self {
        Self::new().with_valid(true).with_ty(true).with_target(target)
    }

    /// A software sub-table pointer (L3 → L4 only).
    pub const fn new_sw_table(target: u64) -> Self {
        Self::new().with_valid(false).with_ty(true).with_target(target)
    }

    /// A software leaf entry of the given kind.
    pub const fn new_sw(kind: SpteKind, target: u64) -> Self {
        Self::new()
            .with_valid(false)
            .with_ty(false)
            .with_spte_type(kind as u8)
            .with_target(target)
    }

    /// Returns a copy with the trace bits copied from `other`, used when
    /// splitting a traced block into finer entries.
    pub const fn with_trace_bits_of(self, other: Self) -> Self {
        self.with_sync_trace(other.sync_trace())
            .with_trace_write(other.trace_write())
            .with_trace_read(other.trace_read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_is_all_zero() {
        assert!(Pte::UNMAPPED.is_unmapped());
        assert_eq!(u64::from(Pte::UNMAPPED), 0);
    }

    #[test]
    fn hw_entry_round_trips_target_and_attrs() {
        let pte = Pte::new_hw(0x1234_5000, 0b1010_1010_1010);
        assert!(pte.is_hw());
        assert!(!pte.is_sw());
        assert_eq!(pte.target(), 0x1234_5000);
        assert_eq!(pte.lower_attr(), 0b1010_1010_1010);
    }

    #[test]
    fn sw_leaf_round_trips_kind_and_target() {
        let pte = Pte::new_sw(SpteKind::Hook, 0xdead_beef);
        assert!(pte.is_sw());
        assert!(!pte.is_hw());
        assert_eq!(pte.spte_kind(), Some(SpteKind::Hook));
        assert_eq!(pte.target(), 0xdead_beef);
    }

    #[test]
    fn table_pointers_are_not_sw_leaves() {
        let l2_table = Pte::new_hw_table(0x2000);
        assert!(l2_table.is_l2_table());
        assert_eq!(l2_table.spte_kind(), None);

        let l3_table = Pte::new_sw_table(0x3000);
        assert!(l3_table.is_l3_sw_table());
        assert_eq!(l3_table.spte_kind(), None);
    }

    #[test]
    fn trace_bits_are_independent_of_leaf_encoding() {
        let pte = Pte::new_hw(0x1000, 0).with_trace_write(true).with_sync_trace(true);
        assert!(pte.trace_write());
        assert!(pte.sync_trace());
        assert!(!pte.trace_read());
        assert_eq!(pte.target(), 0x1000);
    }

    #[test]
    fn full_field_width_does_not_overlap() {
        let pte = Pte::new_sw(SpteKind::ProxyHookRw, 0xF_FFFF_FFFF)
            .with_sync_trace(true)
            .with_trace_write(true)
            .with_trace_read(true);
        assert_eq!(pte.target(), 0xF_FFFF_FFFF);
        assert_eq!(pte.spte_kind(), Some(SpteKind::ProxyHookRw));
        assert!(pte.sync_trace() && pte.trace_write() && pte.trace_read());
    }
}
