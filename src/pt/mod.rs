//! PT — the stage-2 page table.
//!
//! Owns the root L2 array (2048 entries, invariant 1: never freed) and every
//! dynamically allocated L3/L4 sub-table reachable from it. L2 and L3 are
//! hardware-visible levels; L4 is a synthetic, software-only level that gives
//! [`crate::hv`] word-granularity MMIO hooks without hardware ever seeing
//! them (§3.1).

mod pte;

pub use pte::{Pte, SpteKind};

use crate::error::PtError;
use alloc::alloc::Layout;
use core::slice;

/// Width of the IPA space.
pub const IPA_BITS: u32 = 36;
const IPA_LIMIT: u64 = 1 << IPA_BITS;

const L2_INDEX_BITS: u32 = 11;
const L3_INDEX_BITS: u32 = 11;
const L4_INDEX_BITS: u32 = 12;

const L2_SHIFT: u32 = 25; // 32 MiB granule
const L3_SHIFT: u32 = 14; // 16 KiB granule
const L4_SHIFT: u32 = 2; //   4 B granule

const L2_ENTRIES: usize = 1 << L2_INDEX_BITS;
const L3_ENTRIES: usize = 1 << L3_INDEX_BITS;
const L4_ENTRIES: usize = 1 << L4_INDEX_BITS;

const L3_TABLE_SIZE: usize = L3_ENTRIES * core::mem::size_of::<Pte>();
const L4_TABLE_SIZE: usize = L4_ENTRIES * core::mem::size_of::<Pte>();
const TABLE_ALIGN: usize = 16 * 1024;

/// Callback signature for a HOOK software entry: `(ipa, &mut value, is_write,
/// width_bytes) -> Ok(())` on success, matching the teacher's typed-error
/// preference over a bare negative return.
pub type HookFn = fn(u64, &mut u64, bool, u32) -> Result<(), ()>;

/// Which side of a proxy-hook access is forwarded to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyDirection {
    /// Reads go through the proxy; writes target the IPA directly.
    ReadOnly,
    /// Writes go through the proxy; reads target the IPA directly.
    WriteOnly,
    /// Both directions go through the proxy.
    Both,
}

impl ProxyDirection {
    const fn kind(self) -> SpteKind {
        match self {
            Self::ReadOnly => SpteKind::ProxyHookR,
            Self::WriteOnly => SpteKind::ProxyHookW,
            Self::Both => SpteKind::ProxyHookRw,
        }
    }
}

/// Lower attributes used for every HW mapping PT installs: accessed,
/// inner-shareable, S2AP=RW, MemAttr left at its reset (device) encoding —
/// §4.1's `map_hw` contract (`{ACCESS | Inner-Shareable | S2AP=RW | MemAttr=unchanged}`).
const HW_LOWER_ATTR: u16 = 0b0000_0000_1011; // ACCESS | SH=Inner | AP=RW

/// Programs the hardware stage-2 translation-control/base-address registers.
/// Kept as a trait so [`Stage2Table::init`] is host-testable without real
/// EL2 system registers.
pub trait Stage2Registers {
    /// Installs a translation base covering `ipa_bits` of IPA, 16 KiB
    /// granule, rooted at `root_base` (the root L2 array's address).
    fn install(&mut self, ipa_bits: u32, root_base: u64);
}

#[cfg(feature = "hardware")]
pub struct Aarch64Stage2Registers;

#[cfg(feature = "hardware")]
impl Stage2Registers for Aarch64Stage2Registers {
    fn install(&mut self, ipa_bits: u32, root_base: u64) {
        use aarch64_cpu::registers::{VTCR_EL2, VTTBR_EL2};
        use tock_registers::interfaces::Writeable;

        const TG0_16KIB: u64 = 0b10;
        const SL0_START_AT_L2: u64 = 0b01;
        const SH0_INNER: u64 = 0b11;
        const RGN_WRITE_BACK: u64 = 0b01;

        let t0sz = u64::from(64 - ipa_bits);
        let vtcr = t0sz
            | (SL0_START_AT_L2 << 6)
            | (RGN_WRITE_BACK << 8)
            | (RGN_WRITE_BACK << 10)
            | (SH0_INNER << 12)
            | (TG0_16KIB << 14);
        VTCR_EL2.set(vtcr);
        VTTBR_EL2.set(root_base);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    L2,
    L3,
    L4,
}

impl Level {
    const fn shift(self) -> u32 {
        match self {
            Self::L2 => L2_SHIFT,
            Self::L3 => L3_SHIFT,
            Self::L4 => L4_SHIFT,
        }
    }

    const fn granule(self) -> u64 {
        1 << self.shift()
    }

    const fn entries(self) -> usize {
        match self {
            Self::L2 => L2_ENTRIES,
            Self::L3 => L3_ENTRIES,
            Self::L4 => L4_ENTRIES,
        }
    }

    const fn index(self, ipa: u64) -> usize {
        let mask = (self.entries() as u64) - 1;
        ((ipa >> self.shift()) & mask) as usize
    }

    const fn child(self) -> Option<Self> {
        match self {
            Self::L2 => Some(Self::L3),
            Self::L3 => Some(Self::L4),
            Self::L4 => None,
        }
    }
}

fn alloc_table(entries: usize, size: usize) -> Result<*mut Pte, PtError> {
    let layout = Layout::from_size_align(size, TABLE_ALIGN).map_err(|_| PtError::OutOfMemory)?;
    // SAFETY: `layout` has a non-zero size (L3/L4 tables are never empty).
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(PtError::OutOfMemory);
    }
    let _ = entries;
    Ok(ptr.cast())
}

fn dealloc_table(ptr: *mut Pte, size: usize) {
    // SAFETY: `ptr` was allocated by `alloc_table` with this exact layout.
    let layout = Layout::from_size_align(size, TABLE_ALIGN).unwrap();
    unsafe { alloc::alloc::dealloc(ptr.cast(), layout) };
}

fn target_ptr(pte: Pte) -> *mut Pte {
    (pte.target() as usize) as *mut Pte
}

/// Frees `ptr`'s L3 table and, per invariant 3, recursively frees every L4
/// sub-table it owns.
fn free_l3_table(ptr: *mut Pte) {
    // SAFETY: `ptr` is a live L3 table per invariant 2.
    let table = unsafe { slice::from_raw_parts(ptr, L3_ENTRIES) };
    for &entry in table {
        if entry.is_l3_sw_table() {
            free_l4_table(target_ptr(entry));
        }
    }
    dealloc_table(ptr, L3_TABLE_SIZE);
}

fn free_l4_table(ptr: *mut Pte) {
    dealloc_table(ptr, L4_TABLE_SIZE);
}

fn free_entry_subtable(level: Level, entry: Pte) {
    match level {
        Level::L2 if entry.is_l2_table() => free_l3_table(target_ptr(entry)),
        Level::L3 if entry.is_l3_sw_table() => free_l4_table(target_ptr(entry)),
        _ => {}
    }
}

/// Replicates `leaf` (a block/page or SW entry that fully covered one entry
/// at `level`) into every child slot of a freshly allocated sub-table at
/// `level.child()`, per invariants 6 and 7.
fn split_leaf_into(level: Level, leaf: Pte, entry_base: u64, children: &mut [Pte]) {
    let child_level = level.child().expect("cannot split at L4");
    let child_gran = child_level.granule();
    // Hardware cannot walk L4; an L3 HW page must be lowered to a SW MAP
    // redirect before it can be split into L4 children (spec §4.1).
    let lowering_hw_to_sw = level == Level::L3 && leaf.is_hw();

    for (i, child) in children.iter_mut().enumerate() {
        let stride = (i as u64) * child_gran;
        *child = if lowering_hw_to_sw {
            Pte::new_sw(SpteKind::Map, leaf.target() + stride)
        } else if leaf.is_hw() {
            Pte::new_hw(leaf.target() + stride, leaf.lower_attr())
        } else {
            match leaf.spte_kind() {
                Some(SpteKind::Map) => Pte::new_sw(SpteKind::Map, leaf.target() + stride),
                Some(kind) => Pte::new_sw(kind, leaf.target()),
                None => Pte::UNMAPPED,
            }
        }
        .with_trace_bits_of(leaf);
    }
    let _ = entry_base;
}

/// Ensures `entry` is a table entry pointing at a (possibly freshly
/// allocated) sub-table at `level.child()`, splitting any existing leaf into
/// uniform children first. Returns the sub-table's base pointer.
fn ensure_subtable(level: Level, entry: &mut Pte, entry_base: u64) -> Result<*mut Pte, PtError> {
    let already_table = match level {
        Level::L2 => entry.is_l2_table(),
        Level::L3 => entry.is_l3_sw_table(),
        Level::L4 => unreachable!("L4 has no children"),
    };
    if already_table {
        return Ok(target_ptr(*entry));
    }

    let child_level = level.child().expect("cannot descend past L4");
    let (size, count) = match child_level {
        Level::L3 => (L3_TABLE_SIZE, L3_ENTRIES),
        Level::L4 => (L4_TABLE_SIZE, L4_ENTRIES),
        Level::L2 => unreachable!("L2 is never a child"),
    };
    let child_ptr = alloc_table(count, size)?;
    // SAFETY: freshly allocated, exclusively owned until installed below.
    let children = unsafe { slice::from_raw_parts_mut(child_ptr, count) };

    if !entry.is_unmapped() {
        split_leaf_into(level, *entry, entry_base, children);
    }

    *entry = match level {
        Level::L2 => Pte::new_hw_table(child_ptr as u64),
        Level::L3 => Pte::new_sw_table(child_ptr as u64),
        Level::L4 => unreachable!(),
    };
    Ok(child_ptr)
}

/// The stage-2 translation table: a fixed root L2 array plus every
/// dynamically allocated L3/L4 sub-table it owns.
pub struct Stage2Table {
    root: alloc::boxed::Box<[Pte; L2_ENTRIES]>,
}

impl Stage2Table {
    /// Allocates a fresh, fully unmapped table. Does not touch hardware
    /// registers; call [`Self::init`] to do that.
    pub fn new() -> Self {
        let layout = Layout::new::<[Pte; L2_ENTRIES]>();
        // SAFETY: non-zero-size layout; zeroed memory is a valid all-UNMAPPED array.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "failed to allocate the stage-2 root table");
        // SAFETY: `ptr` was allocated with the layout of `[Pte; L2_ENTRIES]`.
        let root = unsafe { alloc::boxed::Box::from_raw(ptr.cast()) };
        Self { root }
    }

    /// Frees every sub-table reachable from the root, zeroes the root, and
    /// reprograms `regs` for a 16 KiB granule, [`IPA_BITS`]-bit IPA space
    /// rooted at L2. Idempotent: safe to call again after prior mappings.
    pub fn init(&mut self, regs: &mut impl Stage2Registers) {
        for entry in self.root.iter_mut() {
            free_entry_subtable(Level::L2, *entry);
            *entry = Pte::UNMAPPED;
        }
        let root_base = self.root.as_ptr() as u64;
        regs.install(IPA_BITS, root_base);
    }

    fn install(
        &mut self,
        from: u64,
        size: u64,
        to0: u64,
        incr: u64,
        min_level: Level,
        align_level: Level,
        make_leaf: &dyn Fn(u64) -> Pte,
    ) -> Result<(), PtError> {
        if size == 0 {
            return Ok(());
        }
        let end = from.checked_add(size).ok_or(PtError::OutOfRange)?;
        if end > IPA_LIMIT {
            return Err(PtError::OutOfRange);
        }
        let align = align_level.granule();
        if from % align != 0 || size % align != 0 {
            return Err(PtError::Misaligned);
        }
        Self::map_level(&mut self.root[..], Level::L2, from, size, to0, incr, min_level, make_leaf)
    }

    #[expect(clippy::too_many_arguments, reason = "internal recursion, not part of the public API")]
    fn map_level(
        table: &mut [Pte],
        level: Level,
        from: u64,
        size: u64,
        to0: u64,
        incr: u64,
        min_level: Level,
        make_leaf: &dyn Fn(u64) -> Pte,
    ) -> Result<(), PtError> {
        let gran = level.granule();
        let mut ipa = from;
        let end = from + size;
        while ipa < end {
            let idx = level.index(ipa);
            let entry_base = (idx as u64) << level.shift();
            let entry_end = entry_base + gran;
            let seg_end = end.min(entry_end);
            let full_entry = ipa == entry_base && seg_end == entry_end;
            let target = to0.wrapping_add(incr.wrapping_mul(entry_base.wrapping_sub(from)));
            // A block/page collapses a whole entry's offset range into `target`
            // via OR in `leaf_with_offset`; that only reconstructs the right
            // address if `target`'s low `gran` bits are zero (spec §4.1's
            // "32 MiB-aligned" rule for L2, generalized to every coarsening
            // level). Misaligned targets fall through to the next finer level.
            let can_coarsen = full_entry && level >= min_level && target % gran == 0;

            if level == Level::L4 || can_coarsen {
                free_entry_subtable(level, table[idx]);
                table[idx] = make_leaf(target);
            } else {
                let child_level = level.child().expect("non-L4 level always has a child");
                let child_ptr = ensure_subtable(level, &mut table[idx], entry_base)?;
                // SAFETY: `ensure_subtable` returns a live table of `child_level`'s size.
                let child_table =
                    unsafe { slice::from_raw_parts_mut(child_ptr, child_level.entries()) };
                let child_from = ipa.max(entry_base);
                Self::map_level(
                    child_table,
                    child_level,
                    child_from,
                    seg_end - child_from,
                    to0,
                    incr,
                    min_level,
                    make_leaf,
                )?;
            }
            ipa = seg_end;
        }
        Ok(())
    }

    /// Generic software-redirect installer (spec §4.1): `incr = 0` yields a
    /// constant target, `incr = 1` a linear redirect stepping by each
    /// segment's own granule.
    pub fn map(&mut self, from: u64, to: u64, size: u64, incr: u64) -> Result<(), PtError> {
        self.install(from, size, to, incr, Level::L2, Level::L4, &|target| {
            Pte::new_sw(SpteKind::Map, target)
        })
    }

    /// Clears every descriptor in `[from, from + size)`, freeing any
    /// sub-tables the cleared range owned.
    pub fn unmap(&mut self, from: u64, size: u64) -> Result<(), PtError> {
        self.map(from, 0, size, 0)
    }

    /// Installs HW mappings at the coarsest legal level (L2 or L3).
    pub fn map_hw(&mut self, from: u64, to: u64, size: u64) -> Result<(), PtError> {
        self.install(from, size, to, 1, Level::L2, Level::L3, &|target| {
            Pte::new_hw(target, HW_LOWER_ATTR)
        })
    }

    /// Alias for [`Self::map`] with `incr = 1`, installing linear SW MAP
    /// redirects.
    pub fn map_sw(&mut self, from: u64, to: u64, size: u64) -> Result<(), PtError> {
        self.map(from, to, size, 1)
    }

    /// Installs a HOOK SW entry for every word in `[from, from + size)` at
    /// the finest (L4) granule, per "finest necessary granule" (spec §4.1).
    pub fn map_hook(&mut self, from: u64, hook: HookFn, size: u64) -> Result<(), PtError> {
        let target = hook as usize as u64;
        self.install(from, size, target, 0, Level::L4, Level::L4, &move |t| {
            Pte::new_sw(SpteKind::Hook, t)
        })
    }

    /// Installs a proxy-hook SW entry for every word in `[from, from + size)`
    /// at the finest (L4) granule, carrying the caller-supplied hook `id`.
    pub fn map_proxy_hook(
        &mut self,
        from: u64,
        id: u32,
        size: u64,
        direction: ProxyDirection,
    ) -> Result<(), PtError> {
        let kind = direction.kind();
        let target = u64::from(id);
        self.install(from, size, target, 0, Level::L4, Level::L4, &move |t| {
            Pte::new_sw(kind, t)
        })
    }

    /// Sets the `SYNC_TRACE`/`TRACE_WRITE`/`TRACE_READ` bits on whatever leaf
    /// entry currently describes `ipa`, leaving its kind and target
    /// untouched. The `map_*` contract never names how these bits get set
    /// (spec §3.2 defines them as pure PTE fields); this is the smallest
    /// addition that makes them reachable at all.
    pub fn set_trace(
        &mut self,
        ipa: u64,
        sync_trace: bool,
        trace_write: bool,
        trace_read: bool,
    ) -> Result<(), PtError> {
        if ipa >= IPA_LIMIT {
            return Err(PtError::OutOfRange);
        }
        let l2 = &mut self.root[Level::L2.index(ipa)];
        if !l2.is_l2_table() {
            *l2 = l2.with_sync_trace(sync_trace).with_trace_write(trace_write).with_trace_read(trace_read);
            return Ok(());
        }
        // SAFETY: `is_l2_table` guarantees this points at a live L3 table.
        let l3_table = unsafe { slice::from_raw_parts_mut(target_ptr(*l2), L3_ENTRIES) };
        let l3 = &mut l3_table[Level::L3.index(ipa)];
        if !l3.is_l3_sw_table() {
            *l3 = l3.with_sync_trace(sync_trace).with_trace_write(trace_write).with_trace_read(trace_read);
            return Ok(());
        }
        // SAFETY: `is_l3_sw_table` guarantees this points at a live L4 table.
        let l4_table = unsafe { slice::from_raw_parts_mut(target_ptr(*l3), L4_ENTRIES) };
        let l4 = &mut l4_table[Level::L4.index(ipa)];
        *l4 = l4.with_sync_trace(sync_trace).with_trace_write(trace_write).with_trace_read(trace_read);
        Ok(())
    }

    /// Returns the final PTE describing `ipa`, with the level-appropriate
    /// low bits of `ipa` OR-ed into `TARGET` for block/page entries so
    /// callers obtain the translated output address directly (spec §4.1).
    pub fn walk(&self, ipa: u64) -> Pte {
        let l2 = self.root[Level::L2.index(ipa)];
        if !l2.is_l2_table() {
            return Self::leaf_with_offset(l2, Level::L2, ipa);
        }
        // SAFETY: `is_l2_table` guarantees this points at a live L3 table.
        let l3_table = unsafe { slice::from_raw_parts(target_ptr(l2), L3_ENTRIES) };
        let l3 = l3_table[Level::L3.index(ipa)];
        if !l3.is_l3_sw_table() {
            return Self::leaf_with_offset(l3, Level::L3, ipa);
        }
        // SAFETY: `is_l3_sw_table` guarantees this points at a live L4 table.
        let l4_table = unsafe { slice::from_raw_parts(target_ptr(l3), L4_ENTRIES) };
        l4_table[Level::L4.index(ipa)]
    }

    fn leaf_with_offset(mut leaf: Pte, level: Level, ipa: u64) -> Pte {
        if leaf.is_unmapped() {
            return leaf;
        }
        if level == Level::L3 && leaf.is_hw() {
            leaf = leaf.with_lower_attr(0);
        }
        let offset_mask: u64 = match level {
            Level::L2 => 0x01FF_FFFC,
            Level::L3 => 0x0000_3FFC,
            Level::L4 => 0,
        };
        leaf.with_target(leaf.target() | (ipa & offset_mask))
    }
}

impl Default for Stage2Table {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the hypervisor is single-core; `Stage2Table` is only ever touched
// from the one core that owns stage-2 translation.
unsafe impl Send for Stage2Table {}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRegisters {
        installed: Option<(u32, u64)>,
    }

    impl Stage2Registers for NullRegisters {
        fn install(&mut self, ipa_bits: u32, root_base: u64) {
            self.installed = Some((ipa_bits, root_base));
        }
    }

    fn hook_ok(_ipa: u64, value: &mut u64, _is_write: bool, _width: u32) -> Result<(), ()> {
        *value = 0x42;
        Ok(())
    }

    #[test]
    fn init_programs_registers_and_zeroes_prior_state() {
        let mut pt = Stage2Table::new();
        pt.map_hw(0, 0, 0x4000).unwrap();
        let mut regs = NullRegisters { installed: None };
        pt.init(&mut regs);
        assert!(regs.installed.is_some());
        assert!(pt.walk(0).is_unmapped());
    }

    #[test]
    fn round_trip_of_linear_hw_map() {
        let mut pt = Stage2Table::new();
        let from = 0x0010_0000_u64;
        let to = 0x0020_0000_u64;
        let size = 0x8000_u64; // two L3 granules
        pt.map_hw(from, to, size).unwrap();

        for offset in (0..size).step_by(17) {
            let pte = pt.walk(from + offset);
            assert!(pte.is_hw());
            assert_eq!(pte.target(), to + offset - (offset & 0b11));
        }
    }

    #[test]
    fn sub_page_hook_addressing_is_word_granular() {
        let mut pt = Stage2Table::new();
        let from = 0x0040_0000_u64;
        pt.map_hook(from, hook_ok, 4).unwrap();

        let pte = pt.walk(from);
        assert!(pte.is_sw());
        assert_eq!(pte.spte_kind(), Some(SpteKind::Hook));
        assert_eq!(pte.target(), hook_ok as usize as u64);

        assert!(pt.walk(from ^ 4).is_unmapped());
    }

    #[test]
    fn split_then_unmap_returns_queried_range_to_zero() {
        let mut pt = Stage2Table::new();
        let from = 0x0060_0000_u64;
        let size = 0x0010_0000_u64; // 1 MiB, several L3 granules
        pt.map_sw(from, 0x0070_0000, size).unwrap();
        pt.unmap(from, size).unwrap();

        for offset in (0..size).step_by(0x4000) {
            assert!(pt.walk(from + offset).is_unmapped());
        }
    }

    #[test]
    fn misaligned_hw_map_is_rejected_without_partial_effect() {
        let mut pt = Stage2Table::new();
        let result = pt.map_hw(0x1000, 0x2000, 0x4000); // 0x1000 is not L3-aligned
        assert_eq!(result, Err(PtError::Misaligned));
        assert!(pt.walk(0x1000).is_unmapped());
    }

    #[test]
    fn out_of_range_map_is_rejected() {
        let mut pt = Stage2Table::new();
        let too_big = IPA_LIMIT - 0x1000;
        let result = pt.map_sw(too_big, 0, 0x2000);
        assert_eq!(result, Err(PtError::OutOfRange));
    }

    #[test]
    fn splitting_an_l2_hw_block_preserves_linear_target() {
        let mut pt = Stage2Table::new();
        let from = 0x0800_0000_u64; // L2-aligned
        let to = 0x0A00_0000_u64; // 32 MiB-aligned, so map_hw coarsens to a single L2 block
        pt.map_hw(from, to, Level::L2.granule()).unwrap();
        // Overwrite a single L3 granule inside the block with a narrower SW
        // MAP, forcing the L2 HW block to split into L3 children first.
        let narrow = from + Level::L3.granule();
        pt.map_sw(narrow, 0, Level::L3.granule()).unwrap();

        let untouched = pt.walk(from);
        assert!(untouched.is_hw());
        assert_eq!(untouched.target(), to);

        let split = pt.walk(narrow);
        assert!(split.is_sw());
        assert_eq!(split.spte_kind(), Some(SpteKind::Map));
    }

    #[test]
    fn misaligned_to_falls_back_to_finer_granule_instead_of_corrupting_offsets() {
        let mut pt = Stage2Table::new();
        let from = 0x0800_0000_u64; // L2-aligned
        let to = 0x0900_0000_u64; // not 32 MiB-aligned: must not coarsen to a single L2 block
        pt.map_hw(from, to, Level::L2.granule()).unwrap();

        // A block collapsed at L2 despite the misaligned `to` would OR the
        // offset into the low bits of `target` instead of adding it, silently
        // dropping the carry out of bit 24 and returning `to` unchanged.
        let offset = 0x0100_0000_u64;
        let leaf = pt.walk(from + offset);
        assert!(leaf.is_hw());
        assert_eq!(leaf.target(), to + offset);
    }

    #[test]
    fn l3_hw_page_splits_to_sw_map_when_lowered_to_l4() {
        let mut pt = Stage2Table::new();
        let from = 0x0A00_0000_u64; // L3-aligned
        let to = 0x0B00_0000_u64;
        pt.map_hw(from, to, Level::L3.granule()).unwrap();
        pt.map_hook(from, hook_ok, 4).unwrap();

        let hooked = pt.walk(from);
        assert_eq!(hooked.spte_kind(), Some(SpteKind::Hook));

        let neighbor = pt.walk(from + 4);
        assert!(neighbor.is_sw());
        assert_eq!(neighbor.spte_kind(), Some(SpteKind::Map));
        assert_eq!(neighbor.target(), to + 4);
    }

    #[test]
    fn proxy_hook_direction_selects_spte_kind() {
        let mut pt = Stage2Table::new();
        pt.map_proxy_hook(0x0C00_0000, 7, 4, ProxyDirection::ReadOnly).unwrap();
        assert_eq!(pt.walk(0x0C00_0000).spte_kind(), Some(SpteKind::ProxyHookR));
        assert_eq!(pt.walk(0x0C00_0000).target(), 7);
    }

    #[test]
    fn set_trace_patches_bits_without_disturbing_kind_or_target() {
        let mut pt = Stage2Table::new();
        let from = 0x0D00_0000_u64;
        pt.map_sw(from, 0x0E00_0000, 4).unwrap();

        pt.set_trace(from, true, true, false).unwrap();
        let leaf = pt.walk(from);
        assert!(leaf.sync_trace());
        assert!(leaf.trace_write());
        assert!(!leaf.trace_read());
        assert_eq!(leaf.spte_kind(), Some(SpteKind::Map));
        assert_eq!(leaf.target(), 0x0E00_0000);

        // A second call overwrites the trace bits rather than OR-ing onto them.
        pt.set_trace(from, false, false, true).unwrap();
        let leaf = pt.walk(from);
        assert!(!leaf.sync_trace());
        assert!(!leaf.trace_write());
        assert!(leaf.trace_read());
    }

    #[test]
    fn set_trace_reaches_an_l4_hook_leaf() {
        let mut pt = Stage2Table::new();
        let from = 0x0F00_0000_u64;
        pt.map_hook(from, hook_ok, 4).unwrap();

        pt.set_trace(from, false, false, true).unwrap();
        let leaf = pt.walk(from);
        assert!(leaf.trace_read());
        assert_eq!(leaf.spte_kind(), Some(SpteKind::Hook));
    }

    #[test]
    fn set_trace_on_out_of_range_ipa_is_rejected() {
        let mut pt = Stage2Table::new();
        assert_eq!(pt.set_trace(IPA_LIMIT, true, false, false), Err(PtError::OutOfRange));
    }
}
