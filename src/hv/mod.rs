//! HV — the data-abort handler and load/store emulator.
//!
//! Decodes a trapped guest data abort against the entry [`crate::pt`] walked
//! for the faulting IPA and dispatches on its `SPTE_TYPE` (spec §4.2).

pub mod decode;

use crate::error::HvFault;
use crate::pt::{Pte, Stage2Table};
use crate::up::framing::MmioTracePayload;
use crate::up::{PhysicalMemory, UartProxy};
use decode::{decode, Decoded};

/// The guest's general-purpose register file, read for load/store operands
/// and written for load results and writeback.
pub trait GuestRegisters {
    fn get(&self, reg: u8) -> u64;
    fn set(&mut self, reg: u8, value: u64);
}

/// Everything about the trapped abort that HV needs besides the page table:
/// stage-1 translation, instruction fetch, and the `ELR` the guest resumes
/// at. Implementations stand in for the `AT` system-register family and the
/// privileged instruction-fetch path named in spec §6.1.
pub trait FaultContext {
    /// The faulting virtual address (`FAR_EL2`).
    fn far(&self) -> u64;
    /// `true` if the abort was caused by a write (`ESR.WnR`).
    fn is_write(&self) -> bool;
    /// Stage-1 translates `va` for the guest's current exception level and
    /// the given direction, returning the IPA. `None` on a translation fault.
    fn translate(&self, va: u64, is_write: bool) -> Option<u64>;
    /// Reads the 32-bit instruction word already resident at IPA `ipa`.
    fn fetch_instruction(&self, ipa: u64) -> u32;
    /// The exception-return address the guest resumes at.
    fn elr(&self) -> u64;
    fn set_elr(&mut self, elr: u64);
}

/// The `hv_exc_proxy` RPC (spec §6.1): hands a proxy-hook access to the host
/// over UP and blocks for its result.
pub trait ProxyHookDispatch {
    /// `flags` packs `width` in bits `[1:0]` and `direction` in bit `2`, per
    /// the `MMIOTRACE` flag convention (spec §6.2). Returns the data the host
    /// supplied (loads use it; stores ignore it).
    fn hv_exc_proxy(&mut self, flags: u32, hook_id: u32, ipa: u64, write_data: u64) -> Result<u64, ()>;
}

const FLAG_WRITE_BIT: u32 = 1 << 2;

fn trace_flags(width_bytes: u32, is_write: bool) -> u32 {
    let width_code = match width_bytes {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    };
    width_code | if is_write { FLAG_WRITE_BIT } else { 0 }
}

fn sign_extend(value: u64, width_bytes: u32) -> u64 {
    let bits = width_bytes * 8;
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    ((value << shift) as i64 >> shift) as u64
}

fn mask_to_width(value: u64, width_bytes: u32) -> u64 {
    if width_bytes >= 8 {
        value
    } else {
        value & ((1_u64 << (width_bytes * 8)) - 1)
    }
}

/// Runs the full data-abort emulation: translates `FAR`/`ELR`, walks `pt`,
/// decodes the faulting instruction, performs the emulated access, traces it
/// over `up` if requested, commits load results, and advances `ELR` by 4.
///
/// On `Err`, the guest `ELR` is left untouched, matching spec §7 category 4:
/// the caller is expected to escalate rather than resume the guest.
pub fn handle_data_abort(
    pt: &Stage2Table,
    ctx: &mut impl FaultContext,
    regs: &mut impl GuestRegisters,
    mem: &mut impl PhysicalMemory,
    up: &mut UartProxy,
    proxy: &mut impl ProxyHookDispatch,
) -> Result<(), HvFault> {
    let is_write = ctx.is_write();
    let ipa = ctx
        .translate(ctx.far(), is_write)
        .filter(|&ipa| ipa < (1_u64 << crate::pt::IPA_BITS))
        .ok_or(HvFault::FarTranslation)?;

    let pte = pt.walk(ipa);
    if pte.is_hw() {
        return Err(HvFault::UnexpectedHardwareEntry);
    }
    if pte.is_unmapped() {
        return Err(HvFault::Unmapped);
    }

    let elr = ctx.elr();
    let insn_ipa = ctx.translate(elr, false).ok_or(HvFault::ElrTranslation)?;
    let insn = ctx.fetch_instruction(insn_ipa);
    let decoded = decode(insn).ok_or(HvFault::UnsupportedInstruction)?;

    let mut value = if decoded.is_write {
        mask_to_width(regs.get(decoded.rt), decoded.width_bytes)
    } else {
        0
    };

    dispatch(pte, ipa, &decoded, &mut value, mem, proxy)?;

    emit_trace(pte, up, elr, ipa, &decoded, value);

    if !decoded.is_write && decoded.rt != 31 {
        let loaded = if decoded.signed {
            sign_extend(value, decoded.width_bytes)
        } else {
            mask_to_width(value, decoded.width_bytes)
        };
        regs.set(decoded.rt, loaded);
    }

    if let Some((rn, imm)) = decoded.writeback {
        let base = regs.get(rn);
        regs.set(rn, base.wrapping_add(imm as u64));
    }

    ctx.set_elr(elr.wrapping_add(4));
    Ok(())
}

fn dispatch(
    pte: Pte,
    ipa: u64,
    decoded: &Decoded,
    value: &mut u64,
    mem: &mut impl PhysicalMemory,
    proxy: &mut impl ProxyHookDispatch,
) -> Result<(), HvFault> {
    use crate::pt::SpteKind;

    match pte.spte_kind() {
        Some(SpteKind::Map) => map_access(pte.target(), decoded, value, mem),
        Some(SpteKind::Hook) => {
            let hook: crate::pt::HookFn =
                unsafe { core::mem::transmute(pte.target() as usize) };
            hook(ipa, value, decoded.is_write, decoded.width_bytes).map_err(|()| HvFault::HookFailed)
        }
        Some(kind @ (SpteKind::ProxyHookR | SpteKind::ProxyHookW | SpteKind::ProxyHookRw)) => {
            let proxied = matches!(
                (kind, decoded.is_write),
                (SpteKind::ProxyHookRw, _)
                    | (SpteKind::ProxyHookR, false)
                    | (SpteKind::ProxyHookW, true)
            );
            if proxied {
                let flags = trace_flags(decoded.width_bytes, decoded.is_write);
                let id = pte.target() as u32;
                let write_data = if decoded.is_write { *value } else { 0 };
                *value = proxy
                    .hv_exc_proxy(flags, id, ipa, write_data)
                    .map_err(|()| HvFault::ProxyFailed)?;
                Ok(())
            } else {
                // The non-proxied direction falls through to MAP using the
                // IPA itself as the physical target (spec §4.2 step 5).
                map_access(ipa, decoded, value, mem)
            }
        }
        None => Err(HvFault::Unmapped),
    }
}

fn map_access(
    target: u64,
    decoded: &Decoded,
    value: &mut u64,
    mem: &mut impl PhysicalMemory,
) -> Result<(), HvFault> {
    let mut buf = [0_u8; 8];
    let width = decoded.width_bytes as usize;
    if decoded.is_write {
        buf[..width].copy_from_slice(&value.to_le_bytes()[..width]);
        mem.write_bytes(target, &buf[..width])
            .map_err(|()| HvFault::Unmapped)
    } else {
        mem.read_bytes(target, &mut buf[..width])
            .map_err(|()| HvFault::Unmapped)?;
        *value = u64::from_le_bytes(buf);
        Ok(())
    }
}

fn emit_trace(pte: Pte, up: &mut UartProxy, pc: u64, ipa: u64, decoded: &Decoded, value: u64) {
    let traced = if decoded.is_write { pte.trace_write() } else { pte.trace_read() };
    if !traced {
        return;
    }
    let flags = trace_flags(decoded.width_bytes, decoded.is_write);
    up.send_mmio_trace(
        MmioTracePayload { flags, pc, addr: ipa, data: value },
        pte.sync_trace() || crate::config::get().force_sync_trace,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iodevice::{IoDevice, MemDevice};
    use alloc::boxed::Box;

    struct Regs([u64; 32]);
    impl GuestRegisters for Regs {
        fn get(&self, reg: u8) -> u64 {
            self.0[reg as usize]
        }
        fn set(&mut self, reg: u8, value: u64) {
            self.0[reg as usize] = value;
        }
    }

    /// Identity stage-1: VA == IPA, instruction words supplied directly.
    struct FlatContext {
        far: u64,
        is_write: bool,
        elr: u64,
        insn: u32,
    }
    impl FaultContext for FlatContext {
        fn far(&self) -> u64 {
            self.far
        }
        fn is_write(&self) -> bool {
            self.is_write
        }
        fn translate(&self, va: u64, _is_write: bool) -> Option<u64> {
            Some(va)
        }
        fn fetch_instruction(&self, _ipa: u64) -> u32 {
            self.insn
        }
        fn elr(&self) -> u64 {
            self.elr
        }
        fn set_elr(&mut self, elr: u64) {
            self.elr = elr;
        }
    }

    struct FlatMemory {
        base: u64,
        bytes: alloc::vec::Vec<u8>,
    }
    impl FlatMemory {
        fn new(base: u64, len: usize) -> Self {
            Self { base, bytes: alloc::vec![0_u8; len] }
        }
    }
    impl PhysicalMemory for FlatMemory {
        fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ()> {
            let start = usize::try_from(addr - self.base).map_err(|_| ())?;
            buf.copy_from_slice(self.bytes.get(start..start + buf.len()).ok_or(())?);
            Ok(())
        }
        fn write_bytes(&mut self, addr: u64, buf: &[u8]) -> Result<(), ()> {
            let start = usize::try_from(addr - self.base).map_err(|_| ())?;
            self.bytes.get_mut(start..start + buf.len()).ok_or(())?.copy_from_slice(buf);
            Ok(())
        }
    }

    struct NoProxy;
    impl ProxyHookDispatch for NoProxy {
        fn hv_exc_proxy(&mut self, _flags: u32, _hook_id: u32, _ipa: u64, _write_data: u64) -> Result<u64, ()> {
            Err(())
        }
    }

    fn ldr_word_unsigned_offset(rt: u8) -> u32 {
        0x3940_0000 | (2 << 30) | u32::from(rt)
    }

    fn str_word_unsigned_offset(rt: u8) -> u32 {
        0x3900_0000 | (2 << 30) | u32::from(rt)
    }

    fn new_proxy() -> UartProxy {
        UartProxy::new(alloc::vec![Box::new(MemDevice::new()) as Box<dyn IoDevice>])
    }

    #[test]
    fn scenario_s1_identity_mmio_load() {
        // A HW-mapped page never reaches dispatch (it faults as
        // UnexpectedHardwareEntry before decode), so the identity-MMIO
        // scenario is exercised here through an identity SW MAP redirect.
        let mut pt_sw = Stage2Table::new();
        pt_sw.map_sw(0x100000, 0x100000, 0x4000).unwrap();

        let mut mem = FlatMemory::new(0x100000, 0x4000);
        mem.bytes[0x10..0x14].copy_from_slice(&0xdead_beef_u32.to_le_bytes());

        let mut ctx = FlatContext { far: 0x100010, is_write: false, elr: 0x1000, insn: ldr_word_unsigned_offset(2) };
        let mut regs = Regs([0; 32]);
        let mut up = new_proxy();
        let mut proxy = NoProxy;

        handle_data_abort(&pt_sw, &mut ctx, &mut regs, &mut mem, &mut up, &mut proxy).unwrap();
        assert_eq!(regs.get(2), 0xdead_beef);
        assert_eq!(ctx.elr, 0x1004);
    }

    #[test]
    fn scenario_s2_redirect_map_store_advances_pc() {
        let mut pt = Stage2Table::new();
        pt.map_sw(0x200000, 0x300000, 0x4000).unwrap();

        let mut mem = FlatMemory::new(0x300000, 0x4000);
        let mut ctx = FlatContext { far: 0x200004, is_write: true, elr: 0x2000, insn: str_word_unsigned_offset(1) };
        let mut regs = Regs([0; 32]);
        regs.set(1, 0xAB);
        let mut up = new_proxy();
        let mut proxy = NoProxy;

        handle_data_abort(&pt, &mut ctx, &mut regs, &mut mem, &mut up, &mut proxy).unwrap();
        assert_eq!(mem.bytes[0x4], 0xAB);
        assert_eq!(ctx.elr, 0x2004);
    }

    fn trace_hook(_ipa: u64, value: &mut u64, _is_write: bool, _width: u32) -> Result<(), ()> {
        *value = 0x7777;
        Ok(())
    }

    #[test]
    fn scenario_s3_sub_page_hook_feeds_register() {
        let mut pt = Stage2Table::new();
        pt.map_hook(0x400000, trace_hook, 4).unwrap();

        let mut mem = FlatMemory::new(0, 0);
        let mut ctx = FlatContext { far: 0x400000, is_write: false, elr: 0x3000, insn: ldr_word_unsigned_offset(4) };
        let mut regs = Regs([0; 32]);
        let mut up = new_proxy();
        let mut proxy = NoProxy;

        handle_data_abort(&pt, &mut ctx, &mut regs, &mut mem, &mut up, &mut proxy).unwrap();
        assert_eq!(regs.get(4), 0x7777);
    }

    #[test]
    fn unexpected_hardware_entry_is_fatal_and_does_not_advance_pc() {
        let mut pt = Stage2Table::new();
        pt.map_hw(0x500000, 0x500000, 0x4000).unwrap();

        let mut mem = FlatMemory::new(0, 0);
        let mut ctx = FlatContext { far: 0x500000, is_write: false, elr: 0x4000, insn: ldr_word_unsigned_offset(0) };
        let mut regs = Regs([0; 32]);
        let mut up = new_proxy();
        let mut proxy = NoProxy;

        let result = handle_data_abort(&pt, &mut ctx, &mut regs, &mut mem, &mut up, &mut proxy);
        assert_eq!(result, Err(HvFault::UnexpectedHardwareEntry));
        assert_eq!(ctx.elr, 0x4000);
    }

    #[test]
    fn unmapped_ipa_is_fatal() {
        let pt = Stage2Table::new();
        let mut mem = FlatMemory::new(0, 0);
        let mut ctx = FlatContext { far: 0x600000, is_write: false, elr: 0x5000, insn: ldr_word_unsigned_offset(0) };
        let mut regs = Regs([0; 32]);
        let mut up = new_proxy();
        let mut proxy = NoProxy;

        let result = handle_data_abort(&pt, &mut ctx, &mut regs, &mut mem, &mut up, &mut proxy);
        assert_eq!(result, Err(HvFault::Unmapped));
    }

    #[test]
    fn zero_register_destination_discards_load_result() {
        let mut pt = Stage2Table::new();
        pt.map_sw(0x700000, 0x710000, 0x4000).unwrap();
        let mut mem = FlatMemory::new(0x710000, 0x4000);
        mem.bytes[0..4].copy_from_slice(&0x1234_u32.to_le_bytes());

        let mut ctx = FlatContext { far: 0x700000, is_write: false, elr: 0x6000, insn: ldr_word_unsigned_offset(31) };
        let mut regs = Regs([0xFFFF_FFFF_FFFF_FFFF; 32]);
        let mut up = new_proxy();
        let mut proxy = NoProxy;

        handle_data_abort(&pt, &mut ctx, &mut regs, &mut mem, &mut up, &mut proxy).unwrap();
        assert_eq!(regs.get(31), 0xFFFF_FFFF_FFFF_FFFF);
    }
}
