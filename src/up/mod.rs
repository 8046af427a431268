//! UP — the UART proxy.
//!
//! A blocking request/reply loop over one of several I/O devices (spec §4.3),
//! multiplexing framed commands with checksummed requests/replies and
//! pushing unsolicited `MMIOTRACE` events on whichever device last
//! synchronized (`current_iodev`).

pub mod checksum;
pub mod framing;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::iodevice::IoDevice;
use crate::sync::{ExcAction, ExcGuard};
use framing::{
    EventHeader, MemXferPayload, MmioTracePayload, Reply, Request, RequestType,
    REQUEST_BODY_AFTER_TYPE,
};

/// Guest/physical memory access used by MEMREAD/MEMWRITE, standing in for
/// the width-specific `read8/16/32/64`/`write8/16/32/64` primitives named in
/// spec §6.1. Implementations report a fault as `Err(())`, standing in for
/// what a real bus/page fault would do under the exception guard.
pub trait PhysicalMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ()>;
    fn write_bytes(&mut self, addr: u64, buf: &[u8]) -> Result<(), ()>;
}

/// Result of forwarding a `PROXY` request to the external RPC layer
/// (`proxy_process`, spec §6.1). Zero continues the loop; non-zero exits it;
/// negative values are logged before being folded into `Exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Continue,
    Exit(i32),
}

pub trait ProxyRpc {
    fn proxy_process(&mut self, request: &Request) -> ProxyOutcome;
}

/// The record embedded in a re-entry BOOT reply, passed in by `hv_exc_proxy`
/// (spec §6.1; decided from the Open Question in spec §9 and original_source's
/// m1n1-lineage RPC boot record, see DESIGN.md).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionStart {
    pub reason: u32,
    pub subsys: u32,
    pub payload: [u64; 4],
}

/// Outcome of one pass through the request handling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Continue,
    Exit(i32),
}

/// The UART proxy: owns every candidate I/O device, the per-device rolling
/// sync buffers, and which device is currently bound (`current_iodev`).
pub struct UartProxy {
    devices: Vec<Box<dyn IoDevice>>,
    sync_windows: Vec<[u8; 4]>,
    current: usize,
    exc_guard: ExcGuard,
}

impl UartProxy {
    /// Device index treated as the fixed console UART for the cold-boot
    /// BOOT reply (spec §4.3).
    pub const CONSOLE_DEVICE: usize = 0;

    pub fn new(devices: Vec<Box<dyn IoDevice>>) -> Self {
        assert!(!devices.is_empty(), "UartProxy requires at least one device");
        let sync_windows = alloc::vec![[0_u8; 4]; devices.len()];
        Self {
            devices,
            sync_windows,
            current: 0,
            exc_guard: ExcGuard::new(),
        }
    }

    /// Index of the device UP is currently bound to.
    pub fn current_device(&self) -> usize {
        self.current
    }

    fn push_window(window: &mut [u8; 4], byte: u8) -> u32 {
        window.rotate_left(1);
        window[3] = byte;
        u32::from_le_bytes(*window)
    }

    fn send_reply_on(&mut self, device: usize, reply: Reply) {
        let wire = reply.to_wire();
        self.devices[device].write(&wire);
    }

    fn send_reply(&mut self, reply: Reply) {
        self.send_reply_on(self.current, reply);
    }

    /// Cold entry (`start == nullptr` in spec terms): first emits a BOOT
    /// reply on the fixed console device, then round-robins every device one
    /// byte at a time until one's rolling window matches the sync pattern.
    /// That device becomes `current_iodev`.
    pub fn cold_boot(&mut self) {
        self.send_reply_on(Self::CONSOLE_DEVICE, Reply::new(RequestType::Boot as u32, 0));
        let mut byte = [0_u8; 1];
        loop {
            for idx in 0..self.devices.len() {
                if let Some(1) = self.devices[idx].read(&mut byte) {
                    let candidate = Self::push_window(&mut self.sync_windows[idx], byte[0]);
                    if framing::is_sync(candidate) {
                        self.current = idx;
                        return;
                    }
                }
            }
        }
    }

    /// Re-entry (`start != nullptr`): keeps `current_iodev`, emits a BOOT
    /// reply embedding `start`, then blocks reading only that device until
    /// the sync pattern appears. An I/O failure here is fatal.
    pub fn reentry_boot(&mut self, start: ExceptionStart) -> Result<(), ()> {
        let mut payload = [0_u8; framing::REPLY_PAYLOAD_SIZE];
        payload[0..4].copy_from_slice(&start.reason.to_le_bytes());
        payload[4..8].copy_from_slice(&start.subsys.to_le_bytes());
        for (i, word) in start.payload.iter().enumerate().take(2) {
            let at = 8 + i * 8;
            payload[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }
        self.send_reply(Reply::new(RequestType::Boot as u32, 0).with_payload(payload));

        let mut byte = [0_u8; 1];
        loop {
            match self.devices[self.current].read(&mut byte) {
                Some(1) => {
                    let candidate = Self::push_window(&mut self.sync_windows[self.current], byte[0]);
                    if framing::is_sync(candidate) {
                        return Ok(());
                    }
                }
                Some(_) => continue,
                None => return Err(()),
            }
        }
    }

    /// Reads the 60 remaining request body bytes after a sync match. Returns
    /// `None` on a short read, in which case the frame is discarded and the
    /// caller should resume sync scanning.
    fn read_request_body(&mut self) -> Option<[u8; REQUEST_BODY_AFTER_TYPE]> {
        let mut body = [0_u8; REQUEST_BODY_AFTER_TYPE];
        let n = self.devices[self.current].read(&mut body)?;
        if n == REQUEST_BODY_AFTER_TYPE {
            Some(body)
        } else {
            None
        }
    }

    /// Services exactly one framed request already synced to on the current
    /// device (`kind_raw` is the 4 bytes the sync scan captured), dispatching
    /// it and replying. Returns what the caller should do next.
    pub fn handle_request(
        &mut self,
        kind_raw: u32,
        mem: &mut impl PhysicalMemory,
        proxy: &mut impl ProxyRpc,
    ) -> LoopOutcome {
        let Some(body) = self.read_request_body() else {
            return LoopOutcome::Continue;
        };
        let request = Request::from_body(kind_raw, &body);

        if request.computed_checksum() != request.checksum {
            self.send_reply(Reply::new(kind_raw, crate::error::Status::CsumErr.as_i32()));
            return LoopOutcome::Continue;
        }

        match request.kind() {
            Some(RequestType::Nop) => {
                self.send_reply(Reply::new(kind_raw, crate::error::Status::Ok.as_i32()));
                LoopOutcome::Continue
            }
            Some(RequestType::Proxy) => match proxy.proxy_process(&request) {
                ProxyOutcome::Continue => LoopOutcome::Continue,
                ProxyOutcome::Exit(code) => LoopOutcome::Exit(code),
            },
            Some(RequestType::MemRead) => {
                self.handle_memread(kind_raw, &request, mem);
                LoopOutcome::Continue
            }
            Some(RequestType::MemWrite) => {
                self.handle_memwrite(kind_raw, &request, mem);
                LoopOutcome::Continue
            }
            Some(RequestType::Boot) | Some(RequestType::Event) | None => {
                self.send_reply(Reply::new(kind_raw, crate::error::Status::BadCmd.as_i32()));
                LoopOutcome::Continue
            }
        }
    }

    fn handle_memread(&mut self, kind_raw: u32, request: &Request, mem: &impl PhysicalMemory) {
        let xfer = MemXferPayload::parse(&request.payload);
        if xfer.size == 0 {
            self.send_reply(Reply::new(kind_raw, crate::error::Status::Ok.as_i32()));
            return;
        }

        let mut buf = alloc::vec![0_u8; xfer.size as usize];
        let (result, _) = self
            .exc_guard
            .guarded(ExcAction::Return, || mem.read_bytes(xfer.addr, &mut buf));

        match result {
            Err(()) => {
                self.send_reply(Reply::new(kind_raw, crate::error::Status::XfrErr.as_i32()));
            }
            Ok(()) => {
                let data_checksum = checksum::checksum(&buf);
                let mut payload = [0_u8; framing::REPLY_PAYLOAD_SIZE];
                payload[0..4].copy_from_slice(&data_checksum.to_le_bytes());
                self.send_reply(
                    Reply::new(kind_raw, crate::error::Status::Ok.as_i32()).with_payload(payload),
                );
                self.devices[self.current].write(&buf);
            }
        }
    }

    fn handle_memwrite(&mut self, kind_raw: u32, request: &Request, mem: &mut impl PhysicalMemory) {
        let xfer = MemXferPayload::parse(&request.payload);
        if xfer.size == 0 {
            self.send_reply(Reply::new(kind_raw, crate::error::Status::Ok.as_i32()));
            return;
        }

        let last = xfer.addr + u64::from(xfer.size) - 1;
        let probe_ok = {
            let mut scratch = [0_u8; 1];
            let (first_ok, _) = self
                .exc_guard
                .guarded(ExcAction::Skip, || mem.read_bytes(xfer.addr, &mut scratch).is_ok());
            let (last_ok, _) = self
                .exc_guard
                .guarded(ExcAction::Skip, || mem.read_bytes(last, &mut scratch).is_ok());
            first_ok && last_ok
        };
        if !probe_ok {
            self.send_reply(Reply::new(kind_raw, crate::error::Status::XfrErr.as_i32()));
            return;
        }

        let mut buf = alloc::vec![0_u8; xfer.size as usize];
        let Some(n) = self.devices[self.current].read(&mut buf) else {
            self.send_reply(Reply::new(kind_raw, crate::error::Status::XfrErr.as_i32()));
            return;
        };
        if n != buf.len() {
            self.send_reply(Reply::new(kind_raw, crate::error::Status::XfrErr.as_i32()));
            return;
        }

        if mem.write_bytes(xfer.addr, &buf).is_err() {
            self.send_reply(Reply::new(kind_raw, crate::error::Status::XfrErr.as_i32()));
            return;
        }

        let written_checksum = checksum::checksum(&buf);
        let status = if written_checksum == xfer.data_checksum {
            crate::error::Status::Ok
        } else {
            crate::error::Status::XfrErr
        };
        self.send_reply(Reply::new(kind_raw, status.as_i32()));
    }

    /// Queues and flushes an event frame: header, payload, then a trailing
    /// checksum computed over both, on `current_iodev`.
    pub fn send_event(&mut self, event_type: u16, data: &[u8]) {
        let header = EventHeader {
            len: data.len() as u16,
            event_type,
        }
        .to_bytes();
        self.devices[self.current].queue(&header);
        self.devices[self.current].queue(data);
        let mut checked = Vec::with_capacity(header.len() + data.len());
        checked.extend_from_slice(&header);
        checked.extend_from_slice(data);
        let checksum = checksum::checksum(&checked);
        self.devices[self.current].queue(&checksum.to_le_bytes());
        self.devices[self.current].flush();
    }

    /// Convenience wrapper for `send_event` with an `MMIOTRACE` payload.
    pub fn send_mmio_trace(&mut self, trace: MmioTracePayload, flush_device: bool) {
        self.send_event(framing::event_type::MMIOTRACE, &trace.to_bytes());
        if flush_device {
            self.devices[self.current].flush();
        }
    }

    /// Gives mutable access to a device, e.g. for `handle_events` servicing.
    pub fn device_mut(&mut self, index: usize) -> &mut dyn IoDevice {
        self.devices[index].as_mut()
    }
}
