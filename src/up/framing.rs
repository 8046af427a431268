//! Wire-exact framing structures for the UART command/event protocol
//! (spec §3.5, §6.2).
//!
//! Requests are 64 bytes on the wire; replies are 36 bytes on the wire (one
//! trailing padding word exists only in the in-memory `Reply` representation,
//! per the Open Question in spec §9 — the crate keeps `Reply` as a 40-byte
//! Rust struct but serializes exactly 36 bytes to the device). Event frames
//! are an 8-byte header, a variable payload, and a 4-byte trailing checksum.

use super::checksum;

/// Low 24 bits shared by every valid request `type` value.
pub const SYNC_PATTERN: u32 = 0x00AA_55FF;
const SYNC_MASK: u32 = 0x00FF_FFFF;

/// Request type codes (spec §3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestType {
    Nop = 0x00AA_55FF,
    Proxy = 0x01AA_55FF,
    MemRead = 0x02AA_55FF,
    MemWrite = 0x03AA_55FF,
    Boot = 0x04AA_55FF,
    Event = 0x05AA_55FF,
}

impl RequestType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            x if x == Self::Nop as u32 => Some(Self::Nop),
            x if x == Self::Proxy as u32 => Some(Self::Proxy),
            x if x == Self::MemRead as u32 => Some(Self::MemRead),
            x if x == Self::MemWrite as u32 => Some(Self::MemWrite),
            x if x == Self::Boot as u32 => Some(Self::Boot),
            x if x == Self::Event as u32 => Some(Self::Event),
            _ => None,
        }
    }
}

/// Returns whether `candidate`'s low 24 bits match the sync pattern, i.e.
/// whether a 4-byte rolling window could be the start of a request `type`.
pub const fn is_sync(candidate: u32) -> bool {
    (candidate & SYNC_MASK) == SYNC_PATTERN
}

/// Byte size of the request body after the 4-byte `type` prefix that the
/// sync scan already consumed (`REQ_SIZE - 4` per spec §4.3).
pub const REQUEST_BODY_AFTER_TYPE: usize = 60;
/// Total on-wire request size.
pub const REQUEST_WIRE_SIZE: usize = 64;
/// Payload capacity inside a request.
pub const REQUEST_PAYLOAD_SIZE: usize = 52;
/// Total on-wire reply size.
pub const REPLY_WIRE_SIZE: usize = 36;
/// Payload capacity inside a reply.
pub const REPLY_PAYLOAD_SIZE: usize = 24;
/// Event header size, before the variable payload and trailing checksum.
pub const EVENT_HEADER_SIZE: usize = 8;

/// A decoded request. `pad` only exists so that, in memory, the 4 bytes the
/// sync scanner captures line up with the `type` field once the frame is
/// fully read; the wire layout *excludes* `pad` and starts at `type`
/// (§9 Open Question: the 60-byte body always begins right after `type`).
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub kind_raw: u32,
    pub payload: [u8; REQUEST_PAYLOAD_SIZE],
    pub checksum: u32,
}

impl Request {
    /// Parses a request from the 60 post-sync body bytes plus the already
    /// captured 4-byte `type` prefix. The body is `{payload:52, checksum:4,
    /// pad:4}`: the last 4 bytes are the wire padding that rounds the 64-byte
    /// request out to the `pad` slot spec §3.5 puts ahead of `type` in
    /// memory, and carry no information.
    pub fn from_body(kind_raw: u32, body: &[u8; REQUEST_BODY_AFTER_TYPE]) -> Self {
        let mut payload = [0_u8; REQUEST_PAYLOAD_SIZE];
        payload.copy_from_slice(&body[..REQUEST_PAYLOAD_SIZE]);
        let checksum_end = REQUEST_PAYLOAD_SIZE + 4;
        let checksum =
            u32::from_le_bytes(body[REQUEST_PAYLOAD_SIZE..checksum_end].try_into().unwrap());
        Self {
            kind_raw,
            payload,
            checksum,
        }
    }

    /// Checksum of the 60-byte `{type, payload}` span that precedes the
    /// trailer, matching what the sender computed.
    pub fn computed_checksum(&self) -> u32 {
        let mut bytes = [0_u8; 4 + REQUEST_PAYLOAD_SIZE];
        bytes[..4].copy_from_slice(&self.kind_raw.to_le_bytes());
        bytes[4..].copy_from_slice(&self.payload);
        checksum::checksum(&bytes)
    }

    pub fn kind(&self) -> Option<RequestType> {
        RequestType::from_u32(self.kind_raw)
    }
}

/// A MEMREAD/MEMWRITE payload: `{addr: u64, size: u32, checksum: u32, ..}`.
#[derive(Debug, Clone, Copy)]
pub struct MemXferPayload {
    pub addr: u64,
    pub size: u32,
    pub data_checksum: u32,
}

impl MemXferPayload {
    pub fn parse(payload: &[u8; REQUEST_PAYLOAD_SIZE]) -> Self {
        Self {
            addr: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
            size: u32::from_le_bytes(payload[8..12].try_into().unwrap()),
            data_checksum: u32::from_le_bytes(payload[12..16].try_into().unwrap()),
        }
    }
}

/// A reply, sealed with a checksum over its first 32 bytes before the final
/// 36-byte blob is written to the device.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub kind_raw: u32,
    pub status: i32,
    pub payload: [u8; REPLY_PAYLOAD_SIZE],
}

impl Reply {
    pub fn new(kind_raw: u32, status: i32) -> Self {
        Self {
            kind_raw,
            status,
            payload: [0; REPLY_PAYLOAD_SIZE],
        }
    }

    pub fn with_payload(mut self, payload: [u8; REPLY_PAYLOAD_SIZE]) -> Self {
        self.payload = payload;
        self
    }

    /// Serializes the reply into exactly [`REPLY_WIRE_SIZE`] bytes, computing
    /// and appending the trailing checksum.
    pub fn to_wire(&self) -> [u8; REPLY_WIRE_SIZE] {
        let mut out = [0_u8; REPLY_WIRE_SIZE];
        out[0..4].copy_from_slice(&self.kind_raw.to_le_bytes());
        out[4..8].copy_from_slice(&self.status.to_le_bytes());
        out[8..32].copy_from_slice(&self.payload);
        let checksum = checksum::checksum(&out[0..32]);
        out[32..36].copy_from_slice(&checksum.to_le_bytes());
        out
    }
}

/// An event header: `{type: u32, len: u16, event_type: u16}`.
#[derive(Debug, Clone, Copy)]
pub struct EventHeader {
    pub len: u16,
    pub event_type: u16,
}

impl EventHeader {
    pub fn to_bytes(self) -> [u8; EVENT_HEADER_SIZE] {
        let mut out = [0_u8; EVENT_HEADER_SIZE];
        out[0..4].copy_from_slice(&(RequestType::Event as u32).to_le_bytes());
        out[4..6].copy_from_slice(&self.len.to_le_bytes());
        out[6..8].copy_from_slice(&self.event_type.to_le_bytes());
        out
    }

    /// Parses `len`/`event_type` from the 4 header bytes that follow an
    /// already captured and identified `type` prefix.
    pub fn from_body(body: &[u8; 4]) -> Self {
        Self {
            len: u16::from_le_bytes(body[0..2].try_into().unwrap()),
            event_type: u16::from_le_bytes(body[2..4].try_into().unwrap()),
        }
    }
}

/// Event type codes carried in [`EventHeader::event_type`].
pub mod event_type {
    pub const MMIOTRACE: u16 = 0;
}

/// `MMIOTRACE` event payload (spec §6.2): `{flags, reserved, pc, addr, data}`.
#[derive(Debug, Clone, Copy)]
pub struct MmioTracePayload {
    pub flags: u32,
    pub pc: u64,
    pub addr: u64,
    pub data: u64,
}

impl MmioTracePayload {
    pub const WIRE_SIZE: usize = 4 + 4 + 8 + 8 + 8;

    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0_u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&0_u32.to_le_bytes());
        out[8..16].copy_from_slice(&self.pc.to_le_bytes());
        out[16..24].copy_from_slice(&self.addr.to_le_bytes());
        out[24..32].copy_from_slice(&self.data.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::WIRE_SIZE]) -> Self {
        Self {
            flags: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            pc: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            addr: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            data: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
        }
    }
}
