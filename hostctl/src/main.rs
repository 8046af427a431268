//! Host-side driver for the UART command/event protocol implemented by
//! [`armvisor::up`].
//!
//! Opens a serial connection to a running hypervisor instance, waits for its
//! cold-boot `BOOT` reply, then sends exactly one framed request and prints
//! the reply (and any trailing data stream).

#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::error::Error;
use std::fs::File;
use std::io::{Read, Write};
use std::time::Duration;

use armvisor::up::checksum;
use armvisor::up::framing::{
    self, EventHeader, MmioTracePayload, RequestType, REPLY_WIRE_SIZE, REQUEST_PAYLOAD_SIZE,
    REQUEST_WIRE_SIZE,
};
use clap::{Parser, Subcommand};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

const DEFAULT_BAUD_RATE: u32 = 921_600;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port to connect to.
    #[arg(short, long)]
    port: String,

    /// Baud rate to use over the connection.
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sends a NOP request and expects `OK`.
    Nop,
    /// Reads `size` bytes starting at `addr` from guest/physical memory.
    MemRead {
        #[arg(value_parser = parse_u64)]
        addr: u64,
        size: u32,
    },
    /// Writes the contents of `file` to `size` bytes starting at `addr`.
    MemWrite {
        #[arg(value_parser = parse_u64)]
        addr: u64,
        file: String,
    },
}

fn parse_u64(value: &str) -> Result<u64, std::num::ParseIntError> {
    value
        .strip_prefix("0x")
        .map_or_else(|| value.parse(), |hex| u64::from_str_radix(hex, 16))
}

fn build_request(kind: RequestType, payload: [u8; REQUEST_PAYLOAD_SIZE]) -> [u8; REQUEST_WIRE_SIZE] {
    let kind_raw = kind as u32;
    let mut body = [0_u8; 4 + REQUEST_PAYLOAD_SIZE];
    body[..4].copy_from_slice(&kind_raw.to_le_bytes());
    body[4..].copy_from_slice(&payload);
    let request_checksum = checksum::checksum(&body);

    let mut wire = [0_u8; REQUEST_WIRE_SIZE];
    let checksum_start = 4 + REQUEST_PAYLOAD_SIZE;
    wire[..4].copy_from_slice(&kind_raw.to_le_bytes());
    wire[4..checksum_start].copy_from_slice(&payload);
    wire[checksum_start..checksum_start + 4].copy_from_slice(&request_checksum.to_le_bytes());
    wire
}

struct ParsedReply {
    status: i32,
    payload: [u8; framing::REPLY_PAYLOAD_SIZE],
}

/// Reads frames off `port`, printing and discarding any `MMIOTRACE`/other
/// event frames interleaved on the wire, until the reply frame this call is
/// actually waiting for arrives.
fn read_reply(port: &mut dyn SerialPort) -> Result<ParsedReply, Box<dyn Error>> {
    loop {
        let mut kind_bytes = [0_u8; 4];
        port.read_exact(&mut kind_bytes)?;
        let kind_raw = u32::from_le_bytes(kind_bytes);

        if kind_raw == RequestType::Event as u32 {
            print_event(port)?;
            continue;
        }

        let mut rest = [0_u8; REPLY_WIRE_SIZE - 4];
        port.read_exact(&mut rest)?;
        let status = i32::from_le_bytes(rest[0..4].try_into().unwrap());
        let mut payload = [0_u8; framing::REPLY_PAYLOAD_SIZE];
        payload.copy_from_slice(&rest[4..28]);
        return Ok(ParsedReply { status, payload });
    }
}

/// Reads one already-identified event frame's header/payload/checksum and
/// prints it, decoding `MMIOTRACE` payloads specifically.
fn print_event(port: &mut dyn SerialPort) -> Result<(), Box<dyn Error>> {
    let mut header_body = [0_u8; 4];
    port.read_exact(&mut header_body)?;
    let header = EventHeader::from_body(&header_body);

    let mut payload = vec![0_u8; header.len as usize];
    port.read_exact(&mut payload)?;
    let mut trailing_checksum = [0_u8; 4];
    port.read_exact(&mut trailing_checksum)?;

    if header.event_type == framing::event_type::MMIOTRACE
        && payload.len() == MmioTracePayload::WIRE_SIZE
    {
        let trace = MmioTracePayload::from_bytes(payload.as_slice().try_into().unwrap());
        let direction = if trace.flags & 0b100 == 0 { "read" } else { "write" };
        eprintln!(
            "[MMIOTRACE] pc={:#018x} addr={:#018x} data={:#018x} ({direction})",
            trace.pc, trace.addr, trace.data
        );
    } else {
        eprintln!("[EVENT] type={} len={} (undecoded)", header.event_type, header.len);
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut port = serialport::new(&args.port, args.baud)
        .data_bits(DataBits::Eight)
        .flow_control(FlowControl::None)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(Duration::from_secs(2))
        .open()?;

    // Drain the cold-boot BOOT reply before driving the request/reply loop.
    let boot = read_reply(port.as_mut())?;
    eprintln!("[LOG] boot reply status {}", boot.status);

    match args.command {
        Command::Nop => {
            let wire = build_request(RequestType::Nop, [0_u8; REQUEST_PAYLOAD_SIZE]);
            port.write_all(&wire)?;
            let reply = read_reply(port.as_mut())?;
            println!("status: {}", reply.status);
        }
        Command::MemRead { addr, size } => {
            let mut payload = [0_u8; REQUEST_PAYLOAD_SIZE];
            payload[0..8].copy_from_slice(&addr.to_le_bytes());
            payload[8..12].copy_from_slice(&size.to_le_bytes());
            let wire = build_request(RequestType::MemRead, payload);
            port.write_all(&wire)?;

            let reply = read_reply(port.as_mut())?;
            if reply.status != 0 {
                return Err(format!("MEMREAD failed: status {}", reply.status).into());
            }
            if size > 0 {
                let mut data = vec![0_u8; size as usize];
                port.read_exact(&mut data)?;
                let declared = u32::from_le_bytes(reply.payload[0..4].try_into().unwrap());
                let actual = checksum::checksum(&data);
                if declared != actual {
                    return Err("checksum mismatch on received data".into());
                }
                std::io::stdout().write_all(&data)?;
            }
        }
        Command::MemWrite { addr, file } => {
            let mut data = Vec::new();
            File::open(&file)?.read_to_end(&mut data)?;
            let size = u32::try_from(data.len())?;
            let data_checksum = checksum::checksum(&data);

            let mut payload = [0_u8; REQUEST_PAYLOAD_SIZE];
            payload[0..8].copy_from_slice(&addr.to_le_bytes());
            payload[8..12].copy_from_slice(&size.to_le_bytes());
            payload[12..16].copy_from_slice(&data_checksum.to_le_bytes());
            let wire = build_request(RequestType::MemWrite, payload);
            port.write_all(&wire)?;
            port.write_all(&data)?;

            let reply = read_reply(port.as_mut())?;
            println!("status: {}", reply.status);
        }
    }

    Ok(())
}
