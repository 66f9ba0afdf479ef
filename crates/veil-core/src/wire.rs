//! Veil wire format — message framing for the control protocol.
//!
//! Every control message is a generic-netlink style frame: a 16-byte message
//! header, a 4-byte family header, then a flat attribute payload (see
//! `attr`). Integers are host byte order, as they are on a netlink socket.
//! Changing a field or size here is a breaking change for every client.
//!
//! Headers use zerocopy derives for allocation-free (de)serialization.
//! There is no unsafe code in this module.

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::schema::{FAMILY_ID, FAMILY_VERSION};

// ── Message Header ───────────────────────────────────────────────────────────

/// Leading header of every message.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MsgHeader {
    /// Total message length in bytes, this header included.
    pub len: u32,

    /// Family id for protocol messages, or one of the `MSG_*` control kinds.
    pub kind: u16,

    /// `FLAG_*` bits.
    pub flags: u16,

    /// Request sequence number. Dump replies carry the device generation
    /// counter here instead, so a reader can tell whether two replies belong
    /// to the same snapshot.
    pub seq: u32,

    /// Sender port id. Zero for the daemon.
    pub port_id: u32,
}

assert_eq_size!(MsgHeader, [u8; 16]);

/// Family header following `MsgHeader` on protocol messages.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FamilyHeader {
    pub cmd: u8,
    pub version: u8,
    pub reserved: u16,
}

assert_eq_size!(FamilyHeader, [u8; 4]);

// ── Constants ─────────────────────────────────────────────────────────────────

pub const MSG_HEADER_LEN: usize = 16;
pub const FAMILY_HEADER_LEN: usize = 4;
/// Offset of the first attribute in a protocol message.
pub const PAYLOAD_OFFSET: usize = MSG_HEADER_LEN + FAMILY_HEADER_LEN;

/// Control message kinds.
pub const MSG_NOOP: u16 = 1;
pub const MSG_ERROR: u16 = 2;
pub const MSG_DONE: u16 = 3;

pub const FLAG_REQUEST: u16 = 0x01;
pub const FLAG_MULTI: u16 = 0x02;
pub const FLAG_ACK: u16 = 0x04;
/// Root | match: the request wants the multi-message dump form.
pub const FLAG_DUMP: u16 = 0x300;

/// Largest frame the daemon will read from a client.
pub const MAX_REQUEST_LEN: usize = 1 << 20;

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Dump-capable read of one device.
    GetDevice = 0,
    /// One-shot mutation of one device.
    SetDevice = 1,
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::GetDevice),
            1 => Ok(Command::SetDevice),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        c as u8
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// A decoded protocol message borrowing its attribute payload.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub header: MsgHeader,
    pub family: FamilyHeader,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Split one protocol message off the front of `buf`.
    ///
    /// Returns the frame and the total number of bytes it occupied.
    pub fn parse(buf: &'a [u8]) -> Result<(Self, usize), WireError> {
        let header = MsgHeader::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;
        let len = header.len as usize;
        if len < PAYLOAD_OFFSET {
            return Err(WireError::BadLength(len));
        }
        if len > buf.len() {
            return Err(WireError::Truncated(buf.len()));
        }
        if header.kind != FAMILY_ID {
            return Err(WireError::UnknownFamily(header.kind));
        }
        let family = FamilyHeader::read_from_prefix(&buf[MSG_HEADER_LEN..])
            .ok_or(WireError::Truncated(buf.len()))?;
        Ok((
            Frame {
                header,
                family,
                payload: &buf[PAYLOAD_OFFSET..len],
            },
            align4(len).min(buf.len()),
        ))
    }

    pub fn command(&self) -> Result<Command, WireError> {
        Command::try_from(self.family.cmd)
    }

    pub fn is_dump(&self) -> bool {
        self.header.flags & FLAG_DUMP == FLAG_DUMP
    }
}

/// Round a length up to the 4-byte message alignment.
pub fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Write the two headers of a protocol message with a zero length and return
/// the message's start offset. Close it with [`finish_message`].
pub fn begin_message(buf: &mut BytesMut, cmd: Command, flags: u16, seq: u32) -> usize {
    let start = buf.len();
    let header = MsgHeader {
        len: 0,
        kind: FAMILY_ID,
        flags,
        seq,
        port_id: 0,
    };
    let family = FamilyHeader {
        cmd: cmd.into(),
        version: FAMILY_VERSION,
        reserved: 0,
    };
    buf.put_slice(header.as_bytes());
    buf.put_slice(family.as_bytes());
    start
}

/// Patch the length of the message started at `start`.
pub fn finish_message(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_ne_bytes());
}

/// Encode an ERROR message. `errno` is positive; 0 encodes an acknowledgement.
pub fn error_message(request: &MsgHeader, errno: i32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MSG_HEADER_LEN + 4 + MSG_HEADER_LEN);
    let header = MsgHeader {
        len: (MSG_HEADER_LEN + 4 + MSG_HEADER_LEN) as u32,
        kind: MSG_ERROR,
        flags: 0,
        seq: request.seq,
        port_id: 0,
    };
    buf.put_slice(header.as_bytes());
    buf.put_slice(&(-errno).to_ne_bytes());
    buf.put_slice(request.as_bytes());
    buf
}

/// Encode the DONE message closing a dump.
pub fn done_message(seq: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MSG_HEADER_LEN + 4);
    let header = MsgHeader {
        len: (MSG_HEADER_LEN + 4) as u32,
        kind: MSG_DONE,
        flags: FLAG_MULTI,
        seq,
        port_id: 0,
    };
    buf.put_slice(header.as_bytes());
    buf.put_slice(&0i32.to_ne_bytes());
    buf
}

/// Read the errno out of an ERROR message body, as a positive value.
pub fn parse_error(buf: &[u8]) -> Result<i32, WireError> {
    let header = MsgHeader::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;
    if header.kind != MSG_ERROR {
        return Err(WireError::UnknownFamily(header.kind));
    }
    let body = buf
        .get(MSG_HEADER_LEN..MSG_HEADER_LEN + 4)
        .ok_or(WireError::Truncated(buf.len()))?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(body);
    Ok(-i32::from_ne_bytes(raw))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting message framing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message truncated: only {0} bytes available")]
    Truncated(usize),

    #[error("message length {0} is smaller than the protocol headers")]
    BadLength(usize),

    #[error("unknown message family: {0}")]
    UnknownFamily(u16),

    #[error("unknown command: 0x{0:02x}")]
    UnknownCommand(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
