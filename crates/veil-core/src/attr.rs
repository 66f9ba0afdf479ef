//! Attribute codec — tagged, nested, length-prefixed fields.
//!
//! Layout of one attribute:
//!
//! ```text
//! [len:2][type:2][payload][pad to 4]
//! ```
//!
//! `len` covers the header and the unpadded payload. The top two bits of
//! `type` are flags (nested, network byte order) and are stripped on decode.
//!
//! Decoding validates each known field against a [`Policy`] and rejects the
//! whole buffer on the first violation. Unknown field ids are skipped so that
//! newer clients can talk to older daemons. Encoding writes into a `BytesMut`
//! bounded by a byte limit; running out of room is reported as
//! [`MessageFull`] and leaves the buffer exactly as it was before the failed
//! write.

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const ATTR_HEADER_LEN: usize = 4;
pub const FLAG_NESTED: u16 = 1 << 15;
pub const FLAG_NET_BYTEORDER: u16 = 1 << 14;
pub const TYPE_MASK: u16 = !(FLAG_NESTED | FLAG_NET_BYTEORDER);

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct AttrHeader {
    pub len: u16,
    pub kind: u16,
}

assert_eq_size!(AttrHeader, [u8; 4]);

fn align(len: usize) -> usize {
    (len + 3) & !3
}

// ── Policy ────────────────────────────────────────────────────────────────────

/// Declared type of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    /// Not part of the schema; skipped like an unknown field.
    Ignored,
    U8,
    U16,
    U32,
    U64,
    /// NUL-terminated string of at most `max` bytes before the NUL.
    NulString { max: usize },
    /// Opaque bytes, at least this long.
    MinLen(usize),
    /// A container of further attributes.
    Nested,
}

/// Per-message schema: `rules[id]` is the declared kind of field `id`.
#[derive(Debug)]
pub struct Policy {
    pub name: &'static str,
    pub rules: &'static [AttrKind],
}

impl Policy {
    pub fn max_kind(&self) -> u16 {
        self.rules.len().saturating_sub(1) as u16
    }

    fn rule(&self, kind: u16) -> AttrKind {
        self.rules
            .get(kind as usize)
            .copied()
            .unwrap_or(AttrKind::Ignored)
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// One attribute borrowed from a decode buffer.
#[derive(Debug, Clone, Copy)]
pub struct Attr<'a> {
    pub kind: u16,
    pub nested: bool,
    pub payload: &'a [u8],
    /// Offset of `payload` within the buffer that was iterated.
    pub offset: usize,
}

impl<'a> Attr<'a> {
    /// Iterate the attributes carried in this attribute's payload.
    pub fn iter_nested(&self) -> AttrIter<'a> {
        AttrIter::new(self.payload)
    }
}

/// Walks a flat attribute buffer without validating payloads.
pub struct AttrIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> AttrIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<Attr<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.pos..];
        if rest.len() < ATTR_HEADER_LEN {
            // Trailing padding shorter than a header is tolerated.
            return None;
        }
        let header = match AttrHeader::read_from_prefix(rest) {
            Some(h) => h,
            None => return Some(Err(CodecError::Truncated(self.pos))),
        };
        let len = header.len as usize;
        if len < ATTR_HEADER_LEN || len > rest.len() {
            let at = self.pos;
            self.pos = self.buf.len();
            return Some(Err(CodecError::Truncated(at)));
        }
        let attr = Attr {
            kind: header.kind & TYPE_MASK,
            nested: header.kind & FLAG_NESTED != 0,
            payload: &rest[ATTR_HEADER_LEN..len],
            offset: self.pos + ATTR_HEADER_LEN,
        };
        self.pos = (self.pos + align(len)).min(self.buf.len());
        Some(Ok(attr))
    }
}

/// Decoded fields of one message or container, indexed by field id.
///
/// A field that was absent on the wire reads back as `None`, never as a zero.
#[derive(Debug, Clone)]
pub struct AttrSet<'a> {
    slots: Vec<Option<Attr<'a>>>,
}

impl<'a> AttrSet<'a> {
    /// Decode `buf` against `policy`.
    pub fn parse(buf: &'a [u8], policy: &Policy) -> Result<Self, CodecError> {
        let mut slots = vec![None; policy.rules.len()];
        for attr in AttrIter::new(buf) {
            let attr = attr?;
            let rule = policy.rule(attr.kind);
            validate(&attr, rule)?;
            if rule != AttrKind::Ignored {
                // Last occurrence wins.
                slots[attr.kind as usize] = Some(attr);
            }
        }
        Ok(Self { slots })
    }

    /// Decode every container inside the nested field `kind` against
    /// `policy`. An absent field yields an empty list.
    pub fn parse_list(&self, kind: u16, policy: &Policy) -> Result<Vec<AttrSet<'a>>, CodecError> {
        let Some(outer) = self.get(kind) else {
            return Ok(Vec::new());
        };
        outer
            .iter_nested()
            .map(|inner| AttrSet::parse(inner?.payload, policy))
            .collect()
    }

    pub fn get(&self, kind: u16) -> Option<&Attr<'a>> {
        self.slots.get(kind as usize).and_then(Option::as_ref)
    }

    pub fn has(&self, kind: u16) -> bool {
        self.get(kind).is_some()
    }

    pub fn bytes(&self, kind: u16) -> Option<&'a [u8]> {
        self.get(kind).map(|a| a.payload)
    }

    pub fn u8(&self, kind: u16) -> Option<u8> {
        self.bytes(kind).and_then(|b| b.first().copied())
    }

    pub fn u16(&self, kind: u16) -> Option<u16> {
        self.fixed::<2>(kind).map(u16::from_ne_bytes)
    }

    pub fn u32(&self, kind: u16) -> Option<u32> {
        self.fixed::<4>(kind).map(u32::from_ne_bytes)
    }

    pub fn u64(&self, kind: u16) -> Option<u64> {
        self.fixed::<8>(kind).map(u64::from_ne_bytes)
    }

    /// String contents up to (not including) the NUL.
    pub fn string(&self, kind: u16) -> Option<&'a str> {
        let raw = self.bytes(kind)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        std::str::from_utf8(&raw[..end]).ok()
    }

    fn fixed<const N: usize>(&self, kind: u16) -> Option<[u8; N]> {
        self.bytes(kind).and_then(|b| b.get(..N)?.try_into().ok())
    }
}

fn validate(attr: &Attr<'_>, rule: AttrKind) -> Result<(), CodecError> {
    let len = attr.payload.len();
    let exact = |n: usize| {
        if len == n {
            Ok(())
        } else {
            Err(CodecError::BadLength { kind: attr.kind, len })
        }
    };
    match rule {
        AttrKind::Ignored => Ok(()),
        AttrKind::U8 => exact(1),
        AttrKind::U16 => exact(2),
        AttrKind::U32 => exact(4),
        AttrKind::U64 => exact(8),
        AttrKind::MinLen(min) if len < min => Err(CodecError::BadLength { kind: attr.kind, len }),
        AttrKind::MinLen(_) => Ok(()),
        AttrKind::NulString { max } => match attr.payload.iter().position(|&b| b == 0) {
            Some(end) if end <= max => Ok(()),
            _ => Err(CodecError::BadString(attr.kind)),
        },
        AttrKind::Nested => attr
            .iter_nested()
            .try_for_each(|inner| inner.map(|_| ())),
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Open container; close it with [`AttrWriter::nest_end`] or drop its
/// contents with [`AttrWriter::nest_cancel`].
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct Nest(usize);

/// Bounded attribute encoder appending to a message buffer.
///
/// Besides `limit`, every open container caps how far the buffer may grow:
/// its 16-bit length field must be able to cover everything written inside.
pub struct AttrWriter<'b> {
    buf: &'b mut BytesMut,
    limit: usize,
    /// Start offsets of the containers not yet closed, outermost first.
    open: Vec<usize>,
}

impl<'b> AttrWriter<'b> {
    /// `limit` is the largest total length `buf` may reach.
    pub fn new(buf: &'b mut BytesMut, limit: usize) -> Self {
        Self {
            buf,
            limit,
            open: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        let limit = match self.open.first() {
            Some(&outer) => self.limit.min(outer + u16::MAX as usize),
            None => self.limit,
        };
        limit.saturating_sub(self.buf.len())
    }

    /// Drop everything written after `mark` (a previous [`len`](Self::len)).
    pub fn truncate(&mut self, mark: usize) {
        self.buf.truncate(mark);
        self.open.retain(|&start| start < mark);
    }

    pub fn put(&mut self, kind: u16, payload: &[u8]) -> Result<(), MessageFull> {
        let len = ATTR_HEADER_LEN + payload.len();
        if align(len) > self.remaining() || len > u16::MAX as usize {
            return Err(MessageFull);
        }
        let header = AttrHeader {
            len: len as u16,
            kind,
        };
        self.buf.put_slice(header.as_bytes());
        self.buf.put_slice(payload);
        self.buf.put_bytes(0, align(len) - len);
        Ok(())
    }

    pub fn put_u8(&mut self, kind: u16, value: u8) -> Result<(), MessageFull> {
        self.put(kind, &[value])
    }

    pub fn put_u16(&mut self, kind: u16, value: u16) -> Result<(), MessageFull> {
        self.put(kind, &value.to_ne_bytes())
    }

    pub fn put_u32(&mut self, kind: u16, value: u32) -> Result<(), MessageFull> {
        self.put(kind, &value.to_ne_bytes())
    }

    pub fn put_u64(&mut self, kind: u16, value: u64) -> Result<(), MessageFull> {
        self.put(kind, &value.to_ne_bytes())
    }

    /// Write a NUL-terminated string.
    pub fn put_str(&mut self, kind: u16, value: &str) -> Result<(), MessageFull> {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.put(kind, &payload)
    }

    pub fn nest_start(&mut self, kind: u16) -> Result<Nest, MessageFull> {
        if self.remaining() < ATTR_HEADER_LEN {
            return Err(MessageFull);
        }
        let start = self.buf.len();
        let header = AttrHeader {
            len: ATTR_HEADER_LEN as u16,
            kind: kind | FLAG_NESTED,
        };
        self.buf.put_slice(header.as_bytes());
        self.open.push(start);
        Ok(Nest(start))
    }

    pub fn nest_end(&mut self, nest: Nest) {
        self.open.retain(|&start| start < nest.0);
        // `remaining` kept every write inside the container's length range.
        let len = (self.buf.len() - nest.0) as u16;
        self.buf[nest.0..nest.0 + 2].copy_from_slice(&len.to_ne_bytes());
    }

    pub fn nest_cancel(&mut self, nest: Nest) {
        self.truncate(nest.0);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Reasons a buffer fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("attribute truncated at offset {0}")]
    Truncated(usize),

    #[error("attribute {kind} has invalid length {len}")]
    BadLength { kind: u16, len: usize },

    #[error("attribute {0} is not a valid NUL-terminated string")]
    BadString(u16),
}

/// The output buffer has no room for the attribute being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message buffer full")]
pub struct MessageFull;

// ── Tests ─────────────────────────────────────────────────────────────────────
