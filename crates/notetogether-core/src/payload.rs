//! Bounds checks for yrs v1 binary payloads.
//!
//! The walkers below read the v1 update and state vector layouts without
//! allocating. Every element count must fit in the bytes that follow it,
//! strings must be UTF-8, clocks must stay within `u32` and nested values
//! stay under [`MAX_NESTING`]. Only payloads that pass are handed to the
//! yrs decoder.

use thiserror::Error;

/// Deepest nesting of embedded `Any` arrays and maps accepted
pub const MAX_NESTING: usize = 64;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;
const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;
const CONTENT_MOVE: u8 = 11;

const TYPE_XML_ELEMENT: u8 = 3;
const TYPE_WEAK: u8 = 7;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("unexpected end of input at offset {0}")]
    EndOfInput(usize),

    #[error("invalid varint at offset {0}")]
    InvalidVarInt(usize),

    #[error("{what} count {count} does not fit in the {remaining} bytes left")]
    CountOverflow {
        what: &'static str,
        count: u64,
        remaining: usize,
    },

    #[error("unknown {what} tag {tag} at offset {offset}")]
    UnknownTag {
        what: &'static str,
        tag: u8,
        offset: usize,
    },

    #[error("invalid UTF-8 string at offset {0}")]
    InvalidString(usize),

    #[error("clock overflow for client {0}")]
    ClockOverflow(u32),

    #[error("values nested deeper than {MAX_NESTING} levels")]
    TooDeep,
}

/// Check that `update` is a well-formed v1 update
pub fn check_update_v1(update: &[u8]) -> Result<(), PayloadError> {
    let mut reader = Reader::new(update);
    let clients = reader.count_u32("client", 3)?;
    for _ in 0..clients {
        let blocks = reader.count_u32("block", 2)?;
        let client = reader.var_u32()?;
        let mut clock = u64::from(reader.var_u32()?);
        for _ in 0..blocks {
            clock += reader.block()?;
            if clock > u64::from(u32::MAX) {
                return Err(PayloadError::ClockOverflow(client));
            }
        }
    }
    reader.delete_set()
}

/// Check that `state_vector` is a well-formed v1 state vector
pub fn check_state_vector_v1(state_vector: &[u8]) -> Result<(), PayloadError> {
    let mut reader = Reader::new(state_vector);
    let entries = reader.count_u32("state vector entry", 2)?;
    for _ in 0..entries {
        reader.var_u64()?;
        reader.var_u32()?;
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, PayloadError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(PayloadError::EndOfInput(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: u64) -> Result<&'a [u8], PayloadError> {
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.remaining())
            .ok_or(PayloadError::EndOfInput(self.pos))?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    // Unsigned varints wrap on overflow, matching the lib0 readers
    fn var_u32(&mut self) -> Result<u32, PayloadError> {
        let start = self.pos;
        let mut num = 0u32;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            num |= u32::wrapping_shl(u32::from(byte & 0x7f), shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(num);
            }
            if shift > 70 {
                return Err(PayloadError::InvalidVarInt(start));
            }
        }
    }

    fn var_u64(&mut self) -> Result<u64, PayloadError> {
        let start = self.pos;
        let mut num = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            num |= u64::wrapping_shl(u64::from(byte & 0x7f), shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(num);
            }
            if shift > 70 {
                return Err(PayloadError::InvalidVarInt(start));
            }
        }
    }

    /// Signed varint: sign and six bits first, then seven bits per byte.
    /// Anything past 62 value bits is rejected. Returns the first byte,
    /// whose low bit is the low bit of the value.
    fn var_i64(&mut self) -> Result<u8, PayloadError> {
        let start = self.pos;
        let first = self.u8()?;
        let mut byte = first;
        let mut shift = 6u32;
        while byte >= 0x80 {
            if shift > 55 {
                return Err(PayloadError::InvalidVarInt(start));
            }
            byte = self.u8()?;
            shift += 7;
        }
        Ok(first)
    }

    fn ensure_fits(
        &self,
        what: &'static str,
        count: u64,
        min_size: u64,
    ) -> Result<(), PayloadError> {
        let remaining = self.remaining();
        if count.saturating_mul(min_size) > remaining as u64 {
            return Err(PayloadError::CountOverflow {
                what,
                count,
                remaining,
            });
        }
        Ok(())
    }

    fn count_u32(&mut self, what: &'static str, min_size: u64) -> Result<u64, PayloadError> {
        let count = u64::from(self.var_u32()?);
        self.ensure_fits(what, count, min_size)?;
        Ok(count)
    }

    fn string(&mut self) -> Result<&'a str, PayloadError> {
        let start = self.pos;
        let len = self.var_u32()?;
        let bytes = self.take(u64::from(len))?;
        std::str::from_utf8(bytes).map_err(|_| PayloadError::InvalidString(start))
    }

    fn id(&mut self) -> Result<(), PayloadError> {
        self.var_u32()?;
        self.var_u32()?;
        Ok(())
    }

    /// One block; returns an upper bound of its clock length
    fn block(&mut self) -> Result<u64, PayloadError> {
        let info = self.u8()?;
        if info == BLOCK_GC || info == BLOCK_SKIP {
            return Ok(u64::from(self.var_u32()?));
        }
        if info & HAS_ORIGIN != 0 {
            self.id()?;
        }
        if info & HAS_RIGHT_ORIGIN != 0 {
            self.id()?;
        }
        if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
            if self.var_u32()? == 1 {
                self.string()?;
            } else {
                self.id()?;
            }
            if info & HAS_PARENT_SUB != 0 {
                self.string()?;
            }
        }
        self.content(info & 0b1111)
    }

    fn content(&mut self, kind: u8) -> Result<u64, PayloadError> {
        let offset = self.pos;
        match kind {
            CONTENT_DELETED => Ok(u64::from(self.var_u32()?)),
            CONTENT_JSON => {
                // yrs reads one string more than the stored count
                let len = self.var_u32()?;
                if len > i32::MAX as u32 {
                    return Err(PayloadError::CountOverflow {
                        what: "json value",
                        count: u64::from(len),
                        remaining: self.remaining(),
                    });
                }
                let count = u64::from(len) + 1;
                self.ensure_fits("json value", count, 1)?;
                for _ in 0..count {
                    self.string()?;
                }
                Ok(count)
            }
            CONTENT_BINARY => {
                let len = self.var_u32()?;
                self.take(u64::from(len))?;
                Ok(1)
            }
            CONTENT_STRING => Ok(self.string()?.len() as u64),
            CONTENT_EMBED => {
                self.string()?;
                Ok(1)
            }
            CONTENT_FORMAT => {
                self.string()?;
                self.string()?;
                Ok(1)
            }
            CONTENT_TYPE => {
                self.type_ref()?;
                Ok(1)
            }
            CONTENT_ANY => {
                let count = self.count_u32("any value", 1)?;
                for _ in 0..count {
                    self.any(0)?;
                }
                Ok(count)
            }
            CONTENT_DOC => {
                self.string()?;
                self.any(0)?;
                Ok(1)
            }
            CONTENT_MOVE => {
                // collapsed moves carry a single id
                let flags = self.var_i64()?;
                self.id()?;
                if flags & 1 == 0 {
                    self.id()?;
                }
                Ok(1)
            }
            tag => Err(PayloadError::UnknownTag {
                what: "content",
                tag,
                offset,
            }),
        }
    }

    fn type_ref(&mut self) -> Result<(), PayloadError> {
        let offset = self.pos;
        match self.u8()? {
            TYPE_XML_ELEMENT => {
                self.string()?;
            }
            TYPE_WEAK => {
                let flags = self.u8()?;
                self.id()?;
                if flags & 1 != 0 {
                    self.id()?;
                }
            }
            0 | 1 | 2 | 4 | 5 | 6 | 9 | 15 => {}
            tag => {
                return Err(PayloadError::UnknownTag {
                    what: "type",
                    tag,
                    offset,
                })
            }
        }
        Ok(())
    }

    fn any(&mut self, depth: usize) -> Result<(), PayloadError> {
        if depth >= MAX_NESTING {
            return Err(PayloadError::TooDeep);
        }
        let offset = self.pos;
        match self.u8()? {
            127 | 126 | 121 | 120 => {}
            125 => {
                self.var_i64()?;
            }
            124 => {
                self.take(4)?;
            }
            123 | 122 => {
                self.take(8)?;
            }
            119 => {
                self.string()?;
            }
            118 => {
                let len = self.var_u64()?;
                self.ensure_fits("map entry", len, 2)?;
                for _ in 0..len {
                    self.string()?;
                    self.any(depth + 1)?;
                }
            }
            117 => {
                let len = self.var_u64()?;
                self.ensure_fits("array element", len, 1)?;
                for _ in 0..len {
                    self.any(depth + 1)?;
                }
            }
            116 => {
                let len = self.var_u32()?;
                self.take(u64::from(len))?;
            }
            tag => {
                return Err(PayloadError::UnknownTag {
                    what: "any",
                    tag,
                    offset,
                })
            }
        }
        Ok(())
    }

    fn delete_set(&mut self) -> Result<(), PayloadError> {
        let clients = self.count_u32("delete set client", 2)?;
        for _ in 0..clients {
            self.var_u32()?;
            let ranges = self.count_u32("delete range", 2)?;
            for _ in 0..ranges {
                self.var_u32()?;
                self.var_u32()?;
            }
        }
        Ok(())
    }
}
