//! Relocation entries attached to code records.
//!
//! Each entry encodes as a one-byte tag followed by a fixed, type-specific
//! payload. Named-symbol and thunk relocations are stored verbatim; a
//! [`Relocation::GuestRipMove`] target is rewritten into the owning
//! region's original address space before it reaches the file, so that a
//! cache baked in one run stays meaningful under a different address-space
//! layout in the next.

use crate::error::CacheError;

const TAG_NAMED_SYMBOL_MOVE: u8 = 0x01;
const TAG_NAMED_SYMBOL_LITERAL: u8 = 0x02;
const TAG_NAMED_THUNK_MOVE: u8 = 0x03;
const TAG_GUEST_RIP_MOVE: u8 = 0x04;

/// A fix-up the emitted host code needs at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// Move a named runtime symbol's address into a register.
    NamedSymbolMove {
        /// Symbol identifier known to the emitter.
        symbol: u64,
        /// Byte offset of the fix-up site within the host code.
        offset: u64,
    },
    /// Patch a literal pool slot with a named symbol's address.
    NamedSymbolLiteral { symbol: u64, offset: u64 },
    /// Move a named thunk's address into a register.
    NamedThunkMove {
        /// Thunk identity hash.
        thunk: [u8; 16],
        offset: u64,
    },
    /// Move a guest RIP into a register. Stored in the original address
    /// space of the region that owns the referent.
    GuestRipMove { guest_rip: u64, offset: u64 },
}

impl Relocation {
    /// Encoded byte length, tag included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::NamedSymbolMove { .. }
            | Self::NamedSymbolLiteral { .. }
            | Self::GuestRipMove { .. } => 1 + 16,
            Self::NamedThunkMove { .. } => 1 + 24,
        }
    }

    /// Append the encoded form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::NamedSymbolMove { symbol, offset } => {
                out.push(TAG_NAMED_SYMBOL_MOVE);
                out.extend_from_slice(&symbol.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Self::NamedSymbolLiteral { symbol, offset } => {
                out.push(TAG_NAMED_SYMBOL_LITERAL);
                out.extend_from_slice(&symbol.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Self::NamedThunkMove { thunk, offset } => {
                out.push(TAG_NAMED_THUNK_MOVE);
                out.extend_from_slice(thunk);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Self::GuestRipMove { guest_rip, offset } => {
                out.push(TAG_GUEST_RIP_MOVE);
                out.extend_from_slice(&guest_rip.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
            }
        }
    }

    /// Decode one entry from the front of `data`, returning it and the
    /// number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), CacheError> {
        let (&tag, rest) = data
            .split_first()
            .ok_or(CacheError::Corrupt("empty relocation blob"))?;
        let take_u64 = |at: usize| -> Result<u64, CacheError> {
            rest.get(at..at + 8)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_le_bytes)
                .ok_or(CacheError::Corrupt("short relocation entry"))
        };
        match tag {
            TAG_NAMED_SYMBOL_MOVE => Ok((
                Self::NamedSymbolMove {
                    symbol: take_u64(0)?,
                    offset: take_u64(8)?,
                },
                17,
            )),
            TAG_NAMED_SYMBOL_LITERAL => Ok((
                Self::NamedSymbolLiteral {
                    symbol: take_u64(0)?,
                    offset: take_u64(8)?,
                },
                17,
            )),
            TAG_NAMED_THUNK_MOVE => {
                let thunk: [u8; 16] = rest
                    .get(..16)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(CacheError::Corrupt("short relocation entry"))?;
                Ok((
                    Self::NamedThunkMove {
                        thunk,
                        offset: take_u64(16)?,
                    },
                    25,
                ))
            }
            TAG_GUEST_RIP_MOVE => Ok((
                Self::GuestRipMove {
                    guest_rip: take_u64(0)?,
                    offset: take_u64(8)?,
                },
                17,
            )),
            other => Err(CacheError::BadRelocationTag(other)),
        }
    }

    /// Decode an entire relocation blob.
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<Self>, CacheError> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let (reloc, used) = Self::decode(data)?;
            out.push(reloc);
            data = &data[used..];
        }
        Ok(out)
    }
}
