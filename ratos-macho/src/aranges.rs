//! Parsing of the DWARF `.debug_aranges` accelerator section.
//!
//! `.debug_aranges` maps program-counter ranges to the compile unit that
//! covers them, which lets the symbolicator jump straight to the right CU
//! header in `.debug_info` instead of scanning all units. The section holds
//! one unit per CU; each unit carries a small header followed by
//! `(segment, address, length)` tuples terminated by an all-zero tuple.

use std::cmp::Ordering;

use ratos_common::{ByteCursor, CursorError};
use thiserror::Error;

use crate::endian::{read_u16, read_u32, read_u64, read_uint};

/// An error encountered while parsing `.debug_aranges` data.
#[derive(Debug, Error)]
pub enum ArangesError {
    /// The section data ended in the middle of a unit.
    #[error("aranges data is truncated")]
    Truncated(#[from] CursorError),

    /// A unit declares a version other than 2.
    #[error("unsupported .debug_aranges version: {0}")]
    UnsupportedVersion(u16),

    /// A unit declares an address size other than 4 or 8 bytes.
    #[error("invalid address size in .debug_aranges unit: {0}")]
    InvalidAddressSize(u8),

    /// A unit declares a segment selector wider than 8 bytes.
    #[error("invalid segment selector size in .debug_aranges unit: {0}")]
    InvalidSelectorSize(u8),
}

/// One address range from `.debug_aranges`.
///
/// `high_pc` is `low_pc + length`, kept as an inclusive upper bound for
/// lookups. Ranges may legally touch or overlap; lookups treat the CU offset
/// as a hint rather than a unique answer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArangeEntry {
    /// Offset of the owning compile unit header in `.debug_info`.
    pub cu_offset: u64,
    /// The segment selector, zero on all current Apple targets.
    pub segment_selector: u64,
    /// First address covered by the range.
    pub low_pc: u64,
    /// Last address covered by the range.
    pub high_pc: u64,
}

/// Parses every unit of a `.debug_aranges` payload.
///
/// Returns all entries parsed so far together with the error that stopped
/// parsing, if any, so the caller can continue with the partial result. The
/// returned entries are sorted ascending by `low_pc`.
pub fn parse_aranges(data: &[u8]) -> (Vec<ArangeEntry>, Option<ArangesError>) {
    let mut entries = Vec::new();
    let error = parse_units(&mut entries, &mut ByteCursor::new(data)).err();
    entries.sort_by_key(|entry| entry.low_pc);
    (entries, error)
}

fn parse_units(
    entries: &mut Vec<ArangeEntry>,
    cursor: &mut ByteCursor<'_>,
) -> Result<(), ArangesError> {
    while cursor.remaining() > 0 {
        let unit_start = cursor.offset();

        let mut is_dwarf64 = false;
        let mut length_bytes = cursor.read_bytes(4)?;
        if length_bytes == b"\xff\xff\xff\xff" {
            is_dwarf64 = true;
            length_bytes = cursor.read_bytes(8)?;
        }

        // Byte-order inference: valid versions are small integers, so the
        // nonzero byte of the version word identifies the stream's order.
        let version_bytes = cursor.read_bytes(2)?;
        let big_endian = version_bytes[0] == 0;

        let body_length = if is_dwarf64 {
            read_u64(length_bytes, big_endian)
        } else {
            u64::from(read_u32(length_bytes, big_endian))
        };

        if body_length == 0 {
            continue;
        }

        let version = read_u16(version_bytes, big_endian);
        if version != 2 {
            return Err(ArangesError::UnsupportedVersion(version));
        }

        let cu_offset = if is_dwarf64 {
            read_u64(cursor.read_bytes(8)?, big_endian)
        } else {
            u64::from(read_u32(cursor.read_bytes(4)?, big_endian))
        };

        let address_size = cursor.read_u8()?;
        if address_size != 4 && address_size != 8 {
            return Err(ArangesError::InvalidAddressSize(address_size));
        }
        let address_size = usize::from(address_size);

        let selector_size = cursor.read_u8()?;
        if selector_size > 8 {
            return Err(ArangesError::InvalidSelectorSize(selector_size));
        }
        let selector_size = usize::from(selector_size);

        // The tuple list is padded so that it starts at a multiple of the
        // tuple size, counted from the beginning of the unit.
        let tuple_size = selector_size + 2 * address_size;
        let consumed = (cursor.offset() - unit_start) % tuple_size;
        if consumed != 0 {
            cursor.skip(tuple_size - consumed)?;
        }

        loop {
            let segment = if selector_size > 0 {
                read_uint(cursor.read_bytes(selector_size)?, big_endian)
            } else {
                0
            };

            let pair = cursor.read_bytes(address_size * 2)?;
            let (address, length) = if address_size == 4 {
                (
                    u64::from(read_u32(&pair[..4], big_endian)),
                    u64::from(read_u32(&pair[4..], big_endian)),
                )
            } else {
                (
                    read_u64(&pair[..8], big_endian),
                    read_u64(&pair[8..], big_endian),
                )
            };

            if segment == 0 && address == 0 && length == 0 {
                break;
            }

            entries.push(ArangeEntry {
                cu_offset,
                segment_selector: segment,
                low_pc: address,
                high_pc: address + length,
            });
        }
    }

    Ok(())
}

/// Binary-searches a sorted entry list for a range containing `addr`.
///
/// Both bounds are inclusive. With touching or overlapping ranges any
/// containing entry may be returned.
pub fn find_arange(entries: &[ArangeEntry], addr: u64) -> Option<&ArangeEntry> {
    entries
        .binary_search_by(|entry| {
            if entry.low_pc > addr {
                Ordering::Greater
            } else if entry.high_pc < addr {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        })
        .ok()
        .map(|index| &entries[index])
}
