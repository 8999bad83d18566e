//! Skipping of compile-unit headers in `.debug_info`.
//!
//! `.debug_aranges` points at the *header* of a compile unit, but a DWARF
//! reader seeks to debugging information entries, the first of which starts
//! right after the header. The header size depends on the DWARF version
//! (2 through 5), the 32/64-bit format, and for version 5 on the unit type.

use std::io::SeekFrom;

use ratos_common::{ByteCursor, CursorError};
use thiserror::Error;

use crate::endian::read_u16;

/// An error encountered while walking a compile-unit header.
#[derive(Debug, Error)]
pub enum CuWalkError {
    /// The `.debug_info` data ended inside the header.
    #[error("compile unit header is truncated")]
    Truncated(#[from] CursorError),

    /// The unit declares a version outside 2 through 5.
    #[error("unsupported DWARF version: {0}")]
    UnsupportedVersion(u16),
}

/// Returns the offset of the root DIE of the compile unit whose header starts
/// at `cu_header_offset`.
///
/// The cursor must cover the full `.debug_info` section. Only the header is
/// inspected; the body is never read.
pub fn cu_body_offset(
    cu_header_offset: u64,
    cursor: &mut ByteCursor<'_>,
) -> Result<usize, CuWalkError> {
    cursor.seek(SeekFrom::Start(cu_header_offset))?;

    let mut is_dwarf64 = false;
    let initial = cursor.read_bytes(4)?;
    if initial == b"\xff\xff\xff\xff" {
        cursor.skip(8)?;
        is_dwarf64 = true;
    }

    let version_bytes = cursor.read_bytes(2)?;
    let big_endian = version_bytes[0] == 0;
    let version = read_u16(version_bytes, big_endian);

    if !(2..=5).contains(&version) {
        return Err(CuWalkError::UnsupportedVersion(version));
    }

    let mut unit_type = 0u8;
    let mut skip = 0usize;

    if version >= 5 {
        unit_type = cursor.read_u8()?;
        // address size follows the abbrev offset in version 5
        skip += 1;
    }

    // abbrev offset
    skip += if is_dwarf64 { 8 } else { 4 };

    if version < 5 {
        // address size sits at the end of pre-v5 headers
        skip += 1;
    }

    match unit_type {
        // skeleton and split compile units carry an 8-byte unit ID
        0x04 | 0x05 => skip += 8,
        // type units carry an 8-byte type signature and a type offset
        0x02 | 0x06 => {
            skip += 8;
            skip += if is_dwarf64 { 8 } else { 4 };
        }
        _ => {}
    }

    cursor.skip(skip)?;
    Ok(cursor.offset())
}
