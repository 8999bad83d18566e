//! Loading of Mach-O section payloads.
//!
//! Sections produced by some toolchains (notably Go binaries) carry their
//! DWARF data zlib-compressed under a `__zdebug_*` name, with a GNU-style
//! header: the 4 byte magic `"ZLIB"` followed by an 8-byte big-endian size of
//! the decompressed data. [`section_payload`] makes both representations look
//! the same to the rest of the engine.

use std::borrow::Cow;

use flate2::{Decompress, FlushDecompress};
use thiserror::Error;

/// An error when loading a compressed section payload.
#[derive(Debug, Error)]
pub enum SectionError {
    /// The `"ZLIB"` magic is present but the 12-byte header is cut short.
    #[error("compressed section header is truncated")]
    ShortHeader,

    /// The zlib stream itself could not be inflated.
    #[error("unable to inflate compressed section data")]
    Inflate(#[from] flate2::DecompressError),

    /// The stream inflated to fewer bytes than the header declared.
    #[error("compressed section inflated to {got} bytes, expected {expected}")]
    ShortInflate {
        /// The size declared in the compression header.
        expected: u64,
        /// The number of bytes actually produced.
        got: usize,
    },
}

/// Returns the full uncompressed payload of a section.
///
/// Data starting with the `"ZLIB"` magic is inflated into a buffer of exactly
/// the declared size; anything else is passed through borrowed.
pub fn section_payload(raw: &[u8]) -> Result<Cow<'_, [u8]>, SectionError> {
    if !raw.starts_with(b"ZLIB") {
        return Ok(Cow::Borrowed(raw));
    }

    if raw.len() < 12 {
        return Err(SectionError::ShortHeader);
    }

    let mut size_bytes = [0; 8];
    size_bytes.copy_from_slice(&raw[4..12]);
    let size = u64::from_be_bytes(size_bytes);

    let mut decompressed = Vec::with_capacity(size as usize);
    Decompress::new(true).decompress_vec(&raw[12..], &mut decompressed, FlushDecompress::Finish)?;

    if decompressed.len() as u64 != size {
        return Err(SectionError::ShortInflate {
            expected: size,
            got: decompressed.len(),
        });
    }

    Ok(Cow::Owned(decompressed))
}

/// Determines whether a Mach-O section name denotes the given logical DWARF
/// section.
///
/// The logical name is given without leading punctuation, for instance
/// `"debug_info"`, which matches both `"__debug_info"` and its compressed
/// alias `"__zdebug_info"`.
pub fn section_matches(section_name: &str, logical: &str) -> bool {
    section_name.strip_prefix("__") == Some(logical)
        || section_name.strip_prefix("__z") == Some(logical)
}
