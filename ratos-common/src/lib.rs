//! Common functionality for `ratos`.
//!
//! This crate exposes the foundation types used by the symbolication engine:
//!
//!  - [`Arch`]: The architecture selector used to pick a Mach-O slice.
//!  - [`ByteView`]: Gives access to binary data in-memory or on the file system.
//!  - [`ByteCursor`]: A seekable, position-tracking reader over a byte slice.
//!
//! This crate is part of the `ratos` workspace.

#![warn(missing_docs)]

mod byteview;
mod cursor;
mod types;

pub use crate::byteview::*;
pub use crate::cursor::*;
pub use crate::types::*;
