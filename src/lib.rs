//! ratos symbolicates addresses against Mach-O binaries and dSYM bundles.
//!
//! This facade crate re-exports the workspace members. Most users want
//! [`macho::MachFile`] together with [`common::ByteView`]:
//!
//! ```no_run
//! use ratos::common::{Arch, ByteView};
//! use ratos::macho::MachFile;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let view = ByteView::open("App.app.dSYM/Contents/Resources/DWARF/App")?;
//! let mut file = MachFile::parse(&view, Arch::Arm64)?;
//! file.set_load_address(0x1_0448_0000);
//! let symbol = file.atos(0x1_0448_6ef0)?;
//! println!("{}", symbol.func);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

#[doc(inline)]
pub use ratos_common as common;
#[doc(inline)]
pub use ratos_macho as macho;
