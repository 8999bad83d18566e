//! Symbolication of Mach-O binaries and dSYM bundles.
//!
//! This crate turns runtime program-counter addresses back into function
//! names and source locations using the DWARF debug information carried by a
//! Mach-O file or its dSYM companion. It is built for post-mortem analysis of
//! crash, sample, leaks and malloc-history reports, where the addresses in
//! the report are offset from the build-time addresses by the ASLR slide.
//!
//! The central type is [`MachFile`]. Parse one over the raw file bytes,
//! configure the slide or load address taken from the report, and call
//! [`MachFile::atos`] for every address:
//!
//! ```no_run
//! use ratos_common::{Arch, ByteView};
//! use ratos_macho::MachFile;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let view = ByteView::open("App.app.dSYM/Contents/Resources/DWARF/App")?;
//! let mut file = MachFile::parse(&view, Arch::Arm64)?;
//! file.set_load_address(0x1_0448_0000);
//!
//! let symbol = file.atos(0x1_0448_6ef0)?;
//! println!("{} ({}:{})", symbol.func, symbol.line.file, symbol.line.line);
//! # Ok(())
//! # }
//! ```
//!
//! Lookups resolve the compile unit through the `.debug_aranges` accelerator
//! when present and fall back to scanning compile units otherwise; the
//! modules [`aranges`] and [`cu`] implement the raw parsing behind the fast
//! path. Lookup diagnostics are emitted at DEBUG level through [`tracing`]
//! and are silent unless a subscriber is installed.

#![warn(missing_docs)]

pub mod aranges;
pub mod cu;

mod dwarf;
mod endian;
mod macho;
mod section;

pub use crate::dwarf::{Endian, LineEntry, Symbol, SymbolicationError};
pub use crate::macho::*;
pub use crate::section::*;
