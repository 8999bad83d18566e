//! The architecture selector and its parser.

use std::fmt;
use std::str;

/// An error returned when parsing an unknown [`Arch`] name.
#[derive(Debug)]
pub struct UnknownArchError;

impl fmt::Display for UnknownArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown architecture")
    }
}

impl std::error::Error for UnknownArchError {}

/// A CPU architecture of a Mach-O slice.
///
/// Every variant corresponds to one `(cputype, cpusubtype)` pair as found in
/// Mach headers and FAT arch tables. Architectures can be parsed from their
/// Apple names; common aliases are supported (`"i386"` for `x86`, `"amd64"`
/// and `"x64"` for `x86_64`).
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Arch {
    X86,
    Amd64,
    Amd64h,
    Arm,
    ArmV6,
    ArmV7,
    ArmV7s,
    Arm64,
    Arm64e,
}

impl Arch {
    /// Returns the canonical Apple name of the architecture.
    ///
    /// This is the name `lipo` and crash reports use, such as `"x86_64h"` or
    /// `"arm64e"`.
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::Amd64 => "x86_64",
            Arch::Amd64h => "x86_64h",
            Arch::Arm => "arm",
            Arch::ArmV6 => "armv6",
            Arch::ArmV7 => "armv7",
            Arch::ArmV7s => "armv7s",
            Arch::Arm64 => "arm64",
            Arch::Arm64e => "arm64e",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl str::FromStr for Arch {
    type Err = UnknownArchError;

    fn from_str(string: &str) -> Result<Arch, UnknownArchError> {
        Ok(match string.trim().to_ascii_lowercase().as_str() {
            "i386" | "x86" => Arch::X86,
            "x86_64" | "amd64" | "x64" => Arch::Amd64,
            "x86_64h" => Arch::Amd64h,
            "arm" => Arch::Arm,
            "armv6" => Arch::ArmV6,
            "armv7" => Arch::ArmV7,
            "armv7s" => Arch::ArmV7s,
            "arm64" => Arch::Arm64,
            "arm64e" => Arch::Arm64e,
            _ => return Err(UnknownArchError),
        })
    }
}
