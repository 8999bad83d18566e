//! The Mach-O container and the address lookup built on top of it.

use std::borrow::Cow;
use std::fmt;

use goblin::mach;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use ratos_common::{Arch, ByteCursor};

use crate::aranges::{find_arange, parse_aranges, ArangeEntry};
use crate::cu::cu_body_offset;
use crate::dwarf::{DwarfInfo, DwarfSections, Endian, Symbol, SymbolicationError, Unit, UnitOffset};
use crate::section::{section_matches, section_payload, SectionError};

/// Capability bits in the high byte of a cpusubtype.
const CPU_SUBTYPE_MASK: u32 = 0xff00_0000;

/// An error when opening or parsing a Mach-O file.
#[derive(Debug, Error)]
pub enum MachError {
    /// The file is too small to carry a Mach-O magic.
    #[error("file is too small for a Mach-O header")]
    Truncated,

    /// The first four bytes are neither a fat nor a thin Mach-O magic.
    #[error("invalid Mach-O magic: {0:#010x}")]
    BadMagic(u32),

    /// A fat file does not carry a slice for the requested architecture.
    #[error("architecture {arch} not found in the fat Mach-O file")]
    ArchNotInFat {
        /// The requested architecture.
        arch: Arch,
    },

    /// A thin file was built for a different architecture than requested.
    #[error(
        "expected architecture {arch} but the Mach-O file is built for \
         cputype {cputype:#x} subtype {cpusubtype:#x}"
    )]
    ArchMismatch {
        /// The requested architecture.
        arch: Arch,
        /// The cputype found in the Mach header.
        cputype: u32,
        /// The cpusubtype found in the Mach header, capability bits masked.
        cpusubtype: u32,
    },

    /// goblin rejected the Mach-O structure.
    #[error("invalid Mach-O file")]
    Mach(#[from] goblin::error::Error),

    /// A debug section payload could not be loaded.
    #[error("unable to load section {name}")]
    Section {
        /// The logical section name.
        name: String,
        /// The underlying decompression failure.
        #[source]
        source: SectionError,
    },
}

/// A symbol-table entry kept for the fallback name lookup.
struct SymtabEntry<'d> {
    name: &'d str,
    value: u64,
    sect: usize,
    n_type: u8,
}

/// A single-architecture Mach-O view with everything the symbolicator needs.
///
/// A `MachFile` borrows the file bytes, typically held in a
/// [`ByteView`](ratos_common::ByteView). Parsing selects the requested slice
/// from a fat file (or validates a thin one), records the `__TEXT` base
/// address, sorts the symbol table, decompresses the DWARF sections, and
/// parses `.debug_aranges` for the lookup fast path.
///
/// Lookups take `&self`; only the slide setters mutate the container, so a
/// parsed file can serve concurrent lookups once its slide is configured.
pub struct MachFile<'d> {
    macho: mach::MachO<'d>,
    endian: Endian,
    vm_addr: u64,
    load_slide: u64,
    text_section: Option<usize>,
    symtab: Vec<SymtabEntry<'d>>,
    aranges: Vec<ArangeEntry>,
    sections: DwarfSections<'d>,
}

impl<'d> MachFile<'d> {
    /// Parses a fat or thin Mach-O buffer, selecting the given architecture.
    ///
    /// For fat files the slice whose `(cputype, cpusubtype)` matches `arch`
    /// is selected; a missing slice is [`MachError::ArchNotInFat`]. A thin
    /// file must match the requested architecture exactly.
    pub fn parse(data: &'d [u8], arch: Arch) -> Result<Self, MachError> {
        let word = match data.get(..4) {
            Some(bytes) => {
                let mut word = [0u8; 4];
                word.copy_from_slice(bytes);
                word
            }
            None => return Err(MachError::Truncated),
        };
        let magic_be = u32::from_be_bytes(word);
        let magic_le = u32::from_le_bytes(word);

        if magic_be == mach::fat::FAT_MAGIC {
            let fat = mach::MultiArch::new(data)?;
            let (cputype, cpusubtype) = arch_pair(arch);

            for fat_arch in fat.iter_arches() {
                let fat_arch = fat_arch?;
                if fat_arch.cputype == cputype
                    && fat_arch.cpusubtype & !CPU_SUBTYPE_MASK == cpusubtype
                {
                    let start = (fat_arch.offset as usize).min(data.len());
                    let end =
                        (fat_arch.offset as usize + fat_arch.size as usize).min(data.len());
                    let macho = mach::MachO::parse(&data[start..end], 0)?;
                    return Self::from_macho(macho);
                }
            }

            return Err(MachError::ArchNotInFat { arch });
        }

        let thin_magics = [mach::header::MH_MAGIC, mach::header::MH_MAGIC_64];
        if thin_magics.contains(&magic_be) || thin_magics.contains(&magic_le) {
            let macho = mach::MachO::parse(data, 0)?;
            let (cputype, cpusubtype) = arch_pair(arch);
            let found_cputype = macho.header.cputype();
            let found_cpusubtype = macho.header.cpusubtype() & !CPU_SUBTYPE_MASK;

            if found_cputype != cputype || found_cpusubtype != cpusubtype {
                return Err(MachError::ArchMismatch {
                    arch,
                    cputype: found_cputype,
                    cpusubtype: found_cpusubtype,
                });
            }

            return Self::from_macho(macho);
        }

        Err(MachError::BadMagic(magic_be))
    }

    fn from_macho(macho: mach::MachO<'d>) -> Result<Self, MachError> {
        let endian = if macho.little_endian {
            Endian::Little
        } else {
            Endian::Big
        };

        let mut vm_addr = 0;
        for segment in &macho.segments {
            if segment.name().map(|name| name == "__TEXT").unwrap_or(false) {
                vm_addr = segment.vmaddr;
                break;
            }
        }

        // nlist entries refer to sections by a global 1-based index in load
        // command order. Resolve the index of __TEXT,__text up front for the
        // symbol-table fallback.
        let mut text_section = None;
        let mut section_index = 0usize;
        'outer: for segment in &macho.segments {
            if segment.name().ok() != Some("__TEXT") {
                section_index += segment.nsects as usize;
                continue;
            }

            for result in segment {
                let section = match result {
                    Ok((section, _data)) => section,
                    Err(_) => break 'outer,
                };

                section_index += 1;
                if section.name().ok() == Some("__text") {
                    text_section = Some(section_index);
                }
            }

            break;
        }

        let mut symtab: Vec<SymtabEntry<'d>> = macho
            .symbols()
            .filter_map(Result::ok)
            .map(|(name, nlist)| SymtabEntry {
                name,
                value: nlist.n_value,
                sect: nlist.n_sect,
                n_type: nlist.n_type,
            })
            .collect();
        symtab.sort_by(|a, b| b.value.cmp(&a.value));

        let sections = DwarfSections::load(|name| match raw_section(&macho, name) {
            Some(raw) => section_payload(raw).map_err(|source| MachError::Section {
                name: name.to_string(),
                source,
            }),
            None => Ok(Cow::Borrowed(&[][..])),
        })?;

        // The aranges fast path is optional; load errors only cost the
        // accelerated lookup and are logged instead of surfaced.
        let mut aranges = Vec::new();
        for segment in &macho.segments {
            for result in segment {
                let (section, data) = match result {
                    Ok(section) => section,
                    Err(_) => break,
                };
                let name = match section.name() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                if !section_matches(name, "debug_aranges") || section.offset == 0 {
                    continue;
                }

                match section_payload(data) {
                    Ok(payload) => {
                        let (mut entries, error) = parse_aranges(&payload);
                        if let Some(error) = error {
                            debug!(section = name, %error, "partial __debug_aranges parse");
                        }
                        aranges.append(&mut entries);
                    }
                    Err(error) => {
                        debug!(section = name, %error, "unable to load __debug_aranges");
                    }
                }
            }
        }
        aranges.sort_by_key(|entry| entry.low_pc);

        Ok(MachFile {
            macho,
            endian,
            vm_addr,
            load_slide: 0,
            text_section,
            symtab,
            aranges,
            sections,
        })
    }

    /// The `__TEXT` segment's build-time virtual address.
    pub fn vm_addr(&self) -> u64 {
        self.vm_addr
    }

    /// The configured ASLR slide, 0 by default.
    pub fn load_slide(&self) -> u64 {
        self.load_slide
    }

    /// Sets the ASLR slide directly.
    pub fn set_load_slide(&mut self, load_slide: u64) {
        self.load_slide = load_slide;
    }

    /// The runtime load address, `vm_addr + load_slide`.
    pub fn load_address(&self) -> u64 {
        self.vm_addr.wrapping_add(self.load_slide)
    }

    /// Sets the runtime load address, deriving the slide from `vm_addr`.
    pub fn set_load_address(&mut self, load_address: u64) {
        self.load_slide = load_address.wrapping_sub(self.vm_addr);
    }

    /// The UUID recorded in the slice's `LC_UUID` load command, if any.
    ///
    /// dSYM bundles and the binaries they describe carry the same UUID.
    pub fn uuid(&self) -> Option<Uuid> {
        for cmd in &self.macho.load_commands {
            if let mach::load_command::CommandVariant::Uuid(ref uuid_cmd) = cmd.command {
                return Uuid::from_slice(&uuid_cmd.uuid).ok();
            }
        }

        None
    }

    /// Determines whether the slice carries a `__debug_info` section.
    pub fn has_debug_info(&self) -> bool {
        !self.sections.debug_info.is_empty()
    }

    /// Symbolicates a runtime program counter.
    ///
    /// The PC is translated to a build-time virtual address using the
    /// configured slide, the owning compile unit is located (through
    /// `.debug_aranges` when possible, otherwise by scanning units), and the
    /// unit's line table and subprogram DIEs provide the source location and
    /// function name.
    pub fn atos(&self, pc: u64) -> Result<Symbol, SymbolicationError> {
        let va = pc.wrapping_sub(self.load_slide);

        let info = DwarfInfo::parse(&self.sections, self.endian)?;
        let (unit, root_offset) = self.locate_unit(&info, va)?;

        let mut cursor = match root_offset {
            Some(offset) => unit.entries_at_offset(offset)?,
            None => unit.entries(),
        };

        let root_tag = match cursor.next_dfs()? {
            Some((_, entry)) => entry.tag(),
            None => return Err(SymbolicationError::CompileUnitNotFound(va)),
        };
        if root_tag != gimli::constants::DW_TAG_compile_unit {
            return Err(SymbolicationError::NotACompileUnit(root_tag));
        }

        let line = info
            .line_entry(&unit, va)?
            .ok_or(SymbolicationError::LineNotFound(va))?;

        match info.subprogram_name(&unit, &mut cursor, va)? {
            Some(func) => Ok(Symbol { func, line }),
            None => Err(SymbolicationError::SubprogramNotFound(va)),
        }
    }

    /// Resolves a virtual address to the nearest preceding symbol name in
    /// `__TEXT,__text`.
    ///
    /// This is a fallback for callers that want a name without debug info;
    /// [`atos`](Self::atos) never consults the symbol table. When several
    /// symbols share the address, the first one in the descending sort wins.
    pub fn resolve_name_from_symtab(&self, va: u64) -> Result<&'d str, SymbolicationError> {
        let index = self.symtab.partition_point(|symbol| symbol.value > va);
        let symbol = self
            .symtab
            .get(index)
            .ok_or(SymbolicationError::NoSymbol(va))?;

        if self.text_section.is_none() || self.text_section != Some(symbol.sect) {
            return Err(SymbolicationError::NoSymbol(va));
        }
        if symbol.n_type & 0x0e != 0x0e {
            return Err(SymbolicationError::NoSymbol(va));
        }

        Ok(symbol.name)
    }

    fn locate_unit<'a>(
        &self,
        info: &DwarfInfo<'a>,
        va: u64,
    ) -> Result<(Unit<'a>, Option<UnitOffset>), SymbolicationError> {
        if !self.aranges.is_empty() {
            match self.fast_locate_unit(info, va) {
                Ok((unit, body_offset)) => return Ok((unit, Some(body_offset))),
                Err(error) => debug!(
                    %error,
                    "aranges lookup missed for {va:#x}, scanning all compile units"
                ),
            }
        }

        match info.unit_for_pc(va)? {
            Some(unit) => Ok((unit, None)),
            None => Err(SymbolicationError::CompileUnitNotFound(va)),
        }
    }

    fn fast_locate_unit<'a>(
        &self,
        info: &DwarfInfo<'a>,
        va: u64,
    ) -> Result<(Unit<'a>, UnitOffset), SymbolicationError> {
        let entry =
            find_arange(&self.aranges, va).ok_or(SymbolicationError::PcNotInAnyRange(va))?;

        let mut cursor = ByteCursor::new(&self.sections.debug_info);
        let body_offset = cu_body_offset(entry.cu_offset, &mut cursor)? as u64;

        let unit = info
            .unit_for_header_offset(entry.cu_offset)?
            .ok_or(SymbolicationError::CompileUnitNotFound(va))?;

        // Read the root DIE once; a bad body offset must miss here so the
        // caller falls back to the linear scan.
        let offset = gimli::UnitOffset((body_offset - entry.cu_offset) as usize);
        {
            let mut probe = unit.entries_at_offset(offset)?;
            probe.next_dfs()?;
        }

        Ok((unit, offset))
    }
}

impl fmt::Debug for MachFile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachFile")
            .field("vm_addr", &format_args!("{:#x}", self.vm_addr))
            .field("load_slide", &format_args!("{:#x}", self.load_slide))
            .field("uuid", &self.uuid())
            .field("symbols", &self.symtab.len())
            .field("aranges", &self.aranges.len())
            .field("has_debug_info", &self.has_debug_info())
            .finish()
    }
}

fn arch_pair(arch: Arch) -> (u32, u32) {
    use goblin::mach::constants::cputype;

    match arch {
        Arch::X86 => (cputype::CPU_TYPE_I386, cputype::CPU_SUBTYPE_I386_ALL),
        Arch::Amd64 => (cputype::CPU_TYPE_X86_64, cputype::CPU_SUBTYPE_X86_64_ALL),
        Arch::Amd64h => (cputype::CPU_TYPE_X86_64, cputype::CPU_SUBTYPE_X86_64_H),
        Arch::Arm => (cputype::CPU_TYPE_ARM, cputype::CPU_SUBTYPE_ARM_ALL),
        Arch::ArmV6 => (cputype::CPU_TYPE_ARM, cputype::CPU_SUBTYPE_ARM_V6),
        Arch::ArmV7 => (cputype::CPU_TYPE_ARM, cputype::CPU_SUBTYPE_ARM_V7),
        Arch::ArmV7s => (cputype::CPU_TYPE_ARM, cputype::CPU_SUBTYPE_ARM_V7S),
        Arch::Arm64 => (cputype::CPU_TYPE_ARM64, cputype::CPU_SUBTYPE_ARM64_ALL),
        Arch::Arm64e => (cputype::CPU_TYPE_ARM64, cputype::CPU_SUBTYPE_ARM64_E),
        _ => unreachable!("Arch is non_exhaustive but all variants are handled above"),
    }
}

fn raw_section<'d>(macho: &mach::MachO<'d>, logical: &str) -> Option<&'d [u8]> {
    for segment in &macho.segments {
        for result in segment {
            let (section, data) = result.ok()?;
            if let Ok(name) = section.name() {
                if section_matches(name, logical) {
                    // dsymutil sometimes leaves a header whose data was
                    // stripped from the file; offset 0 marks those.
                    if section.offset == 0 {
                        return None;
                    }

                    return Some(data);
                }
            }
        }
    }

    None
}
