//! DWARF consumption on top of gimli.
//!
//! The hand-written parsers in [`crate::aranges`] and [`crate::cu`] only
//! locate compile units; everything past the CU header (DIE traversal,
//! attribute and string resolution, range lists, the line program state
//! machine) is delegated to gimli. [`DwarfInfo`] is a cheap per-lookup view
//! that wraps the container's section data in gimli readers, so lookups
//! never share decoder positions.

use std::borrow::Cow;

use fallible_iterator::FallibleIterator;
use gimli::constants;
use thiserror::Error;

use crate::cu::CuWalkError;

pub use gimli::RunTimeEndian as Endian;

type Slice<'a> = gimli::EndianSlice<'a, Endian>;
type DwarfInner<'a> = gimli::Dwarf<Slice<'a>>;
type UnitHeader<'a> = gimli::UnitHeader<Slice<'a>>;
type LineProgramHeader<'a> = gimli::LineProgramHeader<Slice<'a>>;
type DebugInfoOffset = gimli::DebugInfoOffset<usize>;

pub(crate) type Unit<'a> = gimli::Unit<Slice<'a>>;
pub(crate) type UnitOffset = gimli::UnitOffset<usize>;
pub(crate) type EntriesCursor<'abbrev, 'unit, 'a> =
    gimli::EntriesCursor<'abbrev, 'unit, Slice<'a>>;

/// An error produced during address lookup.
#[derive(Debug, Error)]
pub enum SymbolicationError {
    /// No `.debug_aranges` range covers the address. Internal to the fast
    /// path; the linear fallback recovers from it.
    #[error("no __debug_aranges range covers address {0:#x}")]
    PcNotInAnyRange(u64),

    /// No compile unit covers the address.
    #[error("unable to locate a compile unit for address {0:#x}")]
    CompileUnitNotFound(u64),

    /// The DIE at the computed compile-unit body offset has the wrong tag.
    #[error("expected a compile unit entry, got {0}")]
    NotACompileUnit(gimli::DwTag),

    /// The compile unit's line program has no row covering the address.
    #[error("no line table entry covers address {0:#x}")]
    LineNotFound(u64),

    /// The compile unit ended without a subprogram covering the address.
    #[error("unable to find a subprogram covering address {0:#x}")]
    SubprogramNotFound(u64),

    /// The symbol-table fallback found no qualifying entry.
    #[error("no symbol table entry for address {0:#x}")]
    NoSymbol(u64),

    /// The compile-unit header could not be walked.
    #[error("unable to walk the compile unit header")]
    CuWalk(#[from] CuWalkError),

    /// gimli rejected the debug data.
    #[error("corrupted DWARF data")]
    CorruptDwarf(#[from] gimli::Error),
}

/// A source line resolved from the DWARF line table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineEntry {
    /// Address of the line-table row that covered the lookup address.
    pub address: u64,
    /// Full path of the source file.
    pub file: String,
    /// 1-based line number, or 0 when the row carries no line.
    pub line: u32,
    /// 1-based column number, or 0 for the left edge.
    pub column: u32,
}

/// A resolved symbol: the owning function and its source line.
#[derive(Clone, Debug)]
pub struct Symbol {
    /// Name of the subprogram covering the address. Empty when the matched
    /// subprogram carries no name attribute.
    pub func: String,
    /// The source location from the compile unit's line program.
    pub line: LineEntry,
}

/// The raw DWARF section payloads of a Mach-O slice, decompressed once at
/// container-parse time.
#[derive(Debug)]
pub(crate) struct DwarfSections<'d> {
    pub debug_abbrev: Cow<'d, [u8]>,
    pub debug_addr: Cow<'d, [u8]>,
    pub debug_info: Cow<'d, [u8]>,
    pub debug_line: Cow<'d, [u8]>,
    pub debug_line_str: Cow<'d, [u8]>,
    pub debug_ranges: Cow<'d, [u8]>,
    pub debug_rnglists: Cow<'d, [u8]>,
    pub debug_str: Cow<'d, [u8]>,
    pub debug_str_offsets: Cow<'d, [u8]>,
}

impl Default for DwarfSections<'_> {
    fn default() -> Self {
        DwarfSections {
            debug_abbrev: Cow::Borrowed(&[]),
            debug_addr: Cow::Borrowed(&[]),
            debug_info: Cow::Borrowed(&[]),
            debug_line: Cow::Borrowed(&[]),
            debug_line_str: Cow::Borrowed(&[]),
            debug_ranges: Cow::Borrowed(&[]),
            debug_rnglists: Cow::Borrowed(&[]),
            debug_str: Cow::Borrowed(&[]),
            debug_str_offsets: Cow::Borrowed(&[]),
        }
    }
}

impl<'d> DwarfSections<'d> {
    /// Loads all sections through a lookup that maps a logical section name
    /// (`"debug_info"`) to its payload. Missing sections load as empty.
    pub fn load<E, F>(mut section: F) -> Result<Self, E>
    where
        F: FnMut(&str) -> Result<Cow<'d, [u8]>, E>,
    {
        Ok(DwarfSections {
            debug_abbrev: section("debug_abbrev")?,
            debug_addr: section("debug_addr")?,
            debug_info: section("debug_info")?,
            debug_line: section("debug_line")?,
            debug_line_str: section("debug_line_str")?,
            debug_ranges: section("debug_ranges")?,
            debug_rnglists: section("debug_rnglists")?,
            debug_str: section("debug_str")?,
            debug_str_offsets: section("debug_str_offsets")?,
        })
    }
}

/// A per-lookup gimli view over [`DwarfSections`].
///
/// Constructing this is cheap: gimli readers are slices, and only the unit
/// headers are collected eagerly to allow binary search by header offset.
pub(crate) struct DwarfInfo<'a> {
    inner: DwarfInner<'a>,
    headers: Vec<UnitHeader<'a>>,
}

impl<'a> DwarfInfo<'a> {
    pub fn parse(sections: &'a DwarfSections<'_>, endian: Endian) -> Result<Self, gimli::Error> {
        let inner = gimli::Dwarf::load(|id| -> Result<Slice<'a>, gimli::Error> {
            let data: &[u8] = match id {
                gimli::SectionId::DebugAbbrev => &sections.debug_abbrev,
                gimli::SectionId::DebugAddr => &sections.debug_addr,
                gimli::SectionId::DebugInfo => &sections.debug_info,
                gimli::SectionId::DebugLine => &sections.debug_line,
                gimli::SectionId::DebugLineStr => &sections.debug_line_str,
                gimli::SectionId::DebugRanges => &sections.debug_ranges,
                gimli::SectionId::DebugRngLists => &sections.debug_rnglists,
                gimli::SectionId::DebugStr => &sections.debug_str,
                gimli::SectionId::DebugStrOffsets => &sections.debug_str_offsets,
                _ => &[],
            };
            Ok(Slice::new(data, endian))
        })?;

        let headers = inner.units().collect::<Vec<_>>()?;

        Ok(DwarfInfo { inner, headers })
    }

    /// Loads the unit whose header starts exactly at `offset` in
    /// `.debug_info`.
    pub fn unit_for_header_offset(&self, offset: u64) -> Result<Option<Unit<'a>>, gimli::Error> {
        let target =
            gimli::UnitSectionOffset::DebugInfoOffset(gimli::DebugInfoOffset(offset as usize));
        match self
            .headers
            .binary_search_by_key(&target, UnitHeader::offset)
        {
            Ok(index) => self.inner.unit(self.headers[index]).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Scans compile units in document order for one whose ranges cover
    /// `va`. This is the slow path used when `.debug_aranges` is missing or
    /// does not resolve the address.
    pub fn unit_for_pc(&self, va: u64) -> Result<Option<Unit<'a>>, gimli::Error> {
        for header in &self.headers {
            let unit = match self.inner.unit(*header) {
                Ok(unit) => unit,
                Err(gimli::Error::MissingUnitDie) => continue,
                Err(error) => return Err(error),
            };

            let mut ranges = self.inner.unit_ranges(&unit)?;
            while let Some(range) = ranges.next()? {
                if range.begin <= va && va < range.end {
                    return Ok(Some(unit));
                }
            }
        }

        Ok(None)
    }

    /// Finds the line-table row with the greatest address not exceeding `va`
    /// within a sequence that covers `va`.
    pub fn line_entry(&self, unit: &Unit<'a>, va: u64) -> Result<Option<LineEntry>, gimli::Error> {
        let program = match unit.line_program {
            Some(ref program) => program.clone(),
            None => return Ok(None),
        };

        let mut rows = program.rows();
        let mut candidate = None;
        let mut matched = None;

        while let Some((_, row)) = rows.next_row()? {
            if row.end_sequence() {
                // The end-sequence address is one past the last covered byte.
                if candidate.is_some() && row.address() > va {
                    matched = candidate.take();
                    break;
                }
                candidate = None;
                continue;
            }

            if row.address() <= va {
                candidate = Some((row.address(), row.file_index(), row.line(), row.column()));
            } else if candidate.is_some() {
                matched = candidate.take();
                break;
            }
        }

        let (address, file_index, line, column) = match matched {
            Some(row) => row,
            None => return Ok(None),
        };

        let file = self.render_file(unit, rows.header(), file_index)?;

        Ok(Some(LineEntry {
            address,
            file,
            line: line.map(|line| line.get() as u32).unwrap_or(0),
            column: match column {
                gimli::ColumnType::LeftEdge => 0,
                gimli::ColumnType::Column(column) => column.get() as u32,
            },
        }))
    }

    /// Advances the cursor DIE by DIE looking for a subprogram whose ranges
    /// cover `va`.
    ///
    /// Returns `Ok(None)` when the compile unit ends without a match, either
    /// by running into the next unit boundary or by exhausting the cursor. A
    /// matched subprogram without a name yields an empty string.
    pub fn subprogram_name(
        &self,
        unit: &Unit<'a>,
        cursor: &mut EntriesCursor<'_, '_, 'a>,
        va: u64,
    ) -> Result<Option<String>, gimli::Error> {
        while let Some((_, entry)) = cursor.next_dfs()? {
            match entry.tag() {
                constants::DW_TAG_compile_unit | constants::DW_TAG_partial_unit => {
                    return Ok(None);
                }
                constants::DW_TAG_subprogram => {
                    let mut contains = false;
                    let mut ranges = self.inner.die_ranges(unit, entry)?;
                    while let Some(range) = ranges.next()? {
                        if range.begin <= va && va <= range.end {
                            contains = true;
                            break;
                        }
                    }

                    if contains {
                        let mut name = String::new();
                        if let Some(value) = entry.attr_value(constants::DW_AT_name)? {
                            if let Ok(string) = self.inner.attr_string(unit, value) {
                                name = string.to_string_lossy().into_owned();
                            }
                        }
                        // TODO: also walk DW_TAG_inlined_subroutine children
                        // of the match to report inlined frames.
                        return Ok(Some(name));
                    }
                }
                _ => {}
            }
        }

        Ok(None)
    }

    fn render_file(
        &self,
        unit: &Unit<'a>,
        header: &LineProgramHeader<'a>,
        file_index: u64,
    ) -> Result<String, gimli::Error> {
        let file = match header.file(file_index) {
            Some(file) => file,
            None => return Ok(String::new()),
        };

        let mut path = match unit.comp_dir {
            Some(comp_dir) => comp_dir.to_string_lossy().into_owned(),
            None => String::new(),
        };

        // Directory index 0 refers to the compilation directory.
        if file.directory_index() != 0 {
            if let Some(directory) = file.directory(header) {
                path_push(
                    &mut path,
                    &self.inner.attr_string(unit, directory)?.to_string_lossy(),
                );
            }
        }

        path_push(
            &mut path,
            &self
                .inner
                .attr_string(unit, file.path_name())?
                .to_string_lossy(),
        );

        Ok(path)
    }
}

fn path_push(path: &mut String, component: &str) {
    if component.starts_with('/') {
        *path = component.to_string();
    } else {
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(component);
    }
}
