//! End-to-end lookups against a synthetic arm64 dSYM.
//!
//! The fixture is assembled byte by byte: a thin Mach-O with a `__TEXT,__text`
//! section, a `__DWARF` segment carrying DWARF v4 `__debug_info`,
//! `__debug_abbrev`, `__debug_line` and `__debug_aranges` payloads, an
//! `LC_UUID` and an `LC_SYMTAB`. It describes one compile unit `demo.m`
//! compiled in `/tmp/demo` with two functions:
//!
//! | function         | range                          | lines      |
//! |------------------|--------------------------------|------------|
//! | `main`           | `0x100001000 .. 0x100001040`   | 10, 12     |
//! | `throw_uncaught` | `0x100001040 .. 0x100001070`   | 20, 22     |

use ratos_common::{Arch, ByteView};
use ratos_macho::{MachFile, SymbolicationError};
use similar_asserts::assert_eq;
use uuid::Uuid;

const TEXT_VMADDR: u64 = 0x1_0000_0000;
const TEXT_SECT_ADDR: u64 = 0x1_0000_1000;
const FN_MAIN: u64 = 0x1_0000_1000;
const FN_THROW: u64 = 0x1_0000_1040;

const UUID_BYTES: [u8; 16] = [
    0x2d, 0x10, 0xc4, 0x2f, 0x59, 0x1d, 0x32, 0x65, 0xb1, 0x47, 0x78, 0xba, 0x08, 0x68, 0x07, 0x3f,
];

fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    out
}

fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            break;
        }
    }
    out
}

fn build_debug_abbrev() -> Vec<u8> {
    vec![
        0x01, 0x11, 0x01, // abbrev 1: DW_TAG_compile_unit, has children
        0x03, 0x08, // DW_AT_name, DW_FORM_string
        0x1b, 0x08, // DW_AT_comp_dir, DW_FORM_string
        0x11, 0x01, // DW_AT_low_pc, DW_FORM_addr
        0x12, 0x07, // DW_AT_high_pc, DW_FORM_data8
        0x10, 0x17, // DW_AT_stmt_list, DW_FORM_sec_offset
        0x00, 0x00, //
        0x02, 0x2e, 0x00, // abbrev 2: DW_TAG_subprogram, no children
        0x03, 0x08, // DW_AT_name, DW_FORM_string
        0x11, 0x01, // DW_AT_low_pc, DW_FORM_addr
        0x12, 0x07, // DW_AT_high_pc, DW_FORM_data8
        0x00, 0x00, //
        0x00, // end of abbreviations
    ]
}

/// One DWARF32 v4 compile unit with a root DIE and two subprogram children.
fn build_debug_info() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&4u16.to_le_bytes()); // version
    body.extend_from_slice(&0u32.to_le_bytes()); // abbrev offset
    body.push(8); // address size

    body.push(0x01);
    body.extend_from_slice(b"demo.m\0");
    body.extend_from_slice(b"/tmp/demo\0");
    body.extend_from_slice(&TEXT_SECT_ADDR.to_le_bytes());
    body.extend_from_slice(&0x70u64.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // stmt_list

    body.push(0x02);
    body.extend_from_slice(b"main\0");
    body.extend_from_slice(&FN_MAIN.to_le_bytes());
    body.extend_from_slice(&0x40u64.to_le_bytes());

    body.push(0x02);
    body.extend_from_slice(b"throw_uncaught\0");
    body.extend_from_slice(&FN_THROW.to_le_bytes());
    body.extend_from_slice(&0x30u64.to_le_bytes());

    body.push(0x00); // end of children

    let mut section = Vec::new();
    section.extend_from_slice(&(body.len() as u32).to_le_bytes());
    section.extend_from_slice(&body);
    section
}

/// A DWARF v2 line program with a single sequence:
///
/// ```text
/// 0x100001000 line 10    0x100001020 line 12
/// 0x100001040 line 20    0x100001060 line 22
/// end of sequence at 0x100001070
/// ```
fn build_debug_line() -> Vec<u8> {
    let mut declarations = Vec::new();
    declarations.push(1); // minimum_instruction_length
    declarations.push(1); // default_is_stmt
    declarations.push(0xfb); // line_base (-5)
    declarations.push(14); // line_range
    declarations.push(10); // opcode_base
    declarations.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1]);
    declarations.push(0); // include_directories terminator
    declarations.extend_from_slice(b"demo.m\0");
    declarations.push(0); // directory index
    declarations.push(0); // mtime
    declarations.push(0); // length
    declarations.push(0); // file_names terminator

    let mut program = Vec::new();
    program.extend_from_slice(&[0x00, 0x09, 0x02]); // DW_LNE_set_address
    program.extend_from_slice(&FN_MAIN.to_le_bytes());
    for (pc_delta, line_delta) in [(0u64, 9i64), (0x20, 2), (0x20, 8), (0x20, 2)] {
        if pc_delta != 0 {
            program.push(0x02); // DW_LNS_advance_pc
            program.extend_from_slice(&uleb(pc_delta));
        }
        program.push(0x03); // DW_LNS_advance_line
        program.extend_from_slice(&sleb(line_delta));
        program.push(0x01); // DW_LNS_copy
    }
    program.push(0x02); // DW_LNS_advance_pc
    program.extend_from_slice(&uleb(0x10));
    program.extend_from_slice(&[0x00, 0x01, 0x01]); // DW_LNE_end_sequence

    let mut section = Vec::new();
    let unit_length = 2 + 4 + declarations.len() + program.len();
    section.extend_from_slice(&(unit_length as u32).to_le_bytes());
    section.extend_from_slice(&2u16.to_le_bytes()); // version
    section.extend_from_slice(&(declarations.len() as u32).to_le_bytes()); // header_length
    section.extend_from_slice(&declarations);
    section.extend_from_slice(&program);
    section
}

fn build_debug_aranges() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&2u16.to_le_bytes()); // version
    body.extend_from_slice(&0u32.to_le_bytes()); // debug_info offset
    body.push(8); // address size
    body.push(0); // segment selector size
    body.extend_from_slice(&[0; 4]); // pad to the 16-byte tuple size
    body.extend_from_slice(&TEXT_SECT_ADDR.to_le_bytes());
    body.extend_from_slice(&0x70u64.to_le_bytes());
    body.extend_from_slice(&[0; 16]); // terminator tuple

    let mut section = Vec::new();
    section.extend_from_slice(&(body.len() as u32).to_le_bytes());
    section.extend_from_slice(&body);
    section
}

/// nlist_64 entries and the string table. The `_absolute` symbol is not in
/// `__TEXT,__text` and must be rejected by the fallback resolver.
fn build_symtab() -> (Vec<u8>, Vec<u8>) {
    let symbols: &[(&str, u8, u8, u64)] = &[
        ("_main", 0x0f, 1, FN_MAIN),
        ("_throw_uncaught", 0x0f, 1, FN_THROW),
        ("_absolute", 0x02, 0, 0x1_0000_1050),
    ];

    let mut strtab = vec![0u8];
    let mut nlists = Vec::new();
    for &(name, n_type, n_sect, value) in symbols {
        let strx = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);

        nlists.extend_from_slice(&strx.to_le_bytes());
        nlists.push(n_type);
        nlists.push(n_sect);
        nlists.extend_from_slice(&0u16.to_le_bytes()); // n_desc
        nlists.extend_from_slice(&value.to_le_bytes());
    }

    (nlists, strtab)
}

fn push_fixed_str(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&field);
}

fn push_section(out: &mut Vec<u8>, sectname: &str, segname: &str, addr: u64, size: usize, offset: usize) {
    push_fixed_str(out, sectname);
    push_fixed_str(out, segname);
    out.extend_from_slice(&addr.to_le_bytes());
    out.extend_from_slice(&(size as u64).to_le_bytes());
    out.extend_from_slice(&(offset as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // align
    out.extend_from_slice(&0u32.to_le_bytes()); // reloff
    out.extend_from_slice(&0u32.to_le_bytes()); // nreloc
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(&[0u8; 12]); // reserved
}

fn build_dsym(with_aranges: bool) -> Vec<u8> {
    let text = vec![0u8; 0x70];
    let debug_info = build_debug_info();
    let debug_abbrev = build_debug_abbrev();
    let debug_line = build_debug_line();
    let debug_aranges = build_debug_aranges();
    let (nlists, strtab) = build_symtab();

    let dwarf_section_count = if with_aranges { 4u32 } else { 3u32 };
    let text_cmd_size = 72 + 80;
    let dwarf_cmd_size = 72 + 80 * dwarf_section_count as usize;
    let uuid_cmd_size = 24;
    let symtab_cmd_size = 24;
    let sizeofcmds = text_cmd_size + dwarf_cmd_size + uuid_cmd_size + symtab_cmd_size;
    let data_start = 32 + sizeofcmds;

    let text_off = data_start;
    let info_off = text_off + text.len();
    let abbrev_off = info_off + debug_info.len();
    let line_off = abbrev_off + debug_abbrev.len();
    let aranges_off = line_off + debug_line.len();
    let sym_off = aranges_off + if with_aranges { debug_aranges.len() } else { 0 };
    let str_off = sym_off + nlists.len();

    let dwarf_file_size = debug_info.len()
        + debug_abbrev.len()
        + debug_line.len()
        + if with_aranges { debug_aranges.len() } else { 0 };

    let mut out = Vec::new();

    // mach_header_64
    out.extend_from_slice(&0xfeed_facf_u32.to_le_bytes()); // MH_MAGIC_64
    out.extend_from_slice(&0x0100_000c_u32.to_le_bytes()); // CPU_TYPE_ARM64
    out.extend_from_slice(&0u32.to_le_bytes()); // CPU_SUBTYPE_ARM64_ALL
    out.extend_from_slice(&0x0a_u32.to_le_bytes()); // MH_DSYM
    out.extend_from_slice(&4u32.to_le_bytes()); // ncmds
    out.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved

    // LC_SEGMENT_64 __TEXT with one __text section
    out.extend_from_slice(&0x19u32.to_le_bytes());
    out.extend_from_slice(&(text_cmd_size as u32).to_le_bytes());
    push_fixed_str(&mut out, "__TEXT");
    out.extend_from_slice(&TEXT_VMADDR.to_le_bytes());
    out.extend_from_slice(&0x4000u64.to_le_bytes()); // vmsize
    out.extend_from_slice(&(text_off as u64).to_le_bytes());
    out.extend_from_slice(&(text.len() as u64).to_le_bytes());
    out.extend_from_slice(&5u32.to_le_bytes()); // maxprot
    out.extend_from_slice(&5u32.to_le_bytes()); // initprot
    out.extend_from_slice(&1u32.to_le_bytes()); // nsects
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    push_section(&mut out, "__text", "__TEXT", TEXT_SECT_ADDR, text.len(), text_off);

    // LC_SEGMENT_64 __DWARF
    out.extend_from_slice(&0x19u32.to_le_bytes());
    out.extend_from_slice(&(dwarf_cmd_size as u32).to_le_bytes());
    push_fixed_str(&mut out, "__DWARF");
    out.extend_from_slice(&0x1_0000_4000u64.to_le_bytes());
    out.extend_from_slice(&0x4000u64.to_le_bytes()); // vmsize
    out.extend_from_slice(&(info_off as u64).to_le_bytes());
    out.extend_from_slice(&(dwarf_file_size as u64).to_le_bytes());
    out.extend_from_slice(&3u32.to_le_bytes()); // maxprot
    out.extend_from_slice(&3u32.to_le_bytes()); // initprot
    out.extend_from_slice(&dwarf_section_count.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    push_section(&mut out, "__debug_info", "__DWARF", 0, debug_info.len(), info_off);
    push_section(&mut out, "__debug_abbrev", "__DWARF", 0, debug_abbrev.len(), abbrev_off);
    push_section(&mut out, "__debug_line", "__DWARF", 0, debug_line.len(), line_off);
    if with_aranges {
        push_section(
            &mut out,
            "__debug_aranges",
            "__DWARF",
            0,
            debug_aranges.len(),
            aranges_off,
        );
    }

    // LC_UUID
    out.extend_from_slice(&0x1bu32.to_le_bytes());
    out.extend_from_slice(&(uuid_cmd_size as u32).to_le_bytes());
    out.extend_from_slice(&UUID_BYTES);

    // LC_SYMTAB
    out.extend_from_slice(&0x02u32.to_le_bytes());
    out.extend_from_slice(&(symtab_cmd_size as u32).to_le_bytes());
    out.extend_from_slice(&(sym_off as u32).to_le_bytes());
    out.extend_from_slice(&3u32.to_le_bytes()); // nsyms
    out.extend_from_slice(&(str_off as u32).to_le_bytes());
    out.extend_from_slice(&(strtab.len() as u32).to_le_bytes());

    assert_eq!(out.len(), data_start);
    out.extend_from_slice(&text);
    out.extend_from_slice(&debug_info);
    out.extend_from_slice(&debug_abbrev);
    out.extend_from_slice(&debug_line);
    if with_aranges {
        out.extend_from_slice(&debug_aranges);
    }
    out.extend_from_slice(&nlists);
    out.extend_from_slice(&strtab);
    out
}

#[test]
fn test_parses_synthetic_dsym() {
    let data = build_dsym(true);
    let file = MachFile::parse(&data, Arch::Arm64).unwrap();

    assert_eq!(file.vm_addr(), TEXT_VMADDR);
    assert_eq!(file.load_slide(), 0);
    assert!(file.has_debug_info());
    assert_eq!(file.uuid(), Some(Uuid::from_bytes(UUID_BYTES)));
}

#[test]
fn test_atos_with_load_address() {
    let data = build_dsym(true);
    let mut file = MachFile::parse(&data, Arch::Arm64).unwrap();

    file.set_load_address(0x1_0448_0000);
    assert_eq!(file.load_slide(), 0x448_0000);
    assert_eq!(file.load_address(), 0x1_0448_0000);

    let symbol = file.atos(0x1_0448_1000).unwrap();
    assert_eq!(symbol.func, "main");
    assert_eq!(symbol.line.line, 10);
    assert_eq!(symbol.line.file, "/tmp/demo/demo.m");
    assert_eq!(symbol.line.address, FN_MAIN);

    let symbol = file.atos(0x1_0448_1025).unwrap();
    assert_eq!(symbol.func, "main");
    assert_eq!(symbol.line.line, 12);
    assert_eq!(symbol.line.address, FN_MAIN + 0x20);

    let symbol = file.atos(0x1_0448_1048).unwrap();
    assert_eq!(symbol.func, "throw_uncaught");
    assert_eq!(symbol.line.line, 20);
}

#[test]
fn test_atos_without_slide() {
    let data = build_dsym(true);
    let file = MachFile::parse(&data, Arch::Arm64).unwrap();

    let symbol = file.atos(FN_MAIN).unwrap();
    assert_eq!(symbol.func, "main");
    assert_eq!(symbol.line.line, 10);
}

#[test]
fn test_offset_mode_arithmetic() {
    let data = build_dsym(true);
    let file = MachFile::parse(&data, Arch::Arm64).unwrap();

    // Offset mode resolves load_address() + offset; with no slide set this
    // is vm_addr + offset.
    let pc = file.load_address() + 0x1020;
    let symbol = file.atos(pc).unwrap();
    assert_eq!(symbol.func, "main");
    assert_eq!(symbol.line.line, 12);
}

#[test]
fn test_linear_fallback_matches_fast_path() {
    let fast = build_dsym(true);
    let slow = build_dsym(false);
    let fast_file = MachFile::parse(&fast, Arch::Arm64).unwrap();
    let slow_file = MachFile::parse(&slow, Arch::Arm64).unwrap();

    for va in [FN_MAIN, FN_MAIN + 0x25, FN_THROW, FN_THROW + 0x2f] {
        let fast_symbol = fast_file.atos(va).unwrap();
        let slow_symbol = slow_file.atos(va).unwrap();
        assert_eq!(fast_symbol.func, slow_symbol.func, "va {va:#x}");
        assert_eq!(fast_symbol.line, slow_symbol.line, "va {va:#x}");
    }
}

#[test]
fn test_subprogram_bounds_are_inclusive() {
    let data = build_dsym(true);
    let file = MachFile::parse(&data, Arch::Arm64).unwrap();

    // The shared boundary belongs to both functions under inclusive bounds;
    // the first subprogram in document order wins.
    let symbol = file.atos(FN_THROW).unwrap();
    assert_eq!(symbol.func, "main");
    assert_eq!(symbol.line.line, 20);
}

#[test]
fn test_address_past_line_sequence() {
    let data = build_dsym(true);
    let file = MachFile::parse(&data, Arch::Arm64).unwrap();

    assert!(matches!(
        file.atos(TEXT_SECT_ADDR + 0x70),
        Err(SymbolicationError::LineNotFound(_))
    ));
}

#[test]
fn test_address_outside_all_units() {
    let data = build_dsym(true);
    let file = MachFile::parse(&data, Arch::Arm64).unwrap();

    assert!(matches!(
        file.atos(0x1_0000_9000),
        Err(SymbolicationError::CompileUnitNotFound(0x1_0000_9000))
    ));
}

#[test]
fn test_symtab_fallback() {
    let data = build_dsym(true);
    let file = MachFile::parse(&data, Arch::Arm64).unwrap();

    assert_eq!(file.resolve_name_from_symtab(FN_MAIN).unwrap(), "_main");
    assert_eq!(
        file.resolve_name_from_symtab(FN_MAIN + 0x10).unwrap(),
        "_main"
    );
    assert_eq!(
        file.resolve_name_from_symtab(FN_THROW + 0x5).unwrap(),
        "_throw_uncaught"
    );

    // Below the first symbol there is nothing to resolve.
    assert!(matches!(
        file.resolve_name_from_symtab(TEXT_VMADDR),
        Err(SymbolicationError::NoSymbol(_))
    ));

    // The nearest preceding symbol here is absolute, not in __TEXT,__text.
    assert!(matches!(
        file.resolve_name_from_symtab(0x1_0000_1055),
        Err(SymbolicationError::NoSymbol(_))
    ));
}

#[test]
fn test_symbol_name_round_trip_with_slide() {
    let data = build_dsym(true);
    let mut file = MachFile::parse(&data, Arch::Arm64).unwrap();

    file.set_load_slide(0x448_0000);
    let symbol = file.atos(FN_THROW + 0x8 + 0x448_0000).unwrap();
    assert_eq!(symbol.func, "throw_uncaught");
}

#[test]
fn test_byteview_backed_parse() {
    let view = ByteView::from_vec(build_dsym(true));
    let file = MachFile::parse(&view, Arch::Arm64).unwrap();
    assert_eq!(file.vm_addr(), TEXT_VMADDR);
}
