//! The `ratos` command line: a Mach-O / dSYM symbolicator in the spirit of
//! atos(1).

use std::num::ParseIntError;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command};
use tracing::debug;

use ratos_common::{Arch, ByteView};
use ratos_macho::MachFile;

fn build_command() -> Command {
    Command::new("ratos")
        .about(
            "Symbolicate addresses from a Mach-O binary image or dSYM, \
             turning runtime program counters from crash, sample, leaks and \
             malloc_history reports into function names and source locations",
        )
        .arg(
            Arg::new("binary")
                .short('o')
                .value_name("PATH")
                .required(true)
                .help("Path to a binary image file or dSYM in which to look up symbols"),
        )
        .arg(
            Arg::new("arch")
                .long("arch")
                .value_name("NAME")
                .default_value("arm64")
                .help("The particular architecture of a binary image file in which to look up symbols"),
        )
        .arg(
            Arg::new("load-address")
                .short('l')
                .value_name("ADDR")
                .help(
                    "The load address of the binary image, as listed in the Binary Images \
                     section at the bottom of crash, sample, leaks, and malloc_history \
                     reports. Always read as hex, with or without a 0x prefix",
                ),
        )
        .arg(
            Arg::new("text-exec-address")
                .long("textExecAddress")
                .value_name("ADDR")
                .help(
                    "Used instead of the load address with kernel-space binary images on \
                     arm64(e) devices; found in the 'Kernel text exec base' line of panic \
                     reports. Always read as hex, with or without a 0x prefix",
                ),
        )
        .arg(
            Arg::new("slide")
                .short('s')
                .value_name("SLIDE")
                .help(
                    "The slide of the binary image: the difference between its load address \
                     and the address it was built at. It is usually easier to pass the load \
                     address with -l. Always read as hex, with or without a 0x prefix",
                ),
        )
        .arg(
            Arg::new("offset")
                .long("offset")
                .action(ArgAction::SetTrue)
                .help("Treat all given addresses as offsets into the binary"),
        )
        .group(
            ArgGroup::new("base")
                .args(["load-address", "text-exec-address", "slide", "offset"])
                .multiple(false),
        )
        .arg(
            Arg::new("full-path")
                .long("fullPath")
                .action(ArgAction::SetTrue)
                .help("Print the full path of the source files"),
        )
        .arg(
            Arg::new("delimiter")
                .short('d')
                .value_name("DELIM")
                .default_value("\n")
                .help("Delimiter printed after each resolved address"),
        )
        .arg(
            Arg::new("inline-frames")
                .short('i')
                .long("inlineFrames")
                .action(ArgAction::SetTrue)
                .help("Display inlined symbols (not implemented yet)"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging to stderr"),
        )
        .arg(
            Arg::new("addresses")
                .value_name("ADDRESS")
                .num_args(0..)
                .help("Hex addresses to symbolicate, with or without a 0x prefix"),
        )
}

/// Parses an address that is always hex, with or without a `0x` prefix.
fn parse_hex(input: &str) -> Result<u64, ParseIntError> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    u64::from_str_radix(digits, 16)
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

fn run(matches: &ArgMatches) -> Result<()> {
    let arch_name = matches
        .get_one::<String>("arch")
        .map(String::as_str)
        .unwrap_or("arm64");
    let arch: Arch = arch_name
        .parse()
        .map_err(|_| anyhow!("unknown architecture [{arch_name}]"))?;

    let path = matches
        .get_one::<String>("binary")
        .map(String::as_str)
        .unwrap_or_default();
    let view = ByteView::open(path).with_context(|| format!("unable to open file {path}"))?;
    let mut file = MachFile::parse(&view, arch)
        .with_context(|| format!("unable to parse Mach-O file [{path}]"))?;

    if let Some(value) = matches.get_one::<String>("load-address") {
        file.set_load_address(parse_hex(value).context("invalid load address")?);
    }
    if let Some(value) = matches.get_one::<String>("text-exec-address") {
        file.set_load_address(parse_hex(value).context("invalid text exec address")?);
    }
    if let Some(value) = matches.get_one::<String>("slide") {
        file.set_load_slide(parse_hex(value).context("invalid slide value")?);
    }

    if matches.get_flag("inline-frames") {
        debug!("inlined frames are not resolved yet, printing outermost frames only");
    }

    let offsets = matches.get_flag("offset");
    let full_path = matches.get_flag("full-path");
    let delimiter = matches
        .get_one::<String>("delimiter")
        .map(String::as_str)
        .unwrap_or("\n");
    let binary_name = basename(path);

    for input in matches.get_many::<String>("addresses").into_iter().flatten() {
        let pc = match parse_hex(input) {
            Ok(addr) if offsets => file.load_address().wrapping_add(addr),
            Ok(addr) => addr,
            Err(error) => {
                debug!(%error, "invalid address [{input}]");
                print!("{input}{delimiter}");
                continue;
            }
        };

        match file.atos(pc) {
            Ok(symbol) => {
                let file_name = if full_path {
                    symbol.line.file.as_str()
                } else {
                    basename(&symbol.line.file)
                };
                print!(
                    "{} (in {}) ({}:{}){}",
                    symbol.func, binary_name, file_name, symbol.line.line, delimiter
                );
            }
            Err(error) => {
                debug!(%error, "unable to symbolicate [{input}]");
                print!("{input}{delimiter}");
            }
        }
    }

    Ok(())
}

fn main() {
    let matches = match build_command().try_get_matches() {
        Ok(matches) => matches,
        Err(error) => {
            let code = if error.use_stderr() { 1 } else { 0 };
            let _ = error.print();
            std::process::exit(code);
        }
    };

    if matches.get_flag("debug") {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(error) = run(&matches) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}
