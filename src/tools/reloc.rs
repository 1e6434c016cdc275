use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use aout_rs::relocate::{relocate, RelocateOptions};

use crate::commit;

#[derive(Clone, Debug, Parser)]
pub struct RelocArgs {
    /// Verbose output
    #[arg(short = 'v')]
    pub verbose: bool,
    /// Strip the output symbol table
    #[arg(short = 's')]
    pub squash: bool,
    /// Relocate the bss to its own base and freeze it
    #[arg(short = 'b', value_name = "BASE")]
    pub bss_base: Option<String>,
    /// Headerless output
    #[arg(short = 'n')]
    pub headerless: bool,
    /// Convert to absolute data
    #[arg(short = 'd')]
    pub to_data: bool,
    /// Object file, rewritten in place
    pub object: PathBuf,
    /// New text origin
    pub base: String,
}

/// Numbers on the command line follow the assembler's radix rules:
/// `0x`/`0o`/`0b` prefixes, `h`/`o`/`b` suffixes, leading zero for octal.
fn parse_base(text: &str) -> Result<u16> {
    let bad = || anyhow!("invalid number {}", text);
    let bytes = text.as_bytes();
    let mut radix: u32 = 10;
    let mut start = 0;
    while start < bytes.len() && bytes[start] == b'0' {
        start += 1;
        radix = 8;
    }
    let mut end = bytes.len();
    let classify = |c: u8| match c {
        b'b' | b'B' => Some(2),
        b'o' | b'O' => Some(8),
        b'x' | b'X' | b'h' | b'H' => Some(16),
        _ => None,
    };
    if start < end {
        if let Some(r) = classify(bytes[start]) {
            radix = r;
            start += 1;
        } else if let Some(r) = classify(bytes[end - 1]) {
            radix = r;
            end -= 1;
        }
    }
    let mut out: u16 = 0;
    for &b in &bytes[start..end] {
        let v = (b as char).to_digit(16).ok_or_else(bad)?;
        if v >= radix {
            return Err(bad());
        }
        out = out
            .wrapping_mul(radix as u16)
            .wrapping_add(v as u16);
    }
    Ok(out)
}

pub fn reloc(args: &RelocArgs) -> Result<()> {
    let input = fs::read(&args.object)
        .map_err(|_| anyhow!("cannot open {}", args.object.display()))?;
    let target = parse_base(&args.base)?;
    let opts = RelocateOptions {
        verbose: args.verbose,
        squash: args.squash,
        bss_base: args
            .bss_base
            .as_deref()
            .map(parse_base)
            .transpose()?,
        headerless: args.headerless,
        to_data: args.to_data,
    };
    let image = relocate(&input, target, opts)?;
    commit(&args.object, &image)
}
