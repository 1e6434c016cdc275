mod assemble;
use assemble::assemble;
mod link;
use link::link;
mod reloc;
use reloc::reloc;
mod nm;
use nm::nm;
mod size;
use size::size;
mod strip;
use strip::strip;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

pub(crate) use assemble::AssembleArgs;
pub(crate) use link::LinkArgs;
pub(crate) use nm::NmArgs;
pub(crate) use reloc::RelocArgs;
pub(crate) use size::SizeArgs;
pub(crate) use strip::StripArgs;

/// Z80 a.out toolchain
#[derive(Clone, Debug, Parser)]
#[command(name = "aout-tools")]
struct Args {
    #[command(subcommand)]
    tool: Tool,
}

#[derive(Clone, Debug, Subcommand)]
enum Tool {
    /// Assemble sources into a.out
    As(AssembleArgs),
    /// Link objects and archives into a.out
    Ld(LinkArgs),
    /// Move an object to a new base, in place
    Reloc(RelocArgs),
    /// List the symbols of an object
    Nm(NmArgs),
    /// Print segment sizes
    Size(SizeArgs),
    /// Drop the symbol table, in place
    Strip(StripArgs),
}

/// Stage the finished image next to its destination and rename it into
/// place, so a failure never leaves a partial output behind.
pub(crate) fn commit(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let staged = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(anyhow!("cannot write {}: {}", path.display(), e));
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    match &args.tool {
        Tool::As(args) => assemble(args),
        Tool::Ld(args) => link(args),
        Tool::Reloc(args) => reloc(args),
        Tool::Nm(args) => nm(args),
        Tool::Size(args) => size(args),
        Tool::Strip(args) => strip(args),
    }
}
