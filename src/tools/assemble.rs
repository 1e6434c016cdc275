use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;

use aout_rs::asm::Assembler;
use aout_rs::source::SourceStream;

use crate::commit;

#[derive(Clone, Debug, Parser)]
pub struct AssembleArgs {
    /// Auto-globalise labels
    #[arg(short = 'g')]
    pub globalise: bool,
    /// Verbose output
    #[arg(short = 'v')]
    pub verbose: bool,
    /// Source files, assembled as one logical stream
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,
}

pub fn assemble(args: &AssembleArgs) -> Result<()> {
    let src = SourceStream::from_paths(&args.sources)?;
    let mut asm = Assembler::new(src, args.globalise, args.verbose);
    let image = asm.assemble()?;
    commit(Path::new("a.out"), &image)
}
