use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;

use aout_rs::link::{link_paths, LinkOptions};

use crate::commit;

#[derive(Clone, Debug, Parser)]
pub struct LinkArgs {
    /// Verbose output
    #[arg(short = 'v')]
    pub verbose: bool,
    /// Keep unresolved externals for further linking
    #[arg(short = 'r')]
    pub relocatable: bool,
    /// Strip the output symbol table
    #[arg(short = 's')]
    pub squash: bool,
    /// Object files and archives, in link order
    #[arg(required = true)]
    pub objects: Vec<PathBuf>,
}

pub fn link(args: &LinkArgs) -> Result<()> {
    let opts = LinkOptions {
        verbose: args.verbose,
        relocatable: args.relocatable,
        squash: args.squash,
    };
    let image = link_paths(&args.objects, opts)?;
    commit(Path::new("a.out"), &image)
}
