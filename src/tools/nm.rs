use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use aout_rs::names::{list, NamesOptions};

#[derive(Clone, Debug, Parser)]
#[command(disable_help_flag = true)]
pub struct NmArgs {
    /// Do not sort
    #[arg(short = 'p')]
    pub unsorted: bool,
    /// Reverse the order
    #[arg(short = 'r')]
    pub reverse: bool,
    /// Externals only
    #[arg(short = 'g')]
    pub externals_only: bool,
    /// Sort by value
    #[arg(short = 'v')]
    pub by_value: bool,
    /// Suppress the header line
    #[arg(short = 'h')]
    pub no_header: bool,
    /// Object file
    pub object: PathBuf,
    #[arg(long, action = clap::ArgAction::HelpLong, help = "Print help")]
    help: Option<bool>,
}

pub fn nm(args: &NmArgs) -> Result<()> {
    let input = fs::read(&args.object)
        .map_err(|_| anyhow!("cannot open {}", args.object.display()))?;
    let opts = NamesOptions {
        unsorted: args.unsorted,
        reverse: args.reverse,
        externals_only: args.externals_only,
        by_value: args.by_value,
        no_header: args.no_header,
    };
    print!("{}", list(&input, opts)?);
    Ok(())
}
