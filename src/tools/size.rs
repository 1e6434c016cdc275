use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use aout_rs::object::ObjectHeader;

#[derive(Clone, Debug, Parser)]
pub struct SizeArgs {
    /// Object file
    pub object: PathBuf,
}

pub fn size(args: &SizeArgs) -> Result<()> {
    let input = fs::read(&args.object)
        .map_err(|_| anyhow!("cannot open {}", args.object.display()))?;
    let header = ObjectHeader::parse(&input)?;
    println!(
        "{}+{}+{}={} (0x{:04x})",
        header.text_top,
        header.data_top.wrapping_sub(header.text_top),
        header.bss_top.wrapping_sub(header.data_top),
        header.bss_top,
        header.bss_top
    );
    Ok(())
}
