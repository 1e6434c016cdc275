use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use aout_rs::object::{self, ObjectData};

use crate::commit;

#[derive(Clone, Debug, Parser)]
pub struct StripArgs {
    /// Object file, rewritten in place
    pub object: PathBuf,
}

pub fn strip(args: &StripArgs) -> Result<()> {
    let input = fs::read(&args.object)
        .map_err(|_| anyhow!("cannot open {}", args.object.display()))?;
    let obj = ObjectData::parse(input)?;

    let mut out = Vec::with_capacity(obj.data.len());
    out.extend_from_slice(&obj.data[..usize::from(obj.header.data_top)]);
    let relocs = obj.relocs()?;
    object::write_reloc_section(
        &mut out,
        relocs.len(),
        relocs.iter().map(|r| (r.tag, r.addr)),
    );
    object::write_symbol_section(&mut out, &[]);
    commit(&args.object, &out)
}
