use anyhow::Result;

use crate::object::ObjectData;
use crate::SegTag;

#[derive(Debug, Clone, Copy, Default)]
pub struct NamesOptions {
    /// Leave symbols in file order.
    pub unsorted: bool,
    pub reverse: bool,
    /// Only externals.
    pub externals_only: bool,
    /// Sort by value instead of name.
    pub by_value: bool,
    /// Suppress the object summary line.
    pub no_header: bool,
}

/// Format the name list of one object.
pub fn list(input: &[u8], opts: NamesOptions) -> Result<String> {
    let obj = ObjectData::parse(input.to_vec())?;
    let mut out = String::new();

    if !opts.no_header {
        out.push_str(&format!(
            "object base: {:04x} entry: {:04x} size {:04x}\n",
            obj.header.org, obj.header.entry, obj.header.bss_top
        ));
    }

    let mut symbols = obj.symbols()?;
    if opts.externals_only {
        symbols.retain(|s| s.tag >= 5);
    }
    if !opts.unsorted {
        if opts.by_value {
            symbols.sort_by_key(|s| s.value);
        } else {
            symbols.sort_by(|a, b| a.name.cmp(&b.name));
        }
    }
    if opts.reverse {
        symbols.reverse();
    }

    for sym in &symbols {
        out.push_str(&format!(
            "{:04x} {} {}\n",
            sym.value,
            SegTag::from_raw(sym.tag).letter(),
            sym.name
        ));
    }
    Ok(out)
}
