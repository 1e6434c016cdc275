use anyhow::{ensure, Result};

use crate::object::{self, ObjectData, ObjectHeader, SymbolRecord};
use crate::{HEADER_SIZE, SegTag};

/// Between-fixup copying runs in blocks of at most this many bytes.
const CHUNK: usize = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct RelocateOptions {
    pub verbose: bool,
    /// Drop the output symbol table.
    pub squash: bool,
    /// Give bss its own base and freeze bss symbols to absolute.
    pub bss_base: Option<u16>,
    /// Emit the bare patched binary: no header, no metadata.
    pub headerless: bool,
    /// Freeze text and data to absolute data.
    pub to_data: bool,
}

/// Move an object image to a new text origin, patching every in-segment
/// fix-up. Returns the rewritten image.
pub fn relocate(
    input: &[u8],
    target: u16,
    opts: RelocateOptions,
) -> Result<Vec<u8>> {
    ensure!(
        !(opts.headerless && (opts.to_data || opts.squash)),
        "invalid configuration"
    );

    let obj = ObjectData::parse(input.to_vec())?;
    let header = obj.header;
    ensure!(
        header.info.contains(object::Info::LINKABLE),
        "not relocatable"
    );

    // deltas from the old addresses to the new ones
    let mut tbase = target.wrapping_sub(header.org);
    let mut bbase = opts
        .bss_base
        .unwrap_or(0)
        .wrapping_sub(header.org)
        .wrapping_sub(header.data_top);
    if opts.headerless {
        tbase = tbase.wrapping_sub(HEADER_SIZE);
        bbase = bbase.wrapping_sub(HEADER_SIZE);
    }

    let mut out = Vec::with_capacity(input.len());
    if !opts.headerless {
        let new_header = ObjectHeader {
            org: target,
            // relocating the bss separately removes it from this image
            bss_top: if opts.bss_base.is_some() {
                header.data_top
            } else {
                header.bss_top
            },
            // freezing to data leaves no text behind
            text_top: if opts.to_data { 0 } else { header.text_top },
            ..header
        };
        new_header.write(&mut out);
    }

    // patch walk over text and data, externals pass through untouched
    let relocs = obj.relocs()?;
    let bytes = obj.segment_bytes();
    let mut pos = 0usize;
    for rec in relocs.iter().filter(|r| (1..=3).contains(&r.tag)) {
        ensure!(
            rec.addr >= HEADER_SIZE
                && rec.addr.wrapping_add(2) <= header.data_top,
            "cannot relocate byte"
        );
        let off = usize::from(rec.addr - HEADER_SIZE);
        while pos < off {
            let n = (off - pos).min(CHUNK);
            out.extend_from_slice(&bytes[pos..pos + n]);
            pos += n;
        }
        let value = u16::from_le_bytes([bytes[off], bytes[off + 1]]);
        let value = match rec.tag {
            3 if opts.bss_base.is_some() => value.wrapping_add(bbase),
            _ => value.wrapping_add(tbase),
        };
        out.extend_from_slice(&value.to_le_bytes());
        pos += 2;
    }
    while pos < bytes.len() {
        let n = (bytes.len() - pos).min(CHUNK);
        out.extend_from_slice(&bytes[pos..pos + n]);
        pos += n;
    }

    if opts.headerless {
        return Ok(out);
    }

    // relocation records survive unchanged, minus any frozen segment
    let kept: Vec<(u8, u16)> = relocs
        .iter()
        .filter(|r| {
            !(r.tag == 3 && opts.bss_base.is_some())
                && !((r.tag == 1 || r.tag == 2) && opts.to_data)
        })
        .map(|r| (r.tag, r.addr))
        .collect();
    object::write_reloc_section(&mut out, kept.len(), kept.into_iter());

    // symbols move with their segments; frozen segments become absolute
    let symbols = if opts.squash {
        Vec::new()
    } else {
        obj.symbols()?
            .into_iter()
            .map(|mut sym| {
                match SegTag::from_raw(sym.tag) {
                    SegTag::Text | SegTag::Data => {
                        sym.value = sym.value.wrapping_add(tbase);
                        if opts.to_data {
                            sym.tag = SegTag::Absolute.into_raw();
                        }
                    }
                    SegTag::Bss => {
                        if opts.bss_base.is_some() {
                            sym.value = sym.value.wrapping_add(bbase);
                            sym.tag = SegTag::Absolute.into_raw();
                        } else {
                            sym.value = sym.value.wrapping_add(tbase);
                        }
                    }
                    _ => {}
                }
                sym
            })
            .collect::<Vec<SymbolRecord>>()
    };
    object::write_symbol_section(&mut out, &symbols);

    if opts.verbose {
        println!(
            "relocated to {:04x}, {} fix-ups applied",
            target,
            relocs.iter().filter(|r| (1..=3).contains(&r.tag)).count()
        );
    }
    Ok(out)
}
