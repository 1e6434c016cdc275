use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Result};

use crate::archive;
use crate::object::{
    self, Info, ObjectData, RelocRecord, SymbolRecord,
};
use crate::reloc::RelocList;
use crate::{SegTag, HEADER_SIZE};

/// Patch copying runs in blocks of at most this many bytes.
const CHUNK: usize = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOptions {
    pub verbose: bool,
    /// Keep unresolved externals and emit a linkable object.
    pub relocatable: bool,
    /// Drop the output symbol table.
    pub squash: bool,
}

/// One input, either a plain object file or a whole archive.
pub struct LinkInput {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl LinkInput {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|_| anyhow!("cannot open {}", path.display()))?;
        Ok(LinkInput {
            name: path.display().to_string(),
            bytes,
        })
    }
}

/// An external symbol prototype, shared by every object that references
/// the name.
struct Extrn {
    name: String,
    tag: SegTag,
    value: u16,
    source: Option<usize>,
    /// Fresh number handed out when the external survives a `-r` link.
    out_number: u8,
}

/// A checked-in object and its place in the output image.
struct LinkObject {
    name: String,
    /// 1-based member number when the object came out of an archive.
    archive_index: usize,
    data: ObjectData,
    text_base: u16,
    data_base: u16,
    bss_base: u16,
    /// Local external number -> index into the extrn table.
    ext_map: Vec<(u8, usize)>,
}

struct ArchiveInput {
    name: String,
    bytes: Vec<u8>,
    members: Vec<archive::ArchiveMember>,
    loaded: Vec<bool>,
}

#[derive(Default)]
pub struct Linker {
    opts: LinkOptions,
    objects: Vec<LinkObject>,
    extrns: Vec<Extrn>,
    archives: Vec<ArchiveInput>,
}

pub fn link_paths<P: AsRef<Path>>(
    paths: &[P],
    opts: LinkOptions,
) -> Result<Vec<u8>> {
    let inputs = paths
        .iter()
        .map(LinkInput::from_path)
        .collect::<Result<Vec<_>>>()?;
    link(inputs, opts)
}

/// Run a whole link and return the output object image.
pub fn link(inputs: Vec<LinkInput>, opts: LinkOptions) -> Result<Vec<u8>> {
    ensure!(
        !(opts.squash && opts.relocatable),
        "invalid configuration"
    );
    let mut linker = Linker {
        opts,
        ..Linker::default()
    };
    linker.check_in_inputs(inputs)?;
    linker.resolve()?;
    linker.diagnose_unresolved()?;
    linker.compute_bases();
    linker.fix_externals()?;
    let globals = linker.fix_globals()?;
    linker.emit(globals)
}

impl Linker {
    /// Check-in phase: plain objects enter the object list immediately,
    /// archives are recorded for demand loading.
    fn check_in_inputs(&mut self, inputs: Vec<LinkInput>) -> Result<()> {
        for input in inputs {
            if archive::is_archive(&input.bytes) {
                let members = archive::members(&input.bytes)?;
                let loaded = vec![false; members.len()];
                self.archives.push(ArchiveInput {
                    name: input.name,
                    bytes: input.bytes,
                    members,
                    loaded,
                });
            } else {
                self.check_in(input.name, input.bytes, 0)?;
            }
        }
        ensure!(!self.objects.is_empty() || !self.archives.is_empty(), "no input files");
        Ok(())
    }

    /// Parse one object, verify it is linkable, and collect its external
    /// references as extrn prototypes.
    fn check_in(
        &mut self,
        name: String,
        bytes: Vec<u8>,
        archive_index: usize,
    ) -> Result<()> {
        let data = ObjectData::parse(bytes)
            .map_err(|_| anyhow!("{} not an object file", name))?;
        ensure!(
            data.header.info.contains(Info::LINKABLE),
            "{} not linkable",
            name
        );

        let mut ext_map = Vec::new();
        for sym in data.symbols()? {
            if sym.tag >= 5 {
                let idx = match self
                    .extrns
                    .iter()
                    .position(|e| e.name == sym.name)
                {
                    Some(idx) => idx,
                    None => {
                        self.extrns.push(Extrn {
                            name: sym.name.clone(),
                            tag: SegTag::Undefined,
                            value: 0,
                            source: None,
                            out_number: 0,
                        });
                        self.extrns.len() - 1
                    }
                };
                ext_map.push((sym.tag, idx));
            }
        }

        self.objects.push(LinkObject {
            name,
            archive_index,
            data,
            text_base: 0,
            data_base: 0,
            bss_base: 0,
            ext_map,
        });
        Ok(())
    }

    /// Resolution phase. Internal symbols of checked-in objects bind
    /// matching externals; archive members that define a wanted name are
    /// loaded on demand. Repeats until a scan loads nothing new.
    fn resolve(&mut self) -> Result<()> {
        loop {
            for obj_idx in 0..self.objects.len() {
                let symbols = self.objects[obj_idx].data.symbols()?;
                for sym in symbols {
                    if (1..=4).contains(&sym.tag) {
                        self.bind(obj_idx, &sym)?;
                    }
                }
            }

            let mut loaded = false;
            for a_idx in 0..self.archives.len() {
                for m_idx in 0..self.archives[a_idx].members.len() {
                    if self.archives[a_idx].loaded[m_idx] {
                        continue;
                    }
                    if self.member_wanted(a_idx, m_idx)? {
                        let (name, bytes) = {
                            let arch = &self.archives[a_idx];
                            let member = &arch.members[m_idx];
                            (
                                format!("{}({})", arch.name, member.name),
                                archive::member_bytes(&arch.bytes, member)
                                    .to_vec(),
                            )
                        };
                        self.check_in(name, bytes, m_idx + 1)?;
                        self.archives[a_idx].loaded[m_idx] = true;
                        loaded = true;
                    }
                }
            }
            if !loaded {
                return Ok(());
            }
        }
    }

    fn bind(&mut self, obj_idx: usize, sym: &SymbolRecord) -> Result<()> {
        let Some(ext) = self.extrns.iter_mut().find(|e| e.name == sym.name)
        else {
            return Ok(());
        };
        match ext.source {
            None => {
                ext.source = Some(obj_idx);
                ext.tag = SegTag::from_raw(sym.tag);
                ext.value = sym.value;
                Ok(())
            }
            Some(prev) if prev == obj_idx => Ok(()),
            Some(_) => bail!("symbol {} already defined", sym.name),
        }
    }

    /// Does this archive member define a still-unbound external?
    fn member_wanted(&self, a_idx: usize, m_idx: usize) -> Result<bool> {
        let arch = &self.archives[a_idx];
        let bytes =
            archive::member_bytes(&arch.bytes, &arch.members[m_idx]);
        let Ok(data) = ObjectData::parse(bytes.to_vec()) else {
            // non-object members are simply never wanted
            return Ok(false);
        };
        for sym in data.symbols()? {
            if (1..=4).contains(&sym.tag)
                && self
                    .extrns
                    .iter()
                    .any(|e| e.source.is_none() && e.name == sym.name)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Unbound externals either get fresh output numbers (`-r`) or kill
    /// the link.
    fn diagnose_unresolved(&mut self) -> Result<()> {
        let unresolved: Vec<usize> = self
            .extrns
            .iter()
            .enumerate()
            .filter(|(_, e)| e.source.is_none())
            .map(|(i, _)| i)
            .collect();
        if unresolved.is_empty() {
            return Ok(());
        }
        if !self.opts.relocatable {
            let names: Vec<&str> = unresolved
                .iter()
                .map(|&i| self.extrns[i].name.as_str())
                .collect();
            bail!("undefined: {}", names.join(" "));
        }
        ensure!(unresolved.len() <= 250, "too many externals");
        for (n, idx) in unresolved.into_iter().enumerate() {
            self.extrns[idx].out_number = 5 + n as u8;
        }
        Ok(())
    }

    /// All text segments first, then all data, then all bss, starting
    /// right after the output header.
    fn compute_bases(&mut self) {
        let mut addr = HEADER_SIZE;
        for obj in &mut self.objects {
            obj.text_base = addr;
            addr = addr.wrapping_add(obj.data.header.text_size());
        }
        for obj in &mut self.objects {
            obj.data_base = addr;
            addr = addr.wrapping_add(obj.data.header.data_size());
        }
        for obj in &mut self.objects {
            obj.bss_base = addr;
            addr = addr.wrapping_add(obj.data.header.bss_size());
        }

        if self.opts.verbose {
            println!("object file base/size:");
            for obj in &self.objects {
                let origin = if obj.archive_index != 0 {
                    format!("{} record {}", obj.name, obj.archive_index)
                } else {
                    obj.name.clone()
                };
                println!(
                    "\ttext: {:04x}:{:04x}, data: {:04x}:{:04x}, bss: {:04x}:{:04x} <- {}",
                    obj.text_base,
                    obj.data.header.text_size(),
                    obj.data_base,
                    obj.data.header.data_size(),
                    obj.bss_base,
                    obj.data.header.bss_size(),
                    origin,
                );
            }
        }
    }

    /// Translate a value from an object's own image space into the output
    /// image, according to the segment it points at.
    fn sreloc(&self, value: u16, tag: SegTag, obj: &LinkObject) -> Result<u16> {
        let header = &obj.data.header;
        let norm = value
            .wrapping_sub(header.org)
            .wrapping_sub(HEADER_SIZE);
        match tag {
            SegTag::Absolute => Ok(value),
            SegTag::Text => Ok(norm.wrapping_add(obj.text_base)),
            SegTag::Data => Ok(norm
                .wrapping_sub(header.text_size())
                .wrapping_add(obj.data_base)),
            SegTag::Bss => Ok(norm
                .wrapping_sub(header.text_size())
                .wrapping_sub(header.data_size())
                .wrapping_add(obj.bss_base)),
            _ => bail!("undefined segment"),
        }
    }

    fn fix_externals(&mut self) -> Result<()> {
        for i in 0..self.extrns.len() {
            let Some(src) = self.extrns[i].source else {
                continue;
            };
            let tag = self.extrns[i].tag;
            let value = self.extrns[i].value;
            let fixed = self.sreloc(value, tag, &self.objects[src])?;
            self.extrns[i].value = fixed;
        }
        Ok(())
    }

    /// Merge every object's exported symbols, translated to their final
    /// addresses. A name defined twice is fatal.
    fn fix_globals(&mut self) -> Result<Vec<SymbolRecord>> {
        let mut out: Vec<SymbolRecord> = Vec::new();
        for obj in &self.objects {
            for sym in obj.data.symbols()? {
                if !(0..=4).contains(&sym.tag) {
                    continue;
                }
                ensure!(
                    sym.tag != 0,
                    "symbol {} is undefined",
                    sym.name
                );
                ensure!(
                    !out.iter().any(|s| s.name == sym.name),
                    "symbol {} already defined",
                    sym.name
                );
                let value =
                    self.sreloc(sym.value, SegTag::from_raw(sym.tag), obj)?;
                out.push(SymbolRecord {
                    name: sym.name,
                    tag: sym.tag,
                    value,
                });
            }
        }

        if self.opts.verbose {
            println!("symbol type/value:");
            for sym in &out {
                println!(
                    "\t{:8}: {:04x} {}",
                    sym.name,
                    sym.value,
                    match sym.tag {
                        1 => "text",
                        2 => "data",
                        3 => "bss",
                        _ => "abs",
                    }
                );
            }
        }
        Ok(out)
    }

    /// Emission: header, patched text and data streams, then the
    /// relocation and symbol sections.
    fn emit(&mut self, globals: Vec<SymbolRecord>) -> Result<Vec<u8>> {
        ensure!(!self.objects.is_empty(), "no input files");

        let mut out = Vec::new();
        let tail = self.objects.last().unwrap();
        let info = if self.opts.relocatable {
            Info::LINKABLE
        } else {
            Info::LINKABLE | Info::LINKED
        };
        let header = object::ObjectHeader {
            info,
            org: 0,
            syscall: 0,
            entry: 0,
            text_top: tail
                .text_base
                .wrapping_add(tail.data.header.text_size()),
            data_top: tail
                .data_base
                .wrapping_add(tail.data.header.data_size()),
            bss_top: tail
                .bss_base
                .wrapping_add(tail.data.header.bss_size()),
        };
        header.write(&mut out);

        let mut out_relocs = RelocList::new();
        for seg in [SegTag::Text, SegTag::Data] {
            for obj_idx in 0..self.objects.len() {
                self.emit_segment(obj_idx, seg, &mut out, &mut out_relocs)?;
            }
        }

        object::write_reloc_section(
            &mut out,
            out_relocs.len(),
            out_relocs.iter(),
        );

        let mut records = if self.opts.squash { Vec::new() } else { globals };
        for ext in &self.extrns {
            if ext.source.is_none() {
                records.push(SymbolRecord {
                    name: ext.name.clone(),
                    tag: ext.out_number,
                    value: 0,
                });
            }
        }
        object::write_symbol_section(&mut out, &records);
        Ok(out)
    }

    /// Stream one segment of one object into the output, applying every
    /// patch its relocation list names.
    fn emit_segment(
        &self,
        obj_idx: usize,
        seg: SegTag,
        out: &mut Vec<u8>,
        out_relocs: &mut RelocList,
    ) -> Result<()> {
        let obj = &self.objects[obj_idx];
        let header = &obj.data.header;

        // span of this segment inside the input file
        let (start, len, out_base) = match seg {
            SegTag::Text => (HEADER_SIZE, header.text_size(), obj.text_base),
            _ => (
                HEADER_SIZE.wrapping_add(header.text_size()),
                header.data_size(),
                obj.data_base,
            ),
        };
        let lo = start;
        let hi = start.wrapping_add(len);
        let bytes = &obj.data.data
            [usize::from(start)..usize::from(start) + usize::from(len)];

        let fixups: Vec<RelocRecord> = obj
            .data
            .relocs()?
            .into_iter()
            .filter(|r| r.addr >= lo && r.addr < hi)
            .collect();

        let mut pos = 0usize;
        for fixup in fixups {
            let off = usize::from(fixup.addr - lo);
            ensure!(
                off + 2 <= bytes.len(),
                "cannot relocate byte in {}",
                obj.name
            );
            // copy verbatim up to the fix-up, in bounded blocks
            while pos < off {
                let n = (off - pos).min(CHUNK);
                out.extend_from_slice(&bytes[pos..pos + n]);
                pos += n;
            }

            let word =
                u16::from_le_bytes([bytes[off], bytes[off + 1]]);
            let out_addr = out_base.wrapping_add(fixup.addr - lo);
            let patched = if (1..=3).contains(&fixup.tag) {
                let tag = SegTag::from_raw(fixup.tag);
                out_relocs.push(fixup.tag, out_addr)?;
                self.sreloc(word, tag, obj)?
            } else {
                let ext_idx = obj
                    .ext_map
                    .iter()
                    .find(|(n, _)| *n == fixup.tag)
                    .map(|(_, i)| *i)
                    .ok_or_else(|| {
                        anyhow!("cannot resolve external in {}", obj.name)
                    })?;
                let ext = &self.extrns[ext_idx];
                match ext.source {
                    Some(_) => {
                        if ext.tag.is_segment() {
                            out_relocs
                                .push(ext.tag.into_raw(), out_addr)?;
                        }
                        word.wrapping_add(ext.value)
                    }
                    None => {
                        // survives only in relocatable output
                        out_relocs.push(ext.out_number, out_addr)?;
                        word
                    }
                }
            };
            out.extend_from_slice(&patched.to_le_bytes());
            pos += 2;
        }
        while pos < bytes.len() {
            let n = (bytes.len() - pos).min(CHUNK);
            out.extend_from_slice(&bytes[pos..pos + n]);
            pos += n;
        }
        Ok(())
    }
}
