use std::io::Read;

use anyhow::{anyhow, ensure, Result};
use bitflags::bitflags;

use crate::{HEADER_SIZE, RELOC_REC_SIZE, SYMBOL_NAME_SIZE};

/// Object file magic, first two bytes of every header.
pub const MAGIC: [u8; 2] = [0x18, 0x0E];

bitflags! {
    /// Header info byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Info: u8 {
        /// Carries relocations and externals; may be linked further.
        const LINKABLE = 0b01;
        /// Fully linked, ready to execute.
        const LINKED = 0b10;
    }
}

/// Little-endian primitive reads, in the flavour the rest of the crate
/// expects.
pub trait ReadLe: Read {
    fn read_u8(&mut self) -> Result<u8> {
        Ok(bincode::deserialize_from(self)?)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(bincode::deserialize_from(self)?)
    }
}
impl<R: Read> ReadLe for R {}

pub fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// The 16-byte object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub info: Info,
    /// Address the image (header included) expects to load at.
    pub org: u16,
    /// Target of the `C3 lo hi` syscall jump vector.
    pub syscall: u16,
    /// Entry point, text-relative.
    pub entry: u16,
    /// Offset of the first byte past text, counted from address 0 and
    /// including the 16 header bytes.
    pub text_top: u16,
    pub data_top: u16,
    pub bss_top: u16,
}

impl ObjectHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        ensure!(data.len() >= HEADER_SIZE as usize, "not an object file");
        ensure!(data[0..2] == MAGIC, "not an object file");
        let mut input = &data[2..];
        let info = Info::from_bits_truncate(input.read_u8()?);
        let org = input.read_u16()?;
        let vector = input.read_u8()?;
        ensure!(vector == 0xC3, "not an object file");
        let syscall = input.read_u16()?;
        let entry = input.read_u16()?;
        let text_top = input.read_u16()?;
        let data_top = input.read_u16()?;
        let bss_top = input.read_u16()?;
        Ok(ObjectHeader {
            info,
            org,
            syscall,
            entry,
            text_top,
            data_top,
            bss_top,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.push(self.info.bits());
        push_u16(out, self.org);
        out.push(0xC3);
        push_u16(out, self.syscall);
        push_u16(out, self.entry);
        push_u16(out, self.text_top);
        push_u16(out, self.data_top);
        push_u16(out, self.bss_top);
    }

    /// Text bytes on disk (the header does not count).
    pub fn text_size(&self) -> u16 {
        self.text_top.saturating_sub(HEADER_SIZE)
    }

    pub fn data_size(&self) -> u16 {
        self.data_top.saturating_sub(self.text_top)
    }

    pub fn bss_size(&self) -> u16 {
        self.bss_top.saturating_sub(self.data_top)
    }
}

/// One relocation record: the tag of the referenced segment (or the
/// external number) and the image-absolute address of the patched word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocRecord {
    pub tag: u8,
    pub addr: u16,
}

/// One symbol record as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub name: String,
    pub tag: u8,
    pub value: u16,
}

pub fn name_bytes(name: &str) -> [u8; SYMBOL_NAME_SIZE] {
    let mut out = [0u8; SYMBOL_NAME_SIZE];
    for (slot, byte) in out.iter_mut().zip(name.bytes()) {
        *slot = byte;
    }
    out
}

/// `u16 count`, `count` 3-byte records, 3-byte zero terminator.
pub fn write_reloc_section<I>(out: &mut Vec<u8>, count: usize, records: I)
where
    I: Iterator<Item = (u8, u16)>,
{
    push_u16(out, count as u16);
    for (tag, addr) in records {
        out.push(tag);
        push_u16(out, addr);
    }
    out.extend_from_slice(&[0, 0, 0]);
}

pub fn read_reloc_section(input: &mut impl Read) -> Result<Vec<RelocRecord>> {
    let count = input.read_u16()?;
    let mut records = Vec::with_capacity(count.into());
    for _ in 0..count {
        let tag = input.read_u8()?;
        let addr = input.read_u16()?;
        records.push(RelocRecord { tag, addr });
    }
    let mut terminator = [0u8; RELOC_REC_SIZE];
    input.read_exact(&mut terminator)?;
    ensure!(terminator == [0, 0, 0], "corrupt relocation section");
    Ok(records)
}

/// `u16 count`, `count` 11-byte records (8 name bytes, tag, LE value).
pub fn write_symbol_section(out: &mut Vec<u8>, records: &[SymbolRecord]) {
    push_u16(out, records.len() as u16);
    for rec in records {
        out.extend_from_slice(&name_bytes(&rec.name));
        out.push(rec.tag);
        push_u16(out, rec.value);
    }
}

pub fn read_symbol_section(input: &mut impl Read) -> Result<Vec<SymbolRecord>> {
    let count = input.read_u16()?;
    let mut records = Vec::with_capacity(count.into());
    for _ in 0..count {
        let mut name = [0u8; SYMBOL_NAME_SIZE];
        input.read_exact(&mut name)?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = String::from_utf8_lossy(&name[..end]).into_owned();
        let tag = input.read_u8()?;
        let value = input.read_u16()?;
        records.push(SymbolRecord { name, tag, value });
    }
    Ok(records)
}

/// A whole object file held in memory, with section accessors.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub header: ObjectHeader,
    pub data: Vec<u8>,
}

impl ObjectData {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let header = ObjectHeader::parse(&data)?;
        ensure!(
            data.len() >= usize::from(header.data_top),
            "truncated object file"
        );
        Ok(ObjectData { header, data })
    }

    /// File offset where the relocation section starts: right after the
    /// data segment, which is also the image offset `data_top`.
    fn reloc_offset(&self) -> usize {
        usize::from(self.header.data_top)
    }

    pub fn relocs(&self) -> Result<Vec<RelocRecord>> {
        let mut input = &self.data[self.reloc_offset()..];
        read_reloc_section(&mut input)
    }

    pub fn symbols(&self) -> Result<Vec<SymbolRecord>> {
        let mut input = &self.data[self.reloc_offset()..];
        let count = usize::from((&mut input).read_u16()?);
        let skip = count * RELOC_REC_SIZE + RELOC_REC_SIZE;
        input = input
            .get(skip..)
            .ok_or_else(|| anyhow!("truncated object file"))?;
        read_symbol_section(&mut input)
    }

    /// The segment bytes as stored on disk: text then data.
    pub fn segment_bytes(&self) -> &[u8] {
        &self.data[usize::from(HEADER_SIZE)..self.reloc_offset()]
    }
}
