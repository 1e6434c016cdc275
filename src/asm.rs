use anyhow::{anyhow, Result};

use crate::isa;
use crate::lexer::{Lexer, Token};
use crate::object::{self, Info, ObjectHeader, SymbolRecord};
use crate::reloc::RelocList;
use crate::source::{ObjectWriter, SourceStream};
use crate::symtab::{Symbol, SymbolKind, SymbolTable};
use crate::{SegTag, TypedValue, HEADER_SIZE, SYMBOL_NAME_SIZE};

mod encode;
mod expr;

/// C-style escapes shared by character literals and string data.
pub(crate) fn escape_char(c: u8) -> Option<u8> {
    match c {
        b'a' => Some(0x07),
        b'b' => Some(0x08),
        b'e' => Some(0x1B),
        b'f' => Some(0x0C),
        b'n' => Some(0x0A),
        b'r' => Some(0x0D),
        b't' => Some(0x09),
        b'v' => Some(0x0B),
        b'\\' => Some(0x5C),
        b'\'' => Some(0x27),
        b'"' => Some(0x22),
        b'?' => Some(0x3F),
        _ => None,
    }
}

/// The two-pass assembler.
///
/// Pass 1 walks the source with emission simulated, sizing the three
/// segments and interning every name. Between passes the data and bss
/// symbols are shifted up to their final image positions, the source is
/// rewound and the header written. Pass 2 walks the same source again and
/// produces bytes, relocation entries and the export table.
pub struct Assembler {
    pub(crate) lex: Lexer,
    out: ObjectWriter,
    pub(crate) symtab: SymbolTable,
    pub(crate) pass2: bool,
    seg: SegTag,
    pub(crate) address: u16,
    text_top: u16,
    data_top: u16,
    bss_top: u16,
    pub(crate) loc_cnt: usize,
    text_relocs: RelocList,
    data_relocs: RelocList,
    auto_globl: bool,
    verbose: bool,
}

impl Assembler {
    pub fn new(src: SourceStream, auto_globl: bool, verbose: bool) -> Self {
        Assembler {
            lex: Lexer::new(src),
            out: ObjectWriter::new(),
            symtab: SymbolTable::new(),
            pass2: false,
            seg: SegTag::Text,
            address: 0,
            text_top: 0,
            data_top: 0,
            bss_top: 0,
            loc_cnt: 0,
            text_relocs: RelocList::new(),
            data_relocs: RelocList::new(),
            auto_globl,
            verbose,
        }
    }

    pub(crate) fn fail<T>(&self, msg: &str) -> Result<T> {
        Err(anyhow!("{}: {}", self.lex.status(), msg))
    }

    /// Run both passes and return the finished object image.
    pub fn assemble(&mut self) -> Result<Vec<u8>> {
        // room for the header; it is written for real on pass 2
        self.fill(HEADER_SIZE)?;
        self.run_pass()?;

        let image = self.between_passes();
        if self.verbose {
            println!(
                "first pass done, text {} data {} bss {}",
                self.data_top,
                self.bss_top.wrapping_sub(self.data_top),
                image.wrapping_sub(self.bss_top)
            );
        }
        self.emit_header(image)?;
        self.run_pass()?;

        self.out.append_spill();
        self.emit_meta();
        if self.verbose {
            println!("second pass done, {} byte image", image);
        }
        Ok(self.out.take())
    }

    /// Emit one byte into the current segment. Pass 1 only advances the
    /// address; bss never holds real bytes.
    pub(crate) fn emit(&mut self, b: u8) -> Result<()> {
        if self.pass2 {
            match self.seg {
                SegTag::Text => self.out.emit_text(b),
                SegTag::Data => self.out.emit_data(b),
                SegTag::Bss => {
                    if b != 0 {
                        return self.fail("data in bss");
                    }
                }
                _ => {}
            }
        }
        self.address = self.address.wrapping_add(1);
        Ok(())
    }

    pub(crate) fn fill(&mut self, mut n: u16) -> Result<()> {
        while n > 0 {
            self.emit(0)?;
            n -= 1;
        }
        Ok(())
    }

    fn record_reloc(&mut self, tag: u8) -> Result<()> {
        let addr = self.address;
        let status = self.lex.status();
        let list = match self.seg {
            SegTag::Text => &mut self.text_relocs,
            SegTag::Data => &mut self.data_relocs,
            // nothing in bss reaches the output, so there is nothing to fix
            _ => return Ok(()),
        };
        list.push(tag, addr)
            .map_err(|e| anyhow!("{}: {}", status, e))
    }

    /// Emit an evaluated 16-bit value, recording a relocation for anything
    /// that is not absolute.
    pub(crate) fn emit_word_value(&mut self, tv: TypedValue) -> Result<()> {
        match tv.tag {
            SegTag::Undefined => {
                if self.pass2 {
                    return self.fail("undefined symbol");
                }
            }
            SegTag::Text | SegTag::Data | SegTag::Bss => {
                if self.pass2 {
                    self.record_reloc(tv.tag.into_raw())?;
                }
            }
            SegTag::External(n) => {
                if self.pass2 {
                    self.record_reloc(n)?;
                }
            }
            SegTag::Absolute => {}
        }
        let [lo, hi] = tv.value.to_le_bytes();
        self.emit(lo)?;
        self.emit(hi)
    }

    /// Emit an evaluated 8-bit value. Segment-tagged values become
    /// PC-relative displacements; externals cannot shrink to a byte.
    pub(crate) fn emit_byte_value(&mut self, tv: TypedValue) -> Result<()> {
        match tv.tag {
            SegTag::Undefined => {
                if self.pass2 {
                    return self.fail("undefined symbol");
                }
                self.emit(0)
            }
            SegTag::Absolute => self.emit((tv.value & 0xFF) as u8),
            SegTag::Text | SegTag::Data | SegTag::Bss => {
                let rel = i32::from(tv.value) - i32::from(self.address) - 1;
                if self.pass2 && !(-128..=127).contains(&rel) {
                    return self.fail("relative out of bounds");
                }
                self.emit(rel as u8)
            }
            SegTag::External(_) => {
                if self.pass2 {
                    return self.fail("cannot relocate byte");
                }
                self.emit(0)
            }
        }
    }

    /// Bank the running address into the current segment's top and resume
    /// at the next segment's.
    fn switch_seg(&mut self, next: SegTag) {
        match self.seg {
            SegTag::Text => self.text_top = self.address,
            SegTag::Data => self.data_top = self.address,
            SegTag::Bss => self.bss_top = self.address,
            _ => {}
        }
        self.address = match next {
            SegTag::Text => self.text_top,
            SegTag::Data => self.data_top,
            SegTag::Bss => self.bss_top,
            _ => self.address,
        };
        self.seg = next;
    }

    /// Shift symbols to their final image addresses, turn the per-segment
    /// sizes into bases, rewind, and arm pass 2. Returns the total image
    /// size for the header.
    fn between_passes(&mut self) -> u16 {
        // bank the segment pass 1 ended in
        self.switch_seg(SegTag::Text);

        let text = self.text_top;
        let data = self.data_top;
        for sym in self.symtab.symbols_mut() {
            match sym.tag {
                SegTag::Data => sym.value = sym.value.wrapping_add(text),
                SegTag::Bss => {
                    sym.value = sym.value.wrapping_add(text.wrapping_add(data))
                }
                _ => {}
            }
        }
        for loc in self.symtab.locals_mut() {
            match loc.tag {
                SegTag::Data => loc.value = loc.value.wrapping_add(text),
                SegTag::Bss => {
                    loc.value = loc.value.wrapping_add(text.wrapping_add(data))
                }
                _ => {}
            }
        }

        let image = text.wrapping_add(data).wrapping_add(self.bss_top);
        self.bss_top = text.wrapping_add(data);
        self.data_top = text;
        self.text_top = 0;
        self.address = 0;
        self.seg = SegTag::Text;
        self.loc_cnt = 0;
        self.lex.src.rewind();
        self.pass2 = true;
        image
    }

    fn emit_header(&mut self, image: u16) -> Result<()> {
        let header = ObjectHeader {
            info: Info::LINKABLE,
            org: 0,
            syscall: 0,
            entry: 0,
            text_top: self.data_top,
            data_top: self.bss_top,
            bss_top: image,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        for b in bytes {
            self.emit(b)?;
        }
        Ok(())
    }

    /// The metadata tail: relocation section, then the export/external
    /// symbol section.
    fn emit_meta(&mut self) {
        let mut tail = Vec::new();

        let count = self.text_relocs.len() + self.data_relocs.len();
        object::write_reloc_section(
            &mut tail,
            count,
            self.text_relocs.iter().chain(self.data_relocs.iter()),
        );

        let mut records = Vec::new();
        for name in self.symtab.globals() {
            // existence was checked when the name was marked global
            if let Some(sym) = self.symtab.fetch(name) {
                records.push(SymbolRecord {
                    name: name.clone(),
                    tag: sym.tag.into_raw(),
                    value: sym.value,
                });
            }
        }
        for (i, name) in self.symtab.externs().iter().enumerate() {
            records.push(SymbolRecord {
                name: name.clone(),
                tag: 5 + i as u8,
                value: 0,
            });
        }
        object::write_symbol_section(&mut tail, &records);

        for b in tail {
            self.out.emit_text(b);
        }
    }

    fn run_pass(&mut self) -> Result<()> {
        let mut ifdepth = 0u32;
        let mut trdepth = 0u32;
        loop {
            let tok = self.lex.read_token();
            match tok {
                Token::Eof => {
                    if ifdepth != 0 {
                        return self.fail("unpaired .if");
                    }
                    return Ok(());
                }
                Token::Punct(b'.') => {
                    self.directive(&mut ifdepth, &mut trdepth)?
                }
                Token::Newline => {}
                _ if ifdepth > trdepth => self.lex.skip_line(),
                Token::Ident(name) => self.statement(&name)?,
                Token::Number(text) => self.local_label(&text)?,
                _ => return self.fail("unexpected token"),
            }
        }
    }

    fn directive(
        &mut self,
        ifdepth: &mut u32,
        trdepth: &mut u32,
    ) -> Result<()> {
        let Token::Ident(name) = self.lex.read_token() else {
            return self.fail("expected directive");
        };
        match name.as_str() {
            "if" => {
                if *ifdepth > *trdepth {
                    // dead block: count the nesting, skip the condition
                    *ifdepth += 1;
                    self.lex.skip_line();
                    return Ok(());
                }
                *ifdepth += 1;
                let tv = self.evaluate()?;
                if tv.tag != SegTag::Absolute {
                    return self.fail("must be absolute");
                }
                if tv.value != 0 {
                    *trdepth += 1;
                }
                self.lex.eol()
            }
            "endif" => {
                if *ifdepth == 0 {
                    return self.fail("unpaired .endif");
                }
                if *ifdepth == *trdepth {
                    *trdepth -= 1;
                }
                *ifdepth -= 1;
                self.lex.eol()
            }
            _ if *ifdepth > *trdepth => {
                self.lex.skip_line();
                Ok(())
            }
            "text" => {
                self.switch_seg(SegTag::Text);
                self.lex.eol()
            }
            "data" => {
                self.switch_seg(SegTag::Data);
                self.lex.eol()
            }
            "bss" => {
                self.switch_seg(SegTag::Bss);
                self.lex.eol()
            }
            "globl" => self.directive_globl(),
            "extern" => self.directive_extern(),
            "def" => {
                let Token::Ident(type_name) = self.lex.read_token() else {
                    return self.fail("expected symbol");
                };
                let count = self.bracket(true)?;
                self.define(&type_name, count)?;
                self.lex.eol()
            }
            "defl" => self.directive_defl(),
            "type" => {
                let Token::Ident(type_name) = self.lex.read_token() else {
                    return self.fail("expected symbol");
                };
                self.type_decl(&type_name)?;
                self.lex.eol()
            }
            _ => self.fail("unexpected token"),
        }
    }

    fn directive_globl(&mut self) -> Result<()> {
        loop {
            let Token::Ident(name) = self.lex.read_token() else {
                return self.fail("expected symbol");
            };
            if self.pass2 {
                let Some(sym) = self.symtab.fetch(&name) else {
                    return self.fail("undefined symbol");
                };
                match sym.tag {
                    SegTag::Undefined => {
                        return self.fail("undefined symbol")
                    }
                    SegTag::External(_) => {
                        return self.fail("cannot export external")
                    }
                    _ => {}
                }
                self.symtab.add_global(&name);
            }
            if self.lex.peek_char() == Some(b',') {
                self.lex.expect(b',')?;
            } else {
                break;
            }
        }
        self.lex.eol()
    }

    fn directive_extern(&mut self) -> Result<()> {
        loop {
            let Token::Ident(name) = self.lex.read_token() else {
                return self.fail("expected symbol");
            };
            if !self.pass2 {
                if let Some(sym) = self.symtab.fetch(&name) {
                    if sym.tag != SegTag::Undefined {
                        return self.fail("symbol redefined");
                    }
                }
                let Some(number) = self.symtab.add_extern(&name) else {
                    return self.fail("out of externals");
                };
                self.symtab.update(&name, SegTag::External(number), 0);
            }
            if self.lex.peek_char() == Some(b',') {
                self.lex.expect(b',')?;
            } else {
                break;
            }
        }
        self.lex.eol()
    }

    fn directive_defl(&mut self) -> Result<()> {
        let Token::Ident(type_name) = self.lex.read_token() else {
            return self.fail("expected symbol");
        };
        let count = self.bracket(true)?;
        let Token::Ident(label) = self.lex.read_token() else {
            return self.fail("expected symbol");
        };
        let (size, fields) = self.symtab.type_size(&type_name);
        if size == 0 {
            return self.fail("not a type");
        }
        if !self.pass2 {
            self.check_redefinition(&label)?;
        }
        let seg = self.seg;
        let addr = self.address;
        let sym = self.symtab.update(&label, seg, addr);
        sym.size = size;
        sym.kind = match fields {
            Some(fields) => SymbolKind::Type { fields },
            None => SymbolKind::Scalar,
        };
        self.define(&type_name, count)?;
        self.lex.eol()
    }

    fn check_redefinition(&self, name: &str) -> Result<()> {
        if let Some(sym) = self.symtab.fetch(name) {
            if !matches!(sym.tag, SegTag::Undefined | SegTag::Absolute) {
                return self.fail("symbol redefined");
            }
        }
        Ok(())
    }

    fn statement(&mut self, name: &str) -> Result<()> {
        if let Some(isr) = isa::lookup(name) {
            self.encode(isr)?;
            return self.lex.eol();
        }
        match self.lex.peek_char() {
            Some(b'=') => {
                self.lex.read_token();
                let tv = self.evaluate()?;
                if !self.pass2 {
                    self.check_redefinition(name)?;
                }
                self.symtab.update(name, tv.tag, tv.value);
                self.lex.eol()
            }
            Some(b':') => {
                if !self.pass2 {
                    self.check_redefinition(name)?;
                    let seg = self.seg;
                    let addr = self.address;
                    self.symtab.update(name, seg, addr);
                } else if self.auto_globl {
                    if let Some(sym) = self.symtab.fetch(name) {
                        if sym.tag.is_segment() {
                            self.symtab.add_global(name);
                        }
                    }
                }
                self.lex.read_token();
                Ok(())
            }
            _ => self.fail("unexpected symbol"),
        }
    }

    fn local_label(&mut self, text: &str) -> Result<()> {
        let value = self.num_parse(text)?;
        if value > 9 {
            return self.fail("local too large");
        }
        self.lex.expect(b':')?;
        self.loc_cnt += 1;
        if !self.pass2 {
            let seg = self.seg;
            let addr = self.address;
            self.symtab.local_add(value as u8, seg, addr);
        }
        Ok(())
    }

    /// `.type name { type field, ... }` — lay out a new aggregate. Sizing
    /// happens on pass 1; pass 2 only has to get past the body.
    fn type_decl(&mut self, name: &str) -> Result<()> {
        self.lex.expect(b'{')?;
        if self.pass2 {
            loop {
                match self.lex.peek_char() {
                    Some(b'}') | None => break,
                    _ => {
                        self.lex.read_token();
                    }
                }
            }
            return self.lex.expect(b'}');
        }

        if self.symtab.fetch(name).is_some() {
            return self.fail("type already defined");
        }
        self.symtab.update(name, SegTag::Absolute, 0);

        let mut fields: Vec<Symbol> = Vec::new();
        let mut base = 0u16;
        loop {
            let Token::Ident(field_type) = self.lex.read_token() else {
                return self.fail("expected symbol");
            };
            let (fsize, ffields) = self.symtab.type_size(&field_type);
            if fsize == 0 {
                return self.fail("not a type");
            }
            let mut count = self.bracket(true)?;
            if count == 0 {
                count = 1;
            }
            let Token::Ident(field_name) = self.lex.read_token() else {
                return self.fail("expected symbol");
            };
            fields.push(Symbol {
                name: field_name.chars().take(SYMBOL_NAME_SIZE).collect(),
                tag: SegTag::Absolute,
                value: base,
                size: fsize,
                kind: match ffields {
                    Some(fields) => SymbolKind::Type { fields },
                    None => SymbolKind::Scalar,
                },
            });
            base = base.wrapping_add(fsize.wrapping_mul(count));

            if self.lex.peek_char() == Some(b',') {
                self.lex.expect(b',')?;
            } else {
                break;
            }
        }

        let sym = self.symtab.update(name, SegTag::Absolute, 0);
        sym.size = base;
        sym.kind = SymbolKind::Type { fields };
        self.lex.expect(b'}')
    }

    /// `.def type[count] init, ...` — emit initialised values, padding
    /// each initialiser out to the type size.
    fn define(&mut self, type_name: &str, count: u16) -> Result<()> {
        let (size, fields) = self.symtab.type_size(type_name);
        if size == 0 {
            return self.fail("not a type");
        }

        let mut addr = self.address;
        let mut emitted = 0u16;
        while !matches!(self.lex.peek_char(), None | Some(b'\n')) {
            match self.lex.peek_char() {
                Some(b'"') => self.string_emit()?,
                Some(b'{') => {
                    let Some(fields) = &fields else {
                        return self.fail("not a type");
                    };
                    self.define_aggregate(fields, size)?;
                }
                _ => self.emit_expression(size)?,
            }

            // align to the next element boundary
            while self.address > addr {
                addr = addr.wrapping_add(size);
                emitted += 1;
            }
            self.fill(addr.wrapping_sub(self.address))?;

            if !matches!(self.lex.peek_char(), None | Some(b'\n')) {
                self.lex.expect(b',')?;
            }
        }

        if count != 0 {
            if emitted > count {
                return self.fail("define domain overrun");
            }
            self.fill(size.wrapping_mul(count - emitted))?;
        }
        Ok(())
    }

    /// A brace-delimited aggregate initialiser, one entry per field.
    fn define_aggregate(&mut self, fields: &[Symbol], size: u16) -> Result<()> {
        let base = self.address;
        self.lex.expect(b'{')?;

        for (idx, field) in fields.iter().enumerate() {
            let target = base.wrapping_add(field.value);
            if self.address > target {
                return self.fail("field domain overrun");
            }
            self.fill(target.wrapping_sub(self.address))?;

            match self.lex.peek_char() {
                Some(b'"') => self.string_emit()?,
                Some(b'{') => match field.fields() {
                    Some(inner) => {
                        self.define_aggregate(inner, field.size)?
                    }
                    None => return self.fail("not a type"),
                },
                _ => self.emit_expression(field.size)?,
            }

            if idx + 1 < fields.len() {
                self.lex.expect(b',')?;
            }
        }

        let end = base.wrapping_add(size);
        if self.address > end {
            return self.fail("field domain overrun");
        }
        self.fill(end.wrapping_sub(self.address))?;
        self.lex.expect(b'}')
    }

    fn emit_expression(&mut self, size: u16) -> Result<()> {
        let tv = self.evaluate()?;
        if size == 1 {
            self.emit_byte_value(tv)
        } else {
            self.emit_word_value(tv)
        }
    }

    /// A double-quoted string in data position. Simple escapes plus
    /// octal (`\nnn`) and hex (`\xNN`) numeric escapes.
    fn string_emit(&mut self) -> Result<()> {
        self.lex.next_char(); // opening quote
        loop {
            let Some(c) = self.lex.next_char() else {
                break;
            };
            match c {
                b'"' => break,
                b'\\' => {
                    let Some(e) = self.lex.next_char() else {
                        return self.fail("unknown escape");
                    };
                    if let Some(v) = escape_char(e) {
                        self.emit(v)?;
                    } else if e.is_ascii_digit() {
                        let first = e - b'0';
                        if first >= 8 {
                            return self.fail("radix mismatch in numeric");
                        }
                        let mut decode = u16::from(first);
                        let mut len = 1;
                        while len < 3 {
                            match self.lex.peek_char() {
                                Some(d @ b'0'..=b'7') => {
                                    self.lex.next_char();
                                    decode =
                                        decode * 8 + u16::from(d - b'0');
                                    len += 1;
                                }
                                _ => break,
                            }
                        }
                        self.emit((decode & 0xFF) as u8)?;
                    } else if e == b'x' {
                        let Some(first) =
                            self.lex.next_char().and_then(hex_val)
                        else {
                            return self
                                .fail("unexpected character in numeric");
                        };
                        let mut decode = u16::from(first);
                        if let Some(d) =
                            self.lex.peek_char().and_then(hex_val)
                        {
                            self.lex.next_char();
                            decode = decode * 16 + u16::from(d);
                        }
                        self.emit((decode & 0xFF) as u8)?;
                    } else {
                        return self.fail("unknown escape");
                    }
                }
                _ => self.emit(c)?,
            }
        }
        self.lex.skip_space();
        Ok(())
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}
