use anyhow::Result;

use super::Assembler;
use crate::isa::{
    operand_lookup, Family, Instruction, Operand, ARITH_ADD, ARITH_UNARY,
};
use crate::lexer::Token;
use crate::{SegTag, TypedValue};

/// A parsed operand: its class code plus the evaluated expression for the
/// immediate and displaced forms.
pub(crate) struct Arg {
    class: Operand,
    value: TypedValue,
}

impl Arg {
    fn of(class: Operand) -> Self {
        Arg {
            class,
            value: TypedValue::absolute(0),
        }
    }
}

impl Assembler {
    /// Assemble one instruction whose mnemonic has already been matched.
    pub(crate) fn encode(&mut self, isr: &Instruction) -> Result<()> {
        match isr.family {
            Family::Basic => self.emit(isr.opcode),
            Family::BasicExt => {
                self.emit(isr.arg)?;
                self.emit(isr.opcode)
            }
            Family::Arith => self.encode_arith(isr),
            Family::Incr => self.encode_incr(isr),
            Family::Bitsh => self.encode_bitsh(isr),
            Family::Stack => self.encode_stack(isr),
            Family::Ret => self.encode_ret(isr),
            Family::Jump => self.encode_jump(isr),
            Family::JumpRel => self.encode_jump_rel(isr),
            Family::Call => self.encode_call(isr),
            Family::Rst => self.encode_rst(isr),
            Family::IoIn => self.encode_io_in(isr),
            Family::IoOut => self.encode_io_out(isr),
            Family::Exchange => self.encode_exchange(isr),
            Family::IntMode => self.encode_int_mode(isr),
            Family::Load => self.encode_load(),
        }
    }

    /// Read one operand. Register, flag and indirect spellings win over
    /// expressions; anything unrecognised is evaluated.
    fn parse_arg(&mut self) -> Result<Arg> {
        if self.lex.peek_char() == Some(b'(') {
            self.lex.read_token();
            let tok = self.lex.read_token();
            if let Token::Ident(name) = &tok {
                if let Some(op) = operand_lookup(name) {
                    return match op {
                        Operand::Hl => self.close_indirect(Operand::IndHl),
                        Operand::C => self.close_indirect(Operand::IndC),
                        Operand::Sp => self.close_indirect(Operand::IndSp),
                        Operand::Bc => self.close_indirect(Operand::IndBc),
                        Operand::De => self.close_indirect(Operand::IndDe),
                        Operand::Ix | Operand::Iy => self.parse_indexed(op),
                        _ => self.fail("invalid operand"),
                    };
                }
            }
            let tv = self.evaluate_with(Some(tok))?;
            self.lex.expect(b')')?;
            return Ok(Arg {
                class: Operand::IndImm,
                value: tv,
            });
        }

        let tok = self.lex.read_token();
        if let Token::Ident(name) = &tok {
            if let Some(op) = operand_lookup(name) {
                if op == Operand::Af && self.lex.peek_char() == Some(b'\'') {
                    // the shadow set in ex af,af'
                    self.lex.next_char();
                }
                return Ok(Arg::of(op));
            }
        }
        if matches!(tok, Token::Newline | Token::Eof) {
            return self.fail("invalid operand");
        }
        let tv = self.evaluate_with(Some(tok))?;
        Ok(Arg {
            class: Operand::Imm,
            value: tv,
        })
    }

    fn close_indirect(&mut self, class: Operand) -> Result<Arg> {
        self.lex.expect(b')')?;
        Ok(Arg::of(class))
    }

    /// `(ix)` or `(ix+d)` / `(ix-d)`; displacements must be absolute.
    fn parse_indexed(&mut self, reg: Operand) -> Result<Arg> {
        let displaced = match reg {
            Operand::Ix => (Operand::IndIx, Operand::IndIxd),
            _ => (Operand::IndIy, Operand::IndIyd),
        };
        match self.lex.peek_char() {
            Some(b')') => {
                self.lex.read_token();
                Ok(Arg::of(displaced.0))
            }
            Some(sign @ (b'+' | b'-')) => {
                self.lex.read_token();
                let tv = self.evaluate()?;
                let value = match tv.tag {
                    SegTag::Absolute => {
                        let v = if sign == b'-' {
                            0u16.wrapping_sub(tv.value)
                        } else {
                            tv.value
                        };
                        if !(-128..=127).contains(&(v as i16)) {
                            return self.fail("index out of range");
                        }
                        v
                    }
                    SegTag::Undefined => {
                        if self.pass2 {
                            return self.fail("undefined symbol");
                        }
                        0
                    }
                    _ => return self.fail("must be absolute"),
                };
                self.lex.expect(b')')?;
                Ok(Arg {
                    class: displaced.1,
                    value: TypedValue::absolute(value),
                })
            }
            _ => self.fail("unexpected character"),
        }
    }

    /// A value that must be absolute (or still unresolved on pass 1).
    fn absolute_value(&self, tv: TypedValue) -> Result<u16> {
        match tv.tag {
            SegTag::Absolute => Ok(tv.value),
            SegTag::Undefined => {
                if self.pass2 {
                    self.fail("undefined symbol")
                } else {
                    Ok(0)
                }
            }
            _ => self.fail("must be absolute"),
        }
    }

    /// Prefix + opcode + displacement for any operand living in an 8-bit
    /// register slot.
    fn emit_reg8(&mut self, arg: &Arg, opcode: u8) -> Result<()> {
        if let Some(p) = arg.class.index_prefix() {
            self.emit(p)?;
        }
        self.emit(opcode)?;
        if arg.class.is_indexed_mem() {
            self.emit((arg.value.value & 0xFF) as u8)?;
        }
        Ok(())
    }

    fn encode_arith(&mut self, isr: &Instruction) -> Result<()> {
        let mut arg = self.parse_arg()?;

        match arg.class {
            // 16-bit forms: add/adc/sbc hl,rr and add ix/iy,rr
            Operand::Hl if isr.arg != ARITH_UNARY => {
                self.lex.expect(b',')?;
                let rhs = self.parse_arg()?;
                let bits = match rhs.class {
                    Operand::Bc | Operand::De | Operand::Hl | Operand::Sp => {
                        rhs.class.pair_bits().unwrap()
                    }
                    _ => return self.fail("invalid operand"),
                };
                return if isr.arg == ARITH_ADD {
                    self.emit(0x09 | bits)
                } else {
                    self.emit(0xED)?;
                    let base = if isr.opcode == 0x88 { 0x4A } else { 0x42 };
                    self.emit(base | bits)
                };
            }
            Operand::Ix | Operand::Iy if isr.arg == ARITH_ADD => {
                let prefix = arg.class.index_prefix().unwrap();
                self.lex.expect(b',')?;
                let rhs = self.parse_arg()?;
                let bits = match rhs.class {
                    Operand::Bc | Operand::De | Operand::Sp => {
                        rhs.class.pair_bits().unwrap()
                    }
                    c if c == arg.class => 0x20,
                    _ => return self.fail("invalid operand"),
                };
                self.emit(prefix)?;
                return self.emit(0x09 | bits);
            }
            // explicit accumulator: operate on what follows the comma
            Operand::A if self.lex.peek_char() == Some(b',') => {
                self.lex.expect(b',')?;
                arg = self.parse_arg()?;
            }
            _ => {}
        }

        if arg.class == Operand::Imm {
            self.emit(isr.opcode.wrapping_add(0x46))?;
            return self.emit_byte_value(arg.value);
        }
        match arg.class.reg8() {
            Some(code) => self.emit_reg8(&arg, isr.opcode | code),
            None => self.fail("invalid operand"),
        }
    }

    fn encode_incr(&mut self, isr: &Instruction) -> Result<()> {
        let arg = self.parse_arg()?;
        match arg.class {
            Operand::Bc | Operand::De | Operand::Hl | Operand::Sp => {
                self.emit(isr.arg | arg.class.pair_bits().unwrap())
            }
            Operand::Ix | Operand::Iy => {
                self.emit(arg.class.index_prefix().unwrap())?;
                self.emit(isr.arg | 0x20)
            }
            _ => match arg.class.reg8() {
                Some(code) => self.emit_reg8(&arg, isr.opcode | (code << 3)),
                None => self.fail("invalid operand"),
            },
        }
    }

    fn encode_bitsh(&mut self, isr: &Instruction) -> Result<()> {
        let bit = if isr.arg == 1 {
            let arg = self.parse_arg()?;
            if arg.class != Operand::Imm {
                return self.fail("invalid operand");
            }
            let v = self.absolute_value(arg.value)?;
            if v > 7 {
                return self.fail("bit out of range");
            }
            self.lex.expect(b',')?;
            (v as u8) << 3
        } else {
            0
        };

        let arg = self.parse_arg()?;
        match arg.class {
            Operand::IndIxd | Operand::IndIyd => {
                let prefix = arg.class.index_prefix().unwrap();
                // undocumented: a trailing register receives the result
                let reg = if self.lex.peek_char() == Some(b',') {
                    self.lex.expect(b',')?;
                    let r = self.parse_arg()?;
                    match u8::from(r.class) {
                        code @ 0..=7 if r.class != Operand::IndHl => code,
                        _ => return self.fail("invalid operand"),
                    }
                } else {
                    6
                };
                self.emit(prefix)?;
                self.emit(0xCB)?;
                self.emit((arg.value.value & 0xFF) as u8)?;
                self.emit(isr.opcode | bit | reg)
            }
            _ => match u8::from(arg.class) {
                code @ 0..=7 => {
                    self.emit(0xCB)?;
                    self.emit(isr.opcode | bit | code)
                }
                _ => self.fail("invalid operand"),
            },
        }
    }

    fn encode_stack(&mut self, isr: &Instruction) -> Result<()> {
        let arg = self.parse_arg()?;
        match arg.class {
            Operand::Bc | Operand::De | Operand::Hl | Operand::Af => {
                self.emit(isr.opcode | arg.class.pair_bits().unwrap())
            }
            Operand::Ix | Operand::Iy => {
                self.emit(arg.class.index_prefix().unwrap())?;
                self.emit(isr.opcode | 0x20)
            }
            _ => self.fail("invalid operand"),
        }
    }

    fn encode_ret(&mut self, isr: &Instruction) -> Result<()> {
        if matches!(self.lex.peek_char(), None | Some(b'\n')) {
            return self.emit(isr.arg);
        }
        let arg = self.parse_arg()?;
        match arg.class.flag_bits() {
            Some(bits) => self.emit(isr.opcode | bits),
            None => self.fail("invalid operand"),
        }
    }

    fn encode_jump(&mut self, isr: &Instruction) -> Result<()> {
        let arg = self.parse_arg()?;
        if let Some(bits) = arg.class.flag_bits() {
            self.emit(isr.opcode | bits)?;
            self.lex.expect(b',')?;
            let target = self.parse_arg()?;
            if target.class != Operand::Imm {
                return self.fail("invalid operand");
            }
            return self.emit_word_value(target.value);
        }
        match arg.class {
            Operand::IndHl => self.emit(isr.arg),
            Operand::IndIx | Operand::IndIy => {
                self.emit(arg.class.index_prefix().unwrap())?;
                self.emit(isr.arg)
            }
            Operand::Imm => {
                self.emit(0xC3)?;
                self.emit_word_value(arg.value)
            }
            _ => self.fail("invalid operand"),
        }
    }

    fn encode_jump_rel(&mut self, isr: &Instruction) -> Result<()> {
        let arg = self.parse_arg()?;
        // jr takes the four low conditions; djnz takes none
        if isr.arg == 1 {
            if let Some(bits) = arg.class.flag_bits() {
                if bits > 3 << 3 {
                    return self.fail("invalid operand");
                }
                self.emit(0x20 | bits)?;
                self.lex.expect(b',')?;
                let target = self.parse_arg()?;
                if target.class != Operand::Imm {
                    return self.fail("invalid operand");
                }
                return self.emit_byte_value(target.value);
            }
        }
        if arg.class != Operand::Imm {
            return self.fail("invalid operand");
        }
        self.emit(isr.opcode)?;
        self.emit_byte_value(arg.value)
    }

    fn encode_call(&mut self, isr: &Instruction) -> Result<()> {
        let arg = self.parse_arg()?;
        if let Some(bits) = arg.class.flag_bits() {
            self.emit(isr.opcode | bits)?;
            self.lex.expect(b',')?;
            let target = self.parse_arg()?;
            if target.class != Operand::Imm {
                return self.fail("invalid operand");
            }
            return self.emit_word_value(target.value);
        }
        if arg.class != Operand::Imm {
            return self.fail("invalid operand");
        }
        self.emit(isr.arg)?;
        self.emit_word_value(arg.value)
    }

    fn encode_rst(&mut self, isr: &Instruction) -> Result<()> {
        let arg = self.parse_arg()?;
        if arg.class != Operand::Imm {
            return self.fail("invalid operand");
        }
        let v = self.absolute_value(arg.value)?;
        if v > 0x38 || v % 8 != 0 {
            return self.fail("invalid restart");
        }
        self.emit(isr.opcode | v as u8)
    }

    fn encode_io_in(&mut self, isr: &Instruction) -> Result<()> {
        let dst = self.parse_arg()?;
        let code = match u8::from(dst.class) {
            code @ 0..=7 if dst.class != Operand::IndHl => code,
            _ => return self.fail("invalid operand"),
        };
        self.lex.expect(b',')?;
        let src = self.parse_arg()?;
        match src.class {
            Operand::IndImm if dst.class == Operand::A => {
                self.emit(isr.opcode)?;
                self.emit_byte_value(src.value)
            }
            Operand::IndC => {
                self.emit(0xED)?;
                self.emit(isr.arg | (code << 3))
            }
            _ => self.fail("invalid operand"),
        }
    }

    fn encode_io_out(&mut self, isr: &Instruction) -> Result<()> {
        let dst = self.parse_arg()?;
        match dst.class {
            Operand::IndImm => {
                self.lex.expect(b',')?;
                let src = self.parse_arg()?;
                if src.class != Operand::A {
                    return self.fail("invalid operand");
                }
                self.emit(isr.opcode)?;
                self.emit_byte_value(dst.value)
            }
            Operand::IndC => {
                self.lex.expect(b',')?;
                let src = self.parse_arg()?;
                let code = match u8::from(src.class) {
                    code @ 0..=7 if src.class != Operand::IndHl => code,
                    _ => return self.fail("invalid operand"),
                };
                self.emit(0xED)?;
                self.emit(isr.arg | (code << 3))
            }
            _ => self.fail("invalid operand"),
        }
    }

    fn encode_exchange(&mut self, isr: &Instruction) -> Result<()> {
        let first = self.parse_arg()?;
        self.lex.expect(b',')?;
        let second = self.parse_arg()?;
        match (first.class, second.class) {
            (Operand::Af, Operand::Af) => self.emit(isr.arg),
            (Operand::De, Operand::Hl) => self.emit(0xEB),
            (Operand::IndSp, Operand::Hl) => self.emit(isr.opcode),
            (Operand::IndSp, Operand::Ix | Operand::Iy) => {
                self.emit(second.class.index_prefix().unwrap())?;
                self.emit(isr.opcode)
            }
            _ => self.fail("invalid operand"),
        }
    }

    fn encode_int_mode(&mut self, isr: &Instruction) -> Result<()> {
        let arg = self.parse_arg()?;
        if arg.class != Operand::Imm {
            return self.fail("invalid operand");
        }
        let opcode = match self.absolute_value(arg.value)? {
            0 => isr.opcode,
            1 => 0x56,
            2 => isr.arg,
            _ => return self.fail("invalid operand"),
        };
        self.emit(0xED)?;
        self.emit(opcode)
    }

    fn encode_load(&mut self) -> Result<()> {
        use Operand::*;
        let dst = self.parse_arg()?;
        self.lex.expect(b',')?;
        let src = self.parse_arg()?;

        // accumulator and special-register traffic
        match (dst.class, src.class) {
            (A, IndBc) => return self.emit(0x0A),
            (A, IndDe) => return self.emit(0x1A),
            (A, IndImm) => {
                self.emit(0x3A)?;
                return self.emit_word_value(src.value);
            }
            (A, I) => {
                self.emit(0xED)?;
                return self.emit(0x57);
            }
            (A, R) => {
                self.emit(0xED)?;
                return self.emit(0x5F);
            }
            (I, A) => {
                self.emit(0xED)?;
                return self.emit(0x47);
            }
            (R, A) => {
                self.emit(0xED)?;
                return self.emit(0x4F);
            }
            (IndBc, A) => return self.emit(0x02),
            (IndDe, A) => return self.emit(0x12),
            _ => {}
        }

        // 16-bit destinations
        if matches!(dst.class, Bc | De | Hl | Sp | Ix | Iy) {
            let prefix = dst.class.index_prefix();
            return match src.class {
                Imm => {
                    if let Some(p) = prefix {
                        self.emit(p)?;
                    }
                    self.emit(0x01 | dst.class.pair_bits().unwrap())?;
                    self.emit_word_value(src.value)
                }
                IndImm => {
                    match dst.class {
                        Hl => self.emit(0x2A)?,
                        Ix | Iy => {
                            self.emit(prefix.unwrap())?;
                            self.emit(0x2A)?;
                        }
                        _ => {
                            self.emit(0xED)?;
                            self.emit(
                                0x4B | dst.class.pair_bits().unwrap(),
                            )?;
                        }
                    }
                    self.emit_word_value(src.value)
                }
                Hl if dst.class == Sp => self.emit(0xF9),
                Ix | Iy if dst.class == Sp => {
                    self.emit(src.class.index_prefix().unwrap())?;
                    self.emit(0xF9)
                }
                _ => self.fail("invalid operand"),
            };
        }

        // 16-bit stores to memory
        if dst.class == IndImm {
            match src.class {
                A => {
                    self.emit(0x32)?;
                }
                Hl => {
                    self.emit(0x22)?;
                }
                Ix | Iy => {
                    self.emit(src.class.index_prefix().unwrap())?;
                    self.emit(0x22)?;
                }
                Bc | De | Sp => {
                    self.emit(0xED)?;
                    self.emit(0x43 | src.class.pair_bits().unwrap())?;
                }
                _ => return self.fail("invalid operand"),
            }
            return self.emit_word_value(dst.value);
        }

        // 8-bit destinations
        let Some(d) = dst.class.reg8() else {
            return self.fail("invalid operand");
        };
        if src.class == Imm {
            if let Some(p) = dst.class.index_prefix() {
                self.emit(p)?;
            }
            self.emit(0x06 | (d << 3))?;
            if dst.class.is_indexed_mem() {
                self.emit((dst.value.value & 0xFF) as u8)?;
            }
            return self.emit_byte_value(src.value);
        }
        let Some(s) = src.class.reg8() else {
            return self.fail("invalid operand");
        };

        // reject memory-to-memory and prefix mixing
        let dst_mem = dst.class == IndHl || dst.class.is_indexed_mem();
        let src_mem = src.class == IndHl || src.class.is_indexed_mem();
        if dst_mem && src_mem {
            return self.fail("invalid operand");
        }
        let prefix = match (dst.class.index_prefix(), src.class.index_prefix())
        {
            (None, None) => None,
            (Some(p), None) => Some(p),
            (None, Some(p)) => Some(p),
            (Some(a), Some(b))
                if a == b
                    && !dst.class.is_indexed_mem()
                    && !src.class.is_indexed_mem() =>
            {
                Some(a)
            }
            _ => return self.fail("invalid operand"),
        };
        if prefix.is_some() {
            let halves =
                dst.class.is_half_index() || src.class.is_half_index();
            let plain_hl = matches!(dst.class, H | L)
                || matches!(src.class, H | L)
                || dst.class == IndHl
                || src.class == IndHl;
            if dst.class == IndHl || src.class == IndHl {
                return self.fail("invalid operand");
            }
            if halves && plain_hl {
                return self.fail("invalid operand");
            }
        }

        if let Some(p) = prefix {
            self.emit(p)?;
        }
        self.emit(0x40 | (d << 3) | s)?;
        if dst.class.is_indexed_mem() {
            self.emit((dst.value.value & 0xFF) as u8)?;
        } else if src.class.is_indexed_mem() {
            self.emit((src.value.value & 0xFF) as u8)?;
        }
        Ok(())
    }
}
