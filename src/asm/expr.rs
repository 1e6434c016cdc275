use anyhow::Result;

use super::{escape_char, Assembler};
use crate::lexer::Token;
use crate::{SegTag, TypedValue};

/// Both evaluator stacks are this deep; blowing either one is the
/// program's error, not a sizing knob.
const STACK_DEPTH: usize = 16;

fn precedence(op: u8) -> u32 {
    match op {
        b'!' => 1,
        b'+' | b'-' => 2,
        b'*' | b'/' | b'%' => 3,
        b'>' | b'<' => 4,
        b'&' => 5,
        b'^' => 6,
        b'|' => 7,
        b'(' => 0,
        _ => 99,
    }
}

fn classify_radix(c: u8) -> Option<u16> {
    match c {
        b'b' | b'B' => Some(2),
        b'o' | b'O' => Some(8),
        b'x' | b'X' | b'h' | b'H' => Some(16),
        _ => None,
    }
}

fn char_parse(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn has_lpar(estack: &[u8]) -> bool {
    estack.contains(&b'(')
}

impl Assembler {
    /// Evaluate the expression next in the token stream.
    pub(crate) fn evaluate(&mut self) -> Result<TypedValue> {
        self.evaluate_with(None)
    }

    /// Shunting-yard over two fixed-depth stacks. `first` lets a caller
    /// hand over a token it already consumed while deciding what the
    /// operand was.
    pub(crate) fn evaluate_with(
        &mut self,
        mut first: Option<Token>,
    ) -> Result<TypedValue> {
        let mut vstack = [TypedValue::undefined(); STACK_DEPTH];
        let mut vindex = 0usize;
        let mut estack = [0u8; STACK_DEPTH];
        let mut eindex = 0usize;

        loop {
            let tok = match first.take() {
                Some(tok) => tok,
                None => self.lex.read_token(),
            };

            let mut op: Option<u8> = None;
            let mut term: Option<TypedValue> = None;
            match tok {
                Token::Ident(name) => {
                    term = Some(self.term_symbol(&name, false)?)
                }
                Token::Punct(b'$') => {
                    let Token::Ident(name) = self.lex.read_token() else {
                        return self.fail("unexpected token");
                    };
                    term = Some(self.term_symbol(&name, true)?);
                }
                Token::Number(text) => term = Some(self.term_number(&text)?),
                Token::Punct(b'\'') => term = Some(self.term_char()?),
                Token::Punct(
                    c @ (b'+' | b'-' | b'*' | b'/' | b'&' | b'|' | b'%'
                    | b'!' | b'^' | b'(' | b')'),
                ) => op = Some(c),
                Token::Punct(c @ (b'>' | b'<')) => {
                    // << and >> only form when the same character repeats
                    if self.lex.peek_char() != Some(c) {
                        return self.fail("unknown token in expression");
                    }
                    self.lex.read_token();
                    op = Some(c);
                }
                _ => return self.fail("unknown token in expression"),
            }

            match (op, term) {
                (Some(b'('), _) => {
                    self.push_op(&mut estack, &mut eindex, b'(')?
                }
                (Some(b')'), _) => {
                    if !has_lpar(&estack[..eindex]) {
                        return self.fail("unexpected ')'");
                    }
                    while estack[eindex - 1] != b'(' {
                        self.pop_apply(
                            &estack,
                            &mut eindex,
                            &mut vstack,
                            &mut vindex,
                        )?;
                    }
                    eindex -= 1;
                }
                (Some(o), _) => {
                    while eindex > 0
                        && precedence(o) <= precedence(estack[eindex - 1])
                    {
                        self.pop_apply(
                            &estack,
                            &mut eindex,
                            &mut vstack,
                            &mut vindex,
                        )?;
                    }
                    self.push_op(&mut estack, &mut eindex, o)?;
                }
                (None, Some(tv)) => {
                    self.push_val(&mut vstack, &mut vindex, tv)?
                }
                (None, None) => unreachable!(),
            }

            match self.lex.peek_char() {
                None | Some(b',') | Some(b'\n') | Some(b']')
                | Some(b'}') => break,
                Some(b')') if !has_lpar(&estack[..eindex]) => break,
                _ => {}
            }
        }

        while eindex > 0 {
            self.pop_apply(&estack, &mut eindex, &mut vstack, &mut vindex)?;
        }
        if vindex != 1 {
            return self.fail("value stack overpopulation");
        }
        Ok(vstack[0])
    }

    fn push_op(
        &self,
        estack: &mut [u8; STACK_DEPTH],
        eindex: &mut usize,
        op: u8,
    ) -> Result<()> {
        if *eindex >= STACK_DEPTH {
            return self.fail("expression stack overflow");
        }
        estack[*eindex] = op;
        *eindex += 1;
        Ok(())
    }

    fn push_val(
        &self,
        vstack: &mut [TypedValue; STACK_DEPTH],
        vindex: &mut usize,
        tv: TypedValue,
    ) -> Result<()> {
        if *vindex >= STACK_DEPTH {
            return self.fail("value stack overflow");
        }
        vstack[*vindex] = tv;
        *vindex += 1;
        Ok(())
    }

    /// Pop one operator and fold the top two values through it.
    fn pop_apply(
        &self,
        estack: &[u8; STACK_DEPTH],
        eindex: &mut usize,
        vstack: &mut [TypedValue; STACK_DEPTH],
        vindex: &mut usize,
    ) -> Result<()> {
        if *eindex == 0 {
            return self.fail("expression stack depletion");
        }
        *eindex -= 1;
        let op = estack[*eindex];

        if *vindex < 2 {
            return self.fail("value stack depletion");
        }
        *vindex -= 1;
        let b = vstack[*vindex];
        *vindex -= 1;
        let a = vstack[*vindex];

        let value = match op {
            b'!' => a.value | !b.value,
            b'+' => a.value.wrapping_add(b.value),
            b'-' => a.value.wrapping_sub(b.value),
            b'*' => a.value.wrapping_mul(b.value),
            b'/' => {
                if b.value == 0 {
                    // forward references must still size on the first pass
                    if self.pass2 {
                        return self.fail("zero divide");
                    }
                    0
                } else {
                    a.value / b.value
                }
            }
            b'%' => {
                if b.value == 0 {
                    if self.pass2 {
                        return self.fail("zero divide");
                    }
                    0
                } else {
                    a.value % b.value
                }
            }
            b'>' => {
                if b.value >= 16 {
                    0
                } else {
                    a.value >> b.value
                }
            }
            b'<' => {
                if b.value >= 16 {
                    0
                } else {
                    a.value << b.value
                }
            }
            b'&' => a.value & b.value,
            b'^' => a.value ^ b.value,
            b'|' => a.value | b.value,
            b'(' => return self.fail("unexpected '('"),
            _ => 0,
        };

        let tag = self.combine_tags(op, a.tag, b.tag)?;
        vstack[*vindex] = TypedValue { tag, value };
        *vindex += 1;
        Ok(())
    }

    /// Segment-tag propagation through a binary operator.
    fn combine_tags(&self, op: u8, a: SegTag, b: SegTag) -> Result<SegTag> {
        use SegTag::*;
        if a == Undefined || b == Undefined {
            return Ok(Undefined);
        }
        match (a == Absolute, b == Absolute) {
            (false, false) => self.fail("incompatible types"),
            (true, false) => {
                if op == b'+' {
                    Ok(b)
                } else {
                    self.fail("invalid type operation")
                }
            }
            (false, true) => {
                if op == b'+' || op == b'-' {
                    Ok(a)
                } else {
                    self.fail("invalid type operation")
                }
            }
            (true, true) => Ok(Absolute),
        }
    }

    /// Symbol terminal, with optional `$name` size-of and `.field`
    /// dereferencing into a type's layout.
    fn term_symbol(&mut self, name: &str, size_of: bool) -> Result<TypedValue> {
        let mut sym = self.symtab.fetch(name).cloned();
        let (mut tag, mut num) = match &sym {
            Some(s) => {
                if size_of {
                    // sizes are always absolute
                    (SegTag::Absolute, s.size)
                } else {
                    (s.tag, s.value)
                }
            }
            None => (SegTag::Undefined, 0),
        };

        while self.lex.peek_char() == Some(b'.') {
            self.lex.read_token();
            let Token::Ident(field) = self.lex.read_token() else {
                return self.fail("unexpected token");
            };
            sym = match &sym {
                Some(s) => s.field(&field).cloned(),
                None => None,
            };
            match &sym {
                Some(f) => {
                    if size_of {
                        num = f.size;
                    } else {
                        num = num.wrapping_add(f.value);
                    }
                }
                None => {
                    tag = SegTag::Undefined;
                    num = 0;
                }
            }
        }
        Ok(TypedValue { tag, value: num })
    }

    /// Number terminal. A lone digit followed by `f` or `b` is a local
    /// label reference, not a number.
    fn term_number(&mut self, text: &str) -> Result<TypedValue> {
        let bytes = text.as_bytes();
        if bytes.len() == 2
            && bytes[0].is_ascii_digit()
            && (bytes[1] == b'f' || bytes[1] == b'b')
        {
            let ordinal = self.loc_cnt;
            return Ok(self.symtab.local_fetch(
                ordinal,
                bytes[0] - b'0',
                bytes[1] == b'f',
            ));
        }
        Ok(TypedValue::absolute(self.num_parse(text)?))
    }

    /// Radix comes from a prefix (`0x` style), a suffix (`h`, `o`, `b`),
    /// or a leading zero alone (octal); decimal otherwise.
    pub(crate) fn num_parse(&self, text: &str) -> Result<u16> {
        let bytes = text.as_bytes();
        let mut radix: u16 = 10;
        let mut start = 0;
        while start < bytes.len() && bytes[start] == b'0' {
            start += 1;
            radix = 8;
        }
        let mut end = bytes.len();
        if start < end {
            if let Some(r) = classify_radix(bytes[start]) {
                radix = r;
                start += 1;
            } else if let Some(r) = classify_radix(bytes[end - 1]) {
                radix = r;
                end -= 1;
            }
        }

        let mut out: u16 = 0;
        for &b in &bytes[start..end] {
            let Some(v) = char_parse(b) else {
                return self.fail("unexpected character in numeric");
            };
            if u16::from(v) >= radix {
                return self.fail("radix mismatch in numeric");
            }
            out = out.wrapping_mul(radix).wrapping_add(v.into());
        }
        Ok(out)
    }

    fn term_char(&mut self) -> Result<TypedValue> {
        let num = if self.lex.peek_char() == Some(b'\\') {
            self.lex.next_char();
            let Some(c) = self.lex.next_char() else {
                return self.fail("expected quote");
            };
            match escape_char(c) {
                Some(v) => v,
                None => return self.fail("unknown escape"),
            }
        } else {
            match self.lex.next_char() {
                Some(c) => c,
                None => return self.fail("expected quote"),
            }
        };
        if self.lex.read_token() != Token::Punct(b'\'') {
            return self.fail("expected quote");
        }
        Ok(TypedValue::absolute(num.into()))
    }

    /// `[expr]`, used for counts. Must be absolute; resolves to 0 when no
    /// bracket is present.
    pub(crate) fn bracket(&mut self, must_resolve: bool) -> Result<u16> {
        if self.lex.peek_char() != Some(b'[') {
            return Ok(0);
        }
        self.lex.read_token();
        let tv = self.evaluate()?;
        self.lex.expect(b']')?;

        if tv.tag == SegTag::Undefined {
            if must_resolve {
                return self.fail("undefined expression");
            }
            return Ok(0);
        }
        if tv.tag != SegTag::Absolute {
            return self.fail("must be absolute");
        }
        Ok(tv.value)
    }
}
