use anyhow::{anyhow, Result};

use crate::source::SourceStream;

/// Identifier and number tokens are clipped to this many characters.
pub const TOKEN_MAX: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Number(String),
    Punct(u8),
    Newline,
    Eof,
}

/// Classifying token reader over the concatenated source.
///
/// Whitespace and `;` comments are skipped both before and after every
/// token, so a raw [`peek_char`] after `read_token` already shows the first
/// character of the next token.
///
/// [`peek_char`]: Lexer::peek_char
pub struct Lexer {
    pub src: SourceStream,
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_num(c: u8) -> bool {
    c.is_ascii_digit()
}

impl Lexer {
    pub fn new(src: SourceStream) -> Self {
        Lexer { src }
    }

    pub fn status(&self) -> String {
        self.src.status()
    }

    fn fail<T>(&self, msg: &str) -> Result<T> {
        Err(anyhow!("{}: {}", self.status(), msg))
    }

    /// Skip whitespace and `;` comments, stopping short of the newline.
    pub fn skip_space(&mut self) {
        let mut comment = false;
        while let Some(c) = self.src.peek() {
            if c == b'\n' {
                break;
            }
            if c <= b' ' || c == b';' || comment {
                if self.src.next() == Some(b';') {
                    comment = true;
                }
            } else {
                break;
            }
        }
    }

    /// First character of the next token, without consuming anything.
    pub fn peek_char(&mut self) -> Option<u8> {
        self.src.peek()
    }

    pub fn next_char(&mut self) -> Option<u8> {
        self.src.next()
    }

    pub fn read_token(&mut self) -> Token {
        self.skip_space();

        let Some(c) = self.src.peek() else {
            return Token::Eof;
        };

        let out = if is_alpha(c) || is_num(c) {
            let ident = is_alpha(c);
            let mut buf = String::new();
            while let Some(c) = self.src.peek() {
                if !is_alpha(c) && !is_num(c) {
                    break;
                }
                if buf.len() < TOKEN_MAX {
                    buf.push(c as char);
                }
                self.src.next();
            }
            if ident {
                Token::Ident(buf)
            } else {
                Token::Number(buf)
            }
        } else {
            self.src.next();
            if c == b'\n' {
                Token::Newline
            } else {
                Token::Punct(c)
            }
        };

        self.skip_space();
        out
    }

    /// Require a specific punctuation character.
    ///
    /// `{` and `,` swallow any newlines that follow them, and `}` swallows
    /// any that precede it, so brace-delimited initialisers may span lines.
    pub fn expect(&mut self, c: u8) -> Result<()> {
        if c == b'}' {
            while self.src.peek() == Some(b'\n') {
                self.read_token();
            }
        }

        if self.read_token() != Token::Punct(c) {
            return self.fail("unexpected character");
        }

        if c == b'{' || c == b',' {
            while self.src.peek() == Some(b'\n') {
                self.read_token();
            }
        }
        Ok(())
    }

    /// Consume an end of line (or end of input).
    pub fn eol(&mut self) -> Result<()> {
        match self.read_token() {
            Token::Newline | Token::Eof => Ok(()),
            _ => self.fail("expected end of line"),
        }
    }

    /// Discard tokens up to and including the next newline.
    pub fn skip_line(&mut self) {
        loop {
            match self.read_token() {
                Token::Newline | Token::Eof => break,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> Lexer {
        Lexer::new(SourceStream::from_literal("t.s", text))
    }

    #[test]
    fn classifies_tokens() {
        let mut l = lex("start: ld a, 0x10 ; comment\nnext");
        assert_eq!(l.read_token(), Token::Ident("start".into()));
        assert_eq!(l.read_token(), Token::Punct(b':'));
        assert_eq!(l.read_token(), Token::Ident("ld".into()));
        assert_eq!(l.read_token(), Token::Ident("a".into()));
        assert_eq!(l.read_token(), Token::Punct(b','));
        assert_eq!(l.read_token(), Token::Number("0x10".into()));
        assert_eq!(l.read_token(), Token::Newline);
        assert_eq!(l.read_token(), Token::Ident("next".into()));
        assert_eq!(l.read_token(), Token::Eof);
    }

    #[test]
    fn peek_lands_on_next_token() {
        let mut l = lex("name   = 5");
        assert_eq!(l.read_token(), Token::Ident("name".into()));
        assert_eq!(l.peek_char(), Some(b'='));
    }

    #[test]
    fn braces_span_lines() {
        let mut l = lex("{\n\n 1,\n 2\n}");
        l.expect(b'{').unwrap();
        assert_eq!(l.read_token(), Token::Number("1".into()));
        l.expect(b',').unwrap();
        assert_eq!(l.read_token(), Token::Number("2".into()));
        l.expect(b'}').unwrap();
    }

    #[test]
    fn skip_line_stops_after_newline() {
        let mut l = lex("a b c\nd");
        l.skip_line();
        assert_eq!(l.read_token(), Token::Ident("d".into()));
    }
}
