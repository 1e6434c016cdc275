use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// One input file, fully buffered.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// The concatenated assembly source.
///
/// All input files behave as one logical character stream; the cursor can be
/// rewound to the first byte of the first file for the second pass. Line
/// numbers restart at 1 per file and are reported through [`status`].
///
/// [`status`]: SourceStream::status
#[derive(Debug)]
pub struct SourceStream {
    files: Vec<SourceFile>,
    file_idx: usize,
    byte_idx: usize,
    line: u32,
}

impl SourceStream {
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let bytes = fs::read(path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            files.push(SourceFile {
                name: path.display().to_string(),
                bytes,
            });
        }
        Ok(Self::from_files(files))
    }

    pub fn from_files(files: Vec<SourceFile>) -> Self {
        let mut stream = SourceStream {
            files,
            file_idx: 0,
            byte_idx: 0,
            line: 1,
        };
        stream.skip_empty();
        stream
    }

    /// Single in-memory file, mostly for tests.
    pub fn from_literal(name: &str, text: &str) -> Self {
        Self::from_files(vec![SourceFile {
            name: name.to_string(),
            bytes: text.as_bytes().to_vec(),
        }])
    }

    fn skip_empty(&mut self) {
        while self.file_idx < self.files.len()
            && self.byte_idx >= self.files[self.file_idx].bytes.len()
        {
            self.file_idx += 1;
            self.byte_idx = 0;
            self.line = 1;
        }
    }

    /// Next byte without advancing, or `None` once every file is exhausted.
    pub fn peek(&self) -> Option<u8> {
        self.files
            .get(self.file_idx)
            .and_then(|f| f.bytes.get(self.byte_idx))
            .copied()
    }

    /// Consume and return the next byte.
    pub fn next(&mut self) -> Option<u8> {
        let out = self.peek()?;
        self.byte_idx += 1;
        if out == b'\n' {
            self.line += 1;
        }
        self.skip_empty();
        Some(out)
    }

    /// Restart the logical source from the first file.
    pub fn rewind(&mut self) {
        self.file_idx = 0;
        self.byte_idx = 0;
        self.line = 1;
        self.skip_empty();
    }

    /// `file:line` of the cursor, for diagnostics.
    pub fn status(&self) -> String {
        let name = self
            .files
            .get(self.file_idx)
            .or_else(|| self.files.last())
            .map(|f| f.name.as_str())
            .unwrap_or("<input>");
        format!("{}:{}", name, self.line)
    }
}

/// Staged object output.
///
/// Text bytes go straight into the object image; data bytes are spilled on
/// the side during pass 2 and appended after the text stream once the pass
/// completes. Nothing touches the file system until the caller commits the
/// finished image, so a failed run never leaves a partial object behind.
#[derive(Debug, Default)]
pub struct ObjectWriter {
    out: Vec<u8>,
    spill: Vec<u8>,
}

impl ObjectWriter {
    pub fn new() -> Self {
        ObjectWriter::default()
    }

    pub fn emit_text(&mut self, byte: u8) {
        self.out.push(byte);
    }

    pub fn emit_data(&mut self, byte: u8) {
        self.spill.push(byte);
    }

    /// Append the staged data segment after the text stream.
    pub fn append_spill(&mut self) {
        self.out.append(&mut self.spill);
    }

    pub fn take(&mut self) -> Vec<u8> {
        self.spill.clear();
        std::mem::take(&mut self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_files_and_tracks_lines() {
        let mut src = SourceStream::from_files(vec![
            SourceFile {
                name: "a.s".into(),
                bytes: b"ab\n".to_vec(),
            },
            SourceFile {
                name: "b.s".into(),
                bytes: b"c".to_vec(),
            },
        ]);
        assert_eq!(src.status(), "a.s:1");
        assert_eq!(src.next(), Some(b'a'));
        assert_eq!(src.next(), Some(b'b'));
        assert_eq!(src.next(), Some(b'\n'));
        assert_eq!(src.status(), "b.s:1");
        assert_eq!(src.next(), Some(b'c'));
        assert_eq!(src.next(), None);
        assert_eq!(src.peek(), None);
        src.rewind();
        assert_eq!(src.peek(), Some(b'a'));
    }

    #[test]
    fn spill_lands_after_text() {
        let mut w = ObjectWriter::new();
        w.emit_text(1);
        w.emit_data(3);
        w.emit_text(2);
        w.append_spill();
        assert_eq!(w.take(), vec![1, 2, 3]);
    }
}
