//! The parser cursor: a byte-level view of source text with line tracking,
//! comment and continuation skipping, and the low-level token reads the
//! code generator consumes.

pub mod text;

use crate::error::{ParseError, SrcPos};

/// A cursor over one stretch of source text. The code generator drives it
/// directly; nested block compilations run a fresh cursor over captured
/// text while sharing the same output buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pub pos: usize,
    pub line: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(source: &'a str, first_line: usize) -> Self {
        Self {
            buf: source.as_bytes(),
            pos: 0,
            line: first_line,
        }
    }

    /// The byte at `ahead` positions past the cursor, NUL at the end.
    #[inline]
    pub fn current(&self, ahead: usize) -> u8 {
        self.buf.get(self.pos + ahead).copied().unwrap_or(0)
    }

    #[inline]
    pub fn next_char(&mut self) {
        if self.pos < self.buf.len() {
            if self.buf[self.pos] == b'\n' {
                self.line += 1;
            }
            self.pos += 1;
        }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn slice(&self, from: usize, to: usize) -> &'a [u8] {
        &self.buf[from..to]
    }

    /// Advance until one of `chars` (or the end) and return it.
    pub fn skip_until(&mut self, chars: &[u8]) -> u8 {
        loop {
            let c = self.current(0);
            if c == 0 || chars.contains(&c) {
                return c;
            }
            self.next_char();
        }
    }

    pub fn skip_until_char(&mut self, stop: u8) -> u8 {
        loop {
            let c = self.current(0);
            if c == 0 || c == stop {
                return c;
            }
            self.next_char();
        }
    }

    /// Skip horizontal whitespace, `//` comments and backslash line
    /// continuations.
    pub fn skip_comments(&mut self, src_name: Option<&str>) -> Result<(), ParseError> {
        loop {
            while matches!(self.current(0), b' ' | b'\t' | b'\r') {
                self.next_char();
            }
            if self.current(0) == b'\\' {
                let c = self.current(1);
                if c != b'\r' && c != b'\n' {
                    return Err(ParseError::InvalidLineBreak(self.srcpos(src_name)));
                }
                // skip backslash, then CR, LF or CRLF
                self.next_char();
                self.next_char();
                if c == b'\r' && self.current(0) == b'\n' {
                    self.next_char();
                }
                continue;
            }
            if self.current(0) != b'/' || self.current(1) != b'/' {
                return Ok(());
            }
            while self.current(0) != b'\n' && !self.at_end() {
                self.next_char();
            }
        }
    }

    /// Read a bare word, honoring balanced bracket pairs inside it.
    pub fn get_word(&mut self) -> &'a [u8] {
        let start = self.pos;
        let len = text::word_len(self.rest());
        for _ in 0..len {
            self.next_char();
        }
        &self.buf[start..start + len]
    }

    /// Scan a quoted string, returning the raw body between the quotes.
    pub fn get_str(&mut self, src_name: Option<&str>) -> Result<&'a [u8], ParseError> {
        let start = self.pos;
        match text::scan_string(self.rest()) {
            Some((consumed, newlines)) => {
                self.pos += consumed;
                self.line += newlines;
                Ok(&self.buf[start + 1..start + consumed - 1])
            }
            None => {
                self.pos = self.buf.len();
                Err(ParseError::UnterminatedString(self.srcpos(src_name)))
            }
        }
    }

    /// Scan a quoted string and decode its escapes.
    pub fn get_str_dup(&mut self, src_name: Option<&str>) -> Result<String, ParseError> {
        let pos = self.srcpos(src_name);
        let raw = self.get_str(src_name)?;
        text::unescape_string(&String::from_utf8_lossy(raw))
            .map_err(|c| ParseError::InvalidEscape(pos, c))
    }

    /// Read an identifier for `@name` substitution: `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn read_macro_name(&mut self) -> &'a [u8] {
        let start = self.pos;
        let c = self.current(0);
        if !c.is_ascii_alphabetic() && c != b'_' {
            return &[];
        }
        while {
            let c = self.current(0);
            c.is_ascii_alphanumeric() || c == b'_'
        } {
            self.next_char();
        }
        &self.buf[start..self.pos]
    }

    pub fn srcpos(&self, src_name: Option<&str>) -> SrcPos {
        SrcPos::new(src_name.map(String::from), self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_continuations() {
        let mut cur = Cursor::new("  // note\nx", 1);
        cur.skip_comments(None).unwrap();
        assert_eq!(cur.current(0), b'\n');

        let mut cur = Cursor::new("\\\n  next", 1);
        cur.skip_comments(None).unwrap();
        assert_eq!(cur.current(0), b'n');
        assert_eq!(cur.line, 2);
    }

    #[test]
    fn bad_continuation() {
        let mut cur = Cursor::new("\\x", 1);
        assert!(matches!(
            cur.skip_comments(None),
            Err(ParseError::InvalidLineBreak(_))
        ));
    }

    #[test]
    fn line_tracking_in_strings() {
        let mut cur = Cursor::new("\"a\nb\" tail", 1);
        let body = cur.get_str(None).unwrap();
        assert_eq!(body, b"a\nb");
        assert_eq!(cur.line, 2);
        assert_eq!(cur.current(0), b' ');
    }

    #[test]
    fn macro_names() {
        let mut cur = Cursor::new("foo_1)", 1);
        assert_eq!(cur.read_macro_name(), b"foo_1");
        let mut cur = Cursor::new("(x)", 1);
        assert_eq!(cur.read_macro_name(), b"");
    }
}
