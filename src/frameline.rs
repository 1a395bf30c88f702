//! Fast parser for line-oriented raw stack-frame records.
//!
//! Tools that ingest sampled frames as text emit one JSON-ish object per
//! line, e.g. `{"ip":"0x7f02a1","sp":"0x7ffc3440"}`. This parser accepts the
//! keys in any order, tolerates arbitrary extra keys with arbitrary value
//! types (strings, numbers, booleans, arrays, nested objects), and skips
//! whitespace between tokens. It keeps only the IP; the SP of the parsed
//! frame is normalized to 0.
//!
//! A line with no `ip` key, or with a truncated/unterminated value, parses
//! to `None`. This is deliberately not a JSON library: no allocation, one
//! pass, bails on the first structural problem.

use crate::sample::StackFrame;

const MAX_NESTING: usize = 32;

/// Parse a single line. Returns the frame (SP normalized to 0) or `None`.
pub fn parse_frame_line(line: &str) -> Option<StackFrame> {
    let mut cur = Cursor {
        bytes: line.as_bytes(),
        pos: 0,
    };
    cur.skip_ws();
    cur.expect(b'{')?;

    let mut ip: Option<u64> = None;
    loop {
        cur.skip_ws();
        if cur.eat(b'}') {
            break;
        }
        let (key_start, key_end) = cur.string_span()?;
        cur.skip_ws();
        cur.expect(b':')?;
        cur.skip_ws();
        if &cur.bytes[key_start..key_end] == b"ip" {
            ip = Some(cur.hex_string()?);
        } else {
            cur.skip_value(0)?;
        }
        cur.skip_ws();
        if cur.eat(b',') {
            continue;
        }
        if cur.eat(b'}') {
            break;
        }
        return None;
    }

    ip.map(|ip| StackFrame::new(ip, 0))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8) -> Option<()> {
        self.eat(b).then_some(())
    }

    /// Consume a quoted string, returning the span of its raw contents.
    /// Escape sequences are skipped, not decoded; `ip`/`sp` keys never
    /// contain them.
    fn string_span(&mut self) -> Option<(usize, usize)> {
        self.expect(b'"')?;
        let start = self.pos;
        loop {
            match self.bump()? {
                b'"' => return Some((start, self.pos - 1)),
                b'\\' => {
                    self.bump()?;
                }
                _ => {}
            }
        }
    }

    /// Consume a `"0x<hex>"` (or bare-hex) string value.
    fn hex_string(&mut self) -> Option<u64> {
        let (start, end) = self.string_span()?;
        let mut digits = &self.bytes[start..end];
        if let Some(rest) = digits.strip_prefix(b"0x") {
            digits = rest;
        }
        if digits.is_empty() {
            return None;
        }
        let mut value: u64 = 0;
        for &d in digits {
            let nibble = match d {
                b'0'..=b'9' => d - b'0',
                b'a'..=b'f' => d - b'a' + 10,
                b'A'..=b'F' => d - b'A' + 10,
                _ => return None,
            };
            value = value.checked_mul(16)?.checked_add(nibble as u64)?;
        }
        Some(value)
    }

    /// Skip any JSON value without interpreting it.
    fn skip_value(&mut self, depth: usize) -> Option<()> {
        if depth > MAX_NESTING {
            return None;
        }
        match self.peek()? {
            b'"' => {
                self.string_span()?;
                Some(())
            }
            b'[' => {
                self.pos += 1;
                self.skip_ws();
                if self.eat(b']') {
                    return Some(());
                }
                loop {
                    self.skip_ws();
                    self.skip_value(depth + 1)?;
                    self.skip_ws();
                    if self.eat(b']') {
                        return Some(());
                    }
                    self.expect(b',')?;
                }
            }
            b'{' => {
                self.pos += 1;
                self.skip_ws();
                if self.eat(b'}') {
                    return Some(());
                }
                loop {
                    self.skip_ws();
                    self.string_span()?;
                    self.skip_ws();
                    self.expect(b':')?;
                    self.skip_ws();
                    self.skip_value(depth + 1)?;
                    self.skip_ws();
                    if self.eat(b'}') {
                        return Some(());
                    }
                    self.expect(b',')?;
                }
            }
            // Numbers, true/false/null: consume the token blob.
            _ => {
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if matches!(b, b',' | b'}' | b']' | b' ' | b'\t' | b'\r' | b'\n') {
                        break;
                    }
                    self.pos += 1;
                }
                (self.pos > start).then_some(())
            }
        }
    }
}
