/// Byte cursor that hands out lines (CRLF or bare LF terminated) and raw spans.
#[derive(Debug)]
pub(crate) struct LineCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LineCursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    /// Move to `pos`, clamped to the end of the buffer.
    pub(crate) fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// Bytes in `[from, to)`, both clamped to the buffer.
    pub(crate) fn span(&self, from: usize, to: usize) -> &'a [u8] {
        let end = to.min(self.buf.len());
        let start = from.min(end);
        &self.buf[start..end]
    }

    /// Next line without its terminator, and the position after it.
    fn scan(&self) -> Option<(&'a [u8], usize)> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        match memchr::memchr(b'\n', rest) {
            Some(i) => {
                let line = rest[..i].strip_suffix(b"\r").unwrap_or(&rest[..i]);
                Some((line, self.pos + i + 1))
            }
            None => Some((rest, self.buf.len())),
        }
    }

    pub(crate) fn next_line(&mut self) -> Option<&'a [u8]> {
        let (line, next) = self.scan()?;
        self.pos = next;
        Some(line)
    }

    pub(crate) fn peek_line(&self) -> Option<&'a [u8]> {
        self.scan().map(|(line, _)| line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_crlf_and_lf_lines() {
        let mut c = LineCursor::new(b"a\r\nb\nc");
        assert_eq!(c.peek_line(), Some(&b"a"[..]));
        assert_eq!(c.next_line(), Some(&b"a"[..]));
        assert_eq!(c.next_line(), Some(&b"b"[..]));
        assert_eq!(c.next_line(), Some(&b"c"[..]));
        assert_eq!(c.next_line(), None);
    }

    #[test]
    fn blank_lines_are_empty() {
        let mut c = LineCursor::new(b"\r\n\r\n");
        assert_eq!(c.next_line(), Some(&b""[..]));
        assert_eq!(c.position(), 2);
        assert_eq!(c.next_line(), Some(&b""[..]));
        assert_eq!(c.next_line(), None);
    }

    #[test]
    fn spans_and_seek_are_clamped() {
        let mut c = LineCursor::new(b"0123456789");
        assert_eq!(c.span(2, 5), b"234");
        assert_eq!(c.span(8, 50), b"89");
        assert_eq!(c.span(40, 50), b"");
        c.seek(100);
        assert_eq!(c.position(), 10);
        assert_eq!(c.next_line(), None);
    }
}
