//! Newline framing for chunked request bodies.

/// A line (or pending fragment) grew past the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("line of {size} bytes exceeds limit of {limit} bytes")]
pub struct LineTooLong {
    /// Bytes seen so far for the line.
    pub size: usize,
    /// Configured limit.
    pub limit: usize,
}

/// Splits arbitrary chunks into complete lines.
///
/// Lines end at `\n`; a trailing `\r` is trimmed and blank lines are
/// skipped. At most one incomplete fragment is held between chunks.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
}

impl LineBuffer {
    /// Buffer refusing lines longer than `max_line` bytes.
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
        }
    }

    /// Append a chunk and return the lines it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, LineTooLong> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            let size = self.pending.len() + head.len();
            if size > self.max_line {
                return Err(self.too_long(size));
            }
            let line = if self.pending.is_empty() {
                decode(head)
            } else {
                self.pending.extend_from_slice(head);
                let line = decode(&self.pending);
                self.pending.clear();
                line
            };
            if let Some(line) = line {
                lines.push(line);
            }
        }

        let size = self.pending.len() + rest.len();
        if size > self.max_line {
            return Err(self.too_long(size));
        }
        self.pending.extend_from_slice(rest);
        Ok(lines)
    }

    /// Take the unterminated final fragment, if it holds anything.
    pub fn finish(&mut self) -> Option<String> {
        let pending = std::mem::take(&mut self.pending);
        decode(&pending)
    }

    /// Bytes held in the pending fragment.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn too_long(&self, size: usize) -> LineTooLong {
        LineTooLong {
            size,
            limit: self.max_line,
        }
    }
}

fn decode(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    if text.trim().is_empty() {
        None
    } else {
        Some(text.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut buf = LineBuffer::new(1024);
        let lines = buf.push(b"{\"a\":1}\n{\"b\":2}\n").unwrap();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn keeps_fragment_across_chunks() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.push(b"{\"a\":").unwrap().is_empty());
        assert_eq!(buf.pending_len(), 5);
        assert_eq!(buf.push(b"1}\n{\"b\"").unwrap(), vec!["{\"a\":1}"]);
        assert_eq!(buf.finish(), Some("{\"b\"".to_string()));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn trims_cr_and_skips_blank_lines() {
        let mut buf = LineBuffer::new(1024);
        let lines = buf.push(b"one\r\n\n  \r\ntwo\n").unwrap();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn crlf_split_across_chunks() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.push(b"one\r").unwrap().is_empty());
        assert_eq!(buf.push(b"\ntwo\n").unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn pending_fragment_over_limit() {
        let mut buf = LineBuffer::new(8);
        assert!(buf.push(b"12345").unwrap().is_empty());
        let err = buf.push(b"6789").unwrap_err();
        assert_eq!(err, LineTooLong { size: 9, limit: 8 });
    }

    #[test]
    fn complete_line_over_limit() {
        let mut buf = LineBuffer::new(4);
        let err = buf.push(b"123456\n").unwrap_err();
        assert_eq!(err.size, 6);
    }

    #[test]
    fn line_at_limit_is_accepted() {
        let mut buf = LineBuffer::new(4);
        assert_eq!(buf.push(b"1234\n").unwrap(), vec!["1234"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut buf = LineBuffer::new(64);
        let lines = buf.push(b"ab\xffcd\n").unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains('\u{fffd}'));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chunking_does_not_change_lines(
                lines in proptest::collection::vec("[a-z0-9{}\":, ]{1,24}", 0..16),
                cuts in proptest::collection::vec(0usize..512, 0..8),
            ) {
                let input: String = lines.iter().map(|l| format!("{l}\n")).collect();
                let bytes = input.as_bytes();
                let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
                points.sort_unstable();

                let mut buf = LineBuffer::new(64);
                let mut out = Vec::new();
                let mut start = 0;
                for point in points.into_iter().chain(std::iter::once(bytes.len())) {
                    out.extend(buf.push(&bytes[start..point]).unwrap());
                    start = point;
                }
                prop_assert!(buf.finish().is_none());

                let expected: Vec<String> = lines
                    .into_iter()
                    .filter(|l| !l.trim().is_empty())
                    .collect();
                prop_assert_eq!(out, expected);
            }
        }
    }
}
