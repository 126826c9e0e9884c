//! Splits a chunked HTTP body into lines.
//!
//! Both Marathon's server-sent events and the Kubernetes watch API deliver
//! newline-delimited records, but chunk boundaries fall anywhere.

#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, without the
    /// trailing `\n` / `\r\n`. Invalid UTF-8 is replaced, not rejected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_lines_split_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        assert_eq!(buf.push(b": 1}\r\n\r\nevent: x\n"), [
            "data: {\"a\": 1}",
            "",
            "event: x"
        ]);
        assert!(buf.push(b"tail").is_empty());
        assert_eq!(buf.push(b"\n"), ["tail"]);
    }
}
