//! Newline framing for serial byte streams.
//!
//! Raw bytes are buffered until a `\n` arrives, then the complete line is
//! decoded, trimmed, and yielded. Decoding only ever sees whole lines, and
//! byte 10 can't appear inside a multi-byte UTF-8 sequence, so a character
//! split across two reads is reassembled before it is decoded.

const DELIMITER: u8 = b'\n';

/// Per-connection line reassembly buffer.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the complete messages it finishes.
    ///
    /// The returned iterator is lazy. Lines it does not get to yield stay
    /// buffered and come out of the next `feed`.
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.buffer.extend_from_slice(chunk);
        Lines { framer: self }
    }

    /// Same as [`feed`](Self::feed) for already-decoded text.
    pub fn feed_str(&mut self, chunk: &str) -> Lines<'_> {
        self.feed(chunk.as_bytes())
    }

    /// Bytes of the trailing partial line still waiting for a delimiter.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == DELIMITER) {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        None
    }
}

/// Lazy sequence of trimmed, non-empty messages produced by one `feed` call.
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.framer.next_line()
    }
}
