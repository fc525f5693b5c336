//! Line framing for incremental upstream responses.

use serde::de::DeserializeOwned;

/// Prefix providers put in front of each payload line.
pub const DATA_PREFIX: &str = "data:";

/// Longest line kept by [`LineDecoder::new`].
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into complete lines.
///
/// Bytes are buffered rather than decoded eagerly so a multi-byte character
/// split across two network reads is reassembled before UTF-8 decoding.
/// A line longer than the limit is dropped up to its terminating newline.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    // Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    max_line_bytes: usize,
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    /// Feed a network read and return every line it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if self.discarding {
                self.discarding = false;
            } else if end - start > self.max_line_bytes {
                tracing::debug!(limit = self.max_line_bytes, "Dropping oversize upstream line");
            } else if let Some(line) = Self::decode(&self.buffer[start..end]) {
                lines.push(line);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line_bytes {
            tracing::debug!(limit = self.max_line_bytes, "Dropping oversize upstream line");
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        lines
    }

    /// Return the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        Self::decode(&rest)
    }

    fn decode(line: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Strip the `data:` framing prefix. Lines without it are returned as-is.
pub fn strip_framing(line: &str) -> &str {
    line.trim()
        .strip_prefix(DATA_PREFIX)
        .map(str::trim_start)
        .unwrap_or_else(|| line.trim())
}

/// Strip framing and decode the remaining JSON, skipping anything malformed.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let payload = strip_framing(line);
    if payload.is_empty() || !payload.starts_with('{') {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, line = payload, "Skipping undecodable upstream line");
            None
        }
    }
}
