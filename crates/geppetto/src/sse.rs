//! Incremental Server-Sent Events decoding.
//!
//! Every provider streams over SSE. [`SseDecoder`] turns raw body
//! chunks into complete [`SseFrame`]s, handling frames and UTF-8
//! sequences that straddle chunk boundaries.

use crate::error::GeppettoError;

/// Buffered bytes beyond this abort the stream.
const MAX_BUF: usize = 16 * 1024 * 1024;

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseFrame {
    /// Whether this is the `[DONE]` sentinel.
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }
}

/// Accumulates body chunks and yields complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending: Vec<u8>,
}

impl SseDecoder {
    /// An empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the frames it completed.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::ResponseFormat`] when more than 16 MiB are
    /// buffered without a frame boundary.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, GeppettoError> {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() > MAX_BUF || self.buffer.len() > MAX_BUF {
            self.pending.clear();
            self.buffer.clear();
            return Err(GeppettoError::ResponseFormat {
                message: "SSE stream buffer exceeded 16 MiB".into(),
                raw: String::new(),
            });
        }
        self.decode_pending();

        let mut frames = Vec::new();
        while let Some((end, sep)) = find_boundary(&self.buffer) {
            let raw: String = self.buffer.drain(..end + sep).collect();
            if let Some(frame) = parse_frame(&raw[..end]) {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Flushes a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.decode_pending();
        let rest = std::mem::take(&mut self.buffer);
        parse_frame(&rest)
    }

    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending[..valid]) {
                        self.buffer.push_str(text);
                    }
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                        Some(len) => {
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }
}

fn find_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }
    if data_lines.is_empty() && frame.event.is_none() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}
