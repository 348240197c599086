//! Incremental `text/event-stream` frame splitting.
//!
//! Frames end at a blank line (`\n\n` or `\r\n\r\n`). Bytes are buffered until
//! a boundary arrives, so chunks may split a frame anywhere, including inside
//! a multi-byte UTF-8 sequence.
//!
//! Within a frame, `data:` lines are joined with `\n`, comment lines (leading
//! `:`) and other fields are ignored. Frames without data are dropped.

use crate::error::WireError;

/// Default ceiling for one buffered frame (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One decoded frame: the joined `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: String,
}

#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no boundary start.
    scanned: usize,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Buffer a chunk without decoding it. Pair with [`Self::next_frame`].
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the next complete frame from the buffer.
    ///
    /// Frames are handed out one at a time so that a later bad frame does
    /// not swallow the good ones buffered before it.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        loop {
            let Some((start, separator_len)) = find_boundary(&self.buf[self.scanned..]) else {
                // A separator may straddle the next chunk; rescan its prefix.
                self.scanned = self.buf.len().saturating_sub(3);
                if self.buf.len() > self.max_frame_bytes {
                    return Err(WireError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                return Ok(None);
            };
            let end = self.scanned + start;
            let raw: Vec<u8> = self.buf.drain(..end + separator_len).collect();
            self.scanned = 0;
            if let Some(frame) = parse_frame(&raw[..end])? {
                return Ok(Some(frame));
            }
        }
    }

    /// Feed a chunk, returning every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, WireError> {
        self.extend(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of bytes buffered for an unfinished frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Signal end of input. Leftover non-whitespace bytes mean the stream
    /// was cut inside a frame.
    pub fn finish(&mut self) -> Result<(), WireError> {
        let pending = self
            .buf
            .iter()
            .filter(|b| !b.is_ascii_whitespace())
            .count();
        let leftover = self.buf.len();
        self.buf.clear();
        self.scanned = 0;
        if pending > 0 {
            return Err(WireError::TruncatedFrame { pending: leftover });
        }
        Ok(())
    }
}

fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buf, b"\n\n").map(|i| (i, 2));
    let crlf = find(buf, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_frame(raw: &[u8]) -> Result<Option<Frame>, WireError> {
    let text = std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)?;

    let mut data_lines = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            data_lines.push(value);
        }
    }

    if data_lines.is_empty() {
        return Ok(None);
    }
    Ok(Some(Frame {
        data: data_lines.join("\n"),
    }))
}
