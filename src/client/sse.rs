//! Incremental decoder for `text/event-stream` bodies.
//!
//! Frames are blank-line delimited; each frame's `data:` lines are collected
//! and joined with `\n` to form one payload. Anything else (`event:`, `id:`,
//! comments) is ignored. The decoder is transport-agnostic: feed it chunks
//! as they arrive and collect completed payloads.

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the payloads of every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some((end, resume)) = frame_boundary(&self.buf) {
            let frame: String = self.buf[..end].to_string();
            self.buf.drain(..resume);
            if let Some(payload) = frame_payload(&frame) {
                payloads.push(payload);
            }
        }
        payloads
    }
}

/// Find the earliest frame delimiter (`\n\n` or `\r\n\r\n`).
fn frame_boundary(buf: &str) -> Option<(usize, usize)> {
    let lf = buf.find("\n\n").map(|i| (i, i + 2));
    let crlf = buf.find("\r\n\r\n").map(|i| (i, i + 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Join the `data:` lines of one frame, or None for data-less frames.
fn frame_payload(frame: &str) -> Option<String> {
    let mut data: Vec<&str> = Vec::new();
    for line in frame.split('\n') {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}
