//! Newline-delimited JSON framing for the switchboard wire protocol.
//!
//! Wire format: one UTF-8 JSON document per frame, terminated by `\r\n`.
//! Readers also accept a lone `\n` from legacy peers; writers always emit
//! `\r\n`. JSON serialization never produces bare control bytes, so the
//! terminator cannot appear inside a payload.

use crate::constants::{DEFAULT_READ_LIMIT, TERMINATION};
use crate::error::{SwitchboardError, SwitchboardResult};
use crate::json::JsonBackend;
use serde_json::Value;

/// Encode a value as one complete wire frame (payload + terminator).
pub fn encode_frame(backend: JsonBackend, value: &Value) -> SwitchboardResult<Vec<u8>> {
    let mut frame = backend.encode(value)?;
    frame.extend_from_slice(TERMINATION);
    Ok(frame)
}

/// Streaming frame decoder: accumulates bytes and yields complete payloads.
///
/// A single TCP read may carry several whole frames, a partial frame, or
/// both; `feed` returns every payload completed by the new bytes, in order,
/// with the terminator stripped.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_READ_LIMIT)
    }

    /// Create a decoder that rejects frames larger than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    /// Feed bytes into the decoder and return all completed payloads.
    ///
    /// Empty lines are skipped. Fails with `FrameTooLarge` when either a
    /// single payload or the unterminated remainder exceeds the limit.
    pub fn feed(&mut self, data: &[u8]) -> SwitchboardResult<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let newline = start + offset;
            let mut end = newline;
            if end > start && self.buffer[end - 1] == b'\r' {
                end -= 1;
            }
            if end - start > self.limit {
                return Err(SwitchboardError::FrameTooLarge {
                    size: end - start,
                    limit: self.limit,
                });
            }
            if end > start {
                frames.push(self.buffer[start..end].to_vec());
            }
            start = newline + 1;
        }

        self.buffer.drain(..start);

        if self.buffer.len() > self.limit {
            return Err(SwitchboardError::FrameTooLarge {
                size: self.buffer.len(),
                limit: self.limit,
            });
        }

        Ok(frames)
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any buffered partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_appends_crlf() {
        let frame = encode_frame(JsonBackend::Builtin, &json!({"uid": "u1"})).unwrap();
        assert!(frame.ends_with(b"\r\n"));
        let payload = &frame[..frame.len() - 2];
        assert!(!payload.contains(&b'\n'));
    }

    #[test]
    fn single_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"{\"uid\":\"u1\"}\r\n").unwrap();
        assert_eq!(frames, vec![b"{\"uid\":\"u1\"}".to_vec()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn accepts_bare_newline() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"{\"a\":1}\n{\"b\":2}\r\n").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"{\"a\":1}");
        assert_eq!(frames[1], b"{\"b\":2}");
    }

    #[test]
    fn multiple_frames_one_read() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"1\r\n2\r\n3\r\n").unwrap();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn incremental_feed() {
        let payload = b"{\"service\":\"Echo\",\"uid\":\"u1\"}\r\n";
        let mut decoder = FrameDecoder::new();
        for byte in &payload[..payload.len() - 1] {
            assert!(decoder.feed(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        let frames = decoder.feed(&payload[payload.len() - 1..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], &payload[..payload.len() - 2]);
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"{\"a\":1}\r\n{\"b\"").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.pending(), 4);
        let frames = decoder.feed(b":2}\r\n").unwrap();
        assert_eq!(frames, vec![b"{\"b\":2}".to_vec()]);
    }

    #[test]
    fn empty_lines_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"\r\n\n{\"a\":1}\r\n\r\n").unwrap();
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec()]);
    }

    #[test]
    fn oversized_buffer_is_rejected() {
        let mut decoder = FrameDecoder::with_limit(8);
        let err = decoder.feed(b"0123456789abcdef").unwrap_err();
        assert!(matches!(err, SwitchboardError::FrameTooLarge { .. }));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::with_limit(4);
        let err = decoder.feed(b"0123456789\r\n").unwrap_err();
        assert!(matches!(
            err,
            SwitchboardError::FrameTooLarge { size: 10, limit: 4 }
        ));
    }

    #[test]
    fn round_trip_through_backend() {
        let backend = JsonBackend::Builtin;
        let value = json!({
            "error": false,
            "service": "Echo",
            "attribute": "echo",
            "args": ["hello"],
            "kwargs": {},
            "uid": "u1",
        });
        let frame = encode_frame(backend, &value).unwrap();
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&frame).unwrap();
        assert_eq!(backend.decode(&payloads[0]).unwrap(), value);
    }
}
