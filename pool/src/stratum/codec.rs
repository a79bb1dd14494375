//! Newline-delimited JSON framing for Stratum connections.
//!
//! Built on tokio-util's `LinesCodec` so partial lines stay buffered across
//! reads. A line that is not UTF-8, not valid JSON or absurdly long is
//! handed up as [`Frame::Malformed`] instead of an error: `FramedRead` stops
//! for good after the first decoder error, and one bad line must not cost the
//! miner its connection.

use bytes::BytesMut;
use std::io::ErrorKind;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{Message, Request};

/// Longest accepted line. Real Stratum traffic stays well below 1 KiB.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LinesCodecError> for CodecError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => CodecError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line length limit exceeded",
            )),
        }
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Request),
    /// The line was discarded; the stream continues with the next one.
    Malformed { line: String, reason: String },
}

#[derive(Debug)]
pub struct StratumCodec {
    lines: LinesCodec,
    max_length: usize,
}

impl StratumCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self { lines: LinesCodec::new_with_max_length(max_length), max_length }
    }

    fn overlong(&self) -> Frame {
        Frame::Malformed {
            line: String::new(),
            reason: format!("line exceeds {} bytes", self.max_length),
        }
    }

    fn parse_line(line: String) -> Option<Frame> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => Frame::Message(request),
            Err(e) => Frame::Malformed { reason: e.to_string(), line: trimmed.to_string() },
        })
    }
}

impl Default for StratumCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StratumCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = Self::parse_line(line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => return Ok(Some(self.overlong())),
                Err(LinesCodecError::Io(e)) if e.kind() == ErrorKind::InvalidData => {
                    return Ok(Some(Frame::Malformed { line: String::new(), reason: e.to_string() }));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = Self::parse_line(line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => return Ok(Some(self.overlong())),
                Err(LinesCodecError::Io(e)) if e.kind() == ErrorKind::InvalidData => {
                    return Ok(Some(Frame::Malformed { line: String::new(), reason: e.to_string() }));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Encoder<Message> for StratumCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_string(&msg)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(json.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::protocol::{Notification, Response};
    use serde_json::json;

    fn decode_all(codec: &mut StratumCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(&br#"{"id":1,"method":"mining.sub"#[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"scribe\",\"params\":[]}\n");
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Message(req)) => assert_eq!(req.method, "mining.subscribe"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_line_does_not_stop_stream() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(
            &b"{not json}\n\n{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"w\",\"x\"]}\r\n"[..],
        );

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Malformed { line, .. } if line == "{not json}"));
        assert!(matches!(&frames[1], Frame::Message(req) if req.method == "mining.authorize"));
    }

    #[test]
    fn test_overlong_line_is_discarded() {
        let mut codec = StratumCodec::with_max_length(32);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 64]);
        buf.extend_from_slice(b"\n{\"id\":1,\"method\":\"a\"}\n");

        let frames = decode_all(&mut codec, &mut buf);
        assert!(matches!(frames.first(), Some(Frame::Malformed { .. })));
        assert!(matches!(frames.last(), Some(Frame::Message(req)) if req.method == "a"));
    }

    #[test]
    fn test_invalid_utf8_line_is_discarded() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\xff\xfe{\"id\":1}\n");
        buf.extend_from_slice(b"{\"id\":2,\"method\":\"mining.subscribe\",\"params\":[]}\n");

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Malformed { .. }));
        assert!(matches!(&frames[1], Frame::Message(req) if req.method == "mining.subscribe"));
    }

    #[test]
    fn test_invalid_utf8_at_eof() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(codec.decode_eof(&mut buf).unwrap(), Some(Frame::Malformed { .. })));
    }

    #[test]
    fn test_unterminated_line_at_eof() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(&br#"{"id":3,"method":"mining.submit","params":[]}"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(codec.decode_eof(&mut buf).unwrap(), Some(Frame::Message(_))));
    }

    #[test]
    fn test_encode_appends_single_newline() {
        let mut codec = StratumCodec::new();
        let mut dst = BytesMut::new();

        codec.encode(Response::success(json!(1), json!(true)).into(), &mut dst).unwrap();
        codec.encode(Notification::set_difficulty(2.0).into(), &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        let lines: Vec<&str> = text.split_terminator('\n').collect();
        assert_eq!(lines.len(), 2);
        assert!(text.ends_with("]}\n"));
        assert!(!text.contains("\n\n"));
    }
}
