//! Incremental frame decoder for the text event stream.
//!
//! Frames are separated by a blank line (`\n\n` or `\r\n\r\n`). Chunks may
//! split a frame, a delimiter or a multi-byte character at any byte; the
//! decoder buffers raw bytes and only decodes text once a whole frame is
//! available.

use bytes::{Buf, BytesMut};

use crate::stream::proto::ProtocolError;

/// One delimited unit of the stream, before its data is interpreted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// Value of the `id:` line, if any.
    pub id: Option<String>,
    /// Value of the `event:` line, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

impl Frame {
    /// Parses the lines of one frame.
    ///
    /// Returns `None` for frames without any `data:` line, such as keep-alive
    /// comments.
    pub fn parse(text: &str) -> Option<Self> {
        let mut frame = Frame::default();
        let mut data_lines: Vec<&str> = Vec::new();

        for line in text.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "id" => frame.id = Some(value.trim().to_string()),
                "event" => frame.event = Some(value.trim().to_string()),
                "data" => data_lines.push(value),
                // `retry:` and unknown fields carry nothing for this transport.
                _ => {}
            }
        }

        if data_lines.is_empty() {
            return None;
        }
        frame.data = data_lines.join("\n");
        Some(frame)
    }
}

/// Buffers raw body chunks and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of the response body.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` when more bytes are needed.
    ///
    /// Delimited blocks without data are skipped.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        loop {
            let (pos, delim_len) = find_delimiter(&self.buffer, self.scanned)?;
            let block = self.buffer.split_to(pos);
            self.buffer.advance(delim_len);
            self.scanned = 0;

            if let Some(frame) = decode_block(&block) {
                return Some(frame);
            }
        }
    }

    /// Drains every complete frame currently buffered.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<Frame, ProtocolError>> {
        self.push(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        self.scanned = self.buffer.len().saturating_sub(3);
        frames
    }

    /// Flushes the buffer at end of stream.
    ///
    /// A trailing frame that is missing its final blank line is still
    /// returned.
    pub fn finish(&mut self) -> Vec<Result<Frame, ProtocolError>> {
        let mut frames = self.decode(&[]);
        let rest = self.buffer.split();
        self.scanned = 0;
        if let Some(frame) = decode_block(&rest) {
            frames.push(frame);
        }
        frames
    }

    /// Number of bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_block(block: &[u8]) -> Option<Result<Frame, ProtocolError>> {
    if block.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match std::str::from_utf8(block) {
        Ok(text) => Frame::parse(text).map(Ok),
        Err(_) => Some(Err(ProtocolError::InvalidUtf8)),
    }
}

/// Finds the earliest blank-line delimiter at or after `from`.
fn find_delimiter(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    let window = buffer.get(from..)?;
    let lf = window.windows(2).position(|w| w == b"\n\n");
    let crlf = window.windows(4).position(|w| w == b"\r\n\r\n");

    let (pos, len) = match (lf, crlf) {
        (Some(l), Some(c)) if c < l => (c, 4),
        (Some(l), _) => (l, 2),
        (None, Some(c)) => (c, 4),
        (None, None) => return None,
    };
    Some((from + pos, len))
}

#[cfg(test)]
mod tests {
    use super::{Frame, FrameDecoder};
    use crate::stream::proto::ProtocolError;

    const ANSWER: &str = "id: 1\ndata: {\"type\":\"answer\",\"data\":{\"text\":\"hi\"}}\n\n";

    fn frames(results: Vec<Result<Frame, ProtocolError>>) -> Vec<Frame> {
        results
            .into_iter()
            .map(|frame| frame.expect("well-formed frame"))
            .collect()
    }

    #[test]
    fn parses_single_frame() {
        let mut decoder = FrameDecoder::new();
        let out = frames(decoder.decode(ANSWER.as_bytes()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id.as_deref(), Some("1"));
        assert_eq!(
            out[0].data,
            "{\"type\":\"answer\",\"data\":{\"text\":\"hi\"}}"
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn every_two_chunk_split_yields_one_frame() {
        let bytes = ANSWER.as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut out = frames(decoder.decode(&bytes[..split]));
            out.extend(frames(decoder.decode(&bytes[split..])));
            out.extend(frames(decoder.finish()));
            assert_eq!(out.len(), 1, "split at {split}");
            assert_eq!(out[0].id.as_deref(), Some("1"), "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_preserves_order() {
        let body = "id: a\ndata: {\"type\":\"thought\"}\n\n\
                    id: b\ndata: {\"type\":\"heartbeat\"}\n\n\
                    id: c\ndata: {\"type\":\"answer\"}\n\n";
        let mut decoder = FrameDecoder::new();
        let mut ids = Vec::new();
        for byte in body.as_bytes() {
            for frame in frames(decoder.decode(std::slice::from_ref(byte))) {
                ids.push(frame.id.unwrap_or_default());
            }
        }
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn multibyte_characters_split_across_chunks() {
        let body = "data: {\"type\":\"answer\",\"data\":\"héllo ✓\"}\n\n".as_bytes();
        let check = body
            .iter()
            .position(|b| *b == 0xE2)
            .expect("check mark start");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&body[..check + 1]).is_empty());
        let out = frames(decoder.decode(&body[check + 1..]));
        assert_eq!(out.len(), 1);
        assert!(out[0].data.contains("héllo ✓"));
    }

    #[test]
    fn crlf_delimiters_are_recognised() {
        let body = b"id: 9\r\ndata: {\"type\":\"status\"}\r\n\r\nid: 10\r\ndata: {}\r\n\r\n";
        let mut decoder = FrameDecoder::new();
        let out = frames(decoder.decode(body));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id.as_deref(), Some("9"));
        assert_eq!(out[0].data, "{\"type\":\"status\"}");
        assert_eq!(out[1].id.as_deref(), Some("10"));
    }

    #[test]
    fn finish_flushes_frame_without_trailing_delimiter() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder
            .decode(b"id: 5\ndata: {\"type\":\"complete\"}")
            .is_empty());
        let out = frames(decoder.finish());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id.as_deref(), Some("5"));
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn comments_and_empty_blocks_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let out = frames(decoder.decode(b": keep-alive\n\n\n\nretry: 100\n\ndata: {}\n\n"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, "{}");
    }

    #[test]
    fn multiline_data_is_joined() {
        let frame = Frame::parse("event: answer\ndata: {\"a\":\ndata: 1}").expect("frame");
        assert_eq!(frame.event.as_deref(), Some("answer"));
        assert_eq!(frame.data, "{\"a\":\n1}");
    }

    #[test]
    fn invalid_utf8_is_reported_and_decoding_continues() {
        let mut decoder = FrameDecoder::new();
        let mut body = b"data: \xff\xfe\n\n".to_vec();
        body.extend_from_slice(ANSWER.as_bytes());
        let out = decoder.decode(&body);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(ProtocolError::InvalidUtf8)));
        assert_eq!(
            out[1].as_ref().expect("second frame").id.as_deref(),
            Some("1")
        );
    }
}
