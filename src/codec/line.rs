//! LF-terminated frame reader for the downstream and upstream stratum
//! links (C2). A `tokio_util::codec::Decoder` so it composes with
//! `Framed` the same way `ExFrameCodec` does.

use bytes::BytesMut;
use std::fmt;
use tokio_util::codec::Decoder;

/// Frames larger than this are refused to bound memory; no frame length
/// limit below it.
pub const MAX_LINE_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCodecError {
    /// No `\n` found within `MAX_LINE_LEN` bytes of buffered input.
    FrameTooLarge,
}

impl fmt::Display for LineCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineCodecError::FrameTooLarge => {
                write!(f, "line exceeded {} bytes without a terminator", MAX_LINE_LEN)
            }
        }
    }
}

impl std::error::Error for LineCodecError {}

impl From<LineCodecError> for std::io::Error {
    fn from(e: LineCodecError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    }
}

/// Decodes a byte stream into complete `\n`-terminated frames. The
/// terminator is retained in the returned `String`, matching what the
/// rest of this crate expects when re-serializing or logging raw lines.
#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(pos) = src.iter().position(|b| *b == b'\n') {
            let line = src.split_to(pos + 1);
            let s = String::from_utf8_lossy(&line).into_owned();
            return Ok(Some(s));
        }
        if src.len() > MAX_LINE_LEN {
            return Err(LineCodecError::FrameTooLarge.into());
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                // Trailing partial line with no terminator at EOF: drop it,
                // same as the legacy buffer-event reader which only ever
                // surfaces data up to the last `\n`.
                src.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_line() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"hello\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, "hello\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn buffers_partial_frames() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"hel"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lo\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, "hello\n");
    }

    #[test]
    fn splits_multiple_frames_one_at_a_time() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"a\nb\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "a\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "b\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_LEN + 1].as_slice());
        assert!(codec.decode(&mut buf).is_err());
    }
}
