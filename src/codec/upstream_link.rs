//! Combined framing for the physical upstream TCP connection, which
//! carries plain `\n`-terminated stratum JSON (the upstream's own
//! subscribe/authorize/notify/set_difficulty chatter) interleaved with
//! binary ex-frames whenever an ex-frame-aware pool is in use. The two
//! are trivially distinguishable:
//! no JSON document starts with the byte `0x7F`, which is exactly the
//! ex-frame magic.

use super::exframe::{ExFrame, ExFrameCodec, HEADER_LEN, MAGIC};
use super::line::{LineCodec, MAX_LINE_LEN};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    Json(String),
    Ex(ExFrame),
}

#[derive(Debug, Default)]
pub struct UpstreamLinkCodec {
    ex: ExFrameCodec,
    line: LineCodec,
}

impl Decoder for UpstreamLinkCodec {
    type Item = UpstreamFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<UpstreamFrame>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] == MAGIC {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            return Ok(self.ex.decode(src)?.map(UpstreamFrame::Ex));
        }
        Ok(self.line.decode(src)?.map(UpstreamFrame::Json))
    }
}

impl Encoder<UpstreamFrame> for UpstreamLinkCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: UpstreamFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            UpstreamFrame::Json(line) => {
                if line.len() > MAX_LINE_LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "outbound line exceeds MAX_LINE_LEN",
                    ));
                }
                dst.extend_from_slice(line.as_bytes());
                Ok(())
            }
            UpstreamFrame::Ex(frame) => self.ex.encode(frame, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_json_line() {
        let mut codec = UpstreamLinkCodec::default();
        let mut buf = BytesMut::from(&b"{\"id\":1}\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, UpstreamFrame::Json("{\"id\":1}\n".to_string()));
    }

    #[test]
    fn decodes_ex_frame_by_magic_byte() {
        let mut codec = UpstreamLinkCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                UpstreamFrame::Ex(ExFrame::UnregisterWorker { session_id: 9 }),
                &mut buf,
            )
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, UpstreamFrame::Ex(ExFrame::UnregisterWorker { session_id: 9 }));
    }

    #[test]
    fn interleaves_json_and_ex_frames() {
        let mut codec = UpstreamLinkCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(UpstreamFrame::Json("{\"a\":1}\n".to_string()), &mut buf)
            .unwrap();
        codec
            .encode(
                UpstreamFrame::Ex(ExFrame::UnregisterWorker { session_id: 1 }),
                &mut buf,
            )
            .unwrap();
        codec
            .encode(UpstreamFrame::Json("{\"b\":2}\n".to_string()), &mut buf)
            .unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            UpstreamFrame::Json("{\"a\":1}\n".to_string())
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            UpstreamFrame::Ex(ExFrame::UnregisterWorker { session_id: 1 })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            UpstreamFrame::Json("{\"b\":2}\n".to_string())
        );
    }
}
