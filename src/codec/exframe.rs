//! Binary ex-frame codec for the upstream multiplexing channel (C3).
//!
//! Wire format:
//!
//! ```text
//!   offset  size  field
//!        0     1  magic = 0x7F
//!        1     1  kind
//!        2     2  length (LE) of entire frame including header
//!        4     …  payload
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

pub const MAGIC: u8 = 0x7F;
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExFrame {
    /// Agent -> Pool. `{ sessionId, agent, workerName }`.
    RegisterWorker {
        session_id: u16,
        agent: String,
        worker_name: String,
    },
    /// Agent -> Pool. `{ sessionId, jobId, exNonce2, nonce }`.
    SubmitShare {
        session_id: u16,
        job_id: u8,
        ex_nonce2: u32,
        nonce: u32,
    },
    /// Agent -> Pool. As `SubmitShare` plus `nTime`.
    SubmitShareWithTime {
        session_id: u16,
        job_id: u8,
        ex_nonce2: u32,
        nonce: u32,
        n_time: u32,
    },
    /// Agent -> Pool. `{ sessionId }`.
    UnregisterWorker { session_id: u16 },
    /// Pool -> Agent. `{ diff, sessionIds }`.
    MiningSetDiff { diff: u32, session_ids: Vec<u16> },
}

mod kind {
    pub const REGISTER_WORKER: u8 = 0x01;
    pub const SUBMIT_SHARE: u8 = 0x02;
    pub const SUBMIT_SHARE_WITH_TIME: u8 = 0x03;
    pub const UNREGISTER_WORKER: u8 = 0x04;
    pub const MINING_SET_DIFF: u8 = 0x05;
}

impl ExFrame {
    fn kind(&self) -> u8 {
        match self {
            ExFrame::RegisterWorker { .. } => kind::REGISTER_WORKER,
            ExFrame::SubmitShare { .. } => kind::SUBMIT_SHARE,
            ExFrame::SubmitShareWithTime { .. } => kind::SUBMIT_SHARE_WITH_TIME,
            ExFrame::UnregisterWorker { .. } => kind::UNREGISTER_WORKER,
            ExFrame::MiningSetDiff { .. } => kind::MINING_SET_DIFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExFrameError {
    /// First byte wasn't `0x7F`, or the declared length makes no sense
    /// for the frame's kind. The link is poisoned once this happens
    ///: the codec never tries to resynchronize.
    BadFrame,
}

impl fmt::Display for ExFrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExFrameError::BadFrame => write!(f, "bad ex-frame: magic or length mismatch"),
        }
    }
}

impl std::error::Error for ExFrameError {}

impl From<ExFrameError> for std::io::Error {
    fn from(e: ExFrameError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    }
}

#[derive(Debug, Default)]
pub struct ExFrameCodec;

fn cstr_len(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|&b| b == 0)
}

impl Decoder for ExFrameCodec {
    type Item = ExFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ExFrame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[0] != MAGIC {
            return Err(ExFrameError::BadFrame.into());
        }
        let kind = src[1];
        let len = u16::from_le_bytes([src[2], src[3]]) as usize;
        if len < HEADER_LEN {
            return Err(ExFrameError::BadFrame.into());
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        frame.advance(HEADER_LEN);
        let payload = &frame[..];

        let parsed = match kind {
            kind::REGISTER_WORKER => {
                if payload.len() < 2 {
                    return Err(ExFrameError::BadFrame.into());
                }
                let session_id = u16::from_le_bytes([payload[0], payload[1]]);
                let rest = &payload[2..];
                let agent_len = cstr_len(rest).ok_or(ExFrameError::BadFrame)?;
                let agent = String::from_utf8_lossy(&rest[..agent_len]).into_owned();
                let rest = &rest[agent_len + 1..];
                let worker_len = cstr_len(rest).ok_or(ExFrameError::BadFrame)?;
                let worker_name = String::from_utf8_lossy(&rest[..worker_len]).into_owned();
                ExFrame::RegisterWorker {
                    session_id,
                    agent,
                    worker_name,
                }
            }
            kind::SUBMIT_SHARE => {
                if payload.len() != 11 {
                    return Err(ExFrameError::BadFrame.into());
                }
                ExFrame::SubmitShare {
                    session_id: u16::from_le_bytes([payload[0], payload[1]]),
                    job_id: payload[2],
                    ex_nonce2: u32::from_le_bytes(payload[3..7].try_into().unwrap()),
                    nonce: u32::from_le_bytes(payload[7..11].try_into().unwrap()),
                }
            }
            kind::SUBMIT_SHARE_WITH_TIME => {
                if payload.len() != 15 {
                    return Err(ExFrameError::BadFrame.into());
                }
                ExFrame::SubmitShareWithTime {
                    session_id: u16::from_le_bytes([payload[0], payload[1]]),
                    job_id: payload[2],
                    ex_nonce2: u32::from_le_bytes(payload[3..7].try_into().unwrap()),
                    nonce: u32::from_le_bytes(payload[7..11].try_into().unwrap()),
                    n_time: u32::from_le_bytes(payload[11..15].try_into().unwrap()),
                }
            }
            kind::UNREGISTER_WORKER => {
                if payload.len() != 2 {
                    return Err(ExFrameError::BadFrame.into());
                }
                ExFrame::UnregisterWorker {
                    session_id: u16::from_le_bytes([payload[0], payload[1]]),
                }
            }
            kind::MINING_SET_DIFF => {
                if payload.len() < 6 {
                    return Err(ExFrameError::BadFrame.into());
                }
                let diff = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let count = u16::from_le_bytes([payload[4], payload[5]]) as usize;
                let rest = &payload[6..];
                if rest.len() != count * 2 {
                    return Err(ExFrameError::BadFrame.into());
                }
                let session_ids = rest
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                ExFrame::MiningSetDiff { diff, session_ids }
            }
            _ => return Err(ExFrameError::BadFrame.into()),
        };
        Ok(Some(parsed))
    }
}

impl Encoder<ExFrame> for ExFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: ExFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = frame.kind();
        let mut payload = BytesMut::new();
        match &frame {
            ExFrame::RegisterWorker {
                session_id,
                agent,
                worker_name,
            } => {
                payload.put_u16_le(*session_id);
                payload.put_slice(agent.as_bytes());
                payload.put_u8(0);
                payload.put_slice(worker_name.as_bytes());
                payload.put_u8(0);
            }
            ExFrame::SubmitShare {
                session_id,
                job_id,
                ex_nonce2,
                nonce,
            } => {
                payload.put_u16_le(*session_id);
                payload.put_u8(*job_id);
                payload.put_u32_le(*ex_nonce2);
                payload.put_u32_le(*nonce);
            }
            ExFrame::SubmitShareWithTime {
                session_id,
                job_id,
                ex_nonce2,
                nonce,
                n_time,
            } => {
                payload.put_u16_le(*session_id);
                payload.put_u8(*job_id);
                payload.put_u32_le(*ex_nonce2);
                payload.put_u32_le(*nonce);
                payload.put_u32_le(*n_time);
            }
            ExFrame::UnregisterWorker { session_id } => {
                payload.put_u16_le(*session_id);
            }
            ExFrame::MiningSetDiff { diff, session_ids } => {
                payload.put_u32_le(*diff);
                payload.put_u16_le(session_ids.len() as u16);
                for id in session_ids {
                    payload.put_u16_le(*id);
                }
            }
        }

        let total_len = HEADER_LEN + payload.len();
        dst.reserve(total_len);
        dst.put_u8(MAGIC);
        dst.put_u8(kind);
        dst.put_u16_le(total_len as u16);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: ExFrame) {
        let mut codec = ExFrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_all_kinds() {
        round_trip(ExFrame::RegisterWorker {
            session_id: 0x1234,
            agent: "cgminer/1.0".to_string(),
            worker_name: "worker1".to_string(),
        });
        round_trip(ExFrame::SubmitShare {
            session_id: 0x1234,
            job_id: 5,
            ex_nonce2: 0xdeadbeef,
            nonce: 0xcafebabe,
        });
        round_trip(ExFrame::SubmitShareWithTime {
            session_id: 0x1234,
            job_id: 5,
            ex_nonce2: 0xdeadbeef,
            nonce: 0xcafebabe,
            n_time: 0x61000010,
        });
        round_trip(ExFrame::UnregisterWorker { session_id: 7 });
        round_trip(ExFrame::MiningSetDiff {
            diff: 1024,
            session_ids: vec![1, 2, 3],
        });
    }

    #[test]
    fn share_forwarding_with_matching_ntime_omits_time() {
        // session 0x1234, jobId 5, exNonce2 "deadbeef", nonce "cafebabe",
        // matching nTime -> SUBMIT_SHARE.
        let mut codec = ExFrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                ExFrame::SubmitShare {
                    session_id: 0x1234,
                    job_id: 5,
                    ex_nonce2: 0xdeadbeef,
                    nonce: 0xcafebabe,
                },
                &mut buf,
            )
            .unwrap();
        let expected: &[u8] = &[
            0x7F, 0x02, 0x0F, 0x00, 0x34, 0x12, 0x05, 0xEF, 0xBE, 0xAD, 0xDE, 0xBE, 0xBA, 0xFE,
            0xCA,
        ];
        assert_eq!(&buf[..], expected);
    }

    #[test]
    fn share_with_time_matches_spec_scenario_5_variant() {
        let mut codec = ExFrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                ExFrame::SubmitShareWithTime {
                    session_id: 0x1234,
                    job_id: 5,
                    ex_nonce2: 0xdeadbeef,
                    nonce: 0xcafebabe,
                    n_time: 0x61000010,
                },
                &mut buf,
            )
            .unwrap();
        let expected: &[u8] = &[
            0x7F, 0x03, 0x13, 0x00, 0x34, 0x12, 0x05, 0xEF, 0xBE, 0xAD, 0xDE, 0xBE, 0xBA, 0xFE,
            0xCA, 0x10, 0x00, 0x00, 0x61,
        ];
        assert_eq!(&buf[..], expected);
    }

    #[test]
    fn bad_magic_is_rejected_without_resync() {
        let mut codec = ExFrameCodec;
        let mut buf = BytesMut::from(&[0x00u8, 0x02, 0x0F, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn truncated_frame_asks_for_more() {
        let mut codec = ExFrameCodec;
        let mut buf = BytesMut::from(&[0x7Fu8, 0x02, 0x0F, 0x00, 0x34][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
