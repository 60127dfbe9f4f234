// protocol.rs - relay control protocol between client and agent
//
// Frames are a 4-byte big-endian length followed by the body. The body starts
// with a tag byte:
//
// | 0x01 request | target len(2B) | target | count(4B) | interval ms(4B) | timeout ms(4B) | payload len(2B) |
// | 0x02 result  | seq(4B) | replied(1B) | [ ttl(1B) | rtt us(4B) ] |
// | 0x03 summary | tx(4B) | rx(4B) | lost(4B) | loss pct(f64) | has rtt(1B) | [ min us(4B) | max us(4B) | avg us(4B) ] |
// | 0x04 error   | kind(1B) | message len(2B) | message |
//
// A count of 0 means "until cancelled".

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RelayError;
use crate::stats::{PacketOutcome, RttStats, SessionSummary};

/// Largest frame body either side accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;

const TAG_REQUEST: u8 = 0x01;
const TAG_RESULT: u8 = 0x02;
const TAG_SUMMARY: u8 = 0x03;
const TAG_ERROR: u8 = 0x04;

/// Client to agent: what to ping and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRequest {
    /// Host name or address, resolved by the agent.
    pub target: String,
    /// Number of echo requests; `None` runs until the client goes away.
    pub count: Option<u32>,
    pub interval_ms: u32,
    pub timeout_ms: u32,
    /// Echo payload size in bytes.
    pub payload_len: u16,
}

impl PingRequest {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms as u64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }
}

/// Agent to client: how one sequence number resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResult {
    pub sequence: u32,
    pub outcome: PacketOutcome,
}

/// Why the agent could not run (or finish) a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidIntent = 1,
    Unresolvable = 2,
    TransportUnavailable = 3,
    Internal = 4,
}

impl ErrorKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::InvalidIntent),
            2 => Some(Self::Unresolvable),
            3 => Some(Self::TransportUnavailable),
            4 => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIntent => write!(f, "invalid intent"),
            Self::Unresolvable => write!(f, "unresolvable target"),
            Self::TransportUnavailable => write!(f, "transport unavailable"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Request(PingRequest),
    Result(PingResult),
    /// Terminal message of a completed session.
    Summary(SessionSummary),
    /// Terminal message of a session that could not proceed.
    Error { kind: ErrorKind, message: String },
}

impl RelayMessage {
    pub fn error(err: &RelayError) -> Self {
        RelayMessage::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Length-delimited codec for [`RelayMessage`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayCodec;

fn protocol_error(msg: impl Into<String>) -> RelayError {
    RelayError::Protocol(msg.into())
}

fn ensure(buf: &impl Buf, len: usize, what: &str) -> Result<(), RelayError> {
    if buf.remaining() < len {
        return Err(protocol_error(format!("truncated {what}")));
    }
    Ok(())
}

fn get_string(buf: &mut impl Buf, what: &str) -> Result<String, RelayError> {
    ensure(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len, what)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| protocol_error(format!("{what} is not UTF-8")))
}

fn put_string(dst: &mut BytesMut, s: &str, what: &str) -> Result<(), RelayError> {
    let len = u16::try_from(s.len()).map_err(|_| protocol_error(format!("{what} too long")))?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn micros(d: Duration) -> u32 {
    d.as_micros().min(u32::MAX as u128) as u32
}

fn get_micros(buf: &mut impl Buf) -> Duration {
    Duration::from_micros(buf.get_u32() as u64)
}

fn decode_body(mut body: &[u8]) -> Result<RelayMessage, RelayError> {
    let buf = &mut body;
    ensure(buf, 1, "frame")?;

    let message = match buf.get_u8() {
        TAG_REQUEST => {
            let target = get_string(buf, "target")?;
            ensure(buf, 14, "request")?;
            let count = buf.get_u32();
            RelayMessage::Request(PingRequest {
                target,
                count: (count != 0).then_some(count),
                interval_ms: buf.get_u32(),
                timeout_ms: buf.get_u32(),
                payload_len: buf.get_u16(),
            })
        }
        TAG_RESULT => {
            ensure(buf, 5, "result")?;
            let sequence = buf.get_u32();
            let outcome = match buf.get_u8() {
                0 => PacketOutcome::Lost,
                1 => {
                    ensure(buf, 5, "result")?;
                    let ttl = buf.get_u8();
                    PacketOutcome::Replied {
                        ttl,
                        rtt: get_micros(buf),
                    }
                }
                other => return Err(protocol_error(format!("bad outcome {other}"))),
            };
            RelayMessage::Result(PingResult { sequence, outcome })
        }
        TAG_SUMMARY => {
            ensure(buf, 21, "summary")?;
            let tx = buf.get_u32();
            let rx = buf.get_u32();
            let lost = buf.get_u32();
            let loss_pct = buf.get_f64();
            let rtt = match buf.get_u8() {
                0 => None,
                _ => {
                    ensure(buf, 12, "summary")?;
                    Some(RttStats {
                        min: get_micros(buf),
                        max: get_micros(buf),
                        avg: get_micros(buf),
                    })
                }
            };
            RelayMessage::Summary(SessionSummary {
                tx,
                rx,
                lost,
                loss_pct,
                rtt,
            })
        }
        TAG_ERROR => {
            ensure(buf, 1, "error")?;
            let raw = buf.get_u8();
            let kind = ErrorKind::from_u8(raw)
                .ok_or_else(|| protocol_error(format!("bad error kind {raw}")))?;
            let message = get_string(buf, "error message")?;
            RelayMessage::Error { kind, message }
        }
        other => return Err(protocol_error(format!("unknown message tag {other:#04x}"))),
    };

    if buf.has_remaining() {
        return Err(protocol_error("trailing bytes in frame"));
    }
    Ok(message)
}

fn encode_body(item: &RelayMessage, dst: &mut BytesMut) -> Result<(), RelayError> {
    match item {
        RelayMessage::Request(req) => {
            dst.put_u8(TAG_REQUEST);
            put_string(dst, &req.target, "target")?;
            dst.put_u32(req.count.unwrap_or(0));
            dst.put_u32(req.interval_ms);
            dst.put_u32(req.timeout_ms);
            dst.put_u16(req.payload_len);
        }
        RelayMessage::Result(result) => {
            dst.put_u8(TAG_RESULT);
            dst.put_u32(result.sequence);
            match result.outcome {
                PacketOutcome::Lost => dst.put_u8(0),
                PacketOutcome::Replied { ttl, rtt } => {
                    dst.put_u8(1);
                    dst.put_u8(ttl);
                    dst.put_u32(micros(rtt));
                }
            }
        }
        RelayMessage::Summary(summary) => {
            dst.put_u8(TAG_SUMMARY);
            dst.put_u32(summary.tx);
            dst.put_u32(summary.rx);
            dst.put_u32(summary.lost);
            dst.put_f64(summary.loss_pct);
            match summary.rtt {
                None => dst.put_u8(0),
                Some(rtt) => {
                    dst.put_u8(1);
                    dst.put_u32(micros(rtt.min));
                    dst.put_u32(micros(rtt.max));
                    dst.put_u32(micros(rtt.avg));
                }
            }
        }
        RelayMessage::Error { kind, message } => {
            dst.put_u8(TAG_ERROR);
            dst.put_u8(*kind as u8);
            put_string(dst, message, "error message")?;
        }
    }
    Ok(())
}

impl Decoder for RelayCodec {
    type Item = RelayMessage;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(protocol_error(format!("frame of {len} bytes exceeds limit")));
        }

        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let body = src.split_to(len);
        decode_body(&body).map(Some)
    }
}

impl Encoder<RelayMessage> for RelayCodec {
    type Error = RelayError;

    fn encode(&mut self, item: RelayMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0);
        if let Err(err) = encode_body(&item, dst) {
            dst.truncate(start);
            return Err(err);
        }

        let len = dst.len() - start - LEN_PREFIX;
        if len > MAX_FRAME_LEN {
            dst.truncate(start);
            return Err(protocol_error(format!("frame of {len} bytes exceeds limit")));
        }
        dst[start..start + LEN_PREFIX].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }
}
