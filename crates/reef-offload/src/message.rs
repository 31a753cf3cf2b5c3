//! Offload requests, replies, and their wire frames.
//!
//! Every frame travels as a 4-byte big-endian length prefix followed by
//! the frame body. The body starts with a one-byte kind tag:
//!
//! ```text
//! Attach    0x01 | data_units u8 | parity_units u8 | endpoint (utf-8, rest)
//! Attached  0x02
//! Request   0x03 | id u64 | erasure [lo, hi] | survival [lo, hi] | cell_length u32
//!                | persistent u8 | priority u8 | ttl_ms u32 | sent_at_ms u64 | payload (rest)
//! Reply     0x04 | id u64 | payload (rest)
//! Fault     0x05 | id u64 | message (utf-8, rest)
//! ```
//!
//! Patterns use the nibble split of [`BitPattern::to_nibble_bytes`].
//! Integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::DeliveryOptions;
use crate::error::ChannelError;
use crate::pattern::BitPattern;

/// Largest accepted frame body: 256 MiB.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const KIND_ATTACH: u8 = 0x01;
const KIND_ATTACHED: u8 = 0x02;
const KIND_REQUEST: u8 = 0x03;
const KIND_REPLY: u8 = 0x04;
const KIND_FAULT: u8 = 0x05;

/// One coding request for the compute service.
///
/// `payload` holds `k` surviving cells, unit-major, `cell_length` bytes
/// each: the units named by the lowest `k` set bits of `survival_pattern`.
/// A decode pattern may name more valid units than that; the rest are not
/// carried. The service answers with the units of `erasure_pattern`,
/// ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadRequest {
    /// Units to produce.
    pub erasure_pattern: BitPattern,
    /// Valid units; the lowest `k` are the ones in the payload.
    pub survival_pattern: BitPattern,
    /// Bytes per cell.
    pub cell_length: usize,
    /// Packed input cells.
    pub payload: Bytes,
}

/// The compute service's answer: the produced cells, unit-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadReply {
    /// Packed output cells.
    pub payload: Bytes,
}

/// A request as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Per-session correlation id.
    pub id: u64,
    /// Broker delivery hints.
    pub delivery: DeliveryOptions,
    /// Milliseconds since the Unix epoch when the request was sent.
    pub sent_at_ms: u64,
    /// The request itself.
    pub request: OffloadRequest,
}

impl RequestEnvelope {
    /// Whether the request's time-to-live has passed at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.delivery.time_to_live_ms != 0
            && now_ms.saturating_sub(self.sent_at_ms) > u64::from(self.delivery.time_to_live_ms)
    }
}

/// Frames exchanged between a channel and the compute proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Bind this connection to an endpoint's request/response queues.
    Attach {
        /// Endpoint name, e.g. a PCIe function address.
        endpoint: String,
        /// Data units of the session's coding configuration.
        data_units: u8,
        /// Parity units of the session's coding configuration.
        parity_units: u8,
    },
    /// The proxy accepted an [`Frame::Attach`].
    Attached,
    /// A coding request.
    Request(RequestEnvelope),
    /// Successful answer to the request with the same id.
    Reply {
        /// Id of the answered request.
        id: u64,
        /// Packed output cells.
        payload: Bytes,
    },
    /// The proxy could not serve a request (or an attach, with id 0).
    Fault {
        /// Id of the failed request.
        id: u64,
        /// Human-readable reason.
        message: String,
    },
}

/// Milliseconds since the Unix epoch (0 if the clock is before it).
pub fn unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn malformed(what: impl std::fmt::Display) -> ChannelError {
    ChannelError::TransportFailure(format!("malformed frame: {what}"))
}

fn need(buf: &Bytes, n: usize, field: &str) -> Result<(), ChannelError> {
    if buf.remaining() < n {
        return Err(malformed(format!("truncated at {field}")));
    }
    Ok(())
}

fn utf8(bytes: Bytes, field: &str) -> Result<String, ChannelError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed(format!("{field} is not utf-8")))
}

impl Frame {
    /// Serialize the frame body (without the length prefix).
    ///
    /// # Errors
    ///
    /// Fails if a request's cell length does not fit the 32-bit wire field.
    pub fn encode(&self) -> Result<Bytes, ChannelError> {
        let mut buf = BytesMut::new();
        match self {
            Frame::Attach {
                endpoint,
                data_units,
                parity_units,
            } => {
                buf.put_u8(KIND_ATTACH);
                buf.put_u8(*data_units);
                buf.put_u8(*parity_units);
                buf.put_slice(endpoint.as_bytes());
            }
            Frame::Attached => buf.put_u8(KIND_ATTACHED),
            Frame::Request(envelope) => {
                let request = &envelope.request;
                let cell_length = u32::try_from(request.cell_length).map_err(|_| {
                    malformed(format!("cell length {} exceeds 32 bits", request.cell_length))
                })?;
                let (erasure_lo, erasure_hi) = request.erasure_pattern.to_nibble_bytes();
                let (survival_lo, survival_hi) = request.survival_pattern.to_nibble_bytes();

                buf.reserve(32 + request.payload.len());
                buf.put_u8(KIND_REQUEST);
                buf.put_u64(envelope.id);
                buf.put_u8(erasure_lo);
                buf.put_u8(erasure_hi);
                buf.put_u8(survival_lo);
                buf.put_u8(survival_hi);
                buf.put_u32(cell_length);
                buf.put_u8(u8::from(envelope.delivery.persistent));
                buf.put_u8(envelope.delivery.priority);
                buf.put_u32(envelope.delivery.time_to_live_ms);
                buf.put_u64(envelope.sent_at_ms);
                buf.put_slice(&request.payload);
            }
            Frame::Reply { id, payload } => {
                buf.reserve(9 + payload.len());
                buf.put_u8(KIND_REPLY);
                buf.put_u64(*id);
                buf.put_slice(payload);
            }
            Frame::Fault { id, message } => {
                buf.put_u8(KIND_FAULT);
                buf.put_u64(*id);
                buf.put_slice(message.as_bytes());
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a frame body.
    pub fn decode(mut buf: Bytes) -> Result<Frame, ChannelError> {
        need(&buf, 1, "kind")?;
        match buf.get_u8() {
            KIND_ATTACH => {
                need(&buf, 2, "unit counts")?;
                let data_units = buf.get_u8();
                let parity_units = buf.get_u8();
                Ok(Frame::Attach {
                    endpoint: utf8(buf, "endpoint")?,
                    data_units,
                    parity_units,
                })
            }
            KIND_ATTACHED => Ok(Frame::Attached),
            KIND_REQUEST => {
                need(&buf, 30, "request header")?;
                let id = buf.get_u64();
                let erasure_pattern = BitPattern::from_nibble_bytes(buf.get_u8(), buf.get_u8());
                let survival_pattern = BitPattern::from_nibble_bytes(buf.get_u8(), buf.get_u8());
                let cell_length = buf.get_u32() as usize;
                let persistent = buf.get_u8() != 0;
                let priority = buf.get_u8();
                let time_to_live_ms = buf.get_u32();
                let sent_at_ms = buf.get_u64();
                Ok(Frame::Request(RequestEnvelope {
                    id,
                    delivery: DeliveryOptions {
                        persistent,
                        priority,
                        time_to_live_ms,
                    },
                    sent_at_ms,
                    request: OffloadRequest {
                        erasure_pattern,
                        survival_pattern,
                        cell_length,
                        payload: buf,
                    },
                }))
            }
            KIND_REPLY => {
                need(&buf, 8, "reply id")?;
                let id = buf.get_u64();
                Ok(Frame::Reply { id, payload: buf })
            }
            KIND_FAULT => {
                need(&buf, 8, "fault id")?;
                let id = buf.get_u64();
                Ok(Frame::Fault {
                    id,
                    message: utf8(buf, "fault message")?,
                })
            }
            other => Err(malformed(format!("unknown kind {other:#04x}"))),
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode()?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(malformed(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(malformed(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(Bytes::from(body)).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Frame {
        Frame::Request(RequestEnvelope {
            id: 42,
            delivery: DeliveryOptions {
                persistent: true,
                priority: 7,
                time_to_live_ms: 1500,
            },
            sent_at_ms: 1_700_000_000_000,
            request: OffloadRequest {
                erasure_pattern: BitPattern::from_bits(0x18),
                survival_pattern: BitPattern::from_bits(0x07),
                cell_length: 4,
                payload: Bytes::from_static(&[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]),
            },
        })
    }

    #[test]
    fn test_request_layout() {
        let body = sample_request().encode().unwrap();
        assert_eq!(body[0], KIND_REQUEST);
        assert_eq!(&body[1..9], &42u64.to_be_bytes());
        // 0x18 -> (8, 1); 0x07 -> (7, 0).
        assert_eq!(&body[9..13], &[0x08, 0x01, 0x07, 0x00]);
        assert_eq!(&body[13..17], &4u32.to_be_bytes());
        assert_eq!(&body[17..19], &[1, 7]);
        assert_eq!(&body[19..23], &1500u32.to_be_bytes());
        assert_eq!(&body[31..], &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn test_every_kind_parses_back() {
        let frames = vec![
            Frame::Attach {
                endpoint: "0000:01:00.1".into(),
                data_units: 3,
                parity_units: 2,
            },
            Frame::Attached,
            sample_request(),
            Frame::Reply {
                id: 9,
                payload: Bytes::from_static(b"cells"),
            },
            Frame::Fault {
                id: 0,
                message: "unknown endpoint".into(),
            },
        ];
        for frame in frames {
            let body = frame.encode().unwrap();
            assert_eq!(Frame::decode(body).unwrap(), frame);
        }
    }

    #[test]
    fn test_truncated_request_rejected() {
        let body = sample_request().encode().unwrap();
        let err = Frame::decode(body.slice(..20)).unwrap_err();
        assert!(matches!(err, ChannelError::TransportFailure(_)));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Frame::decode(Bytes::from_static(&[0x7f])).is_err());
        assert!(Frame::decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_expiry() {
        let Frame::Request(mut envelope) = sample_request() else {
            unreachable!()
        };
        assert!(!envelope.is_expired(envelope.sent_at_ms + 1500));
        assert!(envelope.is_expired(envelope.sent_at_ms + 1501));
        envelope.delivery.time_to_live_ms = 0;
        assert!(!envelope.is_expired(u64::MAX));
    }

    #[tokio::test]
    async fn test_frames_over_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &sample_request()).await.unwrap();
        write_frame(&mut client, &Frame::Attached).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(sample_request()));
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(Frame::Attached));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }
}
