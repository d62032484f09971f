//! TCP mux frame codec (C7): varint/length-prefixed frames over a byte
//! stream with arbitrary chunking.
//!
//! Wire shape per frame (§4.7): `type(u8) flags(u8) streamId(varint)
//! payloadLen(varint) payload(payloadLen bytes)`. `varint` is
//! little-endian base-128 with a continuation bit, at most 9 bytes,
//! rejecting any value above `u32::MAX`. [`FrameParser`] is the state
//! machine side: it buffers whatever bytes arrive and yields every
//! frame it can fully decode, so a caller is free to hand it a TCP
//! read of any size, including one byte at a time.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{GatewayError, Result};

/// Frames with `stream_id == 0` are session-level (only PING/PONG use
/// this); every other frame type requires a nonzero stream id.
pub const SESSION_STREAM_ID: u32 = 0;

/// Default cap on a single frame's payload (`TCP_MUX_MAX_FRAME_PAYLOAD_BYTES`).
pub const DEFAULT_MAX_FRAME_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

const MAX_VARINT_BYTES: usize = 9;
const MAX_HEADER_BYTES: usize = 2 + MAX_VARINT_BYTES + MAX_VARINT_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameType {
    Open = 0x01,
    OpenAck = 0x02,
    Data = 0x03,
    WindowUpdate = 0x04,
    CloseWrite = 0x05,
    Reset = 0x06,
    Ping = 0x07,
    Pong = 0x08,
}

impl FrameType {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::OpenAck),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::WindowUpdate),
            0x05 => Ok(Self::CloseWrite),
            0x06 => Ok(Self::Reset),
            0x07 => Ok(Self::Ping),
            0x08 => Ok(Self::Pong),
            other => Err(GatewayError::invalid_input(format!("unknown mux frame type {other:#x}"))),
        }
    }
}

/// Result payload of an `OPEN_ACK`, distinguished by the flags byte
/// (`0x00` success, `0x01` error) rather than a payload tag, since the
/// acceptor always knows which one it is sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenAckResult {
    Ok { initial_window: u32 },
    Err { code: u16, reason: String },
}

const OPEN_ACK_FLAG_OK: u8 = 0x00;
const OPEN_ACK_FLAG_ERR: u8 = 0x01;

/// A fully decoded mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open {
        stream_id: u32,
        host: String,
        port: u16,
        initial_window: u32,
    },
    OpenAck {
        stream_id: u32,
        result: OpenAckResult,
    },
    Data {
        stream_id: u32,
        payload: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    CloseWrite {
        stream_id: u32,
    },
    Reset {
        stream_id: u32,
        code: u16,
        reason: String,
    },
    Ping {
        nonce: [u8; 8],
    },
    Pong {
        nonce: [u8; 8],
    },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Open { stream_id, .. }
            | Frame::OpenAck { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::CloseWrite { stream_id }
            | Frame::Reset { stream_id, .. } => *stream_id,
            Frame::Ping { .. } | Frame::Pong { .. } => SESSION_STREAM_ID,
        }
    }

    /// Encode this frame to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let (frame_type, flags, stream_id, payload) = match self {
            Frame::Open {
                stream_id,
                host,
                port,
                initial_window,
            } => {
                let mut payload = Vec::with_capacity(host.len() + 1 + 6);
                payload.extend_from_slice(host.as_bytes());
                payload.push(0);
                payload.extend_from_slice(&port.to_be_bytes());
                payload.extend_from_slice(&initial_window.to_be_bytes());
                (FrameType::Open, 0u8, *stream_id, payload)
            }
            Frame::OpenAck { stream_id, result } => match result {
                OpenAckResult::Ok { initial_window } => (
                    FrameType::OpenAck,
                    OPEN_ACK_FLAG_OK,
                    *stream_id,
                    initial_window.to_be_bytes().to_vec(),
                ),
                OpenAckResult::Err { code, reason } => {
                    let mut payload = Vec::with_capacity(2 + reason.len());
                    payload.extend_from_slice(&code.to_be_bytes());
                    payload.extend_from_slice(reason.as_bytes());
                    (FrameType::OpenAck, OPEN_ACK_FLAG_ERR, *stream_id, payload)
                }
            },
            Frame::Data { stream_id, payload } => (FrameType::Data, 0u8, *stream_id, payload.to_vec()),
            Frame::WindowUpdate { stream_id, increment } => {
                (FrameType::WindowUpdate, 0u8, *stream_id, increment.to_be_bytes().to_vec())
            }
            Frame::CloseWrite { stream_id } => (FrameType::CloseWrite, 0u8, *stream_id, Vec::new()),
            Frame::Reset { stream_id, code, reason } => {
                let mut payload = Vec::with_capacity(2 + reason.len());
                payload.extend_from_slice(&code.to_be_bytes());
                payload.extend_from_slice(reason.as_bytes());
                (FrameType::Reset, 0u8, *stream_id, payload)
            }
            Frame::Ping { nonce } => (FrameType::Ping, 0u8, SESSION_STREAM_ID, nonce.to_vec()),
            Frame::Pong { nonce } => (FrameType::Pong, 0u8, SESSION_STREAM_ID, nonce.to_vec()),
        };

        let mut out = Vec::with_capacity(2 + MAX_VARINT_BYTES * 2 + payload.len());
        out.push(frame_type as u8);
        out.push(flags);
        encode_varint(stream_id as u64, &mut out);
        encode_varint(payload.len() as u64, &mut out);
        out.extend_from_slice(&payload);
        out
    }
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a varint from the front of `buf`. Returns `Ok(None)` when the
/// bytes available so far are all continuation bytes (need more data),
/// `Err` when the varint is malformed (more than 9 bytes, or a decoded
/// value above `u32::MAX`), and `Ok(Some((value, bytes_consumed)))`
/// otherwise.
fn try_read_varint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_BYTES) {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            if value > u32::MAX as u64 {
                return Err(GatewayError::invalid_input("mux varint exceeds u32::MAX"));
            }
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_BYTES {
        return Err(GatewayError::invalid_input("mux varint longer than 9 bytes"));
    }
    Ok(None)
}

/// Incremental frame parser: a rope-like buffer that accepts bytes in
/// any chunking and reconstructs the same frames a single-shot parse
/// over the concatenated bytes would produce (P1/P2/P-F).
pub struct FrameParser {
    buf: BytesMut,
    max_frame_payload_bytes: usize,
}

impl FrameParser {
    pub fn new(max_frame_payload_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_payload_bytes,
        }
    }

    /// Feed a chunk of bytes (of any length, including zero) and
    /// return every frame that can now be fully decoded. On a protocol
    /// error the parser must not be fed further — the caller tears the
    /// session down.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.try_parse_one()? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        Ok(frames)
    }

    fn try_parse_one(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < 2 {
            self.guard_header_growth()?;
            return Ok(None);
        }
        let type_byte = self.buf[0];
        let flags = self.buf[1];

        let Some((stream_id_u64, sid_len)) = try_read_varint(&self.buf[2..])? else {
            self.guard_header_growth()?;
            return Ok(None);
        };
        let len_offset = 2 + sid_len;
        let Some((payload_len_u64, len_len)) = try_read_varint(&self.buf[len_offset..])? else {
            self.guard_header_growth()?;
            return Ok(None);
        };
        let payload_len = payload_len_u64 as usize;
        if payload_len > self.max_frame_payload_bytes {
            return Err(GatewayError::resource_exhausted(format!(
                "mux frame payload {payload_len} exceeds cap {}",
                self.max_frame_payload_bytes
            )));
        }

        let header_len = len_offset + len_len;
        let total_len = header_len + payload_len;
        if self.buf.len() < total_len {
            // Not a header-growth problem (header is fully parsed); we
            // just need more payload bytes, bounded by the cap already
            // checked above.
            return Ok(None);
        }

        let frame_type = FrameType::from_u8(type_byte)?;
        let stream_id = stream_id_u64 as u32;

        let mut frame_bytes = self.buf.split_to(total_len);
        frame_bytes.advance(header_len);
        let payload = frame_bytes.freeze();

        decode_frame(frame_type, flags, stream_id, payload).map(Some)
    }

    /// Bound how long we'll wait for a header to complete: a header is
    /// at most `MAX_HEADER_BYTES` bytes, so buffering more than that
    /// without completing it means the peer is never going to send a
    /// terminating varint byte.
    fn guard_header_growth(&self) -> Result<()> {
        if self.buf.len() > MAX_HEADER_BYTES {
            return Err(GatewayError::invalid_input("mux frame header never terminated"));
        }
        Ok(())
    }
}

fn decode_frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: Bytes) -> Result<Frame> {
    match frame_type {
        FrameType::Open => {
            let nul = payload
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| GatewayError::invalid_input("OPEN frame missing host terminator"))?;
            let host = std::str::from_utf8(&payload[..nul])
                .map_err(|_| GatewayError::invalid_input("OPEN frame host is not valid utf8"))?
                .to_string();
            let rest = &payload[nul + 1..];
            if rest.len() != 6 {
                return Err(GatewayError::invalid_input("OPEN frame has malformed port/window fields"));
            }
            let port = u16::from_be_bytes([rest[0], rest[1]]);
            let initial_window = u32::from_be_bytes([rest[2], rest[3], rest[4], rest[5]]);
            require_nonzero_stream(stream_id)?;
            Ok(Frame::Open {
                stream_id,
                host,
                port,
                initial_window,
            })
        }
        FrameType::OpenAck => {
            require_nonzero_stream(stream_id)?;
            match flags {
                OPEN_ACK_FLAG_OK => {
                    if payload.len() != 4 {
                        return Err(GatewayError::invalid_input("OPEN_ACK ok payload must be 4 bytes"));
                    }
                    let initial_window = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    Ok(Frame::OpenAck {
                        stream_id,
                        result: OpenAckResult::Ok { initial_window },
                    })
                }
                OPEN_ACK_FLAG_ERR => {
                    if payload.len() < 2 {
                        return Err(GatewayError::invalid_input("OPEN_ACK err payload too short"));
                    }
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    let reason = ascii_reason(&payload[2..])?;
                    Ok(Frame::OpenAck {
                        stream_id,
                        result: OpenAckResult::Err { code, reason },
                    })
                }
                other => Err(GatewayError::invalid_input(format!("unknown OPEN_ACK flags {other:#x}"))),
            }
        }
        FrameType::Data => {
            require_nonzero_stream(stream_id)?;
            Ok(Frame::Data { stream_id, payload })
        }
        FrameType::WindowUpdate => {
            require_nonzero_stream(stream_id)?;
            if payload.len() != 4 {
                return Err(GatewayError::invalid_input("WINDOW_UPDATE payload must be 4 bytes"));
            }
            let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Ok(Frame::WindowUpdate { stream_id, increment })
        }
        FrameType::CloseWrite => {
            require_nonzero_stream(stream_id)?;
            if !payload.is_empty() {
                return Err(GatewayError::invalid_input("CLOSE_WRITE payload must be empty"));
            }
            Ok(Frame::CloseWrite { stream_id })
        }
        FrameType::Reset => {
            require_nonzero_stream(stream_id)?;
            if payload.len() < 2 {
                return Err(GatewayError::invalid_input("RESET payload too short"));
            }
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = ascii_reason(&payload[2..])?;
            Ok(Frame::Reset { stream_id, code, reason })
        }
        FrameType::Ping => {
            require_session_stream(stream_id)?;
            Ok(Frame::Ping { nonce: nonce8(&payload)? })
        }
        FrameType::Pong => {
            require_session_stream(stream_id)?;
            Ok(Frame::Pong { nonce: nonce8(&payload)? })
        }
    }
}

fn require_nonzero_stream(stream_id: u32) -> Result<()> {
    if stream_id == SESSION_STREAM_ID {
        return Err(GatewayError::invalid_input("stream frame used session stream id 0"));
    }
    Ok(())
}

fn require_session_stream(stream_id: u32) -> Result<()> {
    if stream_id != SESSION_STREAM_ID {
        return Err(GatewayError::invalid_input("PING/PONG must use session stream id 0"));
    }
    Ok(())
}

fn ascii_reason(bytes: &[u8]) -> Result<String> {
    if !bytes.is_ascii() {
        return Err(GatewayError::invalid_input("reason field is not ascii"));
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn nonce8(payload: &[u8]) -> Result<[u8; 8]> {
    payload
        .try_into()
        .map_err(|_| GatewayError::invalid_input("PING/PONG nonce must be 8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Open {
                stream_id: 1,
                host: "example.com".into(),
                port: 443,
                initial_window: 65536,
            },
            Frame::OpenAck {
                stream_id: 1,
                result: OpenAckResult::Ok { initial_window: 32768 },
            },
            Frame::OpenAck {
                stream_id: 3,
                result: OpenAckResult::Err {
                    code: 1,
                    reason: "blocked-by-host-policy".into(),
                },
            },
            Frame::Data {
                stream_id: 1,
                payload: Bytes::from_static(b"hello world"),
            },
            Frame::WindowUpdate {
                stream_id: 1,
                increment: 4096,
            },
            Frame::CloseWrite { stream_id: 1 },
            Frame::Reset {
                stream_id: 1,
                code: 2,
                reason: "flow-control-violation".into(),
            },
            Frame::Ping { nonce: [1, 2, 3, 4, 5, 6, 7, 8] },
            Frame::Pong { nonce: [8, 7, 6, 5, 4, 3, 2, 1] },
        ]
    }

    #[test]
    fn round_trips_every_frame_kind_single_shot() {
        for frame in sample_frames() {
            let encoded = frame.encode();
            let mut parser = FrameParser::new(DEFAULT_MAX_FRAME_PAYLOAD_BYTES);
            let mut decoded = parser.feed(&encoded).unwrap();
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded.remove(0), frame);
        }
    }

    #[test]
    fn round_trips_across_arbitrary_chunk_boundaries() {
        let frames = sample_frames();
        let mut encoded = Vec::new();
        for frame in &frames {
            encoded.extend_from_slice(&frame.encode());
        }

        for chunk_size in [1usize, 2, 3, 7, 64] {
            let mut parser = FrameParser::new(DEFAULT_MAX_FRAME_PAYLOAD_BYTES);
            let mut decoded = Vec::new();
            for chunk in encoded.chunks(chunk_size) {
                decoded.extend(parser.feed(chunk).unwrap());
            }
            assert_eq!(decoded, frames, "mismatch at chunk size {chunk_size}");
        }
    }

    #[test]
    fn oversize_frame_is_rejected_without_buffering_the_whole_payload() {
        let mut parser = FrameParser::new(16);
        let mut header = vec![FrameType::Data as u8, 0u8];
        encode_varint(1, &mut header);
        encode_varint(1_000_000, &mut header);
        let err = parser.feed(&header).unwrap_err();
        assert_eq!(err.kind(), "resource-exhausted");
    }

    #[test]
    fn never_terminating_varint_is_a_protocol_error_not_unbounded_growth() {
        let mut parser = FrameParser::new(DEFAULT_MAX_FRAME_PAYLOAD_BYTES);
        let garbage = vec![0xFFu8; 64];
        assert!(parser.feed(&garbage).is_err());
    }

    #[test]
    fn incomplete_frame_yields_need_more_data_not_an_error() {
        let frame = Frame::Data {
            stream_id: 1,
            payload: Bytes::from_static(b"abc"),
        };
        let encoded = frame.encode();
        let mut parser = FrameParser::new(DEFAULT_MAX_FRAME_PAYLOAD_BYTES);
        let decoded = parser.feed(&encoded[..encoded.len() - 1]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn data_frame_cannot_use_session_stream_id() {
        let mut payload = vec![FrameType::Data as u8, 0u8];
        encode_varint(0, &mut payload);
        encode_varint(0, &mut payload);
        let mut parser = FrameParser::new(DEFAULT_MAX_FRAME_PAYLOAD_BYTES);
        assert!(parser.feed(&payload).is_err());
    }
}
