//! RFC 6455 base framing.
//!
//! Wire format (section 5.2):
//! `[FIN|RSV1-3|opcode][MASK|len7][ext len: 16 or 64 bit]?[mask key]?[payload]`
//!
//! Client-to-server frames are always masked, server-to-client frames never are.
//! The codec itself is symmetric; [`FrameDecoder`] enforces the masking rule for
//! the side of the connection it runs on.

use crate::error::{ChatError, ChatResult};

/// Default cap on a single frame payload and on a reassembled message (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1_048_576;

/// Control frames carry at most 125 bytes of payload.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Frame opcodes (section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ChatError;

    fn try_from(v: u8) -> ChatResult<Self> {
        match v {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(ChatError::Protocol(format!("unknown opcode: 0x{other:X}"))),
        }
    }
}

/// One decoded frame. `payload` is always held unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    pub opcode: OpCode,
    /// Masking key, present iff the frame was (or will be) masked on the wire.
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked frame.
    pub fn new(opcode: OpCode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(OpCode::Text, text.as_bytes())
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Serialize to wire bytes, masking the payload if `mask` is set.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14 + self.payload.len());
        write_header(&mut out, self.fin, self.opcode, self.mask, self.payload.len());
        let start = out.len();
        out.extend_from_slice(&self.payload);
        if let Some(key) = self.mask {
            apply_mask(&mut out[start..], key);
        }
        out
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold the whole frame, and the
    /// frame plus the number of bytes it occupied otherwise.
    pub fn parse(buf: &[u8], max_payload: usize) -> ChatResult<Option<(Frame, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0x80 != 0;
        let rsv = (buf[0] >> 4) & 0x07;
        if rsv != 0 {
            return Err(ChatError::Protocol(format!(
                "reserved bits set without a negotiated extension: {rsv:#05b}"
            )));
        }
        let opcode = OpCode::try_from(buf[0] & 0x0F)?;

        let masked = buf[1] & 0x80 != 0;
        let mut offset = 2;
        let payload_len: u64 = match buf[1] & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                offset = 4;
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len < 126 {
                    return Err(ChatError::Protocol(format!(
                        "non-minimal 16-bit length encoding for {len} bytes"
                    )));
                }
                len
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                offset = 10;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(ChatError::Protocol(
                        "most significant bit of 64-bit length must be 0".into(),
                    ));
                }
                if len <= 0xFFFF {
                    return Err(ChatError::Protocol(format!(
                        "non-minimal 64-bit length encoding for {len} bytes"
                    )));
                }
                len
            }
            short => short as u64,
        };

        if opcode.is_control() {
            if !fin {
                return Err(ChatError::Protocol(format!(
                    "fragmented control frame ({opcode:?})"
                )));
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ChatError::Protocol(format!(
                    "control frame payload of {payload_len} bytes exceeds {MAX_CONTROL_PAYLOAD}"
                )));
            }
        }

        if payload_len > max_payload as u64 {
            return Err(ChatError::MessageTooLarge(
                usize::try_from(payload_len).unwrap_or(usize::MAX),
            ));
        }
        let len = payload_len as usize;

        let mask = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        if buf.len() < offset + len {
            return Ok(None);
        }

        let mut payload = buf[offset..offset + len].to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some((
            Frame {
                fin,
                opcode,
                mask,
                payload,
            },
            offset + len,
        )))
    }
}

fn write_header(out: &mut Vec<u8>, fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, len: usize) {
    out.push(if fin { 0x80 } else { 0x00 } | u8::from(opcode));

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if let Some(key) = mask {
        out.extend_from_slice(&key);
    }
}

/// XOR `payload` with the 4-byte key cycling over its length (section 5.3).
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a final, unmasked (server-to-client) frame.
pub fn encode(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    Frame::new(opcode, payload).to_bytes()
}

/// Encode a final frame masked with `key` (client-to-server).
pub fn encode_masked(opcode: OpCode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    Frame {
        fin: true,
        opcode,
        mask: Some(key),
        payload: payload.to_vec(),
    }
    .to_bytes()
}

/// Encode a close frame carrying a status code and reason.
pub fn encode_close(code: u16, reason: &str) -> Vec<u8> {
    encode(OpCode::Close, &CloseFrame::new(code, reason).to_payload())
}

/// Decode exactly one frame from `buf`.
///
/// Unlike [`Frame::parse`], a buffer shorter than the declared length is an
/// error, as are trailing bytes after the frame.
pub fn decode(buf: &[u8]) -> ChatResult<Frame> {
    match Frame::parse(buf, usize::MAX)? {
        Some((frame, used)) if used == buf.len() => Ok(frame),
        Some((_, used)) => Err(ChatError::Protocol(format!(
            "{} trailing bytes after frame",
            buf.len() - used
        ))),
        None => Err(ChatError::Protocol(format!(
            "truncated frame ({} bytes)",
            buf.len()
        ))),
    }
}

/// Which end of the connection a [`FrameDecoder`] serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Decodes client frames; every frame must be masked.
    Server,
    /// Decodes server frames; no frame may be masked.
    Client,
}

/// Streaming frame decoder: accumulates bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    max_payload: usize,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(role: Role) -> Self {
        Self::with_max_payload(role, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(role: Role, max_payload: usize) -> Self {
        Self {
            role,
            max_payload,
            buffer: Vec::new(),
        }
    }

    /// Feed bytes into the decoder and return all complete frames.
    ///
    /// Any error is fatal to the connection; the decoder should be discarded.
    pub fn feed(&mut self, data: &[u8]) -> ChatResult<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut consumed = 0;

        while let Some((frame, used)) = Frame::parse(&self.buffer[consumed..], self.max_payload)? {
            match (self.role, frame.is_masked()) {
                (Role::Server, false) => {
                    return Err(ChatError::Protocol("client frame is not masked".into()));
                }
                (Role::Client, true) => {
                    return Err(ChatError::Protocol("server frame is masked".into()));
                }
                _ => {}
            }
            frames.push(frame);
            consumed += used;
        }

        self.buffer.drain(..consumed);
        Ok(frames)
    }

    /// Number of bytes buffered towards an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// Joins fragmented data frames into whole messages (section 5.4).
///
/// Only data frames go through here; control frames may arrive between
/// fragments and are handled by the caller.
#[derive(Debug)]
pub struct Reassembler {
    max_message: usize,
    partial: Option<(OpCode, Vec<u8>)>,
}

impl Reassembler {
    pub fn new(max_message: usize) -> Self {
        Self {
            max_message,
            partial: None,
        }
    }

    /// Push a Text, Binary or Continuation frame; returns a message once the
    /// final fragment has arrived.
    pub fn push(&mut self, frame: Frame) -> ChatResult<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(ChatError::Protocol(
                        "new data frame while a fragmented message is in progress".into(),
                    ));
                }
                self.check_size(frame.payload.len())?;
                if frame.fin {
                    return finish(frame.opcode, frame.payload).map(Some);
                }
                self.partial = Some((frame.opcode, frame.payload));
                Ok(None)
            }
            OpCode::Continuation => {
                let (opcode, mut buf) = self.partial.take().ok_or_else(|| {
                    ChatError::Protocol("continuation frame without a message in progress".into())
                })?;
                self.check_size(buf.len() + frame.payload.len())?;
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    finish(opcode, buf).map(Some)
                } else {
                    self.partial = Some((opcode, buf));
                    Ok(None)
                }
            }
            other => Err(ChatError::Protocol(format!(
                "control frame {other:?} is not part of a message"
            ))),
        }
    }

    /// Whether a fragmented message is waiting for more frames.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    fn check_size(&self, len: usize) -> ChatResult<()> {
        if len > self.max_message {
            return Err(ChatError::MessageTooLarge(len));
        }
        Ok(())
    }
}

fn finish(opcode: OpCode, payload: Vec<u8>) -> ChatResult<Message> {
    match opcode {
        OpCode::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| ChatError::Protocol("text message is not valid UTF-8".into())),
        _ => Ok(Message::Binary(payload)),
    }
}

/// Status code and reason carried by a Close frame (section 5.5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }

    /// Parse a Close payload. An empty payload carries no status.
    pub fn parse(payload: &[u8]) -> ChatResult<Option<CloseFrame>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(ChatError::Protocol("close payload of 1 byte".into())),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| ChatError::Protocol("close reason is not valid UTF-8".into()))?;
                Ok(Some(CloseFrame::new(code, reason)))
            }
        }
    }

    /// Wire payload; the reason is cut to fit the control frame limit.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut end = self.reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&self.code.to_be_bytes());
        payload.extend_from_slice(&self.reason.as_bytes()[..end]);
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn mask_is_symmetric() {
        let original = b"Hello, masking".to_vec();
        let mut buf = original.clone();
        apply_mask(&mut buf, KEY);
        assert_ne!(buf, original);
        apply_mask(&mut buf, KEY);
        assert_eq!(buf, original);
    }

    #[test]
    fn rfc_unmasked_hello() {
        let bytes = encode(OpCode::Text, b"Hello");
        assert_eq!(bytes, vec![0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
    }

    #[test]
    fn rfc_masked_hello() {
        let bytes = encode_masked(OpCode::Text, b"Hello", KEY);
        assert_eq!(
            bytes,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.payload, b"Hello");
        assert_eq!(frame.mask, Some(KEY));
    }

    #[test]
    fn extended_length_headers() {
        let medium = encode(OpCode::Binary, &[0u8; 256]);
        assert_eq!(&medium[..4], &[0x82, 0x7E, 0x01, 0x00]);

        let large = encode(OpCode::Binary, &vec![0u8; 65536]);
        assert_eq!(
            &large[..10],
            &[0x82, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn round_trip_all_opcodes_and_widths() {
        let data_sizes = [0usize, 1, 125, 126, 65535, 65536, 70_000];
        let control_sizes = [0usize, 1, 125];

        let cases = [
            (OpCode::Text, &data_sizes[..]),
            (OpCode::Binary, &data_sizes[..]),
            (OpCode::Continuation, &data_sizes[..]),
            (OpCode::Close, &control_sizes[..]),
            (OpCode::Ping, &control_sizes[..]),
            (OpCode::Pong, &control_sizes[..]),
        ];

        for (opcode, sizes) in cases {
            for &size in sizes {
                let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

                let plain = decode(&encode(opcode, &payload)).unwrap();
                assert_eq!((plain.opcode, &plain.payload), (opcode, &payload));
                assert!(!plain.is_masked());

                let masked = decode(&encode_masked(opcode, &payload, KEY)).unwrap();
                assert_eq!((masked.opcode, &masked.payload), (opcode, &payload));
                assert!(masked.is_masked());
            }
        }
    }

    #[test]
    fn rejects_reserved_bits() {
        let err = decode(&[0xC1, 0x00]).unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let err = decode(&[0x83, 0x00]).unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
    }

    #[test]
    fn rejects_fragmented_or_oversized_control() {
        assert!(decode(&[0x09, 0x00]).is_err());

        let mut long_ping = vec![0x89, 0x7E, 0x00, 0x7E];
        long_ping.extend_from_slice(&[0u8; 126]);
        assert!(decode(&long_ping).is_err());
    }

    #[test]
    fn rejects_bad_length_encodings() {
        // 16-bit form used for a 5-byte payload
        let mut short16 = vec![0x81, 0x7E, 0x00, 0x05];
        short16.extend_from_slice(b"hello");
        assert!(decode(&short16).is_err());

        let mut msb = vec![0x82, 0x7F];
        msb.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(decode(&msb).is_err());
    }

    #[test]
    fn truncated_and_trailing_bytes() {
        let bytes = encode(OpCode::Text, b"Hello");
        let err = decode(&bytes[..4]).unwrap_err();
        assert!(err.to_string().contains("truncated"));

        let mut extra = bytes.clone();
        extra.push(0);
        assert!(decode(&extra).is_err());

        assert!(Frame::parse(&bytes[..4], DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn payload_over_limit() {
        let bytes = encode(OpCode::Binary, &[0u8; 200]);
        let err = Frame::parse(&bytes, 100).unwrap_err();
        assert!(matches!(err, ChatError::MessageTooLarge(200)));
        assert_eq!(err.close_code(), Some(CLOSE_TOO_BIG));
    }

    #[test]
    fn server_decoder_requires_masking() {
        let mut decoder = FrameDecoder::new(Role::Server);
        let err = decoder.feed(&encode(OpCode::Text, b"hi")).unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_PROTOCOL_ERROR));

        let mut decoder = FrameDecoder::new(Role::Client);
        assert!(decoder.feed(&encode_masked(OpCode::Text, b"hi", KEY)).is_err());
    }

    #[test]
    fn incremental_feed() {
        let mut bytes = encode_masked(OpCode::Text, b"first", KEY);
        bytes.extend(encode_masked(OpCode::Ping, b"", KEY));
        let mut decoder = FrameDecoder::new(Role::Server);

        let mut frames = Vec::new();
        for byte in &bytes {
            frames.extend(decoder.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"first");
        assert_eq!(frames[1].opcode, OpCode::Ping);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn pending_bytes() {
        let bytes = encode_masked(OpCode::Text, b"partial", KEY);
        let mut decoder = FrameDecoder::new(Role::Server);
        assert!(decoder.feed(&bytes[..3]).unwrap().is_empty());
        assert_eq!(decoder.pending(), 3);
        decoder.reset();
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn reassembles_fragments() {
        let mut assembler = Reassembler::new(DEFAULT_MAX_PAYLOAD);
        let first = Frame {
            fin: false,
            ..Frame::text("hel")
        };
        let last = Frame::new(OpCode::Continuation, b"lo".to_vec());

        assert_eq!(assembler.push(first).unwrap(), None);
        assert!(assembler.in_progress());
        assert_eq!(
            assembler.push(last).unwrap(),
            Some(Message::Text("hello".into()))
        );
        assert!(!assembler.in_progress());
    }

    #[test]
    fn reassembly_errors() {
        let mut assembler = Reassembler::new(4);
        let orphan = Frame::new(OpCode::Continuation, b"x".to_vec());
        assert!(assembler.push(orphan).is_err());

        let first = Frame {
            fin: false,
            ..Frame::text("abc")
        };
        assembler.push(first).unwrap();
        let err = assembler
            .push(Frame::new(OpCode::Continuation, b"de".to_vec()))
            .unwrap_err();
        assert!(matches!(err, ChatError::MessageTooLarge(5)));

        let mut assembler = Reassembler::new(DEFAULT_MAX_PAYLOAD);
        let bad_utf8 = Frame::new(OpCode::Text, vec![0xff, 0xfe]);
        assert!(assembler.push(bad_utf8).is_err());
    }

    #[test]
    fn close_payloads() {
        let payload = CloseFrame::new(CLOSE_NORMAL, "bye").to_payload();
        assert_eq!(
            CloseFrame::parse(&payload).unwrap(),
            Some(CloseFrame::new(1000, "bye"))
        );
        assert_eq!(CloseFrame::parse(&[]).unwrap(), None);
        assert!(CloseFrame::parse(&[0x03]).is_err());

        let long = "é".repeat(100);
        let payload = CloseFrame::new(CLOSE_GOING_AWAY, &long).to_payload();
        assert!(payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(CloseFrame::parse(&payload).is_ok());
    }
}
