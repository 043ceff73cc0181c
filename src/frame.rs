//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! Each frame is an atomic unit of transmission carrying a payload and the protocol metadata
//! needed to interpret it.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! The length field uses three encodings: a literal 7-bit length below 126, the sentinel 126
//! followed by a big-endian `u16`, or the sentinel 127 followed by a big-endian `u64`.
//!
//! As a client, every frame this crate writes is masked with a fresh random key and every frame
//! it reads must arrive unmasked.
//!
//! ```rust
//! use wsclient::{frame::Frame, CloseCode};
//!
//! let mut close = Frame::close(CloseCode::Normal, "bye");
//! let wire = close.encode(true);
//! assert_eq!(wire[0], 0x88);
//! assert_eq!(wire[1], 0x80 | 5);
//! ```
use bytes::{BufMut, Bytes, BytesMut};

use crate::{close::CloseCode, mask, ErrorKind, Result, WebSocketError};

/// Largest possible frame head: 2 base bytes, 8 extended length bytes and a 4 byte mask key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code that determines the meaning of a frame.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented and carry at most 125 payload bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::new(
                ErrorKind::ProtocolFrameOpcode,
                format!("opcode byte {value:#x}"),
            )),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// The FIN bit: whether a frame completes its message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fin {
    /// More frames of the same message follow.
    Fragment,
    /// The frame is the last (or only) frame of its message.
    Final,
}

impl From<bool> for Fin {
    fn from(fin: bool) -> Self {
        if fin {
            Fin::Final
        } else {
            Fin::Fragment
        }
    }
}

impl From<Fin> for bool {
    fn from(fin: Fin) -> Self {
        fin == Fin::Final
    }
}

/// Frame payload.
///
/// Close frames built locally use the structured [`Payload::Close`] form, which serializes to the
/// big-endian status code followed by the UTF-8 reason. The reason bytes are only written when
/// the reason is non-empty. Every other payload, including everything decoded from the wire, is
/// [`Payload::Raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(Bytes),
    Close { code: CloseCode, reason: String },
}

impl Payload {
    /// Number of bytes the payload occupies on the wire.
    pub fn len(&self) -> usize {
        match self {
            Payload::Raw(bytes) => bytes.len(),
            Payload::Close { reason, .. } => 2 + reason.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialized payload bytes.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Raw(bytes) => bytes.clone(),
            Payload::Close { code, reason } => {
                let mut buf = BytesMut::with_capacity(2 + reason.len());
                buf.put_u16(u16::from(*code));
                if !reason.is_empty() {
                    buf.put_slice(reason.as_bytes());
                }
                buf.freeze()
            }
        }
    }

    /// Interprets the payload as the body of a Close frame.
    ///
    /// Returns `Ok(None)` for an empty body (no status code), the code and reason otherwise.
    /// A single byte body or a reason that is not UTF-8 is rejected.
    pub fn parse_close(&self) -> Result<Option<(CloseCode, String)>> {
        match self {
            Payload::Close { code, reason } => Ok(Some((*code, reason.clone()))),
            Payload::Raw(bytes) => match bytes.len() {
                0 => Ok(None),
                1 => Err(WebSocketError::new(
                    ErrorKind::ProtocolFrameControl,
                    "close payload of a single byte",
                )),
                _ => {
                    let code = CloseCode::from(u16::from_be_bytes([bytes[0], bytes[1]]));
                    let reason = std::str::from_utf8(&bytes[2..]).map_err(|err| {
                        WebSocketError::new(ErrorKind::ProtocolPayloadUtf8, "close reason")
                            .with_source(err)
                    })?;
                    Ok(Some((code, reason.to_owned())))
                }
            },
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Raw(value)
    }
}

impl From<BytesMut> for Payload {
    fn from(value: BytesMut) -> Self {
        Payload::Raw(value.freeze())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Raw(value.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Raw(Bytes::copy_from_slice(value))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Raw(value.into())
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Raw(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// Represents a WebSocket frame, the wire-level unit of the protocol.
///
/// Most callers never build frames directly: [`crate::WebSocket`] fragments outgoing payloads and
/// reassembles incoming ones. Frames surface through the raw-frame event and inside errors.
///
/// The encoded form is cached on the frame, so encoding twice returns the same bytes (and the
/// same mask key) without recomputation.
#[derive(Debug, Clone)]
pub struct Frame {
    fin: Fin,
    /// RSV1..RSV3 in the low three bits.
    rsv: u8,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload: Payload,
    encoded: Option<Bytes>,
}

impl Frame {
    /// Creates a new unmasked frame.
    pub fn new(fin: impl Into<Fin>, opcode: OpCode, payload: impl Into<Payload>) -> Self {
        Self {
            fin: fin.into(),
            rsv: 0,
            opcode,
            mask: None,
            payload: payload.into(),
            encoded: None,
        }
    }

    /// Creates a frame as it was read from the wire, payload already unmasked.
    pub(crate) fn from_wire(
        fin: bool,
        rsv: u8,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: Bytes,
    ) -> Self {
        Self {
            fin: fin.into(),
            rsv,
            opcode,
            mask,
            payload: Payload::Raw(payload),
            encoded: None,
        }
    }

    /// A final text frame.
    pub fn text(payload: impl Into<Payload>) -> Self {
        Self::new(Fin::Final, OpCode::Text, payload)
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Payload>) -> Self {
        Self::new(Fin::Final, OpCode::Binary, payload)
    }

    /// A close frame carrying a status code and an optional reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::new(
            Fin::Final,
            OpCode::Close,
            Payload::Close {
                code,
                reason: reason.into(),
            },
        )
    }

    pub fn ping(payload: impl Into<Payload>) -> Self {
        Self::new(Fin::Final, OpCode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Payload>) -> Self {
        Self::new(Fin::Final, OpCode::Pong, payload)
    }

    pub fn fin(&self) -> Fin {
        self.fin
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.fin == Fin::Final
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Reserved bits RSV1..RSV3, packed in the low three bits.
    pub fn rsv(&self) -> u8 {
        self.rsv
    }

    /// Mask key of the frame, if it was masked when encoded or received.
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Serializes the frame, masking the payload with a random key when `use_mask` is set.
    ///
    /// The result is cached: later calls return the first encoding regardless of `use_mask`.
    pub fn encode(&mut self, use_mask: bool) -> Bytes {
        if let Some(encoded) = &self.encoded {
            return encoded.clone();
        }

        let payload = self.payload.to_bytes();
        let mask = if use_mask {
            Some(*self.mask.get_or_insert_with(rand::random))
        } else {
            None
        };

        let mut head = [0u8; MAX_HEAD_SIZE];
        let size = self.fmt_head(&mut head, payload.len(), mask);

        let mut buf = BytesMut::with_capacity(size + payload.len());
        buf.extend_from_slice(&head[..size]);
        buf.extend_from_slice(&payload);
        if let Some(mask) = mask {
            mask::apply_mask(&mut buf[size..], mask);
        }

        let encoded = buf.freeze();
        self.encoded = Some(encoded.clone());
        encoded
    }

    /// Decodes exactly one frame from `bytes`.
    ///
    /// Trailing bytes after the frame are ignored. Empty input is
    /// [`ErrorKind::StreamEmptyRead`], truncated input [`ErrorKind::StreamReadIncomplete`].
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        use tokio_util::codec::Decoder as _;

        let mut decoder = crate::codec::Decoder::new(usize::MAX, usize::MAX);
        let mut src = BytesMut::from(bytes);
        match decoder.decode(&mut src)? {
            Some(frame) => Ok(frame),
            None if bytes.is_empty() => Err(WebSocketError::new(
                ErrorKind::StreamEmptyRead,
                "no bytes to decode",
            )),
            None => Err(WebSocketError::new(
                ErrorKind::StreamReadIncomplete,
                format!("{} bytes do not hold a complete frame", bytes.len()),
            )),
        }
    }

    /// Checks the invariants a frame received by a client must satisfy.
    ///
    /// - reserved bits are zero, since no extension is ever negotiated
    /// - the frame is not masked, since only clients mask
    /// - control frames are final and at most 125 bytes long
    pub fn validate(&self) -> Result<()> {
        if self.rsv != 0 {
            return Err(WebSocketError::new(
                ErrorKind::ProtocolFrameRsv,
                format!("rsv bits {:#05b}", self.rsv),
            )
            .with_frame(self.clone()));
        }

        if self.is_masked() {
            return Err(WebSocketError::new(
                ErrorKind::ProtocolFrameMask,
                "server frames must not be masked",
            )
            .with_frame(self.clone()));
        }

        if self.opcode.is_control() {
            if !self.is_final() {
                return Err(WebSocketError::new(
                    ErrorKind::ProtocolFrameControl,
                    format!("fragmented {:?} frame", self.opcode),
                )
                .with_frame(self.clone()));
            }
            if self.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::new(
                    ErrorKind::ProtocolFrameControl,
                    format!(
                        "{:?} frame of {} bytes exceeds {MAX_CONTROL_PAYLOAD}",
                        self.opcode,
                        self.payload.len()
                    ),
                )
                .with_frame(self.clone()));
            }
        }

        Ok(())
    }

    /// Formats the frame head into `head` and returns its size in bytes.
    fn fmt_head(&self, head: &mut [u8], len: usize, mask: Option<[u8; 4]>) -> usize {
        head[0] = (bool::from(self.fin) as u8) << 7 | (self.rsv & 0b111) << 4 | u8::from(self.opcode);

        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8() {
            assert_eq!(OpCode::try_from(0x0).unwrap(), OpCode::Continuation);
            assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
            assert_eq!(OpCode::try_from(0x2).unwrap(), OpCode::Binary);
            assert_eq!(OpCode::try_from(0x8).unwrap(), OpCode::Close);
            assert_eq!(OpCode::try_from(0x9).unwrap(), OpCode::Ping);
            assert_eq!(OpCode::try_from(0xA).unwrap(), OpCode::Pong);

            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                let err = OpCode::try_from(code).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::ProtocolFrameOpcode);
            }
        }
    }

    mod payload_tests {
        use super::*;

        #[test]
        fn test_close_payload_encoding() {
            let payload = Payload::Close {
                code: CloseCode::Normal,
                reason: "bye".into(),
            };
            assert_eq!(payload.len(), 5);
            assert_eq!(&payload.to_bytes()[..], &[0x03, 0xE8, b'b', b'y', b'e']);
        }

        #[test]
        fn test_close_payload_without_reason() {
            let payload = Payload::Close {
                code: CloseCode::Away,
                reason: String::new(),
            };
            assert_eq!(&payload.to_bytes()[..], &[0x03, 0xE9]);
        }

        #[test]
        fn test_parse_close_from_raw() {
            let raw = Payload::from(&[0x03, 0xE8, b'b', b'y', b'e'][..]);
            let (code, reason) = raw.parse_close().unwrap().unwrap();
            assert_eq!(code, CloseCode::Normal);
            assert_eq!(reason, "bye");

            assert!(Payload::from(Bytes::new()).parse_close().unwrap().is_none());

            let err = Payload::from(&[0x03][..]).parse_close().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProtocolFrameControl);

            let err = Payload::from(&[0x03, 0xE8, 0xFF][..]).parse_close().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProtocolPayloadUtf8);
        }

        #[test]
        fn test_zero_length_payload() {
            let payload = Payload::from(Vec::new());
            assert!(payload.is_empty());
            assert_eq!(payload.len(), 0);
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_encode_small_masked() {
            let mut frame = Frame::text("Header test");
            let wire = frame.encode(true);
            let mask = frame.mask().unwrap();

            assert_eq!(wire[0], 0x81);
            assert_eq!(wire[1], 0x80 | 11);
            assert_eq!(&wire[2..6], &mask);

            let mut payload = wire[6..].to_vec();
            mask::apply_mask(&mut payload, mask);
            assert_eq!(&payload[..], b"Header test");
        }

        #[test]
        fn test_encode_is_cached() {
            let mut frame = Frame::binary(vec![1u8; 300]);
            let first = frame.encode(true);
            let second = frame.encode(true);
            assert_eq!(first, second);
        }

        #[test]
        fn test_length_buckets() {
            let cases = [
                (0usize, 0u8, 2usize),
                (125, 125, 2),
                (126, 126, 4),
                (65535, 126, 4),
                (65536, 127, 10),
            ];
            for (len, code, head) in cases {
                let mut frame = Frame::binary(vec![0u8; len]);
                let wire = frame.encode(false);
                assert_eq!(wire[1] & 0x7F, code, "length {len}");
                assert_eq!(wire.len(), head + len, "length {len}");
            }
        }

        #[test]
        fn test_decode_round_trip() {
            let lengths = [0usize, 1, 125, 126, 127, 65535, 65536, 10_000_000];
            let opcodes = [OpCode::Continuation, OpCode::Text, OpCode::Binary];

            for len in lengths {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                for opcode in opcodes {
                    for fin in [Fin::Final, Fin::Fragment] {
                        let mut frame = Frame::new(fin, opcode, payload.clone());
                        let wire = frame.encode(false);
                        let decoded = Frame::decode(&wire).unwrap();

                        assert_eq!(decoded.fin(), fin);
                        assert_eq!(decoded.opcode(), opcode);
                        assert_eq!(decoded.payload().to_bytes(), &payload[..]);
                        decoded.validate().unwrap();
                    }
                }
            }
        }

        #[test]
        fn test_decode_control_round_trip() {
            for opcode in [OpCode::Close, OpCode::Ping, OpCode::Pong] {
                for len in [0usize, 2, 125] {
                    let mut frame = Frame::new(Fin::Final, opcode, vec![0x03; len]);
                    let decoded = Frame::decode(&frame.encode(false)).unwrap();
                    assert_eq!(decoded.opcode(), opcode);
                    assert_eq!(decoded.payload().len(), len);
                    decoded.validate().unwrap();
                }
            }
        }

        #[test]
        fn test_decode_close_payload() {
            let mut frame = Frame::close(CloseCode::Normal, "bye");
            let decoded = Frame::decode(&frame.encode(false)).unwrap();
            let (code, reason) = decoded.payload().parse_close().unwrap().unwrap();
            assert_eq!(code, CloseCode::Normal);
            assert_eq!(reason, "bye");
        }

        #[test]
        fn test_fragmented_control_is_rejected() {
            for opcode in [OpCode::Close, OpCode::Ping, OpCode::Pong] {
                let mut frame = Frame::new(Fin::Fragment, opcode, "x");
                let decoded = Frame::decode(&frame.encode(false)).unwrap();
                let err = decoded.validate().unwrap_err();
                assert_eq!(err.kind(), ErrorKind::ProtocolFrameControl);
                assert!(err.frame().is_some());
            }
        }

        #[test]
        fn test_oversized_control_is_rejected() {
            for opcode in [OpCode::Close, OpCode::Ping, OpCode::Pong] {
                let mut frame = Frame::new(Fin::Final, opcode, vec![0u8; 126]);
                let decoded = Frame::decode(&frame.encode(false)).unwrap();
                assert_eq!(
                    decoded.validate().unwrap_err().kind(),
                    ErrorKind::ProtocolFrameControl
                );
            }
        }

        #[test]
        fn test_masked_frame_is_rejected() {
            let mut frame = Frame::text("hello");
            let decoded = Frame::decode(&frame.encode(true)).unwrap();

            // the payload is unmasked, but the frame remembers it arrived masked
            assert_eq!(decoded.payload().to_bytes(), "hello");
            assert_eq!(
                decoded.validate().unwrap_err().kind(),
                ErrorKind::ProtocolFrameMask
            );
        }

        #[test]
        fn test_rsv_bits_are_rejected() {
            let wire = [0x80 | 0x40 | 0x01, 0x00];
            let decoded = Frame::decode(&wire).unwrap();
            assert_eq!(decoded.rsv(), 0b100);
            assert_eq!(
                decoded.validate().unwrap_err().kind(),
                ErrorKind::ProtocolFrameRsv
            );
        }

        #[test]
        fn test_decode_truncated_input() {
            assert_eq!(
                Frame::decode(&[]).unwrap_err().kind(),
                ErrorKind::StreamEmptyRead
            );
            assert_eq!(
                Frame::decode(&[0x81]).unwrap_err().kind(),
                ErrorKind::StreamReadIncomplete
            );
            assert_eq!(
                Frame::decode(&[0x81, 0x05, b'h', b'e']).unwrap_err().kind(),
                ErrorKind::StreamReadIncomplete
            );
        }

        #[test]
        fn test_fin_conversions() {
            assert_eq!(Fin::from(true), Fin::Final);
            assert_eq!(Fin::from(false), Fin::Fragment);
            assert!(bool::from(Fin::Final));
        }
    }
}
