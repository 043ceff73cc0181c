use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode},
    ErrorKind, WebSocketError,
};

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// Currently reading the extended length and mask key of the frame.
    Header(Header),
    /// Currently reading the payload of the frame.
    Payload(HeaderAndMask),
}

/// Represents the first two bytes of a WebSocket frame.
struct Header {
    /// Indicates if this is the final fragment in a message.
    fin: bool,
    /// RSV1..RSV3 in the low three bits.
    rsv: u8,
    /// Indicates if the frame is masked.
    masked: bool,
    /// The operation code of the frame.
    opcode: OpCode,
    /// Additional length of the frame, if applicable.
    extra: usize,
    /// Encoded length of the payload.
    length_code: u8,
    /// Size of the rest of the header in bytes.
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// The connection splits its transport and drives a [`Decoder`] and an [`Encoder`] on separate
/// halves. `Codec` is convenient when a single framed stream is enough, as in tests.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }

    #[inline]
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode_eof(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames, handling state transitions.
///
/// `Decoder` only parses. It rejects undefined opcodes and payloads larger than the message size
/// limit as soon as the header is known, but leaves RSV, mask and control frame checks to
/// [`Frame::validate`] so that a rejected frame is always consumed whole and reported with the
/// error.
pub struct Decoder {
    /// Current reading state (header or payload).
    state: Option<ReadState>,
    /// Maximum allowed size for a frame payload.
    max_payload_size: usize,
    /// Upper bound of buffer space reserved at once while a payload is pending.
    read_fragment_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder`.
    ///
    /// # Parameters
    /// - `max_payload_size`: The maximum allowed payload size, in bytes.
    /// - `read_fragment_size`: How much buffer space to reserve at once for a pending payload.
    pub fn new(max_payload_size: usize, read_fragment_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
            read_fragment_size: read_fragment_size.max(1),
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer, managing header and payload parsing.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a fully read frame, payload unmasked.
    /// - `Ok(None)`: more data is needed to complete the frame.
    /// - `Err(WebSocketError)`: the opcode is undefined or the payload is too large.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b10000000 != 0;
                    let rsv = (src[0] & 0b01110000) >> 4;
                    let opcode = OpCode::try_from(src[0] & 0b00001111)?;
                    let masked = src[1] & 0b10000000 != 0;
                    let length_code = src[1] & 0x7F;

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        _ => {
                            let len = src.get_u64();
                            usize::try_from(len).map_err(|_| {
                                WebSocketError::new(
                                    ErrorKind::ProtocolMessageTooLarge,
                                    format!("frame length {len} does not fit in memory"),
                                )
                            })?
                        }
                    };

                    // the mask key is consumed even though a masked frame is rejected later
                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::new(
                            ErrorKind::ProtocolMessageTooLarge,
                            format!(
                                "frame of {payload_len} bytes exceeds {}",
                                self.max_payload_size
                            ),
                        ));
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(pending)) => {
                    let missing = pending.payload_len.saturating_sub(src.remaining());
                    if missing > 0 {
                        src.reserve(missing.min(self.read_fragment_size));
                        self.state = Some(ReadState::Payload(pending));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = pending;

                    let mut payload = src.split_to(payload_len);
                    if let Some(mask) = mask {
                        crate::mask::apply_mask(&mut payload, mask);
                    }

                    break Ok(Some(Frame::from_wire(
                        header.fin,
                        header.rsv,
                        header.opcode,
                        mask,
                        payload.freeze(),
                    )));
                }
            }
        }
    }

    /// Called once the transport reports end of stream.
    ///
    /// A stream that ends on a frame boundary yields `Ok(None)`. Leftover bytes or a partially
    /// read frame mean the peer went away mid-frame.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.state.is_none() => Ok(None),
            None => Err(WebSocketError::new(
                ErrorKind::StreamReadIncomplete,
                format!("stream ended with {} bytes of an unfinished frame", src.len()),
            )),
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// The encoder masks every frame when built for the client role, which is the only role the
/// connection uses.
pub struct Encoder {
    mask: bool,
}

impl Encoder {
    pub fn new(mask: bool) -> Self {
        Self { mask }
    }

    /// Encoder for the client role: every frame is masked with a fresh random key.
    pub fn client() -> Self {
        Self::new(true)
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame.encode(self.mask));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Fin;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    fn unmasked(frame: Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        Encoder::new(false).encode(frame, &mut dst).unwrap();
        dst
    }

    #[test]
    fn test_decode_across_partial_reads() {
        let wire = unmasked(Frame::binary(vec![7u8; 300]));
        let mut decoder = Decoder::new(1 << 20, 64);
        let mut src = BytesMut::new();

        let mut decoded = None;
        for chunk in wire.chunks(17) {
            src.extend_from_slice(chunk);
            if let Some(frame) = decoder.decode(&mut src).unwrap() {
                decoded = Some(frame);
            }
        }

        let frame = decoded.expect("frame");
        assert_eq!(frame.opcode(), OpCode::Binary);
        assert_eq!(frame.payload().len(), 300);
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut src = unmasked(Frame::text("one"));
        src.extend_from_slice(&unmasked(Frame::new(Fin::Fragment, OpCode::Binary, "two")));

        let mut decoder = Decoder::new(1024, 1024);
        let first = decoder.decode(&mut src).unwrap().unwrap();
        let second = decoder.decode(&mut src).unwrap().unwrap();

        assert_eq!(first.payload().to_bytes(), "one");
        assert_eq!(second.fin(), Fin::Fragment);
        assert_eq!(second.payload().to_bytes(), "two");
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_undefined_opcode() {
        let mut src = BytesMut::from(&[0x83u8, 0x00][..]);
        let err = Decoder::new(1024, 1024).decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolFrameOpcode);
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let mut src = unmasked(Frame::binary(vec![0u8; 2048]));
        let err = Decoder::new(1024, 1024).decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolMessageTooLarge);
    }

    #[test]
    fn test_masked_frame_is_consumed_whole() {
        let mut src = BytesMut::new();
        Encoder::client()
            .encode(Frame::text("masked"), &mut src)
            .unwrap();
        src.extend_from_slice(&unmasked(Frame::text("next")));

        let mut decoder = Decoder::new(1024, 1024);
        let masked = decoder.decode(&mut src).unwrap().unwrap();
        assert!(masked.is_masked());
        assert_eq!(masked.payload().to_bytes(), "masked");

        let next = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(next.payload().to_bytes(), "next");
    }

    #[test]
    fn test_decode_eof() {
        let mut decoder = Decoder::new(1024, 1024);
        assert!(decoder.decode_eof(&mut BytesMut::new()).unwrap().is_none());

        let mut partial = BytesMut::from(&[0x81u8, 0x05, b'h'][..]);
        let err = decoder.decode_eof(&mut partial).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamReadIncomplete);
    }

    #[test]
    fn test_client_encoder_masks() {
        let mut dst = BytesMut::new();
        Encoder::client().encode(Frame::ping("p"), &mut dst).unwrap();
        assert_eq!(dst[0], 0x89);
        assert_eq!(dst[1] & 0x80, 0x80);
        assert_eq!(dst.len(), 2 + 4 + 1);
    }
}
