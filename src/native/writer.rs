//! Outgoing side: splitting payloads into frames and writing them.

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::WriteHalf;
use tokio_util::codec::FramedWrite;

use crate::{
    codec::Encoder,
    frame::{Fin, Frame, OpCode, MAX_CONTROL_PAYLOAD},
    stream::BoxedStream,
    ErrorKind, Result, WebSocketError,
};

/// Write direction of an open connection.
pub(crate) type Writer = FramedWrite<WriteHalf<BoxedStream>, Encoder>;

/// Splits `payload` into the frames of one message.
///
/// A payload of at most `fragment_size` bytes becomes a single final frame. A larger one becomes
/// a first frame carrying `opcode`, continuation frames, and a final continuation frame, each at
/// most `fragment_size` bytes long. Control messages are never split and may not exceed 125
/// bytes.
pub(crate) fn fragment(opcode: OpCode, payload: Bytes, fragment_size: usize) -> Result<Vec<Frame>> {
    if opcode == OpCode::Continuation {
        return Err(WebSocketError::new(
            ErrorKind::ProtocolFragment,
            "a message cannot start with a continuation frame",
        ));
    }

    if opcode.is_control() {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::new(
                ErrorKind::ProtocolFrameControl,
                format!(
                    "{opcode:?} payload of {} bytes exceeds {MAX_CONTROL_PAYLOAD}",
                    payload.len()
                ),
            ));
        }
        return Ok(vec![Frame::new(Fin::Final, opcode, payload)]);
    }

    let fragment_size = fragment_size.max(1);
    if payload.len() <= fragment_size {
        return Ok(vec![Frame::new(Fin::Final, opcode, payload)]);
    }

    let count = payload.len().div_ceil(fragment_size);
    let mut frames = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * fragment_size;
        let end = (start + fragment_size).min(payload.len());
        let fin = if index + 1 == count {
            Fin::Final
        } else {
            Fin::Fragment
        };
        let opcode = if index == 0 {
            opcode
        } else {
            OpCode::Continuation
        };
        frames.push(Frame::new(fin, opcode, payload.slice(start..end)));
    }

    Ok(frames)
}

/// Writes `frames` in order, flushing after each one. Stops at the first failure.
pub(crate) async fn write_frames(writer: &mut Writer, frames: Vec<Frame>) -> Result<()> {
    for frame in frames {
        #[cfg(feature = "logging")]
        log::trace!(
            "<<< {:?} fin={} len={}",
            frame.opcode(),
            frame.is_final(),
            frame.payload().len()
        );

        writer.send(frame).await.map_err(|err| {
            WebSocketError::new(ErrorKind::StreamWrite, "write frame").with_source(err)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::reader::Assembler;

    #[test]
    fn test_small_payload_is_one_frame() {
        let frames = fragment(OpCode::Text, Bytes::from_static(b"hello"), 1024).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode(), OpCode::Text);
        assert!(frames[0].is_final());
    }

    #[test]
    fn test_payload_equal_to_fragment_size_is_one_frame() {
        let frames = fragment(OpCode::Binary, Bytes::from(vec![0u8; 16]), 16).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_fragmentation_plan() {
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 256) as u8).collect();
        let frames = fragment(OpCode::Binary, Bytes::from(payload.clone()), 16 * 1024).unwrap();

        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].opcode(), OpCode::Binary);
        assert_eq!(frames[0].fin(), Fin::Fragment);
        for middle in &frames[1..4] {
            assert_eq!(middle.opcode(), OpCode::Continuation);
            assert_eq!(middle.fin(), Fin::Fragment);
            assert_eq!(middle.payload().len(), 16 * 1024);
        }
        assert_eq!(frames[4].opcode(), OpCode::Continuation);
        assert_eq!(frames[4].fin(), Fin::Final);
        assert_eq!(frames[4].payload().len(), 70_000 - 4 * 16 * 1024);

        let joined: Vec<u8> = frames
            .iter()
            .flat_map(|frame| frame.payload().to_bytes().to_vec())
            .collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_fragments_reassemble() {
        let text = "fragmented ".repeat(1000);
        let frames = fragment(OpCode::Text, Bytes::from(text.clone()), 333).unwrap();

        let mut assembler = Assembler::new(usize::MAX);
        let mut messages = Vec::new();
        for frame in frames {
            if let Some(message) = assembler.on_frame(frame).unwrap() {
                messages.push(message);
            }
        }

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].opcode, OpCode::Text);
        assert_eq!(messages[0].payload, text);
    }

    #[test]
    fn test_control_frames_are_never_split() {
        let frames = fragment(OpCode::Ping, Bytes::from(vec![1u8; 125]), 10).unwrap();
        assert_eq!(frames.len(), 1);

        let err = fragment(OpCode::Ping, Bytes::from(vec![1u8; 126]), 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolFrameControl);
    }

    #[test]
    fn test_continuation_cannot_start_a_message() {
        let err = fragment(OpCode::Continuation, Bytes::new(), 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolFragment);
    }

    #[test]
    fn test_empty_payload() {
        let frames = fragment(OpCode::Binary, Bytes::new(), 1024).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload().is_empty());
    }
}
