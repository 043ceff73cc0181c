//! Incoming side: the background task that reads frames, reassembles messages and dispatches
//! them.

use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::ReadHalf;
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::{
    close::CloseCode,
    codec::Decoder,
    events::{Event, EventKind, Message},
    frame::{Frame, OpCode, Payload},
    stream::BoxedStream,
    ErrorKind, Result, WebSocketError,
};

use super::Shared;

/// Read direction of an open connection.
pub(crate) type Reader = FramedRead<ReadHalf<BoxedStream>, Decoder>;

/// Result of one read.
pub(crate) enum ReadOutcome {
    /// A frame that passed validation.
    Frame(Frame),
    /// The read ended because the connection is shutting down.
    ClosedByShutdown,
    /// The read failed while the connection was expected to be live.
    Failed(WebSocketError),
}

/// Whether the loop keeps reading after a message.
enum Flow {
    Continue,
    Stop,
}

/// Turns a sequence of frames into messages.
///
/// Control frames pass straight through, even in the middle of a fragmented message. Data frames
/// are accumulated until the final one; the message takes the opcode of its first frame.
pub(crate) struct Assembler {
    /// Opcode of the message being accumulated, if any.
    fragment: Option<OpCode>,
    accumulated: BytesMut,
    max_message_size: usize,
}

impl Assembler {
    pub(crate) fn new(max_message_size: usize) -> Self {
        Self {
            fragment: None,
            accumulated: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feeds one frame. Returns a message once one is complete.
    pub(crate) fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = frame.opcode();
        let fin = frame.is_final();

        if opcode.is_control() {
            return Ok(Some(Message {
                opcode,
                payload: frame.into_payload().to_bytes(),
            }));
        }

        match (opcode, self.fragment) {
            (OpCode::Continuation, None) => {
                return Err(WebSocketError::new(
                    ErrorKind::ProtocolFragment,
                    "continuation frame without a message to continue",
                )
                .with_frame(frame))
            }
            (OpCode::Text | OpCode::Binary, Some(open)) => {
                return Err(WebSocketError::new(
                    ErrorKind::ProtocolFragment,
                    format!("{opcode:?} frame while a {open:?} message is incomplete"),
                )
                .with_frame(frame))
            }
            _ => {}
        }

        let payload = frame.payload().to_bytes();
        if self.accumulated.len() + payload.len() > self.max_message_size {
            self.reset();
            return Err(WebSocketError::new(
                ErrorKind::ProtocolMessageTooLarge,
                format!("message exceeds {} bytes", self.max_message_size),
            )
            .with_frame(frame));
        }

        // an unfragmented message needs no copy
        if fin && self.fragment.is_none() {
            return Ok(Some(Message { opcode, payload }));
        }

        self.accumulated.extend_from_slice(&payload);
        let message_opcode = *self.fragment.get_or_insert(opcode);

        if fin {
            let payload = std::mem::take(&mut self.accumulated).freeze();
            self.fragment = None;
            Ok(Some(Message {
                opcode: message_opcode,
                payload,
            }))
        } else {
            Ok(None)
        }
    }

    fn reset(&mut self) {
        self.fragment = None;
        self.accumulated = BytesMut::new();
    }
}

/// Reads until the connection shuts down or fails.
pub(crate) async fn run(shared: Arc<Shared>, mut reader: Reader, cancel: CancellationToken) {
    let mut assembler = Assembler::new(shared.settings.max_message_size);

    #[cfg(feature = "logging")]
    log::debug!("reader started for {}", shared.uri);

    while shared.state.polling() {
        shared.state.set_reading(true);
        let outcome = read_frame(&shared, &mut reader, &cancel).await;
        shared.state.set_reading(false);

        let frame = match outcome {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::ClosedByShutdown => break,
            ReadOutcome::Failed(err) => {
                shared.abort(err).await;
                break;
            }
        };

        #[cfg(feature = "logging")]
        log::trace!(
            ">>> {:?} fin={} len={}",
            frame.opcode(),
            frame.is_final(),
            frame.payload().len()
        );

        if shared.events.has_listeners(EventKind::Frame) {
            shared.events.emit(&Event::Frame(frame.clone()));
        }

        let flow = match assembler.on_frame(frame) {
            Ok(Some(message)) => dispatch(&shared, message).await,
            Ok(None) => Ok(Flow::Continue),
            Err(err) => Err(err),
        };

        match flow {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(err) => {
                shared.abort(err).await;
                break;
            }
        }
    }

    #[cfg(feature = "logging")]
    log::debug!("reader stopped for {}", shared.uri);
}

async fn read_frame(shared: &Shared, reader: &mut Reader, cancel: &CancellationToken) -> ReadOutcome {
    let next = tokio::select! {
        biased;
        _ = cancel.cancelled() => return ReadOutcome::ClosedByShutdown,
        next = reader.next() => next,
    };

    match next {
        Some(Ok(frame)) => match frame.validate() {
            Ok(()) => ReadOutcome::Frame(frame),
            Err(err) => ReadOutcome::Failed(err),
        },
        Some(Err(_)) | None if !shared.state.polling() => ReadOutcome::ClosedByShutdown,
        Some(Err(err)) => ReadOutcome::Failed(err),
        None => ReadOutcome::Failed(WebSocketError::new(
            ErrorKind::StreamEmptyRead,
            "server closed the stream without a close frame",
        )),
    }
}

/// Hands a complete message to its handler.
async fn dispatch(shared: &Arc<Shared>, message: Message) -> Result<Flow> {
    if let Some(handler) = shared.events.handler(message.opcode) {
        handler(message);
        return Ok(Flow::Continue);
    }

    match message.opcode {
        OpCode::Text => {
            let text = std::str::from_utf8(&message.payload).map_err(|err| {
                WebSocketError::new(ErrorKind::ProtocolPayloadUtf8, "text message")
                    .with_source(err)
            })?;
            shared.events.emit(&Event::Text(text.to_owned()));
        }
        OpCode::Binary => shared.events.emit(&Event::Binary(message.payload)),
        OpCode::Ping => shared.events.emit(&Event::Ping(message.payload)),
        OpCode::Pong => shared.events.emit(&Event::Pong(message.payload)),
        OpCode::Close => {
            let (code, reason) = match Payload::Raw(message.payload).parse_close()? {
                Some((code, _)) if !code.is_allowed() => {
                    return Err(WebSocketError::new(
                        ErrorKind::ProtocolFrameControl,
                        format!("close code {code} may not be sent"),
                    ))
                }
                Some(close) => close,
                // no status code at all
                None => (CloseCode::Status, String::new()),
            };

            shared.on_server_close(code, reason).await;
            return Ok(Flow::Stop);
        }
        OpCode::Continuation => {}
    }

    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Fin;
    use bytes::Bytes;

    fn data(fin: Fin, opcode: OpCode, payload: &'static [u8]) -> Frame {
        Frame::new(fin, opcode, Bytes::from_static(payload))
    }

    #[test]
    fn test_single_frame_message() {
        let mut assembler = Assembler::new(1024);
        let message = assembler
            .on_frame(data(Fin::Final, OpCode::Binary, b"abc"))
            .unwrap()
            .unwrap();
        assert_eq!(message.opcode, OpCode::Binary);
        assert_eq!(message.payload, "abc");
    }

    #[test]
    fn test_message_takes_first_opcode() {
        let mut assembler = Assembler::new(1024);
        assert!(assembler
            .on_frame(data(Fin::Fragment, OpCode::Text, b"hel"))
            .unwrap()
            .is_none());
        assert!(assembler
            .on_frame(data(Fin::Fragment, OpCode::Continuation, b"lo "))
            .unwrap()
            .is_none());
        let message = assembler
            .on_frame(data(Fin::Final, OpCode::Continuation, b"world"))
            .unwrap()
            .unwrap();

        assert_eq!(message.opcode, OpCode::Text);
        assert_eq!(message.payload, "hello world");

        // buffers are clear for the next message
        let next = assembler
            .on_frame(data(Fin::Final, OpCode::Binary, b"x"))
            .unwrap()
            .unwrap();
        assert_eq!(next.payload, "x");
    }

    #[test]
    fn test_control_frame_inside_fragmented_message() {
        let mut assembler = Assembler::new(1024);
        assembler
            .on_frame(data(Fin::Fragment, OpCode::Text, b"a"))
            .unwrap();

        let ping = assembler
            .on_frame(data(Fin::Final, OpCode::Ping, b"p"))
            .unwrap()
            .unwrap();
        assert_eq!(ping.opcode, OpCode::Ping);
        assert_eq!(ping.payload, "p");

        let message = assembler
            .on_frame(data(Fin::Final, OpCode::Continuation, b"b"))
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, "ab");
    }

    #[test]
    fn test_out_of_sequence_fragments() {
        let mut assembler = Assembler::new(1024);
        let err = assembler
            .on_frame(data(Fin::Final, OpCode::Continuation, b"x"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolFragment);
        assert!(err.frame().is_some());

        assembler
            .on_frame(data(Fin::Fragment, OpCode::Text, b"a"))
            .unwrap();
        let err = assembler
            .on_frame(data(Fin::Final, OpCode::Binary, b"b"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolFragment);
    }

    #[test]
    fn test_message_too_large() {
        let mut assembler = Assembler::new(4);
        assembler
            .on_frame(data(Fin::Fragment, OpCode::Binary, b"abc"))
            .unwrap();
        let err = assembler
            .on_frame(data(Fin::Final, OpCode::Continuation, b"de"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolMessageTooLarge);
        assert_eq!(err.code(), CloseCode::Size);
    }
}
