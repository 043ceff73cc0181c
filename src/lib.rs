//! # wsclient
//! Client-side implementation of the WebSocket protocol (RFC 6455): HTTP upgrade handshake over
//! TCP or TLS, a bit-exact frame codec, message fragmentation and reassembly, a guarded connection
//! state machine, a background reader task and reconnect backoff.
//!
//! The crate only speaks the client role. Outgoing frames are always masked, incoming frames must
//! never be, and no extension (compression, RSV semantics) is ever negotiated.
//!
//! # Features
//! - `logging` (default): debug logging of the handshake, frame flow and teardown through the
//!   `log` crate.
//! - `json`: adds [`WebSocket::send_json`] for sending serializable values as text messages.
//!
//! # Example
//! ```no_run
//! use wsclient::{events::{Event, EventKind}, Settings, WebSocket};
//!
//! #[tokio::main]
//! async fn main() -> wsclient::Result<()> {
//!     let ws = WebSocket::new("wss://echo.websocket.org", Settings::default());
//!
//!     ws.on(EventKind::Text, |event| {
//!         if let Event::Text(text) = event {
//!             println!("<< {text}");
//!         }
//!     });
//!
//!     ws.connect().await?;
//!     ws.send_text("hello").await;
//!     ws.close(None, None, false).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Threading model
//! A single tokio task reads frames for the lifetime of an open connection. Every other operation
//! may be called from any task; they synchronize only through the connection state machine and a
//! handful of atomic flags. [`blocking::WebSocket`] offers the same operations to synchronous code
//! by driving the async core on its own runtime.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod blocking;
pub mod close;
pub mod codec;
pub mod events;
pub mod frame;
pub mod handshake;
mod mask;
mod native;
mod options;
pub mod retry;
pub mod state;
pub mod stream;

use std::fmt;

use thiserror::Error;

pub use close::CloseCode;
pub use frame::{Fin, Frame, OpCode, Payload};
pub use native::*;
pub use options::{ErrorHandling, RetryPolicy, Settings};
pub use state::ConnectionState;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Boxed lower-level cause attached to a [`WebSocketError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The closed set of failure classes a connection can report.
///
/// Kinds are grouped in four families:
///
/// - **Handshake-open**: the URI, the upgrade request or the upgrade response is unacceptable,
///   the transport could not be established, or the retry budget ran out.
/// - **Handshake-close**: the caller asked to close with a status code that may only be received.
/// - **Protocol**: a frame or message from the server violates RFC 6455.
/// - **Stream**: the transport ended or failed underneath the codec.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The URI is empty or cannot be parsed.
    HandshakeOpenUri,
    /// The URI has no host, or an empty one.
    HandshakeOpenHost,
    /// The URI port is outside 1..=65535.
    HandshakeOpenPort,
    /// The upgrade request would be sent with a protocol version below HTTP/1.1.
    HandshakeOpenRequestVersion,
    /// The server answered with a protocol version below HTTP/1.1.
    HandshakeOpenResponseVersion,
    /// A required upgrade request header is missing or wrong.
    HandshakeOpenRequestHeader,
    /// A required upgrade response header is missing or wrong.
    HandshakeOpenResponseHeader,
    /// The server did not answer `101 Switching Protocols`.
    HandshakeOpenResponseStatus,
    /// Every allowed connect attempt failed.
    HandshakeOpenRetryLimitReached,
    /// The TCP connection could not be established or broke during the handshake.
    HandshakeOpenTransport,
    /// TLS negotiation failed.
    HandshakeOpenTls,
    /// The caller tried to send a close status code reserved for received frames.
    HandshakeCloseStatusCode,
    /// A frame from the server had its mask bit set.
    ProtocolFrameMask,
    /// A frame had reserved bits set while no extension was negotiated.
    ProtocolFrameRsv,
    /// A control frame was fragmented or carried more than 125 bytes.
    ProtocolFrameControl,
    /// A frame carried an opcode RFC 6455 does not define.
    ProtocolFrameOpcode,
    /// Data frames arrived out of sequence.
    ProtocolFragment,
    /// A reassembled message grew beyond the configured maximum.
    ProtocolMessageTooLarge,
    /// A text message was not valid UTF-8.
    ProtocolPayloadUtf8,
    /// The transport failed or was disposed while reading.
    StreamDisposed,
    /// The stream ended cleanly before the next frame header.
    StreamEmptyRead,
    /// The stream ended in the middle of a frame.
    StreamReadIncomplete,
    /// Writing to the transport failed.
    StreamWrite,
}

impl ErrorKind {
    /// Status code sent to the peer (or reported locally) for this kind of failure.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::HandshakeOpenUri
            | Self::HandshakeOpenHost
            | Self::HandshakeOpenPort
            | Self::HandshakeOpenRequestVersion
            | Self::HandshakeOpenRequestHeader => CloseCode::Policy,
            Self::HandshakeOpenResponseVersion
            | Self::HandshakeOpenResponseHeader
            | Self::HandshakeOpenResponseStatus
            | Self::HandshakeCloseStatusCode => CloseCode::Protocol,
            Self::HandshakeOpenTls => CloseCode::Tls,
            Self::HandshakeOpenRetryLimitReached | Self::HandshakeOpenTransport => {
                CloseCode::Abnormal
            }
            Self::ProtocolFrameMask
            | Self::ProtocolFrameRsv
            | Self::ProtocolFrameControl
            | Self::ProtocolFrameOpcode
            | Self::ProtocolFragment => CloseCode::Protocol,
            Self::ProtocolMessageTooLarge => CloseCode::Size,
            Self::ProtocolPayloadUtf8 => CloseCode::Invalid,
            Self::StreamDisposed
            | Self::StreamEmptyRead
            | Self::StreamReadIncomplete
            | Self::StreamWrite => CloseCode::Abnormal,
        }
    }

    /// Returns `true` for failures caused by the caller's own input, which are never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::HandshakeOpenUri
                | Self::HandshakeOpenHost
                | Self::HandshakeOpenPort
                | Self::HandshakeOpenRequestVersion
                | Self::HandshakeOpenRequestHeader
                | Self::HandshakeCloseStatusCode
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::HandshakeOpenUri => "invalid uri",
            Self::HandshakeOpenHost => "invalid host",
            Self::HandshakeOpenPort => "invalid port",
            Self::HandshakeOpenRequestVersion => "request protocol version below HTTP/1.1",
            Self::HandshakeOpenResponseVersion => "response protocol version below HTTP/1.1",
            Self::HandshakeOpenRequestHeader => "invalid request header",
            Self::HandshakeOpenResponseHeader => "invalid response header",
            Self::HandshakeOpenResponseStatus => "unexpected response status",
            Self::HandshakeOpenRetryLimitReached => "connect retry limit reached",
            Self::HandshakeOpenTransport => "transport connect failed",
            Self::HandshakeOpenTls => "tls handshake failed",
            Self::HandshakeCloseStatusCode => "illegal close status code",
            Self::ProtocolFrameMask => "masked frame from server",
            Self::ProtocolFrameRsv => "reserved bits are not zero",
            Self::ProtocolFrameControl => "invalid control frame",
            Self::ProtocolFrameOpcode => "invalid opcode",
            Self::ProtocolFragment => "invalid fragment sequence",
            Self::ProtocolMessageTooLarge => "message too large",
            Self::ProtocolPayloadUtf8 => "invalid utf-8 payload",
            Self::StreamDisposed => "stream disposed",
            Self::StreamEmptyRead => "stream ended",
            Self::StreamReadIncomplete => "stream ended mid-frame",
            Self::StreamWrite => "stream write failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error raised by every fallible operation of the crate.
///
/// Carries the failure [`ErrorKind`], the close status code associated with it, the offending
/// frame when one was decoded, a human readable message and an optional lower-level cause
/// available through [`std::error::Error::source`].
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct WebSocketError {
    kind: ErrorKind,
    code: CloseCode,
    frame: Option<Frame>,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl WebSocketError {
    /// Creates an error of `kind`, using the kind's default close code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.close_code(),
            frame: None,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the frame that caused the failure.
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Attaches a lower-level cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Overrides the close status code.
    pub fn with_code(mut self, code: CloseCode) -> Self {
        self.code = code;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> CloseCode {
        self.code
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for WebSocketError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ErrorKind::StreamReadIncomplete,
            _ => ErrorKind::StreamDisposed,
        };
        WebSocketError::new(kind, err.to_string()).with_source(err)
    }
}

impl From<url::ParseError> for WebSocketError {
    fn from(err: url::ParseError) -> Self {
        let kind = match err {
            url::ParseError::EmptyHost | url::ParseError::InvalidDomainCharacter => {
                ErrorKind::HandshakeOpenHost
            }
            url::ParseError::InvalidPort => ErrorKind::HandshakeOpenPort,
            _ => ErrorKind::HandshakeOpenUri,
        };
        WebSocketError::new(kind, err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_defaults_to_kind_code() {
        let err = WebSocketError::new(ErrorKind::ProtocolFrameMask, "masked");
        assert_eq!(err.kind(), ErrorKind::ProtocolFrameMask);
        assert_eq!(err.code(), CloseCode::Protocol);
        assert!(err.frame().is_none());
        assert_eq!(err.to_string(), "masked frame from server: masked");
    }

    #[test]
    fn test_error_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = WebSocketError::new(ErrorKind::HandshakeOpenTransport, "connect").with_source(io);
        assert!(err.source().is_some());
        assert_eq!(err.code(), CloseCode::Abnormal);
    }

    #[test]
    fn test_io_error_conversion() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(
            WebSocketError::from(eof).kind(),
            ErrorKind::StreamReadIncomplete
        );

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(WebSocketError::from(reset).kind(), ErrorKind::StreamDisposed);
    }

    #[test]
    fn test_url_error_conversion() {
        assert_eq!(
            WebSocketError::from(url::ParseError::InvalidPort).kind(),
            ErrorKind::HandshakeOpenPort
        );
        assert_eq!(
            WebSocketError::from(url::ParseError::EmptyHost).kind(),
            ErrorKind::HandshakeOpenHost
        );
        assert_eq!(
            WebSocketError::from(url::ParseError::RelativeUrlWithoutBase).kind(),
            ErrorKind::HandshakeOpenUri
        );
    }

    #[test]
    fn test_caller_errors_are_flagged() {
        assert!(ErrorKind::HandshakeOpenUri.is_caller_error());
        assert!(ErrorKind::HandshakeOpenRequestHeader.is_caller_error());
        assert!(!ErrorKind::HandshakeOpenResponseStatus.is_caller_error());
        assert!(!ErrorKind::HandshakeOpenTransport.is_caller_error());
    }
}
