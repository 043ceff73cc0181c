//! Native WebSocket implementation for the Tokio runtime.

pub(crate) mod reader;
pub(crate) mod writer;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use tokio::{io::AsyncWriteExt, sync::oneshot, task::JoinHandle};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    close::CloseCode,
    codec::{Decoder, Encoder},
    events::{Event, EventKind, Events, HandlerId, Initiator, Message},
    frame::{Fin, Frame, OpCode, MAX_CONTROL_PAYLOAD},
    handshake::{self, Endpoint},
    options::{ErrorHandling, Settings},
    retry::{Backoff, Decision},
    state::{ConnectionState, StateMachine},
    stream::{Connector, TcpConnector},
    ErrorKind, Result, WebSocketError,
};

use writer::Writer;

/// A client WebSocket connection.
///
/// The connection is created idle in [`ConnectionState::Connecting`]. [`WebSocket::connect`]
/// performs the upgrade and starts a background task that reads frames, reassembles messages and
/// raises [`Event`]s. Sends can be issued from any task while the connection is open; a message
/// that needs several frames keeps them contiguous on the wire.
///
/// A connection that was closed can be connected again.
///
/// # Example
/// ```no_run
/// use wsclient::{events::EventKind, Settings, WebSocket};
///
/// #[tokio::main]
/// async fn main() -> wsclient::Result<()> {
///     let ws = WebSocket::new("ws://127.0.0.1:9001/", Settings::default());
///     ws.on(EventKind::Close, |event| println!("{event:?}"));
///
///     if ws.connect().await? {
///         ws.send_binary(vec![1, 2, 3]).await;
///         ws.close(None, Some("done"), false).await?;
///     }
///     Ok(())
/// }
/// ```
pub struct WebSocket {
    shared: Arc<Shared>,
}

/// State shared by the connection handle and its reader task.
pub(crate) struct Shared {
    pub(crate) uri: String,
    pub(crate) settings: Settings,
    pub(crate) state: StateMachine,
    pub(crate) events: Events,
    backoff: Backoff,
    /// Write direction. The lock keeps the frames of one message contiguous.
    writer: tokio::sync::Mutex<Option<Writer>>,
    /// Mirrors whether `writer` holds a transport, readable without awaiting the lock.
    connected: AtomicBool,
    reader: Mutex<Option<ReaderTask>>,
}

struct ReaderTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl WebSocket {
    /// Creates an idle connection to `uri`. Nothing is validated or opened until
    /// [`WebSocket::connect`].
    pub fn new(uri: impl Into<String>, settings: Settings) -> Self {
        let backoff = Backoff::new(
            settings.retry_policy,
            settings.retry_limit,
            settings.max_backoff,
        );

        Self {
            shared: Arc::new(Shared {
                uri: uri.into(),
                settings,
                state: StateMachine::new(),
                events: Events::new(),
                backoff,
                writer: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        }
    }

    /// Opens the connection.
    ///
    /// Returns `Ok(true)` once the connection is open and `Ok(false)` when the connection was not
    /// in a state that allows connecting (already open, or another connect in flight).
    ///
    /// An invalid URI or upgrade header fails at once. Other failures are retried according to
    /// [`Settings::retry_policy`], waiting [`crate::retry::backoff_delay`] between attempts. With
    /// [`ErrorHandling::Return`] failures are only reported through [`EventKind::Error`] and the
    /// call returns `Ok(false)`.
    pub async fn connect(&self) -> Result<bool> {
        let endpoint = match Endpoint::parse(&self.shared.uri) {
            Ok(endpoint) => endpoint,
            Err(err) => return self.shared.report(err),
        };

        if !self.shared.state.transition(ConnectionState::Connecting, false) {
            #[cfg(feature = "logging")]
            log::debug!(
                "connect to {} ignored in state {:?}",
                self.shared.uri,
                self.shared.state.state()
            );
            return Ok(false);
        }

        // every connect cycle gets the full retry budget
        self.shared.backoff.reset();

        loop {
            let err = match self.shared.attempt(&endpoint).await {
                Ok(opened) => {
                    if opened {
                        self.shared.backoff.reset();
                    }
                    return Ok(opened);
                }
                Err(err) => err,
            };

            if err.kind().is_caller_error() {
                self.shared.state.transition(ConnectionState::Closed, true);
                return self.shared.report(err);
            }

            match self.shared.backoff.on_failure() {
                Decision::Retry { attempt, delay } => {
                    #[cfg(feature = "logging")]
                    log::warn!(
                        "connect to {} failed ({err}), retry {attempt} in {delay:?}",
                        self.shared.uri
                    );
                    #[cfg(not(feature = "logging"))]
                    let _ = attempt;

                    tokio::time::sleep(delay).await;

                    // a forced close while waiting abandons the connect
                    if !self.shared.state.handshake_initiated() {
                        return Ok(false);
                    }
                }
                Decision::Exhausted { attempts } => {
                    self.shared.state.transition(ConnectionState::Closed, true);
                    return self.shared.report(
                        WebSocketError::new(
                            ErrorKind::HandshakeOpenRetryLimitReached,
                            format!("gave up on {} after {attempts} attempts", self.shared.uri),
                        )
                        .with_source(err),
                    );
                }
                Decision::Surface => {
                    self.shared.state.transition(ConnectionState::Closed, true);
                    return self.shared.report(err);
                }
            }
        }
    }

    /// Closes the connection.
    ///
    /// Sends a Close frame with `code` (default [`CloseCode::Normal`]) and `reason`, waits up to
    /// [`Settings::close_timeout`] for the server to answer, then releases the transport. Returns
    /// `Ok(false)` when the connection is not open. With `force` the close proceeds from any state.
    ///
    /// The codes reserved for received frames (1005, 1006, 1015) are rejected with
    /// [`ErrorKind::HandshakeCloseStatusCode`].
    pub async fn close(
        &self,
        code: Option<CloseCode>,
        reason: Option<&str>,
        force: bool,
    ) -> Result<bool> {
        let code = code.unwrap_or(CloseCode::Normal);
        if code.is_receive_only() {
            return self.shared.report(WebSocketError::new(
                ErrorKind::HandshakeCloseStatusCode,
                format!("{code} may only be received"),
            ));
        }

        if !self.shared.state.transition(ConnectionState::Closing, force) {
            return Ok(false);
        }

        let reason = truncate_reason(reason.unwrap_or_default());
        self.shared
            .close_handshake(code, reason, Initiator::Client, true)
            .await;
        Ok(true)
    }

    /// Sends one message, fragmented by [`Settings::write_fragment_size`].
    ///
    /// Returns `false` without raising an error when the connection is not open. A control
    /// payload above 125 bytes or a failed write returns `false` and raises [`EventKind::Error`].
    pub async fn send(&self, opcode: OpCode, payload: impl Into<Bytes>) -> bool {
        if !self.is_alive() {
            return false;
        }

        let result = match writer::fragment(
            opcode,
            payload.into(),
            self.shared.settings.write_fragment_size,
        ) {
            Ok(frames) => self.shared.write(frames).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                #[cfg(feature = "logging")]
                log::debug!("send to {} failed: {err}", self.shared.uri);
                self.shared.events.emit(&Event::Error(Arc::new(err)));
                false
            }
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(OpCode::Text, text.into()).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send(OpCode::Binary, data).await
    }

    /// Sends a Ping. No Pong is awaited.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> bool {
        self.send(OpCode::Ping, payload).await
    }

    /// Sends a Pong, typically from an [`EventKind::Ping`] listener.
    pub async fn pong(&self, payload: impl Into<Bytes>) -> bool {
        self.send(OpCode::Pong, payload).await
    }

    /// Serializes `data` as JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn send_json<T: serde::Serialize>(&self, data: &T) -> bool {
        match serde_json::to_string(data) {
            Ok(text) => self.send_text(text).await,
            Err(_err) => {
                #[cfg(feature = "logging")]
                log::debug!("send_json: {_err}");
                false
            }
        }
    }

    /// Whether the connection is open and holds a transport.
    pub fn is_alive(&self) -> bool {
        self.shared.state.state() == ConnectionState::Open
            && self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.state()
    }

    /// Failed attempts of the current connect cycle, or of the last one if it gave up. Zero once
    /// a connect succeeds.
    pub fn retry_count(&self) -> u32 {
        self.shared.backoff.count()
    }

    pub fn uri(&self) -> &str {
        &self.shared.uri
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Subscribes `listener` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, listener)
    }

    /// Removes a listener.
    pub fn off(&self, id: HandlerId) -> bool {
        self.shared.events.off(id)
    }

    /// Replaces the built-in handling of complete messages with `opcode`.
    ///
    /// A handler for [`OpCode::Close`] also replaces the automatic close reply.
    pub fn set_handler<F>(&self, opcode: OpCode, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.shared.events.set_handler(opcode, handler)
    }

    pub fn remove_handler(&self, opcode: OpCode) -> bool {
        self.shared.events.remove_handler(opcode)
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        // the reader holds the shared state, stop it so the transport is released
        if let Some(task) = self.shared.take_reader() {
            task.cancel.cancel();
        }
    }
}

impl Shared {
    /// One connect attempt: transport, upgrade, reader.
    ///
    /// Returns `Ok(false)` if the connection was force-closed while the attempt ran.
    async fn attempt(self: &Arc<Self>, endpoint: &Endpoint) -> Result<bool> {
        let connector: Arc<dyn Connector> = match &self.settings.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(TcpConnector::new(self.settings.accept_invalid_certs)),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "connecting to {}:{} (secure: {})",
            endpoint.host,
            endpoint.port,
            endpoint.secure
        );

        let mut stream = connector
            .connect(&endpoint.host, endpoint.port, endpoint.secure)
            .await?;

        let handshake = match handshake::client_handshake(
            &mut stream,
            endpoint,
            &self.settings.handshake_headers,
        )
        .await
        {
            Ok(handshake) => handshake,
            Err(err) => {
                // best effort, the server may not even speak the protocol
                let mut close = Frame::close(CloseCode::Protocol, "");
                let _ = stream.write_all(&close.encode(true)).await;
                let _ = stream.shutdown().await;
                return Err(err);
            }
        };

        let (read, write) = tokio::io::split(stream);
        let mut reader = FramedRead::new(
            read,
            Decoder::new(
                self.settings.max_message_size,
                self.settings.read_fragment_size,
            ),
        );
        // frames the server sent right behind the response head
        reader
            .read_buffer_mut()
            .extend_from_slice(&handshake.leftover);

        *self.writer.lock().await = Some(FramedWrite::new(write, Encoder::client()));
        self.connected.store(true, Ordering::SeqCst);

        if !self.state.transition(ConnectionState::Open, false) {
            #[cfg(feature = "logging")]
            log::debug!("connection to {} closed while connecting", self.uri);
            self.release_writer().await;
            return Ok(false);
        }

        // the reader waits until its task is registered and Open is out, so a Close already
        // sitting in the leftover bytes cannot be handled first
        let (start, started) = oneshot::channel::<()>();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let shared = Arc::clone(self);
            let cancel = cancel.clone();
            async move {
                let _ = started.await;
                reader::run(shared, reader, cancel).await
            }
        });
        let task = ReaderTask { handle, cancel };
        *self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        #[cfg(feature = "logging")]
        log::debug!("connected to {}", self.uri);

        self.events.emit(&Event::Open);
        let _ = start.send(());
        Ok(true)
    }

    /// Runs the close handshake from the `Closing` state and ends in `Closed`.
    ///
    /// With `join_reader` the reader is given `close_timeout` to read the server's answer, then
    /// cancelled and awaited. The reader itself passes `false`.
    async fn close_handshake(
        &self,
        code: CloseCode,
        reason: String,
        initiator: Initiator,
        join_reader: bool,
    ) {
        #[cfg(feature = "logging")]
        log::debug!("closing {} with {code} ({initiator:?})", self.uri);

        let frame = if code == CloseCode::Status {
            Frame::new(Fin::Final, OpCode::Close, Bytes::new())
        } else {
            Frame::close(code.sendable(), reason.as_str())
        };
        if let Err(_err) = self.write(vec![frame]).await {
            #[cfg(feature = "logging")]
            log::debug!("close frame not sent: {_err}");
        }

        if let Some(task) = self.take_reader() {
            if join_reader {
                let mut handle = task.handle;
                if tokio::time::timeout(self.settings.close_timeout, &mut handle)
                    .await
                    .is_err()
                {
                    #[cfg(feature = "logging")]
                    log::debug!("no close reply from {}, cancelling reader", self.uri);
                    task.cancel.cancel();
                    let _ = handle.await;
                }
            } else {
                task.cancel.cancel();
            }
        }

        self.release_writer().await;
        self.state.transition(ConnectionState::Closed, true);

        self.events.emit(&Event::Close {
            code,
            reason,
            initiator,
        });
    }

    /// The server sent a Close frame.
    pub(crate) async fn on_server_close(&self, code: CloseCode, reason: String) {
        // losing the race means this is the answer to our own Close
        if self.state.transition(ConnectionState::Closing, false) {
            self.close_handshake(code, reason, Initiator::Server, false)
                .await;
        }
    }

    /// The reader hit an error: report it and close with the error's status code.
    pub(crate) async fn abort(&self, err: WebSocketError) {
        #[cfg(feature = "logging")]
        log::error!("connection to {} failed: {err}", self.uri);

        let code = err.code();
        let reason = truncate_reason(err.kind().to_string().as_str());
        self.events.emit(&Event::Error(Arc::new(err)));

        if self.state.transition(ConnectionState::Closing, false) {
            self.close_handshake(code, reason, Initiator::Client, false)
                .await;
        }
    }

    async fn write(&self, frames: Vec<Frame>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            WebSocketError::new(ErrorKind::StreamDisposed, "connection has no transport")
        })?;
        writer::write_frames(writer, frames).await
    }

    async fn release_writer(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.get_mut().shutdown().await;
        }
    }

    fn take_reader(&self) -> Option<ReaderTask> {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Applies [`Settings::error_handling`] to a failure that ends a `connect` or `close` call.
    fn report(&self, err: WebSocketError) -> Result<bool> {
        match self.settings.error_handling {
            ErrorHandling::Error => Err(err),
            ErrorHandling::Return => {
                self.events.emit(&Event::Error(Arc::new(err)));
                Ok(false)
            }
        }
    }
}

/// Shortens `reason` to fit a Close frame, on a character boundary.
fn truncate_reason(reason: &str) -> String {
    let max = MAX_CONTROL_PAYLOAD - 2;
    if reason.len() <= max {
        return reason.to_owned();
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_reason() {
        assert_eq!(truncate_reason("bye"), "bye");

        let long = "é".repeat(100);
        let truncated = truncate_reason(&long);
        assert!(truncated.len() <= 123);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn test_send_on_idle_connection() {
        let ws = WebSocket::new("ws://127.0.0.1:1/", Settings::default());
        assert_eq!(ws.state(), ConnectionState::Connecting);
        assert!(!ws.is_alive());
        assert!(!ws.send_text("nobody listens").await);
    }

    #[tokio::test]
    async fn test_close_rejects_receive_only_codes() {
        let ws = WebSocket::new("ws://127.0.0.1:1/", Settings::default());
        for code in [CloseCode::Status, CloseCode::Abnormal, CloseCode::Tls] {
            let err = ws.close(Some(code), None, true).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::HandshakeCloseStatusCode);
        }
        assert_eq!(ws.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_close_idle_connection() {
        let ws = WebSocket::new("ws://127.0.0.1:1/", Settings::default());
        assert!(!ws.close(None, None, false).await.unwrap());

        let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        ws.on(EventKind::Close, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(ws.close(None, None, true).await.unwrap());
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_uri_fails_without_io() {
        let ws = WebSocket::new("", Settings::default());
        let err = ws.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeOpenUri);
        assert_eq!(ws.retry_count(), 0);
        assert_eq!(ws.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_invalid_uri_with_return_handling() {
        let ws = WebSocket::new(
            "ws://example.com:99999/",
            Settings::default().with_error_handling(ErrorHandling::Return),
        );

        let kinds = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&kinds);
        ws.on(EventKind::Error, move |event| {
            if let Event::Error(err) = event {
                seen.lock().unwrap().push(err.kind());
            }
        });

        assert!(!ws.connect().await.unwrap());
        assert_eq!(*kinds.lock().unwrap(), vec![ErrorKind::HandshakeOpenPort]);
    }
}
