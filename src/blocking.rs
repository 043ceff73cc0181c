//! Blocking facade over [`crate::WebSocket`].
//!
//! Each blocking connection owns a small multi-threaded tokio runtime. Calls block the current
//! thread on the async operation while the reader task keeps running on the runtime's worker, so
//! events keep arriving between calls.
//!
//! ```no_run
//! use wsclient::{blocking::WebSocket, events::{Event, EventKind}, Settings};
//!
//! fn main() -> wsclient::Result<()> {
//!     let ws = WebSocket::new("ws://127.0.0.1:9001/", Settings::default())?;
//!     ws.on(EventKind::Text, |event| {
//!         if let Event::Text(text) = event {
//!             println!("<< {text}");
//!         }
//!     });
//!
//!     ws.connect()?;
//!     ws.send_text("hello");
//!     ws.close(None, None, false)?;
//!     Ok(())
//! }
//! ```
//!
//! These methods panic if called from within an async runtime, like any blocking tokio call.

use bytes::Bytes;
use tokio::runtime::{self, Runtime};

use crate::{
    close::CloseCode,
    events::{Event, EventKind, HandlerId, Message},
    state::ConnectionState,
    OpCode, Result, Settings,
};

/// A client WebSocket connection with blocking operations.
pub struct WebSocket {
    // dropped before the runtime so the reader is cancelled while the runtime still runs
    inner: crate::WebSocket,
    runtime: Runtime,
}

impl WebSocket {
    /// Creates an idle connection to `uri` and the runtime that drives it.
    pub fn new(uri: impl Into<String>, settings: Settings) -> Result<Self> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("wsclient-reader")
            .enable_all()
            .build()?;

        Ok(Self {
            inner: crate::WebSocket::new(uri, settings),
            runtime,
        })
    }

    /// See [`crate::WebSocket::connect`].
    pub fn connect(&self) -> Result<bool> {
        self.runtime.block_on(self.inner.connect())
    }

    /// See [`crate::WebSocket::close`].
    pub fn close(&self, code: Option<CloseCode>, reason: Option<&str>, force: bool) -> Result<bool> {
        self.runtime.block_on(self.inner.close(code, reason, force))
    }

    /// See [`crate::WebSocket::send`].
    pub fn send(&self, opcode: OpCode, payload: impl Into<Bytes>) -> bool {
        self.runtime.block_on(self.inner.send(opcode, payload))
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.runtime.block_on(self.inner.send_text(text))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.runtime.block_on(self.inner.send_binary(data))
    }

    pub fn ping(&self, payload: impl Into<Bytes>) -> bool {
        self.runtime.block_on(self.inner.ping(payload))
    }

    pub fn pong(&self, payload: impl Into<Bytes>) -> bool {
        self.runtime.block_on(self.inner.pong(payload))
    }

    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize>(&self, data: &T) -> bool {
        self.runtime.block_on(self.inner.send_json(data))
    }

    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.on(kind, listener)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.off(id)
    }

    pub fn set_handler<F>(&self, opcode: OpCode, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.inner.set_handler(opcode, handler)
    }

    pub fn remove_handler(&self, opcode: OpCode) -> bool {
        self.inner.remove_handler(opcode)
    }

    /// The async connection this facade drives.
    pub fn as_async(&self) -> &crate::WebSocket {
        &self.inner
    }
}
