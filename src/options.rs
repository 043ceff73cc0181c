use std::{sync::Arc, time::Duration};

use crate::stream::Connector;

/// Default size of the chunks an outgoing payload is split into, and of the buffer space reserved
/// at once while reading a payload: 64 KiB.
pub const DEFAULT_FRAGMENT_SIZE: usize = 64 * 1024;

/// Default limit on the size of a reassembled incoming message: 16 MiB.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// What a failed connect attempt leads to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Try again after a backoff delay, up to [`Settings::retry_limit`] times.
    #[default]
    Retry,
    /// Give up immediately and report the original failure.
    Return,
}

/// How `connect` and `close` report failures to the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ErrorHandling {
    /// Return the error as `Err`.
    #[default]
    Error,
    /// Only raise the error event; the call returns `Ok(false)`.
    Return,
}

/// Configuration for a WebSocket connection.
///
/// `Settings` is fixed once a [`crate::WebSocket`] is built. Start from [`Settings::default`] and
/// chain the `with_*` methods:
///
/// ```rust
/// use std::time::Duration;
/// use wsclient::{RetryPolicy, Settings};
///
/// let settings = Settings::default()
///     .with_retry_limit(3)
///     .with_retry_policy(RetryPolicy::Retry)
///     .with_max_backoff(Duration::from_secs(10))
///     .with_header("Authorization", "Bearer secret");
/// ```
#[derive(Clone)]
pub struct Settings {
    /// Upper bound of buffer space reserved at once while reading a payload.
    ///
    /// Default: 64 KiB
    pub read_fragment_size: usize,

    /// Payloads larger than this are sent as a fragmented message of frames of at most this size.
    ///
    /// Default: 64 KiB
    pub write_fragment_size: usize,

    /// How many times a failed connect is retried before giving up.
    ///
    /// Default: 5
    pub retry_limit: u32,

    /// Default: [`RetryPolicy::Retry`]
    pub retry_policy: RetryPolicy,

    /// Default: [`ErrorHandling::Error`]
    pub error_handling: ErrorHandling,

    /// Longest delay between two connect attempts.
    ///
    /// Default: 30 seconds
    pub max_backoff: Duration,

    /// Largest incoming message, across all of its fragments. Larger messages close the
    /// connection with status 1009.
    ///
    /// Default: 16 MiB
    pub max_message_size: usize,

    /// How long a local close waits for the server to answer its Close frame before the reader is
    /// cancelled.
    ///
    /// Default: 5 seconds
    pub close_timeout: Duration,

    /// Accept any server certificate on secure connections. Handshake signatures are still
    /// checked.
    ///
    /// Default: `true`
    pub accept_invalid_certs: bool,

    /// Extra headers sent with the upgrade request, replacing built-in headers of the same name.
    pub handshake_headers: Vec<(String, String)>,

    /// Opens the transport. Defaults to [`crate::stream::TcpConnector`].
    pub connector: Option<Arc<dyn Connector>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_fragment_size: DEFAULT_FRAGMENT_SIZE,
            write_fragment_size: DEFAULT_FRAGMENT_SIZE,
            retry_limit: 5,
            retry_policy: RetryPolicy::default(),
            error_handling: ErrorHandling::default(),
            max_backoff: Duration::from_secs(30),
            max_message_size: MAX_MESSAGE_SIZE,
            close_timeout: Duration::from_secs(5),
            accept_invalid_certs: true,
            handshake_headers: Vec::new(),
            connector: None,
        }
    }
}

impl Settings {
    /// Sets the read fragment size. Zero is treated as one byte.
    pub fn with_read_fragment_size(self, size: usize) -> Self {
        Self {
            read_fragment_size: size.max(1),
            ..self
        }
    }

    /// Sets the write fragment size. Zero is treated as one byte.
    pub fn with_write_fragment_size(self, size: usize) -> Self {
        Self {
            write_fragment_size: size.max(1),
            ..self
        }
    }

    pub fn with_retry_limit(self, retry_limit: u32) -> Self {
        Self {
            retry_limit,
            ..self
        }
    }

    pub fn with_retry_policy(self, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            ..self
        }
    }

    pub fn with_error_handling(self, error_handling: ErrorHandling) -> Self {
        Self {
            error_handling,
            ..self
        }
    }

    pub fn with_max_backoff(self, max_backoff: Duration) -> Self {
        Self {
            max_backoff,
            ..self
        }
    }

    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: size,
            ..self
        }
    }

    pub fn with_close_timeout(self, close_timeout: Duration) -> Self {
        Self {
            close_timeout,
            ..self
        }
    }

    /// Verify server certificates against the webpki roots instead of accepting any.
    pub fn with_certificate_verification(self) -> Self {
        Self {
            accept_invalid_certs: false,
            ..self
        }
    }

    /// Adds a header to the upgrade request.
    ///
    /// Names and values are validated when the request is built; an invalid one fails `connect`
    /// with [`crate::ErrorKind::HandshakeOpenRequestHeader`].
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.handshake_headers.push((name.into(), value.into()));
        self
    }

    /// Uses `connector` to open transports.
    pub fn with_connector(self, connector: impl Connector) -> Self {
        Self {
            connector: Some(Arc::new(connector)),
            ..self
        }
    }
}
