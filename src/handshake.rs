//! HTTP/1.1 upgrade handshake, client side.
//!
//! The request is assembled with the [`http`] crate and checked before it leaves the process;
//! the response is parsed with [`httparse`]. Both halves work on plain buffers so they can be
//! tested without a socket, and [`client_handshake`] drives them over any transport.
use base64::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, Request, Version,
};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::{Host, Url};

use crate::{ErrorKind, Result, WebSocketError};

/// GUID appended to the client key before hashing, from RFC 6455 section 1.3.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this client speaks.
pub const WS_VERSION: &str = "13";

/// Maximum size of the response head.
const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Where to connect, resolved from a `ws://` or `wss://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host to dial. IPv6 addresses are kept without brackets.
    pub host: String,
    pub port: u16,
    /// Whether the transport must be wrapped in TLS.
    pub secure: bool,
    /// Value of the `Host` header.
    pub authority: String,
    /// Path and query sent on the request line.
    pub resource: String,
}

impl Endpoint {
    /// Validates `uri` and resolves it into an endpoint without performing any I/O.
    ///
    /// The connection is secure when the scheme is `wss` or the port is 443.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(WebSocketError::new(ErrorKind::HandshakeOpenUri, "empty uri"));
        }

        let url = Url::parse(uri)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WebSocketError::new(
                ErrorKind::HandshakeOpenUri,
                format!("unsupported scheme {:?}", url.scheme()),
            ));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => {
                return Err(WebSocketError::new(
                    ErrorKind::HandshakeOpenHost,
                    format!("no host in {uri}"),
                ))
            }
        };

        let port = match url.port_or_known_default() {
            Some(port) if port != 0 => port,
            _ => {
                return Err(WebSocketError::new(
                    ErrorKind::HandshakeOpenPort,
                    format!("no usable port in {uri}"),
                ))
            }
        };

        // host_str keeps the brackets around IPv6 addresses, which the Host header needs
        let host_str = url.host_str().unwrap_or(&host);
        let authority = match url.port() {
            Some(port) => format!("{host_str}:{port}"),
            None => host_str.to_owned(),
        };

        let resource = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_owned(),
        };

        Ok(Self {
            secure: url.scheme() == "wss" || port == 443,
            host,
            port,
            authority,
            resource,
        })
    }
}

/// Generates a random `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Computes the `Sec-WebSocket-Accept` value the server must answer for `key`.
///
/// ```
/// assert_eq!(
///     wsclient::handshake::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Builds the upgrade request for `endpoint`.
///
/// `extra` headers are applied last and replace headers of the same name.
pub fn build_request(
    endpoint: &Endpoint,
    key: &str,
    extra: &[(String, String)],
) -> Result<Request<()>> {
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(endpoint.resource.as_str())
        .version(Version::HTTP_11)
        .header(header::HOST, endpoint.authority.as_str())
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_KEY, key)
        .header(header::SEC_WEBSOCKET_VERSION, WS_VERSION)
        .body(())
        .map_err(|err| {
            WebSocketError::new(ErrorKind::HandshakeOpenRequestHeader, "upgrade request")
                .with_source(err)
        })?;

    for (name, value) in extra {
        let name = HeaderName::try_from(name.as_str()).map_err(|err| {
            WebSocketError::new(
                ErrorKind::HandshakeOpenRequestHeader,
                format!("header name {name:?}"),
            )
            .with_source(err)
        })?;
        let value = HeaderValue::try_from(value.as_str()).map_err(|err| {
            WebSocketError::new(
                ErrorKind::HandshakeOpenRequestHeader,
                format!("value of header {name}"),
            )
            .with_source(err)
        })?;
        request.headers_mut().insert(name, value);
    }

    Ok(request)
}

/// Checks that `request` is a well formed WebSocket upgrade.
pub fn validate_request(request: &Request<()>) -> Result<()> {
    if matches!(request.version(), Version::HTTP_09 | Version::HTTP_10) {
        return Err(WebSocketError::new(
            ErrorKind::HandshakeOpenRequestVersion,
            format!("{:?}", request.version()),
        ));
    }

    let headers = request.headers();
    let missing = |what: &str| {
        WebSocketError::new(
            ErrorKind::HandshakeOpenRequestHeader,
            format!("missing or invalid {what}"),
        )
    };

    if request.method() != Method::GET {
        return Err(missing("method"));
    }
    if headers.get(header::HOST).is_none() {
        return Err(missing("Host"));
    }
    if !header_eq(headers, header::UPGRADE, "websocket") {
        return Err(missing("Upgrade"));
    }
    if !header_has_token(headers, header::CONNECTION, "upgrade") {
        return Err(missing("Connection"));
    }
    let key_ok = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|key| BASE64_STANDARD.decode(key.as_bytes()).ok())
        .is_some_and(|nonce| nonce.len() == 16);
    if !key_ok {
        return Err(missing("Sec-WebSocket-Key"));
    }
    if !header_eq(headers, header::SEC_WEBSOCKET_VERSION, WS_VERSION) {
        return Err(missing("Sec-WebSocket-Version"));
    }

    Ok(())
}

/// Serializes the request head.
pub fn encode_request(request: &Request<()>) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(request.method().as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(request.uri().to_string().as_bytes());
    buf.put_slice(format!(" {:?}\r\n", request.version()).as_bytes());

    for (name, value) in request.headers() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// A parsed upgrade response head.
#[derive(Debug, Clone)]
pub struct Response {
    /// Minor HTTP version: 1 for HTTP/1.1.
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// Parses a response head from `buf`.
///
/// Returns `Ok(None)` while the head is incomplete, otherwise the response and the number of
/// bytes it occupied.
pub fn parse_response(buf: &[u8]) -> Result<Option<(Response, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut res = httparse::Response::new(&mut headers);

    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::Version) => {
            return Err(WebSocketError::new(
                ErrorKind::HandshakeOpenResponseVersion,
                "response is not HTTP/1.x",
            ))
        }
        Err(err) => {
            return Err(WebSocketError::new(
                ErrorKind::HandshakeOpenResponseHeader,
                "malformed response",
            )
            .with_source(err))
        }
    };

    let mut map = HeaderMap::with_capacity(res.headers.len());
    for h in res.headers.iter() {
        let name = HeaderName::try_from(h.name).map_err(|err| {
            WebSocketError::new(ErrorKind::HandshakeOpenResponseHeader, "header name")
                .with_source(err)
        })?;
        let value = HeaderValue::from_bytes(h.value).map_err(|err| {
            WebSocketError::new(
                ErrorKind::HandshakeOpenResponseHeader,
                format!("value of header {name}"),
            )
            .with_source(err)
        })?;
        map.append(name, value);
    }

    Ok(Some((
        Response {
            version: res.version.unwrap_or(0),
            status: res.code.unwrap_or(0),
            reason: res.reason.unwrap_or_default().to_owned(),
            headers: map,
        },
        len,
    )))
}

/// Checks the response against the key sent with the request.
pub fn validate_response(response: &Response, key: &str) -> Result<()> {
    if response.version < 1 {
        return Err(WebSocketError::new(
            ErrorKind::HandshakeOpenResponseVersion,
            format!("HTTP/1.{}", response.version),
        ));
    }

    if response.status != 101 {
        return Err(WebSocketError::new(
            ErrorKind::HandshakeOpenResponseStatus,
            format!("{} {}", response.status, response.reason),
        ));
    }

    let expected = accept_key(key);
    match response.headers.get(header::SEC_WEBSOCKET_ACCEPT) {
        Some(accept) if accept.as_bytes() == expected.as_bytes() => {}
        Some(accept) => {
            return Err(WebSocketError::new(
                ErrorKind::HandshakeOpenResponseHeader,
                format!("Sec-WebSocket-Accept {accept:?}, expected {expected}"),
            ))
        }
        None => {
            return Err(WebSocketError::new(
                ErrorKind::HandshakeOpenResponseHeader,
                "missing Sec-WebSocket-Accept",
            ))
        }
    }

    if let Some(version) = response.headers.get(header::SEC_WEBSOCKET_VERSION) {
        if version.as_bytes() != WS_VERSION.as_bytes() {
            return Err(WebSocketError::new(
                ErrorKind::HandshakeOpenResponseHeader,
                format!("Sec-WebSocket-Version {version:?}"),
            ));
        }
    }

    Ok(())
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct Handshake {
    pub response: Response,
    /// Bytes the server sent after the response head. They belong to the first frames.
    pub leftover: BytesMut,
}

/// Performs the client side of the upgrade over `stream`.
pub async fn client_handshake<S>(
    stream: &mut S,
    endpoint: &Endpoint,
    extra: &[(String, String)],
) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = build_request(endpoint, &key, extra)?;
    validate_request(&request)?;

    #[cfg(feature = "logging")]
    log::debug!("upgrade request to {}{}", endpoint.authority, endpoint.resource);

    let transport = |err: std::io::Error| {
        WebSocketError::new(ErrorKind::HandshakeOpenTransport, "handshake i/o").with_source(err)
    };

    stream
        .write_all(&encode_request(&request))
        .await
        .map_err(transport)?;
    stream.flush().await.map_err(transport)?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some((response, consumed)) = parse_response(&buf)? {
            validate_response(&response, &key)?;

            #[cfg(feature = "logging")]
            log::debug!(
                "upgrade accepted by {}, {} bytes past the head",
                endpoint.authority,
                buf.len() - consumed
            );

            let leftover = buf.split_off(consumed);
            return Ok(Handshake { response, leftover });
        }

        if buf.len() > MAX_HEADER_SIZE {
            return Err(WebSocketError::new(
                ErrorKind::HandshakeOpenResponseHeader,
                "response head too large",
            ));
        }

        let n = stream.read_buf(&mut buf).await.map_err(transport)?;
        if n == 0 {
            return Err(WebSocketError::new(
                ErrorKind::HandshakeOpenTransport,
                "connection closed during handshake",
            ));
        }
    }
}

fn header_eq(headers: &HeaderMap, name: HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(expected))
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}
