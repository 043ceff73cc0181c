//! Transports the connection runs over.
//!
//! A [`Connector`] turns a host, a port and a secure flag into a [`BoxedStream`]. The default
//! [`TcpConnector`] dials TCP and, for secure endpoints, negotiates TLS with rustls. Tests and
//! embedders can plug their own connector through [`crate::Settings::with_connector`].
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{
    client::TlsStream,
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
        pki_types::{CertificateDer, ServerName, TrustAnchor, UnixTime},
        DigitallySignedStruct, SignatureScheme,
    },
    TlsConnector,
};

use crate::{ErrorKind, Result, WebSocketError};

/// Any byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Type-erased transport handed to the handshake and the frame codec.
pub type BoxedStream = Box<dyn Transport>;

/// Opens transports to a WebSocket endpoint.
pub trait Connector: Send + Sync + 'static {
    /// Connects to `host:port`, wrapping the stream in TLS when `secure` is set.
    ///
    /// Failures should be reported as [`ErrorKind::HandshakeOpenTransport`] or
    /// [`ErrorKind::HandshakeOpenTls`] so the retry policy can tell them apart from caller errors.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        secure: bool,
    ) -> BoxFuture<'a, Result<BoxedStream>>;
}

/// A stream that might be protected with TLS.
#[allow(clippy::large_enum_variant)]
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Default connector: TCP with optional rustls TLS.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    accept_invalid_certs: bool,
    no_delay: bool,
}

impl TcpConnector {
    /// Creates a connector.
    ///
    /// With `accept_invalid_certs` the server certificate chain and host name are not verified;
    /// handshake signatures still are.
    pub fn new(accept_invalid_certs: bool) -> Self {
        Self {
            accept_invalid_certs,
            no_delay: true,
        }
    }

    /// Sets `TCP_NODELAY` on new sockets. Enabled by default.
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    async fn connect_priv(&self, host: &str, port: u16, secure: bool) -> Result<BoxedStream> {
        let tcp_stream = TcpStream::connect((host, port)).await.map_err(|err| {
            WebSocketError::new(
                ErrorKind::HandshakeOpenTransport,
                format!("connect to {host}:{port}"),
            )
            .with_source(err)
        })?;

        let _ = tcp_stream.set_nodelay(self.no_delay);

        if !secure {
            return Ok(Box::new(MaybeTlsStream::Plain(tcp_stream)));
        }

        let domain = ServerName::try_from(host.to_owned()).map_err(|err| {
            WebSocketError::new(ErrorKind::HandshakeOpenTls, format!("server name {host}"))
                .with_source(err)
        })?;

        let connector = tls_connector(self.accept_invalid_certs)?;
        let tls_stream = connector.connect(domain, tcp_stream).await.map_err(|err| {
            WebSocketError::new(ErrorKind::HandshakeOpenTls, format!("tls with {host}"))
                .with_source(err)
        })?;

        Ok(Box::new(MaybeTlsStream::Tls(tls_stream)))
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        secure: bool,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(self.connect_priv(host, port, secure))
    }
}

/// Creates a TLS connector for secure WebSocket connections.
///
/// Verifies certificates against the webpki roots unless `accept_invalid_certs` is set.
pub fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let provider = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|err| {
            WebSocketError::new(ErrorKind::HandshakeOpenTls, "tls protocol versions")
                .with_source(err)
        })?;

    let mut config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    } else {
        let mut root_cert_store = rustls::RootCertStore::empty();
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
            subject: ta.subject.clone(),
            subject_public_key_info: ta.subject_public_key_info.clone(),
            name_constraints: ta.name_constraints.clone(),
        }));
        builder
            .with_root_certificates(root_cert_store)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec!["http/1.1".into()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any server certificate while still checking that the handshake was signed by it.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
