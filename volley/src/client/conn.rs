//! Connection handling for pipelined HTTP exchanges.
//!
//! A [`Connection`] owns one TCP or TLS stream for its whole life. Writes
//! are buffered so an entire batch goes out in a single syscall burst;
//! reads go through the incremental [`ResponseReader`]. Every socket
//! operation is bounded by an absolute deadline taken at dial time.

use once_cell::sync::Lazy;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::http::{RawResponse, ResponseReader};
use crate::{Error, Scheme, Wrapper};

/// One stream, plain or encrypted. Read/write calls dispatch to whichever
/// transport the dial produced.
pub(crate) enum HttpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Certificate verifier that accepts any server certificate. Fuzzing
/// targets routinely present self-signed or mismatched certificates, so
/// chain validation is disabled while signature checks stay intact.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// TLS 1.2 minimum; one shared client config for every worker.
static TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .expect("tls protocol versions supported by provider")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
        .with_no_client_auth();
    Arc::new(config)
});

/// Handles sending and receiving of pipelined HTTP packets over a single
/// exclusively-owned stream.
pub(crate) struct Connection {
    writer: WriteHalf<HttpStream>,
    reader: ResponseReader<ReadHalf<HttpStream>>,
    write_buf: Vec<u8>,
    deadline: Instant,
    host: String,
}

impl Connection {
    /// Dial `host` and, for https, complete a TLS handshake. The io
    /// deadline for the life of the connection starts counting here.
    pub(crate) async fn open(
        scheme: Scheme,
        host: &str,
        dial_timeout: Duration,
        conn_deadline: Duration,
    ) -> Result<Self, Error> {
        let tcp = match timeout(dial_timeout, TcpStream::connect(host)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::transport(format!("dialing {host}"), e)),
            Err(_) => {
                return Err(Error::transport(
                    format!("dialing {host}"),
                    io::Error::new(io::ErrorKind::TimedOut, "dial timeout expired"),
                ))
            }
        };

        let deadline = Instant::now() + conn_deadline;
        let stream = match scheme {
            Scheme::Http => HttpStream::Plain(tcp),
            Scheme::Https => {
                let server_name = tls_server_name(host)?;
                let connector = TlsConnector::from(TLS_CONFIG.clone());
                match timeout_at(deadline, connector.connect(server_name, tcp)).await {
                    Ok(Ok(stream)) => HttpStream::Tls(Box::new(stream)),
                    Ok(Err(e)) => {
                        return Err(Error::transport(format!("tls handshake with {host}"), e))
                    }
                    Err(_) => {
                        return Err(Error::transport(
                            format!("tls handshake with {host}"),
                            io::Error::new(io::ErrorKind::TimedOut, "handshake deadline expired"),
                        ))
                    }
                }
            }
        };

        debug!(%scheme, host, "connection established");
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Connection {
            writer: write_half,
            reader: ResponseReader::new(read_half),
            write_buf: Vec::new(),
            deadline,
            host: host.to_string(),
        })
    }

    /// Queue the request bytes of `wrapper` for the next flush.
    pub(crate) fn enqueue(&mut self, wrapper: &Wrapper) {
        self.write_buf.extend_from_slice(&wrapper.request);
    }

    /// Write everything queued since the last flush to the wire.
    pub(crate) async fn flush(&mut self) -> Result<(), Error> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        trace!(host = %self.host, bytes = self.write_buf.len(), "flushing batch");
        let write = write_all_flush(&mut self.writer, &self.write_buf);
        let result = timeout_at(self.deadline, write).await;
        match result {
            Ok(Ok(())) => {
                self.write_buf.clear();
                Ok(())
            }
            Ok(Err(e)) => Err(Error::transport(format!("writing to {}", self.host), e)),
            Err(_) => Err(Error::transport(
                format!("writing to {}", self.host),
                io::Error::new(io::ErrorKind::TimedOut, "connection deadline expired"),
            )),
        }
    }

    /// Read the next pipelined response. `Ok(None)` means the peer closed
    /// the stream cleanly before sending another response; the caller must
    /// taint the connection and resume on a fresh one. The boolean is
    /// false when this connection cannot serve further reads.
    pub(crate) async fn read_response(&mut self) -> Result<Option<(RawResponse, bool)>, Error> {
        match timeout_at(self.deadline, self.reader.read_response()).await {
            Ok(result) => result,
            Err(_) => Err(Error::transport(
                format!("reading from {}", self.host),
                io::Error::new(io::ErrorKind::TimedOut, "connection deadline expired"),
            )),
        }
    }
}

async fn write_all_flush<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

fn tls_server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>, Error> {
    let name = host.rsplit_once(':').map_or(host, |(h, _)| h);
    rustls::pki_types::ServerName::try_from(name.to_string())
        .map_err(|e| Error::Config(format!("invalid tls server name [{name}]: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_name_strips_port() {
        assert!(tls_server_name("example.com:8443").is_ok());
        assert!(tls_server_name("127.0.0.1:443").is_ok());
    }

    #[tokio::test]
    async fn dial_refused_is_transport_error() {
        // Port 1 on localhost is essentially never listening.
        let result = Connection::open(
            Scheme::Http,
            "127.0.0.1:1",
            Duration::from_secs(2),
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(result, Err(Error::Transport { .. })));
    }
}
