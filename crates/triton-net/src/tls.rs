//! TLS configuration and the per-session TLS channel.
//!
//! The channel exposes the same read/write shape as the raw socket, so the
//! session's I/O paths are transport-agnostic. Server-side handshakes proceed
//! lazily under the pump; client-side wraps handshake eagerly at connect time
//! and fail session setup on error. Client verification is off by default;
//! callers wanting strict verification supply their own
//! [`rustls::ClientConfig`].

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use crate::error::{NetError, NetResult};

/// Server-side TLS material: certificate and private key paths (PEM).
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
}

impl TlsConfig {
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// Builds a rustls `ServerConfig` from this configuration.
    pub fn build_server_config(&self) -> NetResult<Arc<rustls::ServerConfig>> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| NetError::Tls(e.to_string()))?;

        Ok(Arc::new(config))
    }
}

/// Loads certificates from a PEM file.
fn load_certs(path: &Path) -> NetResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        NetError::Tls(format!(
            "failed to open certificate file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(Result::ok)
        .collect();

    if certs.is_empty() {
        return Err(NetError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_private_key(path: &Path) -> NetResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| NetError::Tls(format!("failed to open key file {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => {
                // Skip non-key items such as certificates.
            }
            Ok(None) => break,
            Err(e) => {
                return Err(NetError::Tls(format!(
                    "failed to parse key file {}: {}",
                    path.display(),
                    e
                )));
            }
        }
    }

    Err(NetError::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// A client configuration that skips certificate verification: the
/// framework's default for dialed sessions, which trust transport-level
/// assumptions elsewhere.
pub fn insecure_client_config() -> Arc<rustls::ClientConfig> {
    let algorithms = rustls::crypto::ring::default_provider().signature_verification_algorithms;
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification(algorithms)))
        .with_no_client_auth();
    Arc::new(config)
}

#[derive(Debug)]
struct NoVerification(rustls::crypto::WebPkiSupportedAlgorithms);

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// Per-session TLS state, exposing the raw socket's read/write shape.
pub(crate) struct TlsChannel {
    conn: rustls::Connection,
}

impl TlsChannel {
    /// Server-side channel; the handshake is driven lazily by the pump's
    /// read and flush calls.
    pub(crate) fn server(config: Arc<rustls::ServerConfig>) -> NetResult<Self> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| NetError::Tls(format!("failed to create TLS session: {e}")))?;
        Ok(Self {
            conn: rustls::Connection::Server(conn),
        })
    }

    /// Client-side channel with an eager handshake over the still-blocking
    /// socket. A failure here aborts session setup.
    pub(crate) fn client_handshake(
        socket: &mut std::net::TcpStream,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> NetResult<Self> {
        let mut conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| NetError::Tls(format!("failed to create TLS session: {e}")))?;

        while conn.is_handshaking() {
            conn.complete_io(socket)
                .map_err(|e| NetError::Tls(format!("TLS handshake failed: {e}")))?;
        }

        Ok(Self {
            conn: rustls::Connection::Client(conn),
        })
    }

    /// Reads decrypted bytes, pulling and processing TLS records from the
    /// socket first.
    pub(crate) fn read(&mut self, mut socket: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        while self.conn.wants_read() {
            match self.conn.read_tls(&mut socket) {
                Ok(0) => break,
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        self.conn.reader().read(buf)
    }

    /// Writes plaintext (encrypted by the channel) and flushes what the
    /// socket will take.
    pub(crate) fn write(&mut self, socket: &TcpStream, data: &[u8]) -> io::Result<usize> {
        let written = self.conn.writer().write(data)?;
        self.flush(socket)?;
        Ok(written)
    }

    /// Pushes pending TLS records, handshake output included, to the socket.
    pub(crate) fn flush(&mut self, mut socket: &TcpStream) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut socket) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// True while the channel holds records the socket has not accepted yet.
    pub(crate) fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }
}
