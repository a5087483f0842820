//! TCP server listeners.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpListener;

use crate::error::{NetError, NetResult};
use crate::session::{Session, TcpSessionBase};
use crate::tls::{TlsChannel, TlsConfig};

/// The derived-server interface: the pump accepts clients on readiness and
/// asks the server to construct the concrete session around the prepared
/// [`TcpSessionBase`]. Rejecting a client (an `Err`) drops the connection
/// without touching the listener.
pub trait TcpServer: Send + Sync + 'static {
    fn base(&self) -> &TcpServerBase;

    fn on_client_connect(&self, session: TcpSessionBase) -> NetResult<Arc<dyn Session>>;
}

/// A non-blocking listening socket, plain or TLS.
#[derive(Debug)]
pub struct TcpServerBase {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl TcpServerBase {
    /// Binds a plain listener.
    pub fn bind(addr: SocketAddr) -> NetResult<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        triton_log::info!("Listening on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
            tls: None,
        })
    }

    /// Binds a listener whose accepted sessions are wrapped in server-side
    /// TLS using the given PEM certificate and private key.
    pub fn bind_tls(
        addr: SocketAddr,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> NetResult<Self> {
        let tls = TlsConfig::new(cert_path, key_path).build_server_config()?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        triton_log::info!("Listening on {local_addr} (TLS)");
        Ok(Self {
            listener,
            local_addr,
            tls: Some(tls),
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one pending client, wrapping it in TLS when configured.
    /// `Ok(None)` means the accept queue is drained.
    pub(crate) fn accept_session(&self) -> NetResult<Option<TcpSessionBase>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let tls = match &self.tls {
                    None => None,
                    Some(config) => Some(TlsChannel::server(Arc::clone(config))?),
                };
                Ok(Some(TcpSessionBase::from_parts(stream, addr, tls)))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}
