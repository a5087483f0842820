//! TCP sessions.
//!
//! [`TcpSessionBase`] owns the connection: the non-blocking stream, the
//! remote address derived at construction, the send buffer under its own
//! mutex, the atomic shutdown flags, and the optional TLS channel. Concrete
//! session types embed it and implement [`Session`] for the receive hook.
//!
//! All public operations are callable from any thread and never block beyond
//! a bounded critical section. The pump is the only consumer of the send
//! buffer and the only caller of the read/write paths.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use mio::net::TcpStream;
use rustls::pki_types::ServerName;

use crate::buffer::StreamBuffer;
use crate::error::{NetError, NetResult};
use crate::pump::PumpHandle;
use crate::tls::{insecure_client_config, TlsChannel};

/// The derived-session interface: the pump hands every received chunk to
/// `on_read_avail`. A `Protocol` error shuts the session down forcefully.
pub trait Session: Send + Sync + 'static {
    fn base(&self) -> &TcpSessionBase;

    fn on_read_avail(&self, data: &[u8]) -> NetResult<()>;
}

/// State shared by every TCP session, accepted or dialed.
pub struct TcpSessionBase {
    stream: TcpStream,
    remote_addr: String,
    send_buffer: Mutex<StreamBuffer>,
    shutdown: AtomicBool,
    forced: AtomicBool,
    tls: Option<Mutex<TlsChannel>>,
    pump: OnceLock<PumpHandle>,
}

impl TcpSessionBase {
    pub(crate) fn from_parts(
        stream: TcpStream,
        addr: SocketAddr,
        tls: Option<TlsChannel>,
    ) -> Self {
        let remote_addr = addr.to_string();
        triton_log::info!("Created TCP session, remote = {remote_addr}");
        Self {
            stream,
            remote_addr,
            send_buffer: Mutex::new(StreamBuffer::new()),
            shutdown: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            tls: tls.map(Mutex::new),
            pump: OnceLock::new(),
        }
    }

    /// Dials `addr` without TLS. The socket is switched to non-blocking
    /// before the session is handed to the pump.
    pub fn connect(addr: SocketAddr) -> NetResult<Self> {
        let socket = std::net::TcpStream::connect(addr)?;
        let peer = socket.peer_addr()?;
        socket.set_nonblocking(true)?;
        Ok(Self::from_parts(TcpStream::from_std(socket), peer, None))
    }

    /// Dials `addr` and performs the TLS handshake eagerly; a handshake
    /// failure aborts session setup. Certificate verification is off; pass a
    /// strict [`rustls::ClientConfig`] through [`Self::connect_tls_with`] to
    /// enable it.
    pub fn connect_tls(addr: SocketAddr, server_name: &str) -> NetResult<Self> {
        Self::connect_tls_with(addr, server_name, insecure_client_config())
    }

    /// Dials with a caller-supplied TLS configuration.
    pub fn connect_tls_with(
        addr: SocketAddr,
        server_name: &str,
        config: Arc<rustls::ClientConfig>,
    ) -> NetResult<Self> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| NetError::Tls(format!("invalid server name: {e}")))?;

        let mut socket = std::net::TcpStream::connect(addr)?;
        let peer = socket.peer_addr()?;
        let channel = TlsChannel::client_handshake(&mut socket, config, server_name)?;
        socket.set_nonblocking(true)?;

        Ok(Self::from_parts(
            TcpStream::from_std(socket),
            peer,
            Some(channel),
        ))
    }

    /// The peer's address, formatted at construction.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Enqueues bytes for delivery. Returns `false`, dropping the buffer,
    /// once the session has been shut down.
    pub fn send(&self, mut buffer: StreamBuffer) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            triton_log::debug!("Attempting to send data on a closed session.");
            return false;
        }
        {
            let mut queue = self.send_buffer.lock().unwrap();
            queue.splice(&mut buffer);
        }
        self.nudge();
        true
    }

    /// Convenience for [`Self::send`] with a copied slice.
    pub fn send_slice(&self, data: &[u8]) -> bool {
        self.send(StreamBuffer::from_slice(data))
    }

    /// True once any shutdown has been requested.
    pub fn has_been_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Graceful shutdown: half-closes the read side so queued outbound bytes
    /// still drain; the pump tears the session down once the buffer empties.
    /// Returns whether this caller made the transition.
    pub fn shutdown(&self) -> bool {
        let won = !self.shutdown.swap(true, Ordering::AcqRel);
        if won {
            let _ = self.stream.shutdown(Shutdown::Read);
        }
        self.nudge();
        won
    }

    /// Graceful shutdown with final bytes: the winner appends `final_bytes`
    /// to the send buffer before the half-close.
    pub fn shutdown_with(&self, mut final_bytes: StreamBuffer) -> bool {
        let won = !self.shutdown.swap(true, Ordering::AcqRel);
        if won {
            {
                let mut queue = self.send_buffer.lock().unwrap();
                queue.splice(&mut final_bytes);
            }
            let _ = self.stream.shutdown(Shutdown::Read);
        }
        self.nudge();
        won
    }

    /// Forceful shutdown: both directions close immediately and the pump
    /// drops the session without draining. Closes the write side even when a
    /// graceful shutdown already won the flag, so a force can abort a drain.
    pub fn force_shutdown(&self) -> bool {
        self.forced.store(true, Ordering::Release);
        let won = !self.shutdown.swap(true, Ordering::AcqRel);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.nudge();
        won
    }

    /// Bytes accepted by [`Self::send`] but not yet written to the socket.
    pub fn unsent_len(&self) -> usize {
        self.send_buffer.lock().unwrap().len()
    }

    pub(crate) fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, handle: PumpHandle) {
        let _ = self.pump.set(handle);
    }

    fn nudge(&self) {
        if let Some(handle) = self.pump.get() {
            handle.nudge();
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Delivers bytes from the kernel or, with TLS active, from the TLS
    /// channel over the same stream. `Ok(0)` is the read-terminating
    /// condition.
    pub(crate) fn do_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.tls {
            None => (&self.stream).read(buf),
            Some(tls) => tls.lock().unwrap().read(&self.stream, buf),
        }
    }

    /// Writes one peeked prefix of the send buffer to the socket.
    ///
    /// The buffer mutex is released across the write syscall so a slow peer
    /// never stalls concurrent `send` callers; the peeked prefix is stable
    /// because the pump is the only consumer. `Ok(0)` means the buffer was
    /// empty.
    pub(crate) fn do_write(&self, scratch: &mut [u8]) -> io::Result<usize> {
        let peeked = {
            let queue = self.send_buffer.lock().unwrap();
            queue.peek(scratch)
        };
        if peeked == 0 {
            return Ok(0);
        }

        let written = match &self.tls {
            None => (&self.stream).write(&scratch[..peeked]),
            Some(tls) => tls.lock().unwrap().write(&self.stream, &scratch[..peeked]),
        }?;

        if written > 0 {
            let mut queue = self.send_buffer.lock().unwrap();
            queue.discard(written);
        }
        Ok(written)
    }

    /// Pushes pending TLS records (handshake output included) to the socket.
    /// A no-op for plain sessions.
    pub(crate) fn flush_tls(&self) -> io::Result<()> {
        match &self.tls {
            None => Ok(()),
            Some(tls) => tls.lock().unwrap().flush(&self.stream),
        }
    }

    pub(crate) fn tls_wants_write(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(|tls| tls.lock().unwrap().wants_write())
    }
}

impl Drop for TcpSessionBase {
    fn drop(&mut self) {
        triton_log::info!("Destroyed TCP session, remote = {}", self.remote_addr);
    }
}
