//! The poll pump.
//!
//! One thread owns the readiness set and every live session. Listener
//! readiness turns into accepted sessions, read readiness into
//! `on_read_avail` calls, and write readiness (or a nudge from a `send` or
//! `shutdown` caller on another thread) into send-buffer drains. The pump
//! holds the last strong reference to each session; removing a session
//! deregisters its descriptor and destroys it.
//!
//! Shutdown protocol: a forced session is dropped immediately; a session
//! with the shutdown flag set (or whose read side has terminated) is dropped
//! once its send buffer has fully drained.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::NetResult;
use crate::server::TcpServer;
use crate::session::Session;

const WAKER_TOKEN: Token = Token(0);

/// Maximum events to process per poll iteration.
const MAX_EVENTS: usize = 1024;

/// Scratch size for read and write syscalls.
const SCRATCH_SIZE: usize = 16 * 1024;

pub(crate) struct PumpShared {
    waker: Waker,
    nudged: Mutex<Vec<Token>>,
    running: AtomicBool,
}

/// A session's line back to its pump: queues the session for a write pass
/// and wakes the poll.
pub(crate) struct PumpHandle {
    shared: Arc<PumpShared>,
    token: Token,
}

impl PumpHandle {
    pub(crate) fn nudge(&self) {
        self.shared.nudged.lock().unwrap().push(self.token);
        let _ = self.shared.waker.wake();
    }
}

/// Stops a running pump from another thread.
#[derive(Clone)]
pub struct PumpStopper {
    shared: Arc<PumpShared>,
}

impl PumpStopper {
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.waker.wake();
    }
}

struct SessionEntry {
    session: Arc<dyn Session>,
    fd: RawFd,
    interest: Interest,
    /// Set once the read side has terminated (EOF or error); the entry
    /// survives until the send buffer drains.
    read_done: bool,
}

/// The poll-driven I/O loop.
pub struct Pump {
    poll: Poll,
    shared: Arc<PumpShared>,
    servers: HashMap<Token, Arc<dyn TcpServer>>,
    sessions: HashMap<Token, SessionEntry>,
    next_token: usize,
    read_scratch: Box<[u8]>,
    write_scratch: Box<[u8]>,
}

impl Pump {
    pub fn new() -> NetResult<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            poll,
            shared: Arc::new(PumpShared {
                waker,
                nudged: Mutex::new(Vec::new()),
                running: AtomicBool::new(true),
            }),
            servers: HashMap::new(),
            sessions: HashMap::new(),
            next_token: 1, // 0 is WAKER_TOKEN
            read_scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
            write_scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
        })
    }

    /// A handle that can stop [`Pump::run`] from another thread.
    pub fn stopper(&self) -> PumpStopper {
        PumpStopper {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Registers a listening server; accepted sessions are owned by this
    /// pump.
    pub fn add_server(&mut self, server: Arc<dyn TcpServer>) -> NetResult<()> {
        let token = self.alloc_token();
        let fd = server.base().raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.servers.insert(token, server);
        Ok(())
    }

    /// Takes ownership of a session (accepted or dialed) and registers it
    /// for readiness. Bytes already queued by `send` are picked up
    /// immediately.
    pub fn add_session(&mut self, session: Arc<dyn Session>) -> NetResult<()> {
        let token = self.alloc_token();
        let base = session.base();
        base.attach(PumpHandle {
            shared: Arc::clone(&self.shared),
            token,
        });

        let fd = base.raw_fd();
        let mut interest = Interest::READABLE;
        if base.unsent_len() > 0 || base.tls_wants_write() {
            interest |= Interest::WRITABLE;
        }
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;

        self.sessions.insert(
            token,
            SessionEntry {
                session,
                fd,
                interest,
                read_done: false,
            },
        );
        Ok(())
    }

    /// Number of sessions currently owned by the pump.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs the event loop until a [`PumpStopper`] stops it.
    pub fn run(&mut self) -> NetResult<()> {
        triton_log::set_thread_tag("net");
        triton_log::info!("Pump started.");

        // The flag starts true so a stop() issued before this thread spins
        // up is never lost.
        while self.shared.running.load(Ordering::Acquire) {
            self.poll_once(None)?;
        }

        triton_log::info!("Pump stopped.");
        Ok(())
    }

    /// Runs a single poll iteration. Useful for tests or custom loops.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> NetResult<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        if let Err(e) = self.poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        for event in &events {
            match event.token() {
                WAKER_TOKEN => {}
                token if self.servers.contains_key(&token) => self.accept_clients(token),
                token => {
                    if event.is_readable() {
                        self.handle_readable(token);
                    }
                    if event.is_writable() {
                        self.handle_writable(token);
                    }
                }
            }
        }

        // send()/shutdown() callers on other threads queue their session for
        // a write pass.
        let nudged = std::mem::take(&mut *self.shared.nudged.lock().unwrap());
        for token in nudged {
            self.handle_writable(token);
        }

        Ok(())
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept_clients(&mut self, token: Token) {
        let Some(server) = self.servers.get(&token).map(Arc::clone) else {
            return;
        };
        loop {
            match server.base().accept_session() {
                Ok(Some(base)) => match server.on_client_connect(base) {
                    Ok(session) => {
                        if let Err(e) = self.add_session(session) {
                            triton_log::error!("Failed to register accepted session: {e}");
                        }
                    }
                    Err(e) => triton_log::warning!("Session setup rejected: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    triton_log::error!("Error accepting connection: {e}");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let session = match self.sessions.get(&token) {
            Some(entry) if !entry.read_done => Arc::clone(&entry.session),
            _ => return,
        };
        if session.base().is_forced() {
            self.finish_io(token, false);
            return;
        }

        let mut read_done = false;
        loop {
            match session.base().do_read(&mut self.read_scratch) {
                Ok(0) => {
                    read_done = true;
                    break;
                }
                Ok(n) => {
                    if let Err(e) = session.on_read_avail(&self.read_scratch[..n]) {
                        triton_log::error!("Error in receive handler, shutting session down: {e}");
                        session.base().force_shutdown();
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    triton_log::debug!(
                        "Read error on session {}: {e}",
                        session.base().remote_addr()
                    );
                    read_done = true;
                    break;
                }
            }
            if session.base().is_forced() {
                break;
            }
        }

        // TLS handshake responses produced while reading must go out even
        // though no application bytes are queued.
        if session.base().flush_tls().is_err() {
            read_done = true;
        }

        if read_done {
            if let Some(entry) = self.sessions.get_mut(&token) {
                entry.read_done = true;
            }
        }
        self.finish_io(token, false);
    }

    fn handle_writable(&mut self, token: Token) {
        let session = match self.sessions.get(&token) {
            Some(entry) => Arc::clone(&entry.session),
            None => return,
        };
        let base = session.base();

        let mut write_failed = false;
        if !base.is_forced() {
            loop {
                match base.do_write(&mut self.write_scratch) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        triton_log::debug!("Write error on session {}: {e}", base.remote_addr());
                        write_failed = true;
                        break;
                    }
                }
            }
            if !write_failed && base.flush_tls().is_err() {
                write_failed = true;
            }
        }

        self.finish_io(token, write_failed);
    }

    /// Applies the teardown rules and interest changes after any I/O pass.
    fn finish_io(&mut self, token: Token, io_failed: bool) {
        let Some(entry) = self.sessions.get_mut(&token) else {
            return;
        };
        let base = entry.session.base();

        let drained = base.unsent_len() == 0 && !base.tls_wants_write();
        let close = io_failed
            || base.is_forced()
            || (base.has_been_shutdown() && drained)
            || (entry.read_done && drained);
        if close {
            self.remove_session(token);
            return;
        }

        let desired = if entry.read_done {
            // Read side is finished; only the drain keeps the entry alive.
            Interest::WRITABLE
        } else if drained {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        if desired != entry.interest {
            let fd = entry.fd;
            match self
                .poll
                .registry()
                .reregister(&mut SourceFd(&fd), token, desired)
            {
                Ok(()) => entry.interest = desired,
                Err(e) => {
                    triton_log::error!("Failed to update session interest: {e}");
                    self.remove_session(token);
                }
            }
        }
    }

    /// Drops the pump's reference, the session's last, after deregistering
    /// the descriptor.
    fn remove_session(&mut self, token: Token) {
        if let Some(entry) = self.sessions.remove(&token) {
            let _ = self.poll.registry().deregister(&mut SourceFd(&entry.fd));
            triton_log::debug!(
                "Removing session, remote = {}",
                entry.session.base().remote_addr()
            );
        }
    }
}
