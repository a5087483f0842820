//! # triton-net: the socket I/O core
//!
//! Non-blocking TCP sessions driven by a poll pump, with optional TLS over
//! the same read/write surface.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       triton-net                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐  │
//! │  │ TcpServerBase│ → │     Pump     │ → │ TcpSessionBase│ │
//! │  │ (listener)   │   │ (mio poll)   │   │ (buffer, TLS) │  │
//! │  └──────────────┘   └──────────────┘   └──────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The pump thread owns every session; framing protocols sit above
//! [`Session::on_read_avail`] and application code talks to sessions only
//! through the thread-safe `send`/`shutdown` surface.

mod buffer;
mod error;
mod pump;
mod server;
mod session;
mod tls;

pub use buffer::StreamBuffer;
pub use error::{NetError, NetResult};
pub use pump::{Pump, PumpStopper};
pub use server::{TcpServer, TcpServerBase};
pub use session::{Session, TcpSessionBase};
pub use tls::{insecure_client_config, TlsConfig};
