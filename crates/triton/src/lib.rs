//! # Triton: a multi-threaded server application framework
//!
//! Triton exposes TCP (optionally TLS) endpoints, dispatches framed requests
//! through a servlet registry with weak-dependency lifetime gating, and
//! persists domain objects through an asynchronous write-behind daemon backed
//! by MySQL.
//!
//! The workspace crates, re-exported here:
//!
//! - [`log`]: level-filtered, thread-tagged logging over `tracing`.
//! - [`config`]: the configuration collaborator (`get(key, default)`).
//! - [`jobs`]: the user-thread pool that runs application handlers.
//! - [`db`]: the persistence daemon with coalesced saves, FIFO loads, and
//!   reconnect backoff.
//! - [`net`]: sessions, listeners, TLS, and the poll pump.
//! - [`servlet`]: the URI-to-handler registry.
//!
//! A minimal server wires them together like this:
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! let jobs = triton::jobs::JobPool::start(4);
//! let daemon = triton::db::PersistenceDaemon::new(
//!     triton::db::DbConfig::from_config(&config),
//!     Box::new(triton::db::MySqlConnector::new()?),
//!     Arc::clone(&jobs),
//! );
//! daemon.start();
//!
//! let mut pump = triton::net::Pump::new()?;
//! pump.add_server(my_server)?; // a TcpServer building sessions
//! pump.run()?;
//! ```

pub use triton_config as config;
pub use triton_db as db;
pub use triton_jobs as jobs;
pub use triton_log as log;
pub use triton_net as net;
pub use triton_servlet as servlet;
