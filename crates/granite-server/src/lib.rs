//! # granite-server: static-file HTTP/1.1 server core
//!
//! The concurrency model is threads plus readiness polling, no async
//! runtime:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Supervisor                           │
//! │  ┌──────────┐   ┌─────────────────┐   ┌───────────────────┐  │
//! │  │ Listener │ → │ Manager (jobs)  │ → │ Worker × N        │  │
//! │  │ (accept) │   │ pooled slots    │   │ (poll, read/write)│  │
//! │  └──────────┘   └─────────────────┘   └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A listener thread drains its accept queue on every readable edge and
//! hands each connection, wrapped in a pooled [`job::Job`], to a worker by
//! round-robin. The worker's poller owns the socket from then on: requests
//! are parsed zero-copy, responses stream back as a pre-formatted head
//! plus either a small HTML body or a file (kernel sendfile where the
//! platform offers it, user-space otherwise). TLS endpoints run the same
//! state machine with a rustls session in the transport.
//!
//! ## Usage
//!
//! ```ignore
//! use granite_server::{ServerConfig, Supervisor};
//!
//! let config = ServerConfig::new().with_root("./www").with_http_port(8080);
//! let supervisor = Supervisor::start(config)?;
//! supervisor.run_until(|| granite_server::signal::shutdown_requested());
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod job;
pub mod listener;
pub mod mime;
mod sendfile;
pub mod signal;
pub mod supervisor;
pub mod tls;
pub mod transport;
pub mod worker;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use job::{Job, JobState, Manager};
pub use listener::Listener;
pub use supervisor::Supervisor;
pub use tls::{TlsSettings, TlsStatus};
pub use transport::{Conn, Endpoint, SocketOptions};
pub use worker::{Worker, WorkerHandle};
