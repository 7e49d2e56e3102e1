//! Server configuration.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ServerError, ServerResult};

/// Configuration for the whole server process.
///
/// Defaults match the documented command-line defaults: one worker, 255
/// connections, a 1 MiB transfer buffer, plaintext on 8080 and (when TLS is
/// enabled) 8443, serving `./www`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Maximum concurrent connections across all listeners.
    pub max_connections: usize,
    /// Per-worker transfer buffer in bytes. Also bounds the request size.
    pub buffer_size: usize,
    /// IPv4 bind address.
    pub bind_v4: Ipv4Addr,
    /// IPv6 bind address.
    pub bind_v6: Ipv6Addr,
    /// Listen on the IPv6 address instead of the IPv4 one.
    pub ipv6_enabled: bool,
    /// Serve TLS on `https_port` in addition to plaintext on `http_port`.
    pub tls_enabled: bool,
    /// Plaintext HTTP port.
    pub http_port: u16,
    /// TLS HTTPS port.
    pub https_port: u16,
    /// Document root.
    pub root: PathBuf,
    /// TLS certificate chain (PEM).
    pub tls_cert: PathBuf,
    /// TLS private key (PEM).
    pub tls_key: PathBuf,
    /// Socket receive timeout.
    pub receive_timeout: Duration,
    /// Socket send timeout.
    pub send_timeout: Duration,
    /// Kernel receive buffer per connection, in bytes.
    pub receive_buffer: usize,
    /// Kernel send buffer per connection, in bytes.
    pub send_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            max_connections: 255,
            buffer_size: 1024 * 1024,
            bind_v4: Ipv4Addr::UNSPECIFIED,
            bind_v6: Ipv6Addr::UNSPECIFIED,
            ipv6_enabled: false,
            tls_enabled: false,
            http_port: 8080,
            https_port: 8443,
            root: PathBuf::from("./www"),
            tls_cert: PathBuf::from("./fullchain.pem"),
            tls_key: PathBuf::from("./privkey.pem"),
            receive_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            receive_buffer: 1024 * 1024,
            send_buffer: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with the documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the maximum number of concurrent connections.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the per-worker transfer buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the document root.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the plaintext HTTP port.
    #[must_use]
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Sets the HTTPS port.
    #[must_use]
    pub fn with_https_port(mut self, port: u16) -> Self {
        self.https_port = port;
        self
    }

    /// Enables the TLS listener with the given certificate and key paths.
    #[must_use]
    pub fn with_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls_enabled = true;
        self.tls_cert = cert.into();
        self.tls_key = key.into();
        self
    }

    /// Per-worker poller capacity: an even share of the connection limit
    /// plus one slot of slack.
    pub fn jobs_per_worker(&self) -> usize {
        self.max_connections / self.worker_count.max(1) + 1
    }

    /// Validates the configuration and canonicalizes the document root.
    ///
    /// Capacity mistakes and an unusable root are configuration errors;
    /// startup aborts on them.
    pub fn validate(&mut self) -> ServerResult<()> {
        if self.worker_count == 0 {
            return Err(ServerError::Config("worker count must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config(
                "maximum connections must be positive".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ServerError::Config("buffer size must be positive".into()));
        }

        let canonical = self
            .root
            .canonicalize()
            .map_err(|e| ServerError::Config(format!("document root {:?}: {e}", self.root)))?;
        if !canonical.is_dir() {
            return Err(ServerError::Config(format!(
                "document root {canonical:?} is not a directory"
            )));
        }
        self.root = canonical;
        Ok(())
    }
}
