//! granite: edge-triggered static-file HTTP/1.1 server.
//!
//! ```bash
//! # Serve ./www on port 8080 with four workers
//! granite --workers 4 --root ./www
//!
//! # Add a TLS listener on 8443
//! granite --tls --tls-cert ./fullchain.pem --tls-key ./privkey.pem
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use granite_server::{signal, ServerConfig, Supervisor};

/// granite - static-file HTTP/1.1 server.
#[derive(Parser)]
#[command(name = "granite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of worker threads.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Maximum number of concurrent connections.
    #[arg(long, default_value_t = 255)]
    max_connections: usize,

    /// Per-worker transfer buffer in bytes.
    #[arg(long, default_value_t = 1_048_576)]
    buffer_size: usize,

    /// IPv4 bind address.
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_v4: Ipv4Addr,

    /// IPv6 bind address.
    #[arg(long, default_value_t = Ipv6Addr::UNSPECIFIED)]
    bind_v6: Ipv6Addr,

    /// Listen on the IPv6 address instead of the IPv4 one.
    #[arg(long)]
    ipv6: bool,

    /// Serve TLS on the HTTPS port as well.
    #[arg(long)]
    tls: bool,

    /// Plaintext HTTP port.
    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    /// HTTPS port (with --tls).
    #[arg(long, default_value_t = 8443)]
    https_port: u16,

    /// Document root directory.
    #[arg(long, default_value = "./www")]
    root: PathBuf,

    /// TLS certificate chain file (PEM).
    #[arg(long, default_value = "./fullchain.pem")]
    tls_cert: PathBuf,

    /// TLS private key file (PEM).
    #[arg(long, default_value = "./privkey.pem")]
    tls_key: PathBuf,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::new()
            .with_workers(self.workers)
            .with_max_connections(self.max_connections)
            .with_buffer_size(self.buffer_size)
            .with_root(self.root)
            .with_http_port(self.http_port)
            .with_https_port(self.https_port);
        config.bind_v4 = self.bind_v4;
        config.bind_v6 = self.bind_v6;
        config.ipv6_enabled = self.ipv6;
        if self.tls {
            config = config.with_tls(self.tls_cert, self.tls_key);
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = signal::install() {
        error!(error = %e, "failed to install signal handlers");
        return exit_code_for(e.raw_os_error());
    }

    let supervisor = match Supervisor::start(cli.into_config()) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "startup failed");
            return exit_code_for(e.os_error());
        }
    };

    supervisor.run_until(signal::shutdown_requested);
    ExitCode::SUCCESS
}

/// Startup failures exit with the OS errno of the first failure.
fn exit_code_for(errno: Option<i32>) -> ExitCode {
    match errno {
        Some(code) if code > 0 && code <= u8::MAX as i32 => ExitCode::from(code as u8),
        _ => ExitCode::FAILURE,
    }
}
