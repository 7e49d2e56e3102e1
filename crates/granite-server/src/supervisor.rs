//! Process supervisor: owns every long-lived component.
//!
//! The supervisor is the single owning value for the configuration, the
//! job manager, the workers, and the listeners. Nothing about the running
//! server is global; the only process-global piece is the signal handler,
//! which communicates through the atomic shutdown flag the supervisor
//! hands out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::job::Manager;
use crate::listener::Listener;
use crate::tls::TlsSettings;
use crate::transport::{Endpoint, SocketOptions};
use crate::worker::Worker;

/// How often the supervising thread re-checks the shutdown condition.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The one owning value for a running server.
pub struct Supervisor {
    manager: Arc<Manager>,
    workers: Vec<Worker>,
    listeners: Vec<Listener>,
    shutdown: Arc<AtomicBool>,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    torn_down: bool,
}

impl Supervisor {
    /// Validates the configuration, builds every component, and starts the
    /// worker and listener threads.
    ///
    /// Startup failures abort construction; the caller is expected to exit
    /// with the OS error of the first failure.
    pub fn start(mut config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let manager = Arc::new(Manager::new(config.max_connections));
        let root = Arc::new(config.root.clone());
        let options = SocketOptions {
            receive_timeout: config.receive_timeout,
            send_timeout: config.send_timeout,
            receive_buffer: config.receive_buffer,
            send_buffer: config.send_buffer,
        };

        let mut workers = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let mut worker = Worker::new(
                index,
                config.jobs_per_worker(),
                Arc::clone(&manager),
                Arc::clone(&root),
                config.buffer_size,
            )?;
            worker.start()?;
            workers.push(worker);
        }
        let handles: Vec<_> = workers.iter().map(Worker::handle).collect();

        let bind_ip: std::net::IpAddr = if config.ipv6_enabled {
            config.bind_v6.into()
        } else {
            config.bind_v4.into()
        };

        let mut listeners = Vec::new();
        let http_endpoint = Endpoint::bind(
            SocketAddr::new(bind_ip, config.http_port),
            config.max_connections,
            None,
            options.clone(),
        )?;
        let http_addr = http_endpoint.local_addr();
        listeners.push(Listener::new(
            "http",
            http_endpoint,
            Arc::clone(&manager),
            handles.clone(),
            config.buffer_size,
        )?);

        let mut https_addr = None;
        if config.tls_enabled {
            let tls_config =
                TlsSettings::new(&config.tls_cert, &config.tls_key).build_server_config()?;
            let https_endpoint = Endpoint::bind(
                SocketAddr::new(bind_ip, config.https_port),
                config.max_connections,
                Some(tls_config),
                options,
            )?;
            https_addr = Some(https_endpoint.local_addr());
            listeners.push(Listener::new(
                "https",
                https_endpoint,
                Arc::clone(&manager),
                handles,
                config.buffer_size,
            )?);
        }

        for listener in &mut listeners {
            listener.attach_shutdown(Arc::clone(&shutdown));
            listener.start()?;
        }

        info!(
            workers = config.worker_count,
            max_connections = config.max_connections,
            root = %root.display(),
            "granite started"
        );

        Ok(Self {
            manager,
            workers,
            listeners,
            shutdown,
            http_addr,
            https_addr,
            torn_down: false,
        })
    }

    /// The HTTP listener's actual bound address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// The HTTPS listener's actual bound address, when TLS is enabled.
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// The shared shutdown flag. Setting it stops the accept loops.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Free job slots right now (diagnostics and tests).
    pub fn available_jobs(&self) -> usize {
        self.manager.available()
    }

    /// Requests shutdown programmatically.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Blocks until `should_stop` returns true (or the shutdown flag is
    /// set), then tears everything down in order: listeners stop accepting
    /// and are joined first, then the workers are stopped and joined.
    /// In-flight responses are abandoned with their sockets.
    pub fn run_until(mut self, should_stop: impl Fn() -> bool) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if should_stop() {
                self.shutdown.store(true, Ordering::Release);
                break;
            }
            std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!("shutting down");
        for listener in &self.listeners {
            listener.stop();
        }
        for listener in &mut self.listeners {
            listener.join();
        }
        for worker in &self.workers {
            worker.stop();
        }
        for worker in &mut self.workers {
            worker.join();
        }
        info!("shutdown complete");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.teardown();
    }
}
