//! Raw TCP proxying
//!
//! One listener per configured protocol port. L4 traffic carries no host
//! indicator, so a connection is routed to the first domain with a
//! selectable TCP backend; deployments are expected to run one TCP-routed
//! domain per port (the loader warns otherwise).

use crate::domain::SchemeFilter;
use crate::metrics::MetricsAggregator;
use crate::store::ConfigStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Copy buffer size per direction
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Per-operation deadlines, rearmed on every loop iteration
const READ_DEADLINE: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Backend dial timeout
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// A raw TCP listener for one protocol port
pub struct TcpGateway {
    protocol: String,
    bind_addr: SocketAddr,
    store: Arc<ConfigStore>,
    metrics: Arc<MetricsAggregator>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TcpGateway {
    pub fn new(
        protocol: String,
        bind_addr: SocketAddr,
        store: Arc<ConfigStore>,
        metrics: Arc<MetricsAggregator>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            protocol,
            bind_addr,
            store,
            metrics,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            protocol = self.protocol,
            addr = %listener.local_addr()?,
            "TCP proxy listener started"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let store = Arc::clone(&self.store);
                            let metrics = Arc::clone(&self.metrics);
                            let protocol = self.protocol.clone();

                            tokio::spawn(async move {
                                handle_session(stream, peer, store, metrics, protocol).await;
                            });
                        }
                        Err(e) => {
                            error!(protocol = self.protocol, error = %e, "TCP accept error");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(protocol = self.protocol, "TCP proxy listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_session(
    client: TcpStream,
    peer: SocketAddr,
    store: Arc<ConfigStore>,
    metrics: Arc<MetricsAggregator>,
    protocol: String,
) {
    debug!(protocol, peer = %peer, "New TCP connection");

    let config = match store.first_match(|c| c.has_selectable_tcp_backend()) {
        Some(config) => config,
        None => {
            warn!(protocol, peer = %peer, "No domain with active TCP backends");
            return;
        }
    };

    let backend = match config.select_backend(SchemeFilter::TcpOnly) {
        Some(backend) => backend,
        None => {
            warn!(
                protocol,
                domain = config.routing_key,
                "No healthy TCP backends available"
            );
            return;
        }
    };

    let backend_addr = backend.addr();
    let backend_conn =
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(backend_addr)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(protocol, backend = %backend_addr, error = %e, "TCP backend connection error");
                return;
            }
            Err(_) => {
                warn!(protocol, backend = %backend_addr, "TCP backend dial timed out");
                return;
            }
        };

    debug!(
        protocol,
        domain = config.routing_key,
        peer = %peer,
        backend = %backend_addr,
        "TCP session established"
    );

    let started = Instant::now();

    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend_conn.into_split();

    // Either direction ending tears down the whole session: the losing
    // branch is dropped, closing both halves it holds
    tokio::select! {
        result = pump(client_read, backend_write) => {
            log_direction("client->backend", &result);
        }
        result = pump(backend_read, client_write) => {
            log_direction("backend->client", &result);
        }
    }

    let elapsed = started.elapsed();
    metrics.record_tcp(&config.routing_key, elapsed);

    debug!(
        protocol,
        peer = %peer,
        backend = %backend_addr,
        elapsed_ms = elapsed.as_millis() as u64,
        "TCP session closed"
    );
}

/// Copy one direction with per-operation deadlines until EOF, error or
/// timeout. Returns the number of bytes moved.
async fn pump(mut read: OwnedReadHalf, mut write: OwnedWriteHalf) -> std::io::Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match tokio::time::timeout(READ_DEADLINE, read.read(&mut buffer)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "read deadline exceeded",
                ))
            }
        };

        match tokio::time::timeout(WRITE_DEADLINE, write.write_all(&buffer[..n])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                ))
            }
        }

        total += n as u64;
    }

    Ok(total)
}

fn log_direction(direction: &str, result: &std::io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(direction, bytes, "TCP direction finished"),
        Err(e) => debug!(direction, error = %e, "TCP direction failed"),
    }
}
