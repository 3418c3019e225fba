//! Backend health checking
//!
//! Periodically probes every active backend of every health-check-enabled
//! domain and records the result in the control-plane store. The request
//! pipeline picks the change up on the next configuration reload.

use crate::db::{Database, HealthTarget};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Global probe cadence. The per-domain `health_check_interval` column is
/// advisory; every enabled domain is probed on this ticker.
const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for a single probe attempt
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before the second HTTP probe attempt
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// User agent presented by HTTP probes
const PROBE_USER_AGENT: &str = "ProxyEngine-HealthCheck";

pub const STATUS_HEALTHY: &str = "healthy";
pub const STATUS_UNHEALTHY: &str = "unhealthy";

/// Health checker that monitors configured backends
pub struct HealthChecker {
    db: Database,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(db: Database) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build health check client: {}", e))?;

        Ok(Self { db, client })
    }

    /// Run the health checker until shutdown. Probes once immediately, then
    /// on the fixed ticker.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = CHECK_INTERVAL.as_secs(),
            "Health checker started"
        );

        self.check_all_backends().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(CHECK_INTERVAL) => {
                    self.check_all_backends().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every target and write results back
    async fn check_all_backends(&self) {
        let targets = match self.db.health_check_targets() {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "Health check query failed");
                return;
            }
        };

        for target in targets {
            let healthy = self.probe(&target).await;
            let status = if healthy {
                STATUS_HEALTHY
            } else {
                STATUS_UNHEALTHY
            };

            debug!(
                domain = target.domain_name,
                backend = target.backend_id,
                addr = format!("{}:{}", target.ip, target.port),
                status,
                "Probe finished"
            );

            if !healthy {
                warn!(
                    domain = target.domain_name,
                    backend = target.backend_id,
                    scheme = target.scheme,
                    addr = format!("{}:{}", target.ip, target.port),
                    "Backend unhealthy"
                );
            }

            if let Err(e) = self.db.update_backend_health(target.backend_id, status) {
                warn!(backend = target.backend_id, error = %e, "Failed to record health status");
            }
        }
    }

    async fn probe(&self, target: &HealthTarget) -> bool {
        match target.scheme.as_str() {
            "http" | "https" => self.probe_http(target).await,
            "tcp" => probe_tcp(&target.ip, target.port).await,
            other => {
                warn!(
                    backend = target.backend_id,
                    scheme = other,
                    "Unknown backend scheme, marking unhealthy"
                );
                false
            }
        }
    }

    /// HTTP(S) probe: GET / with a closed connection. Any response counts
    /// as healthy; a transport failure is retried once before giving up.
    async fn probe_http(&self, target: &HealthTarget) -> bool {
        let url = format!(
            "{}://{}/",
            target.scheme,
            host_port(&target.ip, target.port)
        );

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }

            let result = self
                .client
                .get(&url)
                .header(reqwest::header::USER_AGENT, PROBE_USER_AGENT)
                .header(reqwest::header::CONNECTION, "close")
                .send()
                .await;

            match result {
                Ok(response) => {
                    debug!(url, status = response.status().as_u16(), "HTTP probe ok");
                    return true;
                }
                Err(e) => {
                    debug!(url, attempt, error = %e, "HTTP probe attempt failed");
                }
            }
        }

        false
    }
}

/// TCP probe: a successful connect within the timeout is healthy
pub async fn probe_tcp(ip: &str, port: u16) -> bool {
    let addr: SocketAddr = match ip.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => return false,
    };

    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "TCP probe failed");
            false
        }
        Err(_) => {
            debug!(addr = %addr, "TCP probe timed out");
            false
        }
    }
}

/// Format an address for a URL, bracketing IPv6 hosts
fn host_port(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}
