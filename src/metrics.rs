//! Per-domain metrics aggregation
//!
//! The request pipeline records outcomes into in-memory buffers; a periodic
//! flush computes windowed summaries (average, p95, p99) and appends them to
//! the control-plane store. The per-domain lock is held only long enough to
//! swap the buffers out, so recording never waits on the database.

use crate::db::Database;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Flush cadence for windowed summaries
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Buffered counters and samples for one domain
#[derive(Debug, Default)]
struct DomainBuffers {
    http_count: u64,
    error_count: u64,
    tcp_count: u64,
    http_latency_ms: Vec<f64>,
    tcp_latency_ms: Vec<f64>,
}

impl DomainBuffers {
    fn is_idle(&self) -> bool {
        self.http_count == 0 && self.error_count == 0 && self.tcp_count == 0
    }
}

/// Aggregates request metrics per routing key
pub struct MetricsAggregator {
    db: Database,
    buffers: DashMap<String, Mutex<DomainBuffers>>,
}

impl MetricsAggregator {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            buffers: DashMap::new(),
        }
    }

    /// Record a completed HTTP request
    pub fn record_http(&self, routing_key: &str, status: u16, elapsed: Duration) {
        let entry = self.buffers.entry(routing_key.to_string()).or_default();
        let mut buffers = entry.lock();
        buffers.http_count += 1;
        buffers.http_latency_ms.push(elapsed.as_millis() as f64);
        if status >= 400 {
            buffers.error_count += 1;
        }
    }

    /// Record an upstream failure with no response
    pub fn record_error(&self, routing_key: &str) {
        let entry = self.buffers.entry(routing_key.to_string()).or_default();
        entry.lock().error_count += 1;
    }

    /// Record a finished TCP session
    pub fn record_tcp(&self, routing_key: &str, elapsed: Duration) {
        let entry = self.buffers.entry(routing_key.to_string()).or_default();
        let mut buffers = entry.lock();
        buffers.tcp_count += 1;
        buffers.tcp_latency_ms.push(elapsed.as_millis() as f64);
    }

    /// Run the periodic flush until shutdown
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = FLUSH_INTERVAL.as_secs(),
            "Metrics aggregator started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(FLUSH_INTERVAL) => {
                    self.flush();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        // Final flush so a clean shutdown loses no window
                        self.flush();
                        info!("Metrics aggregator shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Flush every domain with activity and zero the buffers
    pub fn flush(&self) {
        // Swap active buffers out under their brief per-domain locks, then
        // do the database work without touching the map
        let mut pending = Vec::new();
        for entry in self.buffers.iter() {
            let mut buffers = entry.value().lock();
            if buffers.is_idle() {
                continue;
            }
            pending.push((entry.key().clone(), std::mem::take(&mut *buffers)));
        }

        for (routing_key, taken) in pending {
            let routing_key = routing_key.as_str();

            let domain_id = match self.resolve_domain_id(routing_key) {
                Some(id) => id,
                None => {
                    debug!(routing_key, "Skipping metrics for unknown domain");
                    continue;
                }
            };

            if taken.http_count > 0 || taken.error_count > 0 {
                let (avg, p95, p99) = summarize(&taken.http_latency_ms);
                if let Err(e) = self.db.insert_request_metrics(
                    domain_id,
                    taken.http_count,
                    taken.error_count,
                    avg,
                    p95,
                    p99,
                ) {
                    warn!(routing_key, error = %e, "Failed to flush request metrics");
                }
            }

            if taken.tcp_count > 0 {
                let (avg, p95, p99) = summarize(&taken.tcp_latency_ms);
                if let Err(e) =
                    self.db
                        .insert_tcp_metrics(domain_id, taken.tcp_count, avg, p95, p99)
                {
                    warn!(routing_key, error = %e, "Failed to flush tcp metrics");
                }
            }
        }
    }

    /// Resolve a routing key back to its domain row: by administrative
    /// target first, then by name (TCP-routed domains key on the name).
    fn resolve_domain_id(&self, routing_key: &str) -> Option<i64> {
        if let Ok(Some(id)) = self.db.domain_id_for_target(routing_key) {
            return Some(id);
        }
        self.db.domain_id_for_name(routing_key).ok().flatten()
    }
}

/// Average, p95 and p99 of a sample set. Percentiles use the sorted value
/// at index floor(q * n).
fn summarize(samples: &[f64]) -> (f64, f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0, 0.0);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;
    (avg, percentile(&sorted, 0.95), percentile(&sorted, 0.99))
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    let index = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[index]
}
