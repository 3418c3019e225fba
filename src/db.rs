//! SQLite control-plane store
//!
//! This module provides the authoritative storage the proxy core reads its
//! routing configuration from: domains, backend servers, IP rules and rate
//! limits. The health checker writes probe results back here and the metrics
//! aggregator appends windowed summaries.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            // Add future migrations here:
            // if current_version < 2 { self.migrate_v2(&conn)?; }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            -- Routed domains
            CREATE TABLE IF NOT EXISTS domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                target_url TEXT NOT NULL,
                ssl_enabled INTEGER NOT NULL DEFAULT 0,
                health_check_enabled INTEGER NOT NULL DEFAULT 0,
                health_check_interval INTEGER NOT NULL DEFAULT 30,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Upstream origins per domain
            CREATE TABLE IF NOT EXISTS backend_servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_id INTEGER NOT NULL,
                scheme TEXT NOT NULL DEFAULT 'http',
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                weight INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                health_status TEXT,
                last_health_check TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
            );

            -- Access control rules per domain
            CREATE TABLE IF NOT EXISTS ip_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_id INTEGER NOT NULL,
                ip_range TEXT NOT NULL,
                rule_type TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
            );

            -- Token-bucket parameters per domain
            CREATE TABLE IF NOT EXISTS rate_limits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_id INTEGER NOT NULL,
                requests_per_second INTEGER NOT NULL,
                burst_size INTEGER NOT NULL,
                per_ip INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
            );

            -- Windowed HTTP metrics
            CREATE TABLE IF NOT EXISTS request_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                request_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                avg_latency_ms REAL NOT NULL,
                p95_latency_ms REAL NOT NULL,
                p99_latency_ms REAL NOT NULL,
                FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
            );

            -- Windowed TCP session metrics
            CREATE TABLE IF NOT EXISTS tcp_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                connection_count INTEGER NOT NULL,
                avg_duration_ms REAL NOT NULL,
                p95_duration_ms REAL NOT NULL,
                p99_duration_ms REAL NOT NULL,
                FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
            );

            -- Create indexes
            CREATE INDEX IF NOT EXISTS idx_backend_servers_domain ON backend_servers(domain_id);
            CREATE INDEX IF NOT EXISTS idx_ip_rules_domain ON ip_rules(domain_id);
            CREATE INDEX IF NOT EXISTS idx_rate_limits_domain ON rate_limits(domain_id);
            CREATE INDEX IF NOT EXISTS idx_request_metrics_domain ON request_metrics(domain_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_tcp_metrics_domain ON tcp_metrics(domain_id, timestamp);

            -- Record migration
            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    // ==================== Domain Operations ====================

    /// Create a domain, returning its id
    pub fn create_domain(
        &self,
        name: &str,
        target_url: &str,
        ssl_enabled: bool,
        health_check_enabled: bool,
        health_check_interval: u32,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO domains (name, target_url, ssl_enabled, health_check_enabled, health_check_interval)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, target_url, ssl_enabled, health_check_enabled, health_check_interval],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List all domains
    pub fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, target_url, ssl_enabled, health_check_enabled, health_check_interval
             FROM domains ORDER BY id",
        )?;

        let domains = stmt
            .query_map([], |row| {
                Ok(DomainRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    target_url: row.get(2)?,
                    ssl_enabled: row.get(3)?,
                    health_check_enabled: row.get(4)?,
                    health_check_interval: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(domains)
    }

    /// Delete a domain (cascades to backends, rules, limits and metrics)
    pub fn delete_domain(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM domains WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Resolve a domain id by its administrative target URL
    pub fn domain_id_for_target(&self, target_url: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id FROM domains WHERE target_url = ?1",
            params![target_url],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to resolve domain by target")
    }

    /// Resolve a domain id by its administrative name
    pub fn domain_id_for_name(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id FROM domains WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to resolve domain by name")
    }

    // ==================== Backend Operations ====================

    /// Add a backend server to a domain, returning its id
    pub fn add_backend(
        &self,
        domain_id: i64,
        scheme: &str,
        ip: &str,
        port: u16,
        weight: u32,
        is_active: bool,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO backend_servers (domain_id, scheme, ip, port, weight, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![domain_id, scheme, ip, port, weight, is_active],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Load the backends of a domain
    pub fn backends_for_domain(&self, domain_id: i64) -> Result<Vec<BackendRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, scheme, ip, port, weight, is_active, health_status, last_health_check
             FROM backend_servers WHERE domain_id = ?1 ORDER BY id",
        )?;

        let backends = stmt
            .query_map(params![domain_id], |row| {
                Ok(BackendRecord {
                    id: row.get(0)?,
                    domain_id: row.get(1)?,
                    scheme: row.get(2)?,
                    ip: row.get(3)?,
                    port: row.get(4)?,
                    weight: row.get(5)?,
                    is_active: row.get(6)?,
                    health_status: row.get(7)?,
                    last_health_check: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(backends)
    }

    /// Set a backend's active flag
    pub fn set_backend_active(&self, id: i64, is_active: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backend_servers SET is_active = ?1 WHERE id = ?2",
            params![is_active, id],
        )?;
        Ok(())
    }

    /// Record a probe result for a backend
    pub fn update_backend_health(&self, id: i64, status: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backend_servers
             SET health_status = ?1, last_health_check = datetime('now')
             WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    /// All (domain, backend) pairs the health checker should probe:
    /// health checking enabled on the domain and the backend active.
    pub fn health_check_targets(&self) -> Result<Vec<HealthTarget>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.name, d.health_check_interval, b.id, b.scheme, b.ip, b.port
             FROM domains d
             JOIN backend_servers b ON b.domain_id = d.id
             WHERE d.health_check_enabled = 1 AND b.is_active = 1
             ORDER BY d.id, b.id",
        )?;

        let targets = stmt
            .query_map([], |row| {
                Ok(HealthTarget {
                    domain_id: row.get(0)?,
                    domain_name: row.get(1)?,
                    interval_secs: row.get(2)?,
                    backend_id: row.get(3)?,
                    scheme: row.get(4)?,
                    ip: row.get(5)?,
                    port: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(targets)
    }

    // ==================== IP Rule Operations ====================

    /// Add an IP rule to a domain, returning its id
    pub fn add_ip_rule(
        &self,
        domain_id: i64,
        ip_range: &str,
        rule_type: &str,
        description: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ip_rules (domain_id, ip_range, rule_type, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![domain_id, ip_range, rule_type, description],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Load the IP rules of a domain, oldest first
    pub fn ip_rules_for_domain(&self, domain_id: i64) -> Result<Vec<IpRuleRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, ip_range, rule_type, description
             FROM ip_rules WHERE domain_id = ?1 ORDER BY id",
        )?;

        let rules = stmt
            .query_map(params![domain_id], |row| {
                Ok(IpRuleRecord {
                    id: row.get(0)?,
                    domain_id: row.get(1)?,
                    ip_range: row.get(2)?,
                    rule_type: row.get(3)?,
                    description: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rules)
    }

    // ==================== Rate Limit Operations ====================

    /// Add a rate limit rule to a domain, returning its id
    pub fn add_rate_limit(
        &self,
        domain_id: i64,
        requests_per_second: u32,
        burst_size: u32,
        per_ip: bool,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rate_limits (domain_id, requests_per_second, burst_size, per_ip)
             VALUES (?1, ?2, ?3, ?4)",
            params![domain_id, requests_per_second, burst_size, per_ip],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The effective rate limit of a domain: most recently created wins
    pub fn rate_limit_for_domain(&self, domain_id: i64) -> Result<Option<RateLimitRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, domain_id, requests_per_second, burst_size, per_ip
             FROM rate_limits WHERE domain_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![domain_id],
            |row| {
                Ok(RateLimitRecord {
                    id: row.get(0)?,
                    domain_id: row.get(1)?,
                    requests_per_second: row.get(2)?,
                    burst_size: row.get(3)?,
                    per_ip: row.get(4)?,
                })
            },
        )
        .optional()
        .context("Failed to get rate limit")
    }

    // ==================== Metrics Operations ====================

    /// Append one HTTP metrics window for a domain
    pub fn insert_request_metrics(
        &self,
        domain_id: i64,
        request_count: u64,
        error_count: u64,
        avg_latency_ms: f64,
        p95_latency_ms: f64,
        p99_latency_ms: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO request_metrics
             (domain_id, request_count, error_count, avg_latency_ms, p95_latency_ms, p99_latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                domain_id,
                request_count as i64,
                error_count as i64,
                avg_latency_ms,
                p95_latency_ms,
                p99_latency_ms
            ],
        )?;
        Ok(())
    }

    /// Append one TCP metrics window for a domain
    pub fn insert_tcp_metrics(
        &self,
        domain_id: i64,
        connection_count: u64,
        avg_duration_ms: f64,
        p95_duration_ms: f64,
        p99_duration_ms: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tcp_metrics
             (domain_id, connection_count, avg_duration_ms, p95_duration_ms, p99_duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                domain_id,
                connection_count as i64,
                avg_duration_ms,
                p95_duration_ms,
                p99_duration_ms
            ],
        )?;
        Ok(())
    }

    /// Count stored HTTP metric windows for a domain
    pub fn request_metrics_count(&self, domain_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM request_metrics WHERE domain_id = ?1",
            params![domain_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Load stored HTTP metric windows for a domain, newest first
    pub fn request_metrics_for_domain(&self, domain_id: i64) -> Result<Vec<RequestMetricsRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, timestamp, request_count, error_count,
                    avg_latency_ms, p95_latency_ms, p99_latency_ms
             FROM request_metrics WHERE domain_id = ?1 ORDER BY id DESC",
        )?;

        let records = stmt
            .query_map(params![domain_id], |row| {
                Ok(RequestMetricsRecord {
                    id: row.get(0)?,
                    domain_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    request_count: row.get(3)?,
                    error_count: row.get(4)?,
                    avg_latency_ms: row.get(5)?,
                    p95_latency_ms: row.get(6)?,
                    p99_latency_ms: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Load stored TCP metric windows for a domain, newest first
    pub fn tcp_metrics_for_domain(&self, domain_id: i64) -> Result<Vec<TcpMetricsRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, timestamp, connection_count,
                    avg_duration_ms, p95_duration_ms, p99_duration_ms
             FROM tcp_metrics WHERE domain_id = ?1 ORDER BY id DESC",
        )?;

        let records = stmt
            .query_map(params![domain_id], |row| {
                Ok(TcpMetricsRecord {
                    id: row.get(0)?,
                    domain_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    connection_count: row.get(3)?,
                    avg_duration_ms: row.get(4)?,
                    p95_duration_ms: row.get(5)?,
                    p99_duration_ms: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

// ==================== Record Types ====================

/// Domain row as the loader projects it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: i64,
    pub name: String,
    pub target_url: String,
    pub ssl_enabled: bool,
    pub health_check_enabled: bool,
    pub health_check_interval: u32,
}

/// Backend server row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    pub id: i64,
    pub domain_id: i64,
    pub scheme: String,
    pub ip: String,
    pub port: u16,
    pub weight: u32,
    pub is_active: bool,
    pub health_status: Option<String>,
    pub last_health_check: Option<String>,
}

/// IP rule row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRuleRecord {
    pub id: i64,
    pub domain_id: i64,
    pub ip_range: String,
    pub rule_type: String,
    pub description: String,
}

/// Rate limit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub id: i64,
    pub domain_id: i64,
    pub requests_per_second: u32,
    pub burst_size: u32,
    pub per_ip: bool,
}

/// One probe target for the health checker
#[derive(Debug, Clone)]
pub struct HealthTarget {
    pub domain_id: i64,
    pub domain_name: String,
    pub interval_secs: u32,
    pub backend_id: i64,
    pub scheme: String,
    pub ip: String,
    pub port: u16,
}

/// Stored HTTP metrics window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetricsRecord {
    pub id: i64,
    pub domain_id: i64,
    pub timestamp: String,
    pub request_count: i64,
    pub error_count: i64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
}

/// Stored TCP metrics window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpMetricsRecord {
    pub id: i64,
    pub domain_id: i64,
    pub timestamp: String,
    pub connection_count: i64,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_list_domains() {
        let db = Database::open_in_memory().unwrap();

        let id = db
            .create_domain("api", "api.example.com", true, true, 30)
            .unwrap();

        let domains = db.list_domains().unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].id, id);
        assert_eq!(domains[0].name, "api");
        assert_eq!(domains[0].target_url, "api.example.com");
        assert!(domains[0].ssl_enabled);
        assert!(domains[0].health_check_enabled);
        assert_eq!(domains[0].health_check_interval, 30);
    }

    #[test]
    fn test_backend_operations() {
        let db = Database::open_in_memory().unwrap();
        let domain_id = db
            .create_domain("web", "web.example.com", false, false, 30)
            .unwrap();

        let b1 = db
            .add_backend(domain_id, "http", "10.0.0.1", 8080, 2, true)
            .unwrap();
        db.add_backend(domain_id, "http", "10.0.0.2", 8080, 1, true)
            .unwrap();

        let backends = db.backends_for_domain(domain_id).unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].ip, "10.0.0.1");
        assert_eq!(backends[0].weight, 2);
        assert!(backends[0].health_status.is_none());

        db.update_backend_health(b1, "unhealthy").unwrap();
        let backends = db.backends_for_domain(domain_id).unwrap();
        assert_eq!(backends[0].health_status.as_deref(), Some("unhealthy"));
        assert!(backends[0].last_health_check.is_some());

        db.set_backend_active(b1, false).unwrap();
        let backends = db.backends_for_domain(domain_id).unwrap();
        assert!(!backends[0].is_active);
    }

    #[test]
    fn test_rate_limit_most_recent_wins() {
        let db = Database::open_in_memory().unwrap();
        let domain_id = db
            .create_domain("api", "api.example.com", false, false, 30)
            .unwrap();

        db.add_rate_limit(domain_id, 10, 20, false).unwrap();
        db.add_rate_limit(domain_id, 5, 8, true).unwrap();

        let limit = db.rate_limit_for_domain(domain_id).unwrap().unwrap();
        assert_eq!(limit.requests_per_second, 5);
        assert_eq!(limit.burst_size, 8);
        assert!(limit.per_ip);
    }

    #[test]
    fn test_rate_limit_absent() {
        let db = Database::open_in_memory().unwrap();
        let domain_id = db
            .create_domain("api", "api.example.com", false, false, 30)
            .unwrap();

        assert!(db.rate_limit_for_domain(domain_id).unwrap().is_none());
    }

    #[test]
    fn test_ip_rules_ordered() {
        let db = Database::open_in_memory().unwrap();
        let domain_id = db
            .create_domain("api", "api.example.com", false, false, 30)
            .unwrap();

        db.add_ip_rule(domain_id, "10.0.0.0/8", "whitelist", "internal")
            .unwrap();
        db.add_ip_rule(domain_id, "0.0.0.0/0", "blacklist", "everyone else")
            .unwrap();

        let rules = db.ip_rules_for_domain(domain_id).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].rule_type, "whitelist");
        assert_eq!(rules[1].rule_type, "blacklist");
    }

    #[test]
    fn test_health_check_targets() {
        let db = Database::open_in_memory().unwrap();

        let checked = db
            .create_domain("api", "api.example.com", false, true, 30)
            .unwrap();
        let unchecked = db
            .create_domain("web", "web.example.com", false, false, 30)
            .unwrap();

        db.add_backend(checked, "http", "10.0.0.1", 8080, 1, true)
            .unwrap();
        db.add_backend(checked, "tcp", "10.0.0.2", 25565, 1, false)
            .unwrap();
        db.add_backend(unchecked, "http", "10.0.0.3", 8080, 1, true)
            .unwrap();

        let targets = db.health_check_targets().unwrap();
        // Only the active backend of the health-checked domain
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].domain_name, "api");
        assert_eq!(targets[0].ip, "10.0.0.1");
    }

    #[test]
    fn test_delete_domain_cascades() {
        let db = Database::open_in_memory().unwrap();
        let domain_id = db
            .create_domain("api", "api.example.com", false, false, 30)
            .unwrap();
        db.add_backend(domain_id, "http", "10.0.0.1", 8080, 1, true)
            .unwrap();
        db.add_ip_rule(domain_id, "10.0.0.0/8", "whitelist", "")
            .unwrap();
        db.add_rate_limit(domain_id, 10, 10, false).unwrap();

        assert!(db.delete_domain(domain_id).unwrap());
        assert!(db.list_domains().unwrap().is_empty());
        assert!(db.backends_for_domain(domain_id).unwrap().is_empty());
        assert!(db.ip_rules_for_domain(domain_id).unwrap().is_empty());
        assert!(db.rate_limit_for_domain(domain_id).unwrap().is_none());
    }

    #[test]
    fn test_metrics_insert_and_read() {
        let db = Database::open_in_memory().unwrap();
        let domain_id = db
            .create_domain("api", "api.example.com", false, false, 30)
            .unwrap();

        db.insert_request_metrics(domain_id, 100, 3, 12.5, 40.0, 95.0)
            .unwrap();
        db.insert_tcp_metrics(domain_id, 7, 5000.0, 9000.0, 9900.0)
            .unwrap();

        let http = db.request_metrics_for_domain(domain_id).unwrap();
        assert_eq!(http.len(), 1);
        assert_eq!(http[0].request_count, 100);
        assert_eq!(http[0].error_count, 3);
        assert!((http[0].avg_latency_ms - 12.5).abs() < f64::EPSILON);

        let tcp = db.tcp_metrics_for_domain(domain_id).unwrap();
        assert_eq!(tcp.len(), 1);
        assert_eq!(tcp[0].connection_count, 7);
    }

    #[test]
    fn test_domain_resolution() {
        let db = Database::open_in_memory().unwrap();
        let by_target = db
            .create_domain("api", "api.example.com", false, false, 30)
            .unwrap();
        let by_name = db
            .create_domain("mc", "tcp://mc.example.com", false, false, 30)
            .unwrap();

        assert_eq!(
            db.domain_id_for_target("api.example.com").unwrap(),
            Some(by_target)
        );
        assert_eq!(db.domain_id_for_target("mc").unwrap(), None);
        assert_eq!(db.domain_id_for_name("mc").unwrap(), Some(by_name));
        assert_eq!(db.domain_id_for_name("missing").unwrap(), None);
    }
}
