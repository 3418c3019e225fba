//! Configuration loader
//!
//! Pulls domains, backends, IP rules and rate limits from the control-plane
//! store on a fixed cadence and publishes a fresh snapshot into the config
//! store. A failure loading one domain skips that domain and keeps its
//! previous configuration; a store-wide query failure aborts the whole cycle
//! without touching the snapshot.

use crate::acme::CertificateManager;
use crate::db::{Database, DomainRecord};
use crate::domain::{
    Backend, BackendScheme, DomainConfig, HealthState, IpRule, IpRuleKind, RateLimitPolicy,
};
use crate::store::ConfigStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reload cadence
const RELOAD_INTERVAL: Duration = Duration::from_secs(30);

pub struct Loader {
    db: Database,
    store: Arc<ConfigStore>,
    certs: Option<Arc<CertificateManager>>,
}

impl Loader {
    pub fn new(db: Database, store: Arc<ConfigStore>, certs: Option<Arc<CertificateManager>>) -> Self {
        Self { db, store, certs }
    }

    /// Run the reload loop until shutdown
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = RELOAD_INTERVAL.as_secs(),
            "Configuration loader started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(RELOAD_INTERVAL) => {
                    if let Err(e) = self.reload() {
                        warn!(error = %e, "Domain reload failed, keeping previous snapshot");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Configuration loader shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Load all domains and publish a new snapshot
    pub fn reload(&self) -> Result<()> {
        let rows = self.db.list_domains()?;

        let mut snapshot = Vec::with_capacity(rows.len());
        for row in rows {
            match self.build_config(&row) {
                Ok(config) => snapshot.push(Arc::new(config)),
                Err(e) => {
                    warn!(domain = row.name, error = %e, "Skipping domain this cycle");
                }
            }
        }

        // Carry the round-robin cursor over so a reload does not reshuffle
        // in-flight distribution
        for config in &snapshot {
            if let Some(previous) = self.store.get(&config.routing_key) {
                config.restore_cursor(previous.cursor_position());
            }
        }

        let tcp_domains = snapshot.iter().filter(|c| c.has_tcp_backends()).count();
        if tcp_domains > 1 {
            warn!(
                count = tcp_domains,
                "Multiple TCP-routed domains configured; raw TCP listeners pick the first match"
            );
        }

        let ssl_domains: Vec<String> = snapshot
            .iter()
            .filter(|c| c.ssl_enabled)
            .map(|c| c.routing_key.clone())
            .collect();

        debug!(
            domains = snapshot.len(),
            ssl = ssl_domains.len(),
            "Publishing configuration snapshot"
        );
        self.store.publish(snapshot);

        if let Some(certs) = &self.certs {
            certs.ensure_managed(&ssl_domains);
        }

        Ok(())
    }

    /// Assemble the runtime configuration for one domain row
    fn build_config(&self, row: &DomainRecord) -> Result<DomainConfig> {
        let routing_key = routing_key(&row.name, &row.target_url);

        let mut backends = Vec::new();
        for record in self.db.backends_for_domain(row.id)? {
            let scheme = match BackendScheme::parse(&record.scheme) {
                Some(scheme) => scheme,
                None => {
                    warn!(
                        domain = row.name,
                        backend = record.id,
                        scheme = record.scheme,
                        "Ignoring backend with unknown scheme"
                    );
                    continue;
                }
            };
            let ip = match record.ip.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!(
                        domain = row.name,
                        backend = record.id,
                        ip = record.ip,
                        "Ignoring backend with invalid IP address"
                    );
                    continue;
                }
            };
            backends.push(Backend {
                id: record.id,
                scheme,
                ip,
                port: record.port,
                weight: record.weight.max(1),
                active: record.is_active,
                health: HealthState::parse(record.health_status.as_deref()),
            });
        }

        let mut ip_rules = Vec::new();
        for record in self.db.ip_rules_for_domain(row.id)? {
            let kind = match IpRuleKind::parse(&record.rule_type) {
                Some(kind) => kind,
                None => {
                    warn!(
                        domain = row.name,
                        rule = record.id,
                        rule_type = record.rule_type,
                        "Ignoring rule with unknown type"
                    );
                    continue;
                }
            };
            let cidr = match record.ip_range.parse() {
                Ok(cidr) => cidr,
                Err(_) => {
                    warn!(
                        domain = row.name,
                        rule = record.id,
                        range = record.ip_range,
                        "Ignoring rule with invalid CIDR"
                    );
                    continue;
                }
            };
            ip_rules.push(IpRule {
                cidr,
                kind,
                description: record.description,
            });
        }

        let rate_limit = self
            .db
            .rate_limit_for_domain(row.id)?
            .map(|record| RateLimitPolicy {
                requests_per_second: record.requests_per_second.max(1),
                burst_size: record.burst_size.max(1),
                per_client: record.per_ip,
            });

        Ok(DomainConfig::new(
            routing_key,
            row.name.clone(),
            row.ssl_enabled,
            row.health_check_enabled,
            row.health_check_interval,
            backends,
            ip_rules,
            rate_limit,
        ))
    }
}

/// The host value a domain is looked up by. TCP targets have no HTTP host
/// to match, so the administrative name is authoritative; HTTP/S targets
/// match the Host header, so the bare host of the target URL is used.
pub fn routing_key(name: &str, target_url: &str) -> String {
    if target_url.starts_with("tcp://") {
        return name.to_string();
    }

    let host = target_url
        .strip_prefix("https://")
        .or_else(|| target_url.strip_prefix("http://"))
        .unwrap_or(target_url);
    let host = host.split('/').next().unwrap_or(host);
    host.split(':').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SchemeFilter;

    #[test]
    fn test_routing_key_tcp_uses_name() {
        assert_eq!(routing_key("mc", "tcp://mc.example.com:25565"), "mc");
    }

    #[test]
    fn test_routing_key_strips_scheme_and_port() {
        assert_eq!(
            routing_key("api", "https://api.example.com:8443/health"),
            "api.example.com"
        );
        assert_eq!(routing_key("web", "http://web.example.com"), "web.example.com");
        assert_eq!(routing_key("bare", "bare.example.com"), "bare.example.com");
        assert_eq!(routing_key("bare", "bare.example.com:8080"), "bare.example.com");
    }

    fn seeded_db() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .create_domain("api", "https://api.example.com", false, true, 30)
            .unwrap();
        db.add_backend(id, "http", "10.0.0.1", 8080, 2, true).unwrap();
        db.add_backend(id, "http", "10.0.0.2", 8080, 1, true).unwrap();
        db.add_ip_rule(id, "203.0.113.0/24", "blacklist", "abuse")
            .unwrap();
        db.add_rate_limit(id, 10, 20, true).unwrap();
        (db, id)
    }

    #[test]
    fn test_reload_publishes_snapshot() {
        let (db, _) = seeded_db();
        let store = Arc::new(ConfigStore::new());
        let loader = Loader::new(db, Arc::clone(&store), None);

        loader.reload().unwrap();

        let config = store.get("api.example.com").unwrap();
        assert_eq!(config.display_name, "api");
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].weight, 2);
        assert_eq!(config.ip_rules.len(), 1);
        let limit = config.rate_limit.unwrap();
        assert_eq!(limit.requests_per_second, 10);
        assert!(limit.per_client);
    }

    #[test]
    fn test_reload_removes_deleted_domains() {
        let (db, id) = seeded_db();
        let store = Arc::new(ConfigStore::new());
        let loader = Loader::new(db.clone(), Arc::clone(&store), None);

        loader.reload().unwrap();
        assert!(store.get("api.example.com").is_some());

        db.delete_domain(id).unwrap();
        loader.reload().unwrap();
        assert!(store.get("api.example.com").is_none());
    }

    #[test]
    fn test_reload_preserves_cursor() {
        let (db, _) = seeded_db();
        let store = Arc::new(ConfigStore::new());
        let loader = Loader::new(db, Arc::clone(&store), None);

        loader.reload().unwrap();
        let config = store.get("api.example.com").unwrap();
        config.select_backend(SchemeFilter::Any).unwrap();
        let position = config.cursor_position();

        loader.reload().unwrap();
        let reloaded = store.get("api.example.com").unwrap();
        assert_eq!(reloaded.cursor_position(), position);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let (db, _) = seeded_db();
        let store = Arc::new(ConfigStore::new());
        let loader = Loader::new(db, Arc::clone(&store), None);

        loader.reload().unwrap();
        let first = store.get("api.example.com").unwrap();
        loader.reload().unwrap();
        let second = store.get("api.example.com").unwrap();

        assert_eq!(first.routing_key, second.routing_key);
        assert_eq!(first.backends.len(), second.backends.len());
        assert_eq!(first.cursor_position(), second.cursor_position());
    }

    #[test]
    fn test_invalid_rows_skipped_not_fatal() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .create_domain("api", "api.example.com", false, false, 30)
            .unwrap();
        db.add_backend(id, "ftp", "10.0.0.1", 21, 1, true).unwrap();
        db.add_backend(id, "http", "not-an-ip", 8080, 1, true).unwrap();
        db.add_backend(id, "http", "10.0.0.2", 8080, 1, true).unwrap();
        db.add_ip_rule(id, "not-a-cidr", "blacklist", "").unwrap();
        db.add_ip_rule(id, "10.0.0.0/8", "bogus", "").unwrap();

        let store = Arc::new(ConfigStore::new());
        let loader = Loader::new(db, Arc::clone(&store), None);
        loader.reload().unwrap();

        let config = store.get("api.example.com").unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].id, 3);
        assert!(config.ip_rules.is_empty());
    }

    #[test]
    fn test_weight_clamped_to_one() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .create_domain("api", "api.example.com", false, false, 30)
            .unwrap();
        db.add_backend(id, "http", "10.0.0.1", 8080, 0, true).unwrap();

        let store = Arc::new(ConfigStore::new());
        let loader = Loader::new(db, Arc::clone(&store), None);
        loader.reload().unwrap();

        let config = store.get("api.example.com").unwrap();
        assert_eq!(config.backends[0].weight, 1);
        assert!(config.select_backend(SchemeFilter::Any).is_some());
    }

    #[test]
    fn test_health_status_reflected() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .create_domain("api", "api.example.com", false, true, 30)
            .unwrap();
        let backend_id = db.add_backend(id, "http", "10.0.0.1", 8080, 1, true).unwrap();
        db.update_backend_health(backend_id, "unhealthy").unwrap();

        let store = Arc::new(ConfigStore::new());
        let loader = Loader::new(db, Arc::clone(&store), None);
        loader.reload().unwrap();

        let config = store.get("api.example.com").unwrap();
        assert_eq!(config.backends[0].health, HealthState::Unhealthy);
        assert!(config.select_backend(SchemeFilter::Any).is_none());
    }
}
