//! Runtime routing configuration
//!
//! The in-memory shape of a routed domain: its backends, IP rules and rate
//! limit. One `DomainConfig` value is the unit of atomic publication; the
//! request pipeline only ever sees a whole value. Backend selection is
//! weighted round-robin over a precomputed ring, with the cursor as the only
//! mutable field.

use ipnet::IpNet;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};

/// Upstream protocol of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendScheme {
    Http,
    Https,
    Tcp,
}

impl BackendScheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Tcp => "tcp",
        }
    }
}

/// Probe state of a backend as last observed by the health checker.
///
/// A backend that has never been probed is `Unknown` and treated as
/// selectable, so freshly added backends receive traffic before the first
/// probe completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn parse(status: Option<&str>) -> Self {
        match status {
            Some("healthy") => Self::Healthy,
            Some("unhealthy") => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    pub fn is_selectable(self) -> bool {
        self != Self::Unhealthy
    }
}

/// An upstream origin
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: i64,
    pub scheme: BackendScheme,
    pub ip: IpAddr,
    pub port: u16,
    pub weight: u32,
    pub active: bool,
    pub health: HealthState,
}

impl Backend {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Eligible for selection: active and not known-unhealthy
    pub fn selectable(&self) -> bool {
        self.active && self.health.is_selectable()
    }
}

/// Access rule kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRuleKind {
    Whitelist,
    Blacklist,
}

impl IpRuleKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whitelist" => Some(Self::Whitelist),
            "blacklist" => Some(Self::Blacklist),
            _ => None,
        }
    }
}

/// One CIDR-based access rule
#[derive(Debug, Clone)]
pub struct IpRule {
    pub cidr: IpNet,
    pub kind: IpRuleKind,
    pub description: String,
}

/// Token-bucket parameters for a domain
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub requests_per_second: u32,
    pub burst_size: u32,
    pub per_client: bool,
}

/// Scheme constraint for backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeFilter {
    /// HTTP and HTTPS backends
    Any,
    /// Only raw TCP backends
    TcpOnly,
}

impl SchemeFilter {
    fn matches(self, scheme: BackendScheme) -> bool {
        match self {
            Self::Any => scheme != BackendScheme::Tcp,
            Self::TcpOnly => scheme == BackendScheme::Tcp,
        }
    }
}

/// The routing configuration of one domain
#[derive(Debug)]
pub struct DomainConfig {
    /// Host value this config is looked up by
    pub routing_key: String,
    /// Administrative name
    pub display_name: String,
    pub ssl_enabled: bool,
    pub health_check_enabled: bool,
    pub health_check_interval: u32,
    pub backends: Vec<Backend>,
    pub ip_rules: Vec<IpRule>,
    pub rate_limit: Option<RateLimitPolicy>,
    /// Selection ring: backend indices repeated by weight
    ring: Vec<usize>,
    /// Round-robin cursor into the ring
    cursor: Mutex<usize>,
}

impl DomainConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        routing_key: String,
        display_name: String,
        ssl_enabled: bool,
        health_check_enabled: bool,
        health_check_interval: u32,
        backends: Vec<Backend>,
        ip_rules: Vec<IpRule>,
        rate_limit: Option<RateLimitPolicy>,
    ) -> Self {
        let ring = build_ring(&backends);
        Self {
            routing_key,
            display_name,
            ssl_enabled,
            health_check_enabled,
            health_check_interval,
            backends,
            ip_rules,
            rate_limit,
            ring,
            cursor: Mutex::new(0),
        }
    }

    /// Weighted round-robin selection over active, non-unhealthy backends
    /// matching the scheme filter. Advances the cursor under the per-config
    /// lock and inspects at most one full ring revolution.
    pub fn select_backend(&self, filter: SchemeFilter) -> Option<Backend> {
        if self.ring.is_empty() {
            return None;
        }

        let mut cursor = self.cursor.lock();
        for _ in 0..self.ring.len() {
            *cursor = (*cursor + 1) % self.ring.len();
            let backend = &self.backends[self.ring[*cursor]];
            if backend.selectable() && filter.matches(backend.scheme) {
                return Some(backend.clone());
            }
        }

        None
    }

    /// Current cursor position, for carrying over across reloads
    pub fn cursor_position(&self) -> usize {
        *self.cursor.lock()
    }

    /// Seed the cursor from a previous configuration of the same domain
    pub fn restore_cursor(&self, position: usize) {
        if !self.ring.is_empty() {
            *self.cursor.lock() = position % self.ring.len();
        }
    }

    /// Evaluate the IP rules for a client address. The first rule whose
    /// range contains the address is authoritative; with no match the
    /// client is permitted.
    pub fn allows_client(&self, client: IpAddr) -> bool {
        for rule in &self.ip_rules {
            if rule.cidr.contains(&client) {
                return rule.kind == IpRuleKind::Whitelist;
            }
        }
        true
    }

    /// Whether any raw TCP backend is currently selectable
    pub fn has_selectable_tcp_backend(&self) -> bool {
        self.backends
            .iter()
            .any(|b| b.scheme == BackendScheme::Tcp && b.selectable())
    }

    /// Whether the domain has any raw TCP backend at all
    pub fn has_tcp_backends(&self) -> bool {
        self.backends.iter().any(|b| b.scheme == BackendScheme::Tcp)
    }
}

/// Expand backends into a ring where each backend occupies `weight`
/// consecutive slots. Over one revolution each backend is offered exactly
/// `weight` times.
fn build_ring(backends: &[Backend]) -> Vec<usize> {
    let mut ring = Vec::with_capacity(backends.iter().map(|b| b.weight as usize).sum());
    for (index, backend) in backends.iter().enumerate() {
        for _ in 0..backend.weight.max(1) {
            ring.push(index);
        }
    }
    ring
}
