use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Control-plane database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// ACME/Let's Encrypt configuration
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Raw TCP protocol listeners: protocol name -> port (e.g. minecraft = 25565)
    #[serde(default)]
    pub tcp_protocols: HashMap<String, u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 443, set to 0 to disable)
    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the control-plane SQLite database
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl DatabaseConfig {
    /// Effective database path; the DATABASE_URL environment variable wins
    /// over the config file. A `sqlite://` prefix is accepted and stripped.
    pub fn resolved_path(&self) -> String {
        match std::env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => url
                .strip_prefix("sqlite://")
                .unwrap_or(&url)
                .to_string(),
            _ => self.path.clone(),
        }
    }
}

/// Challenge type for ACME domain validation
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcmeChallengeType {
    /// HTTP-01: Serves challenge response on port 80 at /.well-known/acme-challenge/
    #[default]
    #[serde(alias = "http01", alias = "HTTP-01")]
    #[serde(rename = "http-01")]
    Http01,
    /// TLS-ALPN-01: Serves challenge via TLS on port 443 with special ALPN protocol
    #[serde(alias = "tls-alpn01", alias = "TLS-ALPN-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

/// ACME (Let's Encrypt) configuration for automatic certificate provisioning
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Enable ACME certificate provisioning (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Contact email for the ACME account (required when enabled)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Data directory for the account key, certificates and challenge material
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Challenge type for domain validation (default: http-01)
    #[serde(default)]
    pub challenge_type: AcmeChallengeType,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            email: None,
            directory_url: None,
            data_dir: default_data_dir(),
            challenge_type: AcmeChallengeType::default(),
        }
    }
}

impl AcmeConfig {
    /// Effective operator email; the ACME_EMAIL environment variable wins
    /// over the config file.
    pub fn resolved_email(&self) -> Option<String> {
        match std::env::var("ACME_EMAIL") {
            Ok(email) if !email.is_empty() => Some(email),
            _ => self.email.clone(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_database_path() -> String {
    "routegate.db".to_string()
}

fn default_data_dir() -> String {
    "/root/.local/share/certmagic".to_string()
}

fn default_true() -> bool {
    true
}
