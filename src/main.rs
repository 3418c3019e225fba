use routegate::acme::CertificateManager;
use routegate::config::{AcmeChallengeType, Config};
use routegate::db::Database;
use routegate::healthcheck::HealthChecker;
use routegate::limiter::RateLimiterRegistry;
use routegate::loader::Loader;
use routegate::metrics::MetricsAggregator;
use routegate::proxy::{PipelineState, ProxyServer};
use routegate::store::ConfigStore;
use routegate::tcp::TcpGateway;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// How long shutdown waits for in-flight work to drain
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Process-wide TLS crypto provider, installed before any rustls config
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!(path = %config_path.display(), "No config file found, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    // Open the control-plane store
    let db = Database::open(config.database.resolved_path())?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(ConfigStore::new());
    let limiters = Arc::new(RateLimiterRegistry::new());
    let metrics = Arc::new(MetricsAggregator::new(db.clone()));

    // Certificate manager (requires an operator email)
    let certs: Option<Arc<CertificateManager>> = if config.acme.enabled {
        match config.acme.resolved_email() {
            Some(email) => Some(CertificateManager::new(&config.acme, email)?),
            None => {
                warn!("ACME enabled but no operator email configured; TLS termination disabled");
                None
            }
        }
    } else {
        None
    };

    let mut handles = Vec::new();

    // Initial configuration load, then the periodic reload loop
    let loader = Loader::new(db.clone(), Arc::clone(&store), certs.clone());
    if let Err(e) = loader.reload() {
        error!(error = %e, "Initial domain load failed");
    }
    {
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            loader.run(shutdown).await;
        }));
    }

    // Health checker
    let health_checker = HealthChecker::new(db.clone())?;
    {
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            health_checker.run(shutdown).await;
        }));
    }

    // Metrics flush loop
    {
        let metrics = Arc::clone(&metrics);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            metrics.run(shutdown).await;
        }));
    }

    // Certificate renewal sweep
    if let Some(certs) = certs.clone() {
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            certs.run_renewal(shutdown).await;
        }));
    }

    let state = PipelineState::new(
        Arc::clone(&store),
        Arc::clone(&limiters),
        Arc::clone(&metrics),
        certs.clone(),
        config.server.https_port,
    )?;

    // HTTP listener (ACME challenges + HTTPS redirect + plaintext serving)
    if config.server.http_port > 0 {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.http_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP bind address: {}", e))?;

        let server = ProxyServer::new(addr, Arc::clone(&state), shutdown_rx.clone());
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }));
    }

    // HTTPS listener with per-SNI certificates
    if config.server.https_port > 0 {
        if let Some(ref certs) = certs {
            let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.https_port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid HTTPS bind address: {}", e))?;

            let mut tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(certs.resolver());
            tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
            if certs.challenge_type() == AcmeChallengeType::TlsAlpn01 {
                tls_config.alpn_protocols.push(b"acme-tls/1".to_vec());
            }
            let acceptor = TlsAcceptor::from(Arc::new(tls_config));

            let server = ProxyServer::new(addr, Arc::clone(&state), shutdown_rx.clone())
                .with_tls(acceptor);
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }));
        } else {
            warn!("HTTPS port configured but no certificate manager available; listener disabled");
        }
    }

    // Raw TCP listeners, one per protocol mapping
    for (protocol, port) in &config.tcp_protocols {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid TCP bind address for {}: {}", protocol, e))?;

        let gateway = TcpGateway::new(
            protocol.clone(),
            addr,
            Arc::clone(&store),
            Arc::clone(&metrics),
            shutdown_rx.clone(),
        );
        let protocol = protocol.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = gateway.run().await {
                error!(protocol, error = %e, "TCP proxy error");
            }
        }));
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for tasks to drain
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out waiting for tasks"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting proxy server"
    );
    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        acme = config.acme.enabled,
        "Listener configuration"
    );
    info!(
        database = %config.database.resolved_path(),
        "Control-plane store"
    );
    if !config.tcp_protocols.is_empty() {
        info!(
            protocols = ?config.tcp_protocols,
            "TCP protocol listeners configured"
        );
    }
}
