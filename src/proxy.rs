use crate::acme::{CertificateManager, CHALLENGE_PREFIX};
use crate::domain::SchemeFilter;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::limiter::RateLimiterRegistry;
use crate::metrics::MetricsAggregator;
use crate::store::ConfigStore;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header carrying the original client address upstream
const X_REAL_IP: &str = "x-real-ip";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Upstream transport tuning
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_KEEPALIVE: Duration = Duration::from_secs(30);
const UPSTREAM_MAX_IDLE_PER_HOST: usize = 100;
const UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Listener-side header read timeout
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Pooled upstream client dispatching to both http and https backends
pub type UpstreamClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Incoming>;

/// Build the shared upstream client used by all listeners
pub fn build_upstream_client() -> anyhow::Result<UpstreamClient> {
    // The connector needs a process-default TLS provider; installing twice
    // is a no-op
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.set_connect_timeout(Some(UPSTREAM_CONNECT_TIMEOUT));
    connector.set_keepalive(Some(UPSTREAM_KEEPALIVE));
    connector.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| anyhow::anyhow!("Failed to load native root certificates: {}", e))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(connector);

    Ok(Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(UPSTREAM_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(UPSTREAM_IDLE_TIMEOUT)
        .build(https))
}

/// Everything the request pipeline consults, shared across listeners
pub struct PipelineState {
    pub store: Arc<ConfigStore>,
    pub limiters: Arc<RateLimiterRegistry>,
    pub metrics: Arc<MetricsAggregator>,
    pub certs: Option<Arc<CertificateManager>>,
    upstream: UpstreamClient,
    /// Port HTTP->HTTPS redirects point at (omitted from the URL when 443)
    https_port: u16,
}

impl PipelineState {
    pub fn new(
        store: Arc<ConfigStore>,
        limiters: Arc<RateLimiterRegistry>,
        metrics: Arc<MetricsAggregator>,
        certs: Option<Arc<CertificateManager>>,
        https_port: u16,
    ) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            store,
            limiters,
            metrics,
            certs,
            upstream: build_upstream_client()?,
            https_port,
        }))
    }
}

/// One HTTP or HTTPS listener feeding the request pipeline
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<PipelineState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<PipelineState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Proxy listener started (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, state, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, state, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(protocol, "Proxy listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<PipelineState>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    // Use auto::Builder to support both HTTP/1.1 and HTTP/2
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<PipelineState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // ACME HTTP-01 challenges are answered before anything else; a request
    // under the challenge prefix never reaches the pipeline
    if req.uri().path().starts_with(CHALLENGE_PREFIX) {
        if let Some(ref certs) = state.certs {
            let host = extract_hostname(&req);
            let path = req.uri().path().to_string();
            if let Some(key_auth) = certs.try_serve_challenge(host.as_deref(), &path).await {
                debug!(path, "Responding to ACME HTTP-01 challenge");
                return Ok(text_response(StatusCode::OK, key_auth));
            }
        }
        return Ok(text_response(StatusCode::NOT_FOUND, "Challenge not found".to_string()));
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    let config = match state.store.get(&hostname) {
        Some(config) => config,
        None => {
            debug!(hostname, "Unknown host");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Domain not found",
            ));
        }
    };

    // SSL-enabled domains are served exclusively over TLS
    if !is_tls && config.ssl_enabled {
        return Ok(build_https_redirect(&req, &hostname, state.https_port));
    }

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let started = Instant::now();
    let client_ip = client_addr.ip();

    if !config.allows_client(client_ip) {
        state
            .metrics
            .record_http(&hostname, StatusCode::FORBIDDEN.as_u16(), started.elapsed());
        return Ok(json_error_response(ProxyErrorCode::AccessDenied, "Access denied"));
    }

    if let Some(policy) = &config.rate_limit {
        if !state.limiters.allow(&hostname, client_ip, policy) {
            state.metrics.record_http(
                &hostname,
                StatusCode::TOO_MANY_REQUESTS.as_u16(),
                started.elapsed(),
            );
            return Ok(json_error_response(
                ProxyErrorCode::RateLimitExceeded,
                "Rate limit exceeded",
            ));
        }
    }

    let backend = match config.select_backend(SchemeFilter::Any) {
        Some(backend) => backend,
        None => {
            state.metrics.record_http(
                &hostname,
                StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                started.elapsed(),
            );
            return Ok(json_error_response(
                ProxyErrorCode::NoHealthyBackend,
                "No healthy backends available",
            ));
        }
    };

    let upstream_req = match build_upstream_request(req, &hostname, &backend, client_ip, &request_id) {
        Ok(upstream_req) => upstream_req,
        Err(e) => {
            error!(hostname, error = %e, "Failed to build upstream request");
            state.metrics.record_error(&hostname);
            return Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Failed to build upstream request",
            ));
        }
    };

    match state.upstream.request(upstream_req).await {
        Ok(response) => {
            let status = response.status();
            state
                .metrics
                .record_http(&hostname, status.as_u16(), started.elapsed());
            debug!(
                hostname,
                backend = backend.id,
                status = status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                request_id,
                "Request proxied"
            );
            Ok(response.map(|body| body.boxed()))
        }
        Err(e) => {
            warn!(hostname, backend = backend.id, error = %e, request_id, "Upstream request failed");
            state.metrics.record_error(&hostname);
            Ok(json_error_response(
                ProxyErrorCode::UpstreamFailed,
                "Backend error",
            ))
        }
    }
}

/// Rewrite an inbound request for the chosen backend: swap the authority,
/// keep method/path/query/body, set Host to the client-visible host and
/// populate X-Real-IP from X-Forwarded-For or the peer address.
fn build_upstream_request(
    req: Request<Incoming>,
    hostname: &str,
    backend: &crate::domain::Backend,
    client_ip: IpAddr,
    request_id: &str,
) -> anyhow::Result<Request<Incoming>> {
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let authority = match backend.ip {
        IpAddr::V6(ip) => format!("[{}]:{}", ip, backend.port),
        IpAddr::V4(ip) => format!("{}:{}", ip, backend.port),
    };
    let uri: Uri = format!("{}://{}{}", backend.scheme.as_str(), authority, path_and_query)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid upstream URI: {}", e))?;

    let mut builder = Request::builder().method(parts.method).uri(uri);

    let real_ip = parts
        .headers
        .get(X_FORWARDED_FOR)
        .cloned()
        .or_else(|| HeaderValue::from_str(&client_ip.to_string()).ok());

    for (name, value) in parts.headers.iter() {
        if *name == hyper::header::HOST || is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder = builder.header(hyper::header::HOST, hostname);
    if let Some(value) = real_ip {
        builder = builder.header(X_REAL_IP, value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        builder = builder.header(X_REQUEST_ID, value);
    }

    builder
        .body(body)
        .map_err(|e| anyhow::anyhow!("Invalid upstream request: {}", e))
}

/// Connection-scoped headers that must not be forwarded
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().host().map(String::from))
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            // Validate length (DNS max is 253 characters)
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Validate characters: alphanumeric, hyphen, and dot only
            // This prevents log injection and other attacks
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

/// Build the HTTPS redirect response (307 Temporary Redirect)
fn build_https_redirect(
    req: &Request<Incoming>,
    hostname: &str,
    https_port: u16,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", hostname, path)
    } else {
        format!("https://{}:{}{}", hostname, https_port, path)
    };

    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn text_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
