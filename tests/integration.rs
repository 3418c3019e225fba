//! Integration tests for routegate
//!
//! Each test publishes a routing snapshot, starts real listeners on
//! ephemeral ports and drives them over raw sockets.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use routegate::db::Database;
use routegate::domain::{
    Backend, BackendScheme, DomainConfig, HealthState, IpRule, IpRuleKind, RateLimitPolicy,
};
use routegate::limiter::RateLimiterRegistry;
use routegate::metrics::MetricsAggregator;
use routegate::proxy::{PipelineState, ProxyServer};
use routegate::store::ConfigStore;
use routegate::tcp::TcpGateway;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Start an HTTP/1.1 backend that answers every request with `tag`
async fn spawn_http_backend(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(
                        tag.as_bytes(),
                    ))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    addr
}

/// Start a TCP echo backend; the returned receiver fires when the first
/// accepted connection closes.
async fn spawn_echo_backend() -> (SocketAddr, tokio::sync::oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buffer[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = done_tx.send(());
    });

    (addr, done_rx)
}

fn http_backend(id: i64, addr: SocketAddr) -> Backend {
    Backend {
        id,
        scheme: BackendScheme::Http,
        ip: addr.ip(),
        port: addr.port(),
        weight: 1,
        active: true,
        health: HealthState::Unknown,
    }
}

fn tcp_backend(id: i64, addr: SocketAddr) -> Backend {
    Backend {
        id,
        scheme: BackendScheme::Tcp,
        ip: addr.ip(),
        port: addr.port(),
        weight: 1,
        active: true,
        health: HealthState::Healthy,
    }
}

#[allow(clippy::too_many_arguments)]
fn domain_config(
    routing_key: &str,
    name: &str,
    ssl_enabled: bool,
    backends: Vec<Backend>,
    ip_rules: Vec<IpRule>,
    rate_limit: Option<RateLimitPolicy>,
) -> Arc<DomainConfig> {
    Arc::new(DomainConfig::new(
        routing_key.to_string(),
        name.to_string(),
        ssl_enabled,
        false,
        30,
        backends,
        ip_rules,
        rate_limit,
    ))
}

struct TestProxy {
    addr: SocketAddr,
    store: Arc<ConfigStore>,
    metrics: Arc<MetricsAggregator>,
    db: Database,
    _shutdown_tx: watch::Sender<bool>,
}

/// Start a plain-HTTP proxy listener over a fresh store and in-memory
/// control-plane database
async fn start_proxy() -> TestProxy {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(ConfigStore::new());
    let limiters = Arc::new(RateLimiterRegistry::new());
    let metrics = Arc::new(MetricsAggregator::new(db.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = PipelineState::new(
        Arc::clone(&store),
        limiters,
        Arc::clone(&metrics),
        None,
        443,
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(addr, state, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestProxy {
        addr,
        store,
        metrics,
        db,
        _shutdown_tx: shutdown_tx,
    }
}

/// Issue one HTTP/1.1 request over a raw socket, returning status, headers
/// and body
async fn http_get(proxy: SocketAddr, host: &str, path: &str) -> (u16, String, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let response = String::from_utf8_lossy(&raw).to_string();

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let (headers, body) = response
        .split_once("\r\n\r\n")
        .map(|(h, b)| (h.to_string(), b.to_string()))
        .unwrap_or((response.clone(), String::new()));

    (status, headers, body)
}

#[tokio::test]
async fn test_round_robin_across_two_backends() {
    let first = spawn_http_backend("backend-one").await;
    let second = spawn_http_backend("backend-two").await;

    let proxy = start_proxy().await;
    proxy
        .db
        .create_domain("a.example", "http://a.example", false, false, 30)
        .unwrap();
    proxy.store.publish(vec![domain_config(
        "a.example",
        "a.example",
        false,
        vec![http_backend(1, first), http_backend(2, second)],
        Vec::new(),
        None,
    )]);

    let mut first_hits = 0;
    let mut second_hits = 0;
    for _ in 0..10 {
        let (status, _, body) = http_get(proxy.addr, "a.example", "/").await;
        assert_eq!(status, 200);
        match body.as_str() {
            "backend-one" => first_hits += 1,
            "backend-two" => second_hits += 1,
            other => panic!("unexpected body: {}", other),
        }
    }
    assert_eq!(first_hits, 5);
    assert_eq!(second_hits, 5);

    // Every request produced exactly one metrics record
    proxy.metrics.flush();
    let domain_id = proxy.db.domain_id_for_name("a.example").unwrap().unwrap();
    let windows = proxy.db.request_metrics_for_domain(domain_id).unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].request_count, 10);
    assert_eq!(windows[0].error_count, 0);
}

#[tokio::test]
async fn test_https_redirect_for_ssl_domain() {
    let proxy = start_proxy().await;
    proxy.store.publish(vec![domain_config(
        "b.example",
        "b.example",
        true,
        Vec::new(),
        Vec::new(),
        None,
    )]);

    let (status, headers, _) = http_get(proxy.addr, "b.example", "/x").await;
    assert_eq!(status, 307);
    assert!(
        headers
            .lines()
            .any(|l| l.eq_ignore_ascii_case("location: https://b.example/x")),
        "missing redirect location in: {}",
        headers
    );
}

#[tokio::test]
async fn test_ip_rules_deny_and_allow() {
    let backend = spawn_http_backend("c-backend").await;

    let proxy = start_proxy().await;

    // Loopback blacklisted: the request is refused before any upstream
    // contact
    proxy.store.publish(vec![domain_config(
        "c.example",
        "c.example",
        false,
        vec![http_backend(1, backend)],
        vec![IpRule {
            cidr: "127.0.0.0/8".parse().unwrap(),
            kind: IpRuleKind::Blacklist,
            description: "test deny".to_string(),
        }],
        None,
    )]);

    let (status, _, _) = http_get(proxy.addr, "c.example", "/").await;
    assert_eq!(status, 403);

    // A rule set that does not match the client falls through to allow
    proxy.store.publish(vec![domain_config(
        "c.example",
        "c.example",
        false,
        vec![http_backend(1, backend)],
        vec![IpRule {
            cidr: "203.0.113.0/24".parse().unwrap(),
            kind: IpRuleKind::Blacklist,
            description: "unrelated range".to_string(),
        }],
        None,
    )]);

    let (status, _, body) = http_get(proxy.addr, "c.example", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "c-backend");
}

#[tokio::test]
async fn test_rate_limit_burst_and_recovery() {
    let backend = spawn_http_backend("d-backend").await;

    let proxy = start_proxy().await;
    proxy.store.publish(vec![domain_config(
        "d.example",
        "d.example",
        false,
        vec![http_backend(1, backend)],
        Vec::new(),
        Some(RateLimitPolicy {
            requests_per_second: 2,
            burst_size: 2,
            per_client: true,
        }),
    )]);

    let mut admitted = 0;
    let mut limited = 0;
    for _ in 0..5 {
        let (status, _, _) = http_get(proxy.addr, "d.example", "/").await;
        match status {
            200 => admitted += 1,
            429 => limited += 1,
            other => panic!("unexpected status: {}", other),
        }
    }
    assert_eq!(admitted, 2);
    assert_eq!(limited, 3);

    // A second of refill admits one more
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let (status, _, _) = http_get(proxy.addr, "d.example", "/").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_unknown_host_and_domain_removal() {
    let backend = spawn_http_backend("e-backend").await;

    let proxy = start_proxy().await;
    let (status, _, _) = http_get(proxy.addr, "e.example", "/").await;
    assert_eq!(status, 404);

    proxy.store.publish(vec![domain_config(
        "e.example",
        "e.example",
        false,
        vec![http_backend(1, backend)],
        Vec::new(),
        None,
    )]);
    let (status, _, _) = http_get(proxy.addr, "e.example", "/").await;
    assert_eq!(status, 200);

    // The next snapshot no longer lists the domain
    proxy.store.publish(Vec::new());
    let (status, _, _) = http_get(proxy.addr, "e.example", "/").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_no_healthy_backend_yields_503() {
    let backend = spawn_http_backend("f-backend").await;

    let proxy = start_proxy().await;
    let mut unhealthy = http_backend(1, backend);
    unhealthy.health = HealthState::Unhealthy;
    proxy.store.publish(vec![domain_config(
        "f.example",
        "f.example",
        false,
        vec![unhealthy],
        Vec::new(),
        None,
    )]);

    let (status, _, _) = http_get(proxy.addr, "f.example", "/").await;
    assert_eq!(status, 503);

    // The backend flips back to healthy on the next snapshot
    proxy.store.publish(vec![domain_config(
        "f.example",
        "f.example",
        false,
        vec![http_backend(1, backend)],
        Vec::new(),
        None,
    )]);

    let (status, _, body) = http_get(proxy.addr, "f.example", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "f-backend");
}

#[tokio::test]
async fn test_upstream_failure_yields_502() {
    // Reserve a port, then close it so the dial is refused
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = closed.local_addr().unwrap();
    drop(closed);

    let proxy = start_proxy().await;
    proxy
        .db
        .create_domain("g.example", "g.example", false, false, 30)
        .unwrap();
    proxy.store.publish(vec![domain_config(
        "g.example",
        "g.example",
        false,
        vec![http_backend(1, dead_addr)],
        Vec::new(),
        None,
    )]);

    let (status, _, _) = http_get(proxy.addr, "g.example", "/").await;
    assert_eq!(status, 502);

    // The failure landed as an error record
    proxy.metrics.flush();
    let domain_id = proxy.db.domain_id_for_target("g.example").unwrap().unwrap();
    let windows = proxy.db.request_metrics_for_domain(domain_id).unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].error_count, 1);
}

#[tokio::test]
async fn test_acme_challenge_path_never_routes() {
    let backend = spawn_http_backend("h-backend").await;

    let proxy = start_proxy().await;
    proxy.store.publish(vec![domain_config(
        "h.example",
        "h.example",
        false,
        vec![http_backend(1, backend)],
        Vec::new(),
        None,
    )]);

    // Without a pending challenge the prefix answers 404 instead of
    // reaching the backend
    let (status, _, body) =
        http_get(proxy.addr, "h.example", "/.well-known/acme-challenge/token").await;
    assert_eq!(status, 404);
    assert_ne!(body, "h-backend");
}

#[tokio::test]
async fn test_tcp_session_round_trip() {
    let (echo_addr, echo_done) = spawn_echo_backend().await;

    let db = Database::open_in_memory().unwrap();
    db.create_domain("mc.example", "tcp://mc.example", false, false, 30)
        .unwrap();
    let store = Arc::new(ConfigStore::new());
    let metrics = Arc::new(MetricsAggregator::new(db.clone()));
    store.publish(vec![domain_config(
        "mc.example",
        "mc.example",
        false,
        vec![tcp_backend(1, echo_addr)],
        Vec::new(),
        None,
    )]);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    let gateway = TcpGateway::new(
        "minecraft".to_string(),
        gateway_addr,
        Arc::clone(&store),
        Arc::clone(&metrics),
        shutdown_rx,
    );
    tokio::spawn(async move {
        let _ = gateway.serve(listener).await;
    });

    let mut client = TcpStream::connect(gateway_addr).await.unwrap();
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 241) as u8).collect();

    let mut echoed = vec![0u8; payload.len()];
    {
        let (mut read_half, mut write_half) = client.split();
        let writer = async {
            write_half.write_all(&payload).await.unwrap();
        };
        let reader = async {
            read_half.read_exact(&mut echoed).await.unwrap();
        };
        tokio::join!(writer, reader);
    }
    assert_eq!(echoed, payload);

    // Closing the client tears the whole session down within a second
    drop(client);
    tokio::time::timeout(Duration::from_secs(1), echo_done)
        .await
        .expect("backend connection should close promptly")
        .unwrap();

    // The finished session lands in tcp_metrics on the next flush
    let domain_id = db.domain_id_for_name("mc.example").unwrap().unwrap();
    let mut recorded = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        metrics.flush();
        if db.tcp_metrics_for_domain(domain_id).unwrap().len() == 1 {
            recorded = true;
            break;
        }
    }
    assert!(recorded, "tcp session metrics were not flushed");

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_tcp_connection_closed_without_tcp_domain() {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(ConfigStore::new());
    let metrics = Arc::new(MetricsAggregator::new(db));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    let gateway = TcpGateway::new(
        "minecraft".to_string(),
        gateway_addr,
        store,
        metrics,
        shutdown_rx,
    );
    tokio::spawn(async move {
        let _ = gateway.serve(listener).await;
    });

    let mut client = TcpStream::connect(gateway_addr).await.unwrap();
    let mut buffer = [0u8; 16];
    // No routable domain: the proxy closes the connection
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buffer))
        .await
        .expect("connection should be closed promptly")
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_host_header_with_port_is_stripped() {
    let backend = spawn_http_backend("i-backend").await;

    let proxy = start_proxy().await;
    proxy.store.publish(vec![domain_config(
        "i.example",
        "i.example",
        false,
        vec![http_backend(1, backend)],
        Vec::new(),
        None,
    )]);

    let (status, _, body) = http_get(proxy.addr, "i.example:8080", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "i-backend");
}

#[tokio::test]
async fn test_missing_host_header_rejected() {
    let proxy = start_proxy().await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let response = String::from_utf8_lossy(&raw);

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    assert_eq!(status, 400);
}
