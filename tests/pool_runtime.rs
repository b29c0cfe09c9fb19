//! End-to-end tests for the pool runtime, driven over real sockets with
//! in-process stub upstreams.

use continuity::affinity::{StickyConfig, LB_COOKIE_NAME};
use continuity::backend::{Backend, Condition, HealthStatus};
use continuity::error::{empty_body, ProxyBody};
use continuity::pool::{HealthCheckParams, Pool, PoolError};
use continuity::registry::Registry;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, COOKIE, HOST, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;

const HOSTNAME: &str = "app.example.com";

struct StubUpstream {
    addr: SocketAddr,
    status: Arc<AtomicU16>,
}

impl StubUpstream {
    fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }
}

/// Start an HTTP server that answers every request with its name as the
/// body, the configurable status, and optionally a Set-Cookie header.
async fn spawn_upstream(name: &'static str, set_cookie: Option<&'static str>) -> StubUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let status = Arc::new(AtomicU16::new(200));
    let status_for_server = Arc::clone(&status);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let status = Arc::clone(&status_for_server);
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let status = Arc::clone(&status);
                    async move {
                        let code = StatusCode::from_u16(status.load(Ordering::SeqCst)).unwrap();
                        let mut builder = Response::builder().status(code);
                        if let Some(cookie) = set_cookie {
                            builder = builder.header(SET_COOKIE, cookie);
                        }
                        Ok::<_, Infallible>(
                            builder
                                .body(Full::new(Bytes::from_static(name.as_bytes())))
                                .unwrap(),
                        )
                    }
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    StubUpstream { addr, status }
}

fn params() -> HealthCheckParams {
    HealthCheckParams {
        interval: Duration::from_secs(1),
        initial_delay: Duration::from_secs(1),
        timeout: Duration::from_secs(1),
        num_ok: 2,
        num_fail: 2,
    }
}

fn client_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
}

fn backend_for(upstream: &StubUpstream) -> Backend {
    Backend::new(&upstream.address(), "/h", None).unwrap()
}

fn request(hostname: &str) -> Request<ProxyBody> {
    Request::builder()
        .uri("/")
        .header(HOST, hostname)
        .body(empty_body())
        .unwrap()
}

async fn body_string(response: Response<ProxyBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Registry with a running health loop; the guard keeps the loop alive.
async fn registry_with_health_loop() -> (Arc<Registry>, watch::Sender<bool>) {
    let registry = Arc::new(Registry::new("127.0.0.1:0".parse().unwrap()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&registry).health_check_loop(shutdown_rx));
    (registry, shutdown_tx)
}

#[tokio::test]
async fn pending_server_is_promoted_by_probes() {
    let upstream = spawn_upstream("one", None).await;
    let (registry, _guard) = registry_with_health_loop().await;
    let pool = registry
        .add_pool(Pool::new(HOSTNAME, params(), None))
        .await
        .unwrap();
    let server = pool.add_server(backend_for(&upstream)).await;
    assert_eq!(server.status(), HealthStatus::Pending);

    // initial delay (1 s) + two passing probes at 1 s intervals
    wait_until(
        || server.status() == HealthStatus::Healthy,
        Duration::from_secs(8),
        "server to turn healthy",
    )
    .await;

    let chosen = pool.choose(&HeaderMap::new(), client_ip()).await.unwrap();
    assert_eq!(chosen.id, server.id);
}

#[tokio::test]
async fn failing_server_is_demoted_and_recovers() {
    let upstream = spawn_upstream("one", None).await;
    let (registry, _guard) = registry_with_health_loop().await;
    let pool = registry
        .add_pool(Pool::new(HOSTNAME, params(), None))
        .await
        .unwrap();
    let server = pool.add_server(backend_for(&upstream)).await;

    wait_until(
        || server.status() == HealthStatus::Healthy,
        Duration::from_secs(8),
        "server to turn healthy",
    )
    .await;

    upstream.set_status(500);
    wait_until(
        || server.status() == HealthStatus::Unhealthy,
        Duration::from_secs(8),
        "server to turn unhealthy",
    )
    .await;
    assert!(matches!(
        pool.choose(&HeaderMap::new(), client_ip()).await,
        Err(PoolError::NoHealthyServer)
    ));

    upstream.set_status(200);
    wait_until(
        || server.status() == HealthStatus::Healthy,
        Duration::from_secs(8),
        "server to recover",
    )
    .await;
    assert!(pool.choose(&HeaderMap::new(), client_ip()).await.is_ok());
}

#[tokio::test]
async fn conditional_server_takes_matching_requests() {
    let plain = spawn_upstream("plain", None).await;
    let prod = spawn_upstream("prod", None).await;

    let registry = Arc::new(Registry::new("127.0.0.1:0".parse().unwrap()));
    let pool = registry
        .add_pool(Pool::new(HOSTNAME, params(), None))
        .await
        .unwrap();
    pool.add_server(backend_for(&plain)).await.mark_healthy();
    pool.add_server(
        Backend::new(
            &prod.address(),
            "/h",
            Some(Condition {
                header: "x-env".to_string(),
                value: "prod".to_string(),
            }),
        )
        .unwrap(),
    )
    .await
    .mark_healthy();

    let mut with_header = request(HOSTNAME);
    with_header
        .headers_mut()
        .insert("x-env", HeaderValue::from_static("prod"));
    let response = registry.serve(with_header, client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "prod");

    let response = registry.serve(request(HOSTNAME), client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "plain");
}

#[tokio::test]
async fn round_robin_distributes_evenly() {
    let upstreams = [
        spawn_upstream("one", None).await,
        spawn_upstream("two", None).await,
        spawn_upstream("three", None).await,
    ];

    let registry = Arc::new(Registry::new("127.0.0.1:0".parse().unwrap()));
    let pool = registry
        .add_pool(Pool::new(HOSTNAME, params(), None))
        .await
        .unwrap();
    for upstream in &upstreams {
        pool.add_server(backend_for(upstream)).await.mark_healthy();
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..9 {
        let response = registry.serve(request(HOSTNAME), client_ip()).await;
        assert_eq!(response.status(), StatusCode::OK);
        *counts.entry(body_string(response).await).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(
        counts.values().all(|&count| count == 3),
        "unbalanced distribution: {counts:?}"
    );
}

#[tokio::test]
async fn lb_cookie_pins_follow_up_requests() {
    let upstreams = [
        spawn_upstream("one", None).await,
        spawn_upstream("two", None).await,
        spawn_upstream("three", None).await,
    ];

    let registry = Arc::new(Registry::new("127.0.0.1:0".parse().unwrap()));
    let pool = registry
        .add_pool(Pool::new(
            HOSTNAME,
            params(),
            Some(StickyConfig::lb_cookie(Duration::from_secs(3600))),
        ))
        .await
        .unwrap();
    for upstream in &upstreams {
        pool.add_server(backend_for(upstream)).await.mark_healthy();
    }

    // The first, cookie-less request gets a Set-Cookie naming its server.
    let response = registry.serve(request(HOSTNAME), client_ip()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{LB_COOKIE_NAME}=")))
        .map(str::to_string)
        .expect("LB cookie set on response");
    let pinned = body_string(response).await;

    // Replaying the cookie pins every request, even though round-robin
    // would move to the other servers.
    for _ in 0..6 {
        let mut replay = request(HOSTNAME);
        replay
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
        let response = registry.serve(replay, client_ip()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, pinned);
    }
}

#[tokio::test]
async fn app_cookie_from_upstream_creates_affinity() {
    let upstreams = [
        spawn_upstream("one", Some("jsessionid=alpha")).await,
        spawn_upstream("two", Some("jsessionid=beta")).await,
    ];

    let registry = Arc::new(Registry::new("127.0.0.1:0".parse().unwrap()));
    let pool = registry
        .add_pool(Pool::new(
            HOSTNAME,
            params(),
            Some(StickyConfig::app_cookie(Duration::from_secs(3600), "jsessionid").unwrap()),
        ))
        .await
        .unwrap();
    for upstream in &upstreams {
        pool.add_server(backend_for(upstream)).await.mark_healthy();
    }

    let response = registry.serve(request(HOSTNAME), client_ip()).await;
    let first = body_string(response).await;
    let session = if first == "one" { "alpha" } else { "beta" };

    for _ in 0..4 {
        let mut replay = request(HOSTNAME);
        replay.headers_mut().insert(
            COOKIE,
            HeaderValue::from_str(&format!("jsessionid={session}")).unwrap(),
        );
        let response = registry.serve(replay, client_ip()).await;
        assert_eq!(body_string(response).await, first);
    }
}

#[tokio::test]
async fn transaction_rolls_back_unhealthy_candidate() {
    let good = spawn_upstream("good", None).await;
    let bad = spawn_upstream("bad", None).await;
    bad.set_status(500);

    let (registry, _guard) = registry_with_health_loop().await;
    let pool = registry
        .add_pool(Pool::new(HOSTNAME, params(), None))
        .await
        .unwrap();
    let old = pool.add_server(backend_for(&good)).await;
    wait_until(
        || old.status() == HealthStatus::Healthy,
        Duration::from_secs(8),
        "old server to turn healthy",
    )
    .await;

    // Deadline is 1 + 1 * (2 * 2) + 1 = 6 s; the candidate fails its
    // probes well before that.
    let result = pool.transaction(backend_for(&bad), old.id).await;
    assert!(matches!(
        result,
        Err(PoolError::TransactionUnhealthy) | Err(PoolError::TransactionTimeout)
    ));

    let (conditional, unconditional) = pool.server_snapshot().await;
    assert!(conditional.is_empty());
    assert_eq!(unconditional.len(), 1);
    assert_eq!(unconditional[0].id, old.id);

    let chosen = pool.choose(&HeaderMap::new(), client_ip()).await.unwrap();
    assert_eq!(chosen.id, old.id);
}

#[tokio::test]
async fn unknown_host_gets_an_explicit_404() {
    let registry = Arc::new(Registry::new("127.0.0.1:0".parse().unwrap()));
    let response = registry.serve(request("nobody.example.com"), client_ip()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("X-Proxy-Error").unwrap(),
        "UNKNOWN_HOST"
    );

    let missing_host = Request::builder().uri("/").body(empty_body()).unwrap();
    let response = registry.serve(missing_host, client_ip()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pool_without_healthy_servers_gets_503() {
    let upstream = spawn_upstream("one", None).await;
    let registry = Arc::new(Registry::new("127.0.0.1:0".parse().unwrap()));
    let pool = registry
        .add_pool(Pool::new(HOSTNAME, params(), None))
        .await
        .unwrap();
    pool.add_server(backend_for(&upstream)).await;

    // The only server is still Pending.
    let response = registry.serve(request(HOSTNAME), client_ip()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unreachable_upstream_becomes_502_and_is_counted() {
    // Grab a port and release it so nothing is listening there.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let registry = Arc::new(Registry::new("127.0.0.1:0".parse().unwrap()));
    let pool = registry
        .add_pool(Pool::new(HOSTNAME, params(), None))
        .await
        .unwrap();
    let server = pool
        .add_server(Backend::new(&format!("http://{dead_addr}"), "/h", None).unwrap())
        .await;
    server.mark_healthy();

    let response = registry.serve(request(HOSTNAME), client_ip()).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(server.stats().not_ok, 1);
    assert_eq!(server.stats().ok, 0);
}
