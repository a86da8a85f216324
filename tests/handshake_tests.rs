//! End-to-end tests over loopback TLS.
//!
//! Each test mints its own certificates, starts an [`OriginServer`] on an
//! ephemeral port and connects with a tokio-rustls client.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{Router, routing::get};
use rcgen::{CertificateParams, ExtendedKeyUsagePurpose, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use origin_guard::Error;
use origin_guard::config::{CertificatePaths, Config, FilterStrategy};
use origin_guard::gate::ConnectionGate;
use origin_guard::ranges::{CidrSet, RangeSource};
use origin_guard::server::OriginServer;

const EDGE_ONLY: &str = "173.245.48.0/20\n2400:cb00::/32";
const EDGE_AND_LOOPBACK: &str = "173.245.48.0/20\n127.0.0.0/8\n2400:cb00::/32";

/// In-memory edge ranges; `None` fails every fetch.
struct FixedRanges {
    body: Option<&'static str>,
    fetches: AtomicUsize,
}

impl FixedRanges {
    fn new(body: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            body,
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RangeSource for FixedRanges {
    async fn fetch(&self) -> origin_guard::Result<CidrSet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.body {
            Some(body) => CidrSet::parse_list("fixed", body),
            None => Err(Error::RangeFetch("edge unreachable".to_string())),
        }
    }
}

/// A self-signed certificate written to disk.
struct Pem {
    cert_path: std::path::PathBuf,
    key_path: std::path::PathBuf,
    cert: CertificateDer<'static>,
    key_pem: String,
}

impl Pem {
    fn private_key(&self) -> PrivateKeyDer<'static> {
        rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .unwrap()
            .unwrap()
    }
}

fn mint(dir: &Path, stem: &str, names: &[&str], purpose: ExtendedKeyUsagePurpose) -> Pem {
    let key = KeyPair::generate().unwrap();
    let mut params =
        CertificateParams::new(names.iter().map(ToString::to_string).collect::<Vec<_>>()).unwrap();
    params.extended_key_usages = vec![purpose];
    let cert = params.self_signed(&key).unwrap();

    let cert_path = dir.join(format!("{stem}.pem"));
    let key_path = dir.join(format!("{stem}.key"));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key.serialize_pem()).unwrap();

    Pem {
        cert_path,
        key_path,
        cert: cert.der().clone(),
        key_pem: key.serialize_pem(),
    }
}

/// Two served certificates, `a.example` and `b.example`.
struct Fixture {
    _dir: TempDir,
    a: Pem,
    b: Pem,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let a = mint(dir.path(), "a", &["a.example"], ExtendedKeyUsagePurpose::ServerAuth);
        let b = mint(dir.path(), "b", &["b.example"], ExtendedKeyUsagePurpose::ServerAuth);

        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.handshake_timeout = Duration::from_millis(500);
        for pem in [&a, &b] {
            config.tls.certificates.push(CertificatePaths {
                cert: pem.cert_path.clone(),
                key: pem.key_path.clone(),
            });
        }

        Self {
            _dir: dir,
            a,
            b,
            config,
        }
    }

    fn filter_ips(mut self, strategy: FilterStrategy) -> Self {
        self.config.ip_filter.enabled = true;
        self.config.ip_filter.strategy = strategy;
        self
    }

    fn client_config(&self, client_cert: Option<&Pem>) -> ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(self.a.cert.clone()).unwrap();
        roots.add(self.b.cert.clone()).unwrap();

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_root_certificates(roots);

        let mut config = match client_cert {
            Some(pem) => builder
                .with_client_auth_cert(vec![pem.cert.clone()], pem.private_key())
                .unwrap(),
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }

    async fn bind(&self, source: Arc<dyn RangeSource>) -> OriginServer {
        let gate = ConnectionGate::from_config_with_source(&self.config, source)
            .await
            .unwrap();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        OriginServer::bind(addr, gate, &self.config.server)
            .await
            .unwrap()
    }

    async fn start(&self, source: Arc<dyn RangeSource>) -> SocketAddr {
        let server = self.bind(source).await;
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve(app()));
        addr
    }

    /// Serve `app` until the returned sender fires.
    async fn start_stoppable(
        &self,
        app: Router,
    ) -> (
        SocketAddr,
        oneshot::Sender<()>,
        JoinHandle<origin_guard::Result<()>>,
    ) {
        let server = self.bind(FixedRanges::new(None)).await;
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(app, async {
            let _ = stopped.await;
        }));
        (addr, stop, handle)
    }
}

fn app() -> Router {
    Router::new().route("/", get(|| async { "origin" }))
}

/// An app whose only route answers after `delay`.
fn slow_app(delay: Duration) -> Router {
    Router::new().route(
        "/",
        get(move || async move {
            tokio::time::sleep(delay).await;
            "slow"
        }),
    )
}

/// The rustls error behind a failed client handshake.
fn tls_error(err: &std::io::Error) -> Option<rustls::Error> {
    err.get_ref()?.downcast_ref::<rustls::Error>().cloned()
}

/// First fetch answers at once; every later one takes `delay`.
struct SlowRefresh {
    body: &'static str,
    delay: Duration,
    fetches: AtomicUsize,
}

#[async_trait]
impl RangeSource for SlowRefresh {
    async fn fetch(&self) -> origin_guard::Result<CidrSet> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.delay).await;
        }
        CidrSet::parse_list("slow", self.body)
    }
}

async fn connect(
    addr: SocketAddr,
    config: ClientConfig,
    name: ServerName<'static>,
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let connector = TlsConnector::from(Arc::new(config));
    tokio::time::timeout(Duration::from_secs(5), connector.connect(name, tcp))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake hung"))?
}

fn dns(name: &str) -> ServerName<'static> {
    ServerName::try_from(name.to_string()).unwrap()
}

/// Send one HTTP/1.1 request and return the status line.
async fn get_status(stream: &mut TlsStream<TcpStream>, host: &str) -> std::io::Result<String> {
    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
        if response.windows(2).any(|w| w == b"\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&response);
    text.lines().next().map(str::to_owned).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no status line")
    })
}

#[tokio::test]
async fn serves_the_certificate_matching_sni() {
    let fixture = Fixture::new();
    let addr = fixture.start(FixedRanges::new(None)).await;

    let stream = connect(addr, fixture.client_config(None), dns("a.example"))
        .await
        .unwrap();
    let (_, session) = stream.get_ref();
    let served = session.peer_certificates().unwrap();
    assert_eq!(served[0], fixture.a.cert);

    let stream = connect(addr, fixture.client_config(None), dns("b.example"))
        .await
        .unwrap();
    let (_, session) = stream.get_ref();
    assert_eq!(session.peer_certificates().unwrap()[0], fixture.b.cert);
}

#[tokio::test]
async fn unknown_sni_fails_the_handshake() {
    let fixture = Fixture::new();
    let addr = fixture.start(FixedRanges::new(None)).await;

    let result = connect(addr, fixture.client_config(None), dns("c.example")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn missing_sni_fails_the_handshake() {
    let fixture = Fixture::new();
    let addr = fixture.start(FixedRanges::new(None)).await;

    // rustls sends no SNI for an IP address server name
    let name = ServerName::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST).into());
    let result = connect(addr, fixture.client_config(None), name).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn request_host_must_match_sni() {
    let fixture = Fixture::new();
    let addr = fixture.start(FixedRanges::new(None)).await;

    let mut stream = connect(addr, fixture.client_config(None), dns("a.example"))
        .await
        .unwrap();
    let status = get_status(&mut stream, "a.example").await.unwrap();
    assert!(status.starts_with("HTTP/1.1 200"), "{status}");

    let mut stream = connect(addr, fixture.client_config(None), dns("a.example"))
        .await
        .unwrap();
    let status = get_status(&mut stream, "b.example").await.unwrap();
    assert!(status.starts_with("HTTP/1.1 403"), "{status}");
}

#[tokio::test]
async fn listed_peer_passes_the_handshake_filter() {
    let fixture = Fixture::new().filter_ips(FilterStrategy::Handshake);
    let source = FixedRanges::new(Some(EDGE_AND_LOOPBACK));
    let addr = fixture.start(source.clone()).await;

    connect(addr, fixture.client_config(None), dns("a.example"))
        .await
        .unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unlisted_peer_fails_the_handshake() {
    let fixture = Fixture::new().filter_ips(FilterStrategy::Handshake);
    let source = FixedRanges::new(Some(EDGE_ONLY));
    let addr = fixture.start(source.clone()).await;

    let result = connect(addr, fixture.client_config(None), dns("a.example")).await;
    assert!(result.is_err());

    // bootstrap opened the throttle window, so misses do not refetch
    let result = connect(addr, fixture.client_config(None), dns("b.example")).await;
    assert!(result.is_err());
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_strategy_drops_unlisted_peers() {
    let fixture = Fixture::new().filter_ips(FilterStrategy::Close);
    let addr = fixture.start(FixedRanges::new(Some(EDGE_ONLY))).await;

    let result = connect(addr, fixture.client_config(None), dns("a.example")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn decoy_strategy_never_completes_a_handshake() {
    let fixture = Fixture::new().filter_ips(FilterStrategy::Decoy);
    let addr = fixture.start(FixedRanges::new(Some(EDGE_ONLY))).await;

    let result = connect(addr, fixture.client_config(None), dns("a.example")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn bootstrap_failure_prevents_startup() {
    let fixture = Fixture::new().filter_ips(FilterStrategy::Handshake);

    let err = ConnectionGate::from_config_with_source(&fixture.config, FixedRanges::new(None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RangeBootstrap(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn origin_pull_requires_a_client_certificate() {
    let mut fixture = Fixture::new();
    let dir = tempfile::tempdir().unwrap();
    let edge = mint(
        dir.path(),
        "edge",
        &["origin-pull.example"],
        ExtendedKeyUsagePurpose::ClientAuth,
    );
    fixture.config.tls.origin_pull_ca = Some(edge.cert_path.clone());
    let addr = fixture.start(FixedRanges::new(None)).await;

    let mut stream = connect(addr, fixture.client_config(Some(&edge)), dns("a.example"))
        .await
        .unwrap();
    let status = get_status(&mut stream, "a.example").await.unwrap();
    assert!(status.starts_with("HTTP/1.1 200"), "{status}");

    // TLS 1.3 clients finish before the server rejects them, so the refusal
    // shows up on the first exchange
    let result = match connect(addr, fixture.client_config(None), dns("a.example")).await {
        Ok(mut stream) => get_status(&mut stream, "a.example").await,
        Err(e) => Err(e),
    };
    assert!(result.is_err());
}

#[tokio::test]
async fn wrong_ip_and_wrong_name_get_the_same_alert() {
    let unlisted = Fixture::new().filter_ips(FilterStrategy::Handshake);
    let unlisted_addr = unlisted.start(FixedRanges::new(Some(EDGE_ONLY))).await;
    let wrong_ip = connect(unlisted_addr, unlisted.client_config(None), dns("a.example"))
        .await
        .unwrap_err();

    let listed = Fixture::new().filter_ips(FilterStrategy::Handshake);
    let listed_addr = listed.start(FixedRanges::new(Some(EDGE_AND_LOOPBACK))).await;
    let wrong_name = connect(listed_addr, listed.client_config(None), dns("c.example"))
        .await
        .unwrap_err();

    let wrong_ip = tls_error(&wrong_ip);
    let wrong_name = tls_error(&wrong_name);
    assert!(
        matches!(wrong_ip, Some(rustls::Error::AlertReceived(_))),
        "{wrong_ip:?}"
    );
    assert_eq!(wrong_ip, wrong_name);
}

#[tokio::test]
async fn shutdown_lets_in_flight_requests_finish() {
    let fixture = Fixture::new();
    let (addr, stop, server) = fixture
        .start_stoppable(slow_app(Duration::from_secs(1)))
        .await;

    let mut stream = connect(addr, fixture.client_config(None), dns("a.example"))
        .await
        .unwrap();
    let request = tokio::spawn(async move { get_status(&mut stream, "a.example").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!server.is_finished(), "server returned with a request in flight");

    let status = request.await.unwrap().unwrap();
    assert!(status.starts_with("HTTP/1.1 200"), "{status}");
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_drain_is_bounded() {
    let mut fixture = Fixture::new();
    fixture.config.server.shutdown_timeout = Duration::from_millis(200);
    let (addr, stop, server) = fixture
        .start_stoppable(slow_app(Duration::from_secs(60)))
        .await;

    let mut stream = connect(addr, fixture.client_config(None), dns("a.example"))
        .await
        .unwrap();
    let _request = tokio::spawn(async move { get_status(&mut stream, "a.example").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("drain must stop at shutdown_timeout")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let mut fixture = Fixture::new();
    fixture.config.server.idle_timeout = Duration::from_millis(300);
    fixture.config.server.header_read_timeout = Duration::from_secs(60);
    let addr = fixture.start(FixedRanges::new(None)).await;

    let mut idle = connect(addr, fixture.client_config(None), dns("a.example"))
        .await
        .unwrap();
    let mut buf = [0_u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), idle.read(&mut buf))
        .await
        .expect("idle connection was never closed");
    assert!(matches!(read, Ok(0) | Err(_)), "{read:?}");
}

#[tokio::test]
async fn slow_refresh_for_one_peer_does_not_delay_another() {
    let mut fixture = Fixture::new().filter_ips(FilterStrategy::Close);
    // every miss may refetch, so the stranger's miss starts a slow fetch
    fixture.config.ip_filter.refresh_interval = Duration::ZERO;
    let source = Arc::new(SlowRefresh {
        body: "127.0.0.1/32",
        delay: Duration::from_millis(1500),
        fetches: AtomicUsize::new(0),
    });
    let addr = fixture.start(source.clone()).await;

    let stranger = TcpSocket::new_v4().unwrap();
    stranger.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    let _stranger = stranger.connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

    let started = Instant::now();
    connect(addr, fixture.client_config(None), dns("a.example"))
        .await
        .unwrap();
    let took = started.elapsed();
    assert!(took < Duration::from_millis(1000), "allowed peer waited {took:?}");
}
