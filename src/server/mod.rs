//! The origin listener: gated accept, TLS handshake, HTTP serving.
//!
//! Every accepted connection gets its own task, which runs the accept filter,
//! the handshake and HTTP serving in that order. Shutdown stops the accept
//! loop, asks every connection to finish its current requests, and waits up
//! to `shutdown_timeout` before aborting what is left.

pub mod deadline;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::HOST};
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::gate::{ConnectionGate, GatedStream};
use crate::Result;

pub use deadline::{Activity, DeadlineIo};

/// How often HTTP/2 connections are pinged to detect dead peers.
const H2_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection time bounds, copied out of [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
struct Timeouts {
    handshake: Duration,
    header_read: Duration,
    read: Duration,
    write: Duration,
    idle: Duration,
    shutdown: Duration,
}

impl From<&ServerConfig> for Timeouts {
    fn from(config: &ServerConfig) -> Self {
        Self {
            handshake: config.handshake_timeout,
            header_read: config.header_read_timeout,
            read: config.read_timeout,
            write: config.write_timeout,
            idle: config.idle_timeout,
            shutdown: config.shutdown_timeout,
        }
    }
}

/// TLS origin server behind the CDN.
#[derive(Debug)]
pub struct OriginServer {
    listener: TcpListener,
    gate: ConnectionGate,
    timeouts: Timeouts,
}

impl OriginServer {
    /// Bind `addr`; connections are filtered and served per `gate` and `config`.
    pub async fn bind(
        addr: SocketAddr,
        gate: ConnectionGate,
        config: &ServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            gate,
            timeouts: Timeouts::from(config),
        })
    }

    /// Local address of the listening socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve `app` until the process is stopped.
    pub async fn serve(self, app: Router) -> Result<()> {
        self.serve_with_shutdown(app, std::future::pending()).await
    }

    /// Serve `app` until `shutdown` resolves, then drain.
    ///
    /// Returns once every connection has finished, or once `shutdown_timeout`
    /// has passed and the remaining connections have been aborted.
    pub async fn serve_with_shutdown<F>(self, app: Router, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        let Self {
            listener,
            gate,
            timeouts,
        } = self;
        info!(
            %addr,
            strategy = ?gate.filter().strategy(),
            "Listening"
        );

        let mut http = auto::Builder::new(TokioExecutor::new());
        http.http1()
            .timer(TokioTimer::new())
            .header_read_timeout(timeouts.header_read);
        http.http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(H2_KEEP_ALIVE_INTERVAL)
            .keep_alive_timeout(timeouts.read);

        let (stop, stopped) = watch::channel(false);
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, peer)) => {
                            let conn = Connection {
                                gate: gate.clone(),
                                http: http.clone(),
                                app: app.clone(),
                                timeouts,
                                stopped: stopped.clone(),
                            };
                            connections.spawn(conn.run(tcp, peer));
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        stop.send_replace(true);

        info!(connections = connections.len(), "Draining connections");
        let drained = tokio::time::timeout(timeouts.shutdown, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Shutdown timeout elapsed, aborting connections"
            );
            connections.shutdown().await;
        }

        Ok(())
    }
}

/// Resolves once shutdown has begun.
async fn stopping(stopped: &mut watch::Receiver<bool>) {
    // a dropped sender also means the server is gone
    let _ = stopped.wait_for(|stop| *stop).await;
}

/// Everything one connection task owns.
struct Connection {
    gate: ConnectionGate,
    http: auto::Builder<TokioExecutor>,
    app: Router,
    timeouts: Timeouts,
    stopped: watch::Receiver<bool>,
}

impl Connection {
    async fn run(self, tcp: TcpStream, peer: SocketAddr) {
        let Self {
            gate,
            http,
            app,
            timeouts,
            mut stopped,
        } = self;

        let Some(stream) = gate.filter().admit(tcp, peer).await else {
            return;
        };
        let tcp = match stream {
            GatedStream::Open(tcp) => tcp,
            GatedStream::Decoy(decoy) => {
                tokio::select! {
                    () = decoy.hold(timeouts.handshake) => {}
                    () = stopping(&mut stopped) => {}
                }
                return;
            }
        };

        let handshake = gate.handshake(tcp, peer);
        let tls = match tokio::time::timeout(timeouts.handshake, handshake).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                debug!(error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                debug!("TLS handshake timed out");
                return;
            }
        };

        let sni = tls.get_ref().1.server_name().map(str::to_owned);
        let activity = Arc::new(Activity::new());
        let service = {
            let activity = Arc::clone(&activity);
            tower::service_fn(move |req: Request<Incoming>| {
                let app = app.clone();
                let sni = sni.clone();
                let request = activity.begin();
                async move {
                    let _request = request;
                    if !host_matches_sni(request_host(&req), sni.as_deref()) {
                        debug!("Request host does not match SNI");
                        return Ok::<Response, Infallible>(forbidden());
                    }
                    app.oneshot(req).await
                }
            })
        };

        let io = DeadlineIo::new(tls, Arc::clone(&activity), timeouts.read, timeouts.write);
        let conn = http.serve_connection(TokioIo::new(io), TowerToHyperService::new(service));
        tokio::pin!(conn);

        let mut closing = false;
        let result = loop {
            let idle_check = activity
                .idle_deadline(timeouts.idle)
                .unwrap_or_else(|| Instant::now() + timeouts.idle);
            tokio::select! {
                result = conn.as_mut() => break result,
                () = stopping(&mut stopped), if !closing => {
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                }
                () = tokio::time::sleep_until(idle_check), if !closing => {
                    let idle = activity
                        .idle_deadline(timeouts.idle)
                        .is_some_and(|deadline| deadline <= Instant::now());
                    if idle {
                        debug!("Closing idle connection");
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        };

        if let Err(e) = result {
            debug!(error = %e, "Connection ended with error");
        }
    }
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Body::from("Forbidden")).into_response()
}

/// The host a request addresses: the `Host` header, else the URI authority (HTTP/2).
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Drop a trailing `:port`, keeping bracketed IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Whether the request host names the same server as the negotiated SNI.
pub fn host_matches_sni(host: Option<&str>, sni: Option<&str>) -> bool {
    match (host, sni) {
        (Some(host), Some(sni)) => {
            let host = strip_port(host).trim_end_matches('.');
            host.eq_ignore_ascii_case(sni.trim_end_matches('.'))
        }
        _ => false,
    }
}
