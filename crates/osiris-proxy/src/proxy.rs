//! Counting single-port reverse proxy.
//!
//! Every inbound request is forwarded to `http://localhost:<app_port>`.
//! Requests that represent real application traffic bump an atomic
//! counter; probe traffic and configured paths are forwarded without
//! being counted, so health checks never keep an idle app alive.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::header::HeaderValue;
use http::Uri;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use osiris_core::headers::strip_hop_by_hop;

/// How long in-flight requests get to finish after shutdown is signalled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Substring of the orchestrator's probe User-Agent.
const KUBE_PROBE_USER_AGENT: &str = "kube-probe";

/// Header carrying the post-increment counter value to the app.
const REQUEST_COUNT_HEADER: &str = "x-osiris-request-count";

/// Body type unifying upstream responses and locally built errors.
type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Configuration for one sidecar proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port the proxy listens on (what the pod's service targets).
    pub listen_port: u16,
    /// Port the application listens on inside the pod.
    pub app_port: u16,
    /// Request paths that are forwarded but never counted.
    pub ignored_paths: HashSet<String>,
}

struct ProxyInner {
    app_port: u16,
    request_count: Arc<AtomicU64>,
    ignored_paths: HashSet<String>,
    client: Client<HttpConnector, Incoming>,
}

/// A reverse proxy for a single application port.
pub struct SinglePortProxy {
    listener: TcpListener,
    inner: Arc<ProxyInner>,
}

impl SinglePortProxy {
    /// Bind the proxy's listen port. The shared `request_count` is the
    /// same atomic the stats endpoint reports.
    pub async fn bind(
        config: ProxyConfig,
        request_count: Arc<AtomicU64>,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind proxy port")?;
        Ok(Self {
            listener,
            inner: Arc::new(ProxyInner {
                app_port: config.app_port,
                request_count,
                ignored_paths: config.ignored_paths,
                client: Client::builder(TokioExecutor::new()).build_http(),
            }),
        })
    }

    /// The bound address (useful when the configured port was 0).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal fires, then drain in-flight
    /// requests for up to five seconds.
    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, app_port = self.inner.app_port, "proxy sidecar listening");

        let graceful = GracefulShutdown::new();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    let (stream, peer_addr) = accept_result.context("accept failed")?;
                    let inner = self.inner.clone();

                    let svc = service_fn(move |req: Request<Incoming>| {
                        let inner = inner.clone();
                        async move { Ok::<_, Infallible>(inner.handle(req).await) }
                    });
                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc);
                    let watched = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(e) = watched.await {
                            error!(%peer_addr, error = %e, "proxy connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!(%addr, "proxy sidecar shutting down");
                    break;
                }
            }
        }

        // New connections are refused from here on; the listener is gone.
        drop(self.listener);
        tokio::select! {
            _ = graceful.shutdown() => {}
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                debug!("drain timeout elapsed with requests still in flight");
            }
        }
        Ok(())
    }
}

impl ProxyInner {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let mut req = req;
        if self.is_ignored(&req) {
            debug!(path = req.uri().path(), "not counting ignored request");
        } else {
            let count = self.request_count.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(path = req.uri().path(), request_count = count, "counted request");
            if let Ok(value) = HeaderValue::from_str(&count.to_string()) {
                req.headers_mut().insert(REQUEST_COUNT_HEADER, value);
            }
        }

        match self.forward(req).await {
            Ok(resp) => resp.map(|b| b.boxed()),
            Err(e) => {
                error!(error = %e, app_port = self.app_port, "error forwarding to application");
                bad_gateway()
            }
        }
    }

    async fn forward(&self, mut req: Request<Incoming>) -> anyhow::Result<Response<Incoming>> {
        strip_hop_by_hop(req.headers_mut());
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = Uri::builder()
            .scheme("http")
            .authority(format!("localhost:{}", self.app_port))
            .path_and_query(path_and_query)
            .build()
            .context("rebuilding upstream URI")?;
        *req.uri_mut() = uri;
        Ok(self.client.request(req).await?)
    }

    fn is_ignored(&self, req: &Request<Incoming>) -> bool {
        if self.ignored_paths.contains(req.uri().path()) {
            return true;
        }
        req.headers()
            .get(http::header::USER_AGENT)
            .and_then(|ua| ua.to_str().ok())
            .is_some_and(|ua| ua.contains(KUBE_PROBE_USER_AGENT))
    }
}

fn bad_gateway() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(full(Bytes::from_static(b"bad gateway")))
        .unwrap()
}

fn full(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
