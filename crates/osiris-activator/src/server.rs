//! The cold-start HTTP listener.
//!
//! Every request that lands here is for a (possibly) scaled-to-zero
//! app: resolve the host against the index, wait for the activation to
//! finish, then forward the buffered original request to the service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::header::HOST;
use http::Uri;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use osiris_core::headers::strip_hop_by_hop;
use osiris_core::App;

use crate::activate::Activate;

/// How long in-flight requests get to finish after shutdown is signalled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type ServerBody = BoxBody<Bytes, hyper::Error>;

/// Resolves a request host to an app. The watch layer provides the real
/// implementation via [`crate::ClusterState::lookup`].
pub type HostLookup = Arc<dyn Fn(&str) -> Option<Arc<App>> + Send + Sync>;

/// Activator server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Requests with bodies above this are refused with 413; the body
    /// has to be buffered in memory while activation runs.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

struct ServerInner {
    lookup: HostLookup,
    activate: Arc<dyn Activate>,
    config: ServerConfig,
    client: Client<HttpConnector, Full<Bytes>>,
}

/// The activator's HTTP front door.
pub struct ActivatorServer {
    listener: TcpListener,
    inner: Arc<ServerInner>,
}

impl ActivatorServer {
    pub async fn bind(
        addr: SocketAddr,
        lookup: HostLookup,
        activate: Arc<dyn Activate>,
        config: ServerConfig,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind activator port")?;
        Ok(Self {
            listener,
            inner: Arc::new(ServerInner {
                lookup,
                activate,
                config,
                client: Client::builder(TokioExecutor::new()).build_http(),
            }),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal fires, then drain for up to five
    /// seconds.
    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "activator listening");

        let graceful = GracefulShutdown::new();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    let (stream, peer_addr) = accept_result.context("accept failed")?;
                    let inner = self.inner.clone();

                    let svc = service_fn(move |req: Request<Incoming>| {
                        let inner = inner.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(inner.handle(req).await)
                        }
                    });
                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc);
                    let watched = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(e) = watched.await {
                            error!(%peer_addr, error = %e, "activator connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!(%addr, "activator shutting down");
                    break;
                }
            }
        }

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

impl ServerInner {
    async fn handle(&self, req: Request<Incoming>) -> Response<ServerBody> {
        let host = match effective_host(&req) {
            Some(host) => host,
            None => {
                debug!("request without a usable host");
                return status_response(StatusCode::NOT_FOUND, "unknown host");
            }
        };

        let app = match (self.lookup)(&host) {
            Some(app) => app,
            None => {
                debug!(%host, "no app indexed for host");
                return status_response(StatusCode::NOT_FOUND, "unknown host");
            }
        };

        // The body is buffered up front so the original request survives
        // the activation wait intact.
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.config.max_body_bytes)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                debug!(%host, "request body exceeds the buffer cap");
                return status_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
            Err(e) => {
                debug!(%host, error = %e, "failed reading request body");
                return status_response(StatusCode::BAD_REQUEST, "bad request body");
            }
        };

        debug!(%host, workload = %app.workload(), "request waiting on activation");
        if let Err(e) = self.activate.ensure_active(app.clone()).await {
            warn!(%host, workload = %app.workload(), error = %e, "activation did not complete");
            return status_response(StatusCode::SERVICE_UNAVAILABLE, "activation failed");
        }

        match self.forward(parts, body, &app).await {
            Ok(resp) => resp.map(|b| b.boxed()),
            Err(e) => {
                error!(%host, target = %app.target_url, error = %e, "error forwarding to activated app");
                status_response(StatusCode::BAD_GATEWAY, "bad gateway")
            }
        }
    }

    async fn forward(
        &self,
        mut parts: http::request::Parts,
        body: Bytes,
        app: &App,
    ) -> anyhow::Result<Response<Incoming>> {
        strip_hop_by_hop(&mut parts.headers);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let authority = app
            .target_url
            .authority()
            .context("target URL has no authority")?
            .clone();
        parts.uri = Uri::builder()
            .scheme("http")
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .context("rebuilding forward URI")?;

        let req = Request::from_parts(parts, Full::new(body));
        Ok(self.client.request(req).await?)
    }
}

/// The host the client addressed, port suffix preserved as sent.
fn effective_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) {
        if !host.is_empty() {
            return Some(host.to_string());
        }
    }
    req.uri().authority().map(|a| a.to_string())
}

fn status_response(status: StatusCode, message: &'static str) -> Response<ServerBody> {
    Response::builder()
        .status(status)
        .body(
            Full::new(Bytes::from_static(message.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}
