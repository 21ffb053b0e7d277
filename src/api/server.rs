use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::catalog;
use super::deprecation::DeprecationNotice;
use super::router::{parse_query, Handler, RequestContext, Router};
use super::version::{ApiVersion, VersionNegotiator};
use super::{error_response, json_response, BoxBody};
use crate::core::Core;

const API_VERSION_HEADER: HeaderName = HeaderName::from_static("x-api-version");

/// `GET /health`: latest health snapshot
pub struct HealthHandler;

#[async_trait]
impl Handler for HealthHandler {
    async fn handle(&self, ctx: &RequestContext<'_>) -> Response<BoxBody> {
        let health = &ctx.core.health;
        let mut snapshot = health.snapshot();

        // Polling is off in some environments; run once so the first answer is real
        if health.is_enabled() && snapshot.checks.is_empty() {
            snapshot = health.run_checks().await;
        }

        let status = if snapshot.is_degraded() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };
        json_response(status, snapshot.as_ref())
    }
}

/// `GET /health/runtime`: pool and breaker counters
pub struct RuntimeHandler;

#[async_trait]
impl Handler for RuntimeHandler {
    async fn handle(&self, ctx: &RequestContext<'_>) -> Response<BoxBody> {
        let breaker = ctx.core.breaker.as_ref().map(|b| b.stats());
        json_response(
            StatusCode::OK,
            &json!({
                "pool": ctx.core.pool.stats(),
                "breaker": breaker,
                "timestamp": chrono::Utc::now(),
            }),
        )
    }
}

/// Build the full route table
///
/// v2 handlers live under `/api/v2`. The v1 handlers are mounted under both
/// `/api/v1` and the unversioned `/api` prefix.
pub fn build_router() -> Router {
    let v1 = catalog::v1_routes();
    let v2 = catalog::v2_routes();

    let mut router = Router::new();
    router
        .mount("/api/v2", Some(ApiVersion::V2), &v2)
        .mount("/api/v1", Some(ApiVersion::V1), &v1)
        .mount("/api", Some(ApiVersion::V1), &v1)
        .route(Method::GET, "/health", Arc::new(HealthHandler))
        .route(Method::GET, "/health/runtime", Arc::new(RuntimeHandler));
    router
}

fn is_api_path(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

/// HTTP server state
pub struct ApiServer {
    core: Core,
    listen: String,
    router: Router,
    negotiator: VersionNegotiator,
    notice: DeprecationNotice,
}

impl ApiServer {
    /// Create a server with the given core and listen address
    pub fn new(core: Core, listen: String) -> Self {
        let api = &core.config.api;
        let negotiator = VersionNegotiator::new(api.default_version);
        let notice = DeprecationNotice::for_v1(api.v1_sunset_date.as_deref(), &api.migration_guide_url);

        Self {
            core,
            listen,
            router: build_router(),
            negotiator,
            notice,
        }
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    /// Bind the listen address and serve until Ctrl-C
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        info!("pureza-api listening on {}", addr);

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        };
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections on `listener` until `shutdown` resolves, then close the core
    pub async fn serve<S>(self, listener: TcpListener, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        self.core.start_background_tasks();
        let server = Arc::new(self);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle_request(req).await) }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    let err_str = format!("{}", e);
                    if !err_str.contains("connection reset") && !err_str.contains("broken pipe") {
                        error!("Error serving connection from {}: {}", remote_addr, e);
                    }
                }
            });
        }

        server.core.shutdown();
    }

    /// Negotiate the version, dispatch, then decorate `/api` responses
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<BoxBody> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let version = self.negotiator.negotiate(&req);

        let mut response = match self.router.find(&method, &path) {
            Some(found) => {
                let ctx = RequestContext {
                    core: &self.core,
                    params: found.params,
                    query: parse_query(req.uri().query()),
                    version: &version,
                    mount_version: found.version,
                };
                found.handler.handle(&ctx).await
            }
            None if self.router.matches_path(&path) => error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "METHOD_NOT_ALLOWED",
                &format!("Method {} not allowed on {}", method, path),
            ),
            None => error_response(
                StatusCode::NOT_FOUND,
                "ROUTE_NOT_FOUND",
                &format!("Route {} {} not found", method, path),
            ),
        };

        if is_api_path(&path) {
            let headers = response.headers_mut();
            headers.insert(API_VERSION_HEADER, HeaderValue::from_static(version.negotiated.as_str()));
            if self.notice.applies_to(version.negotiated) {
                self.notice.apply(headers);
            }
        }

        debug!(
            requested = version.requested.as_deref().unwrap_or(""),
            source = ?version.source,
            "Version negotiated"
        );
        info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            api_version = %version.negotiated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request"
        );

        response
    }
}
