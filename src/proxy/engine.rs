use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::{Config, Scheme, ServerConfig};
use crate::error::{EdgeProxyError, Result as EdgeResult};
use crate::observability::{AccessLogEntry, AccessLogger, MetricsCollector};
use super::{
    admission::{CacheableRule, RequestClass},
    cache::{CacheKey, CacheStore},
    cors::{self, X_CACHE},
    upstream::{is_hop_by_hop_header, ClientMeta, Origin, OriginResponse},
};

/// Static, startup-time settings of the edge proxy.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub rule: CacheableRule,
    pub ttl: Duration,
    pub scheme: Scheme,
    pub powered_by: HeaderValue,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let powered_by = HeaderValue::from_str(&config.proxy.powered_by).map_err(|e| {
            anyhow::anyhow!("Invalid proxy.powered_by '{}': {}", config.proxy.powered_by, e)
        })?;

        Ok(Self {
            rule: CacheableRule::new(config.cache.cacheable_prefixes.iter().cloned()),
            ttl: config.cache.ttl,
            scheme: config.server.scheme,
            powered_by,
        })
    }
}

/// Caching reverse proxy. Holds no per-request state; the cache store and
/// the origin client are injected.
pub struct EdgeProxy {
    settings: ProxySettings,
    store: Arc<dyn CacheStore>,
    origin: Arc<dyn Origin>,
    metrics: Arc<MetricsCollector>,
    access_log: Arc<AccessLogger>,
}

impl EdgeProxy {
    pub fn new(settings: ProxySettings, store: Arc<dyn CacheStore>, origin: Arc<dyn Origin>) -> Self {
        Self {
            settings,
            store,
            origin,
            metrics: Arc::new(MetricsCollector::disabled()),
            access_log: Arc::new(AccessLogger::disabled()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_access_log(mut self, access_log: Arc<AccessLogger>) -> Self {
        self.access_log = access_log;
        self
    }

    /// Catch-all router; every path and method goes through [`EdgeProxy::handle`].
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(handle_request)
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Start the proxy server
    pub async fn serve(self: Arc<Self>, server_config: &ServerConfig) -> EdgeResult<()> {
        let addr = format!("{}:{}", server_config.host, server_config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| EdgeProxyError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

        info!(
            "Edge proxy listening on {} (cache backend: {})",
            addr,
            self.store.backend_name()
        );

        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| EdgeProxyError::Internal(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Process a single inbound request
    #[instrument(
        skip(self, req),
        fields(request_id, client_ip = %client_addr.ip(), method = %req.method(), uri = %req.uri())
    )]
    pub async fn handle(&self, req: Request, client_addr: SocketAddr) -> Response {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        Span::current().record("request_id", request_id.as_str());

        let class = self.settings.rule.classify(req.method(), req.uri().path());
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(String::from);

        let client = ClientMeta {
            request_id: request_id.clone(),
            ip: client_addr.ip(),
            proto: self.settings.scheme.as_str(),
        };

        let response = match class {
            RequestClass::Preflight => cors::preflight_response(),
            RequestClass::CacheableGet => self.serve_cacheable(req, &client).await,
            RequestClass::PassThrough => self.serve_pass_through(req, &client).await,
        };

        let elapsed = started.elapsed();
        self.metrics.record_request(class, elapsed.as_secs_f64());

        let cache = response.headers().get(X_CACHE).and_then(|v| match v.as_bytes() {
            b"HIT" => Some("HIT"),
            b"MISS" => Some("MISS"),
            _ => None,
        });
        self.access_log
            .log(&AccessLogEntry {
                timestamp: chrono::Utc::now(),
                request_id,
                client_ip: client_addr.ip().to_string(),
                method,
                uri,
                status: response.status().as_u16(),
                duration_ms: elapsed.as_millis() as u64,
                class: class.as_str(),
                cache,
                user_agent,
            })
            .await;

        debug!("Completed {} request in {}ms", class.as_str(), elapsed.as_millis());
        response
    }

    async fn serve_cacheable(&self, req: Request, client: &ClientMeta) -> Response {
        let key = CacheKey::new(req.method(), req.uri().path(), req.uri().query());

        match self.store.get(&key).await {
            Ok(Some(body)) => {
                debug!("Cache HIT for key: {}", key);
                self.metrics.record_cache_hit();
                return cors::cache_hit_response(body);
            }
            Ok(None) => debug!("Cache MISS for key: {}", key),
            Err(e) => {
                // A broken store degrades to a miss
                warn!("Cache lookup failed for key {}: {}", key, e);
                self.metrics.record_store_error("get");
            }
        }
        self.metrics.record_cache_miss();

        self.fetch_from_origin(req, client, Some(key)).await
    }

    async fn serve_pass_through(&self, req: Request, client: &ClientMeta) -> Response {
        self.fetch_from_origin(req, client, None).await
    }

    /// Forward to origin on a detached task so a client disconnect does not
    /// cancel the fetch or the cache population that follows it.
    async fn fetch_from_origin(
        &self,
        req: Request,
        client: &ClientMeta,
        cache_key: Option<CacheKey>,
    ) -> Response {
        let origin = self.origin.clone();
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let ttl = self.settings.ttl;
        let client = client.clone();

        let task = tokio::spawn(
            async move {
                let (parts, body) = req.into_parts();
                let origin_response = origin.forward(parts, body, &client).await?;

                let key = match cache_key {
                    Some(key) if origin_response.status.is_success() => key,
                    _ => return Ok(origin_response),
                };

                let OriginResponse { status, headers, body } = origin_response;
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| {
                        EdgeProxyError::OriginUnreachable(format!("Failed to read origin body: {}", e))
                    })?
                    .to_bytes();

                populate(store, metrics, key, bytes.clone(), ttl);

                EdgeResult::<OriginResponse>::Ok(OriginResponse {
                    status,
                    headers,
                    body: Body::from(bytes),
                })
            }
            .instrument(Span::current()),
        );

        match task.await {
            Ok(Ok(response)) => self.forwarded_response(response),
            Ok(Err(e)) => self.origin_failure(e),
            Err(e) => self.origin_failure(EdgeProxyError::OriginUnreachable(format!(
                "Origin task failed: {}",
                e
            ))),
        }
    }

    fn forwarded_response(&self, origin_response: OriginResponse) -> Response {
        let mut headers = HeaderMap::with_capacity(origin_response.headers.len() + 3);
        for (name, value) in origin_response.headers.iter() {
            if !is_hop_by_hop_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        cors::apply_forwarded_overrides(&mut headers, &self.settings.powered_by);

        let mut response = Response::new(origin_response.body);
        *response.status_mut() = origin_response.status;
        *response.headers_mut() = headers;
        response
    }

    fn origin_failure(&self, err: EdgeProxyError) -> Response {
        if err.is_origin_failure() {
            error!("Origin unavailable: {}", err);
            self.metrics.record_origin_error();
        } else {
            warn!("Request failed before reaching origin: {}", err);
        }
        err.into_response()
    }
}

/// Write the body to the store without holding up the client response.
fn populate(
    store: Arc<dyn CacheStore>,
    metrics: Arc<MetricsCollector>,
    key: CacheKey,
    body: Bytes,
    ttl: Duration,
) {
    tokio::spawn(
        async move {
            match store.put(&key, body, ttl).await {
                Ok(()) => debug!("Cache SET for key: {}, TTL: {:?}", key, ttl),
                Err(e) => {
                    warn!("Cache write failed for key {}: {}", key, e);
                    metrics.record_store_error("put");
                }
            }
        }
        .instrument(Span::current()),
    );
}

async fn handle_request(
    State(proxy): State<Arc<EdgeProxy>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    proxy.handle(req, client_addr).await
}
