use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
};
use http_body_util::BodyExt;
use tracing::{debug, error};

use crate::config::OriginConfig;
use crate::error::{EdgeProxyError, Result};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// What the edge itself observed about the client connection.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub request_id: String,
    pub ip: IpAddr,
    pub proto: &'static str,
}

/// Response received from origin, body still streaming.
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

/// Upstream HTTP service every non-preflight request is forwarded to.
#[async_trait]
pub trait Origin: Send + Sync + 'static {
    async fn forward(&self, parts: Parts, body: Body, client: &ClientMeta) -> Result<OriginResponse>;
}

/// Origin reached over HTTP with a pooled `reqwest` client.
pub struct HttpOrigin {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOrigin {
    pub fn new(config: &OriginConfig, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn target_url(&self, parts: &Parts) -> String {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}{}", self.base_url, path_and_query)
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn forward(&self, parts: Parts, body: Body, client: &ClientMeta) -> Result<OriginResponse> {
        let target_url = self.target_url(&parts);
        let started = Instant::now();

        debug!("Forwarding request {} to {}", client.request_id, target_url);

        let headers = forwarded_headers(&parts.headers, client);
        let body = body
            .collect()
            .await
            .map_err(|e| EdgeProxyError::BadRequest(format!("Failed to read request body: {}", e)))?
            .to_bytes();

        let response = self
            .client
            .request(parts.method, &target_url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("Origin request failed for {}: {}", client.request_id, e);
                if e.is_timeout() {
                    EdgeProxyError::OriginTimeout(e.to_string())
                } else {
                    EdgeProxyError::OriginUnreachable(e.to_string())
                }
            })?;

        metrics::histogram!("edge_origin_response_seconds").record(started.elapsed().as_secs_f64());

        let status = response.status();
        let headers = response.headers().clone();

        Ok(OriginResponse {
            status,
            headers,
            body: Body::from_stream(response.bytes_stream()),
        })
    }
}

/// Copy inbound headers for the origin request, then replace the
/// forwarding headers with values the edge observed itself.
pub fn forwarded_headers(inbound: &HeaderMap, client: &ClientMeta) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 4);

    for (name, value) in inbound.iter() {
        if !is_hop_by_hop_header(name) && name != axum::http::header::HOST {
            headers.append(name.clone(), value.clone());
        }
    }

    let ip = HeaderValue::from_str(&client.ip.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));

    // insert() drops every existing value for the name
    headers.insert(X_FORWARDED_FOR, ip.clone());
    headers.insert(X_REAL_IP, ip);
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(client.proto));
    if let Ok(request_id) = HeaderValue::from_str(&client.request_id) {
        headers.insert(X_REQUEST_ID, request_id);
    }

    headers
}

/// Connection-scoped headers that must not cross the proxy
pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Request, Router};
    use http_body_util::BodyExt;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn client_meta() -> ClientMeta {
        ClientMeta {
            request_id: "req-1".to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            proto: "https",
        }
    }

    fn origin_config(base_url: String) -> OriginConfig {
        OriginConfig {
            base_url,
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            ..OriginConfig::default()
        }
    }

    /// Fake origin that echoes request details back as JSON.
    async fn spawn_echo_origin() -> String {
        async fn echo(req: Request) -> axum::Json<serde_json::Value> {
            let (parts, body) = req.into_parts();
            let body = body.collect().await.unwrap().to_bytes();
            let header = |name: &str| -> Vec<String> {
                parts
                    .headers
                    .get_all(name)
                    .iter()
                    .map(|v| v.to_str().unwrap().to_string())
                    .collect()
            };
            axum::Json(serde_json::json!({
                "method": parts.method.as_str(),
                "uri": parts.uri.to_string(),
                "x_forwarded_for": header("x-forwarded-for"),
                "x_forwarded_proto": header("x-forwarded-proto"),
                "x_real_ip": header("x-real-ip"),
                "x_request_id": header("x-request-id"),
                "authorization": header("authorization"),
                "body": String::from_utf8_lossy(&body),
            }))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(echo);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_forwarded_headers_overwrite_client_values() {
        let mut inbound = HeaderMap::new();
        inbound.append(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        inbound.append(X_FORWARDED_FOR, HeaderValue::from_static("5.6.7.8"));
        inbound.insert(X_REAL_IP, HeaderValue::from_static("1.2.3.4"));
        inbound.insert(X_FORWARDED_PROTO, HeaderValue::from_static("gopher"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("host", HeaderValue::from_static("edge.example.com"));
        inbound.insert("authorization", HeaderValue::from_static("Bearer abc"));

        let headers = forwarded_headers(&inbound, &client_meta());

        let xff: Vec<_> = headers.get_all(X_FORWARDED_FOR).iter().collect();
        assert_eq!(xff, vec!["203.0.113.7"]);
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "203.0.113.7");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer abc");
        assert!(headers.get("connection").is_none());
        assert!(headers.get("host").is_none());
    }

    #[tokio::test]
    async fn test_forward_preserves_method_path_query_and_body() {
        let base_url = spawn_echo_origin().await;
        let origin = HttpOrigin::new(&origin_config(base_url), "edge-test").unwrap();

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/articles?draft=true")
            .header("x-forwarded-for", "10.0.0.1")
            .header("authorization", "Bearer abc")
            .body(Body::from("{\"title\":\"hi\"}"))
            .unwrap();
        let (parts, body) = request.into_parts();

        let response = origin.forward(parts, body, &client_meta()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let bytes = response.body.collect().await.unwrap().to_bytes();
        let echoed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["uri"], "/api/articles?draft=true");
        assert_eq!(echoed["x_forwarded_for"], serde_json::json!(["203.0.113.7"]));
        assert_eq!(echoed["x_real_ip"], serde_json::json!(["203.0.113.7"]));
        assert_eq!(echoed["x_forwarded_proto"], serde_json::json!(["https"]));
        assert_eq!(echoed["x_request_id"], serde_json::json!(["req-1"]));
        assert_eq!(echoed["authorization"], serde_json::json!(["Bearer abc"]));
        assert_eq!(echoed["body"], "{\"title\":\"hi\"}");
    }

    #[tokio::test]
    async fn test_forward_to_closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let origin = HttpOrigin::new(&origin_config(format!("http://{}", addr)), "edge-test").unwrap();
        let (parts, body) = axum::http::Request::get("/api/health")
            .body(Body::empty())
            .unwrap()
            .into_parts();

        let err = origin.forward(parts, body, &client_meta()).await.err().unwrap();
        assert!(err.is_origin_failure());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_target_url_joins_base_and_path() {
        let origin = HttpOrigin::new(
            &origin_config("http://origin.internal:8000/".to_string()),
            "edge-test",
        )
        .unwrap();
        let (parts, _) = axum::http::Request::get("/api/news?source=tech")
            .body(Body::empty())
            .unwrap()
            .into_parts();

        assert_eq!(origin.target_url(&parts), "http://origin.internal:8000/api/news?source=tech");
    }
}
