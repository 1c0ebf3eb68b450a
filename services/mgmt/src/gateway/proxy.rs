//! Loopback reverse proxy.
//!
//! All proxied backends live on 127.0.0.1, each behind its own port. The
//! gateway forwards the request path and query verbatim and streams both
//! bodies, since media delivery responses can stay open for the lifetime
//! of a stream. Hop-by-hop headers are dropped in both directions.

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Request headers that must not be forwarded upstream. `accept-encoding`
/// is stripped so the backend replies with an identity body we can relay
/// without re-coding.
fn skip_request_header(name: &str) -> bool {
    matches!(
        name,
        "host"
            | "connection"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "upgrade"
            | "accept-encoding"
            | "content-length"
            | "transfer-encoding"
    )
}

/// Response headers that describe the upstream connection, not the payload.
fn skip_response_header(name: &str) -> bool {
    matches!(
        name,
        "connection" | "keep-alive" | "transfer-encoding" | "content-length"
    )
}

/// Shared client for all proxy targets.
pub struct ProxyClient {
    client: reqwest::Client,
}

impl ProxyClient {
    pub fn new() -> Result<Self> {
        // No request timeout: media responses are unbounded. Connecting to a
        // loopback backend that is down should still fail quickly.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("build proxy client")?;
        Ok(Self { client })
    }

    /// Forward the request to the backend on the given loopback port. A
    /// failure to reach the backend becomes a 502 so the caller always gets
    /// a response.
    pub async fn forward(&self, port: u16, req: Request) -> Response {
        let path = req.uri().path().to_string();
        match self.try_forward(port, req).await {
            Ok(response) => response,
            Err(err) => {
                warn!(port, path = %path, error = %format!("{err:#}"), "proxy failed");
                (StatusCode::BAD_GATEWAY, "backend unavailable\n").into_response()
            }
        }
    }

    async fn try_forward(&self, port: u16, req: Request) -> Result<Response> {
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://127.0.0.1:{port}{path_and_query}");
        debug!(url = %url, method = %parts.method, "proxying");

        let mut headers = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if skip_request_header(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .with_context(|| format!("request {url}"))?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in upstream.headers().iter() {
                if skip_response_header(name.as_str()) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
        }

        let response = builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .context("assemble response")?;
        Ok(response)
    }
}
