//! Upstream request forwarding
//!
//! A deliberately slim forwarder: method, path, query, headers (minus
//! hop-by-hop) and body are relayed to the configured upstream and the
//! answer is relayed back. Everything interesting happens in the
//! middleware chain before a request gets here.

use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode},
    response::Response,
};
use tracing::{debug, error};
use url::Url;

use crate::{Error, Result};

/// Largest request/response body the forwarder will buffer
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Forwarder for the protected upstream service
pub struct Upstream {
    base: String,
    client: reqwest::Client,
}

impl Upstream {
    /// Create a forwarder for the given base URL
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let base = url.trim_end_matches('/').to_string();
        Url::parse(&base).map_err(|e| Error::Config(format!("invalid upstream_url: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { base, client })
    }

    /// Relay a request to the upstream and return its response
    pub async fn forward(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let url = format!("{}{}", self.base, path_and_query);

        let body_bytes = match to_bytes(body, MAX_BODY_SIZE).await {
            Ok(bytes) => bytes,
            Err(_) => return status_response(StatusCode::PAYLOAD_TOO_LARGE),
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &parts.headers {
            if name == axum::http::header::HOST || is_hop_header(name.as_str()) {
                continue;
            }
            headers.append(name, value.clone());
        }

        debug!(method = %parts.method, url = %url, "forwarding to upstream");

        let result = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body_bytes)
            .send()
            .await;

        let upstream_response = match result {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, url = %url, "upstream request failed");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let status = upstream_response.status();
        let response_headers = upstream_response.headers().clone();
        let bytes = match upstream_response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to read upstream response body");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        for (name, value) in &response_headers {
            if is_hop_header(name.as_str()) {
                continue;
            }
            response.headers_mut().append(name, value.clone());
        }
        response
    }
}

fn status_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
