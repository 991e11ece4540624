//! HTTP router assembly

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderName, Request},
    middleware::from_fn_with_state,
    response::Response,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use regex::Regex;
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};

use crate::config::Config;
use crate::handlers;
use crate::middleware::{
    admission_middleware, authentication_middleware, headers_middleware, metrics_middleware,
    resource_middleware,
};
use crate::oidc::OidcClient;
use crate::store::RefreshStore;
use crate::token::Verifier;
use crate::upstream::Upstream;

/// Shared application state
pub struct AppState {
    /// Proxy configuration
    pub config: Arc<Config>,
    /// Claim regexes, compiled once at load
    pub claim_matches: HashMap<String, Regex>,
    /// Custom claim names with their precomputed header names
    pub custom_claim_headers: Vec<(String, HeaderName)>,
    /// Token verifier with the JWKS cache
    pub verifier: Verifier,
    /// Client for the provider's token endpoints
    pub oidc: OidcClient,
    /// Optional refresh-token store; cookies only when absent
    pub store: Option<Arc<dyn RefreshStore>>,
    /// Upstream forwarder
    pub upstream: Upstream,
    /// Prometheus render handle for the metrics endpoint
    pub metrics: PrometheusHandle,
}

/// Create the router: OAuth endpoints under the configured base path, and
/// everything else through the protected pipeline to the upstream
pub fn create_router(state: Arc<AppState>) -> Router {
    let oauth = Router::new()
        .route("/authorize", get(handlers::authorize))
        .route("/callback", get(handlers::callback))
        .route("/login", post(handlers::login))
        .route("/logout", get(handlers::logout))
        .route("/token", get(handlers::token))
        .route("/expired", get(handlers::expired))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .with_state(Arc::clone(&state));

    // Stage order: resource match, authenticate, admit, inject headers
    let protected = Router::new()
        .fallback(proxy_handler)
        .layer(from_fn_with_state(Arc::clone(&state), headers_middleware))
        .layer(from_fn_with_state(Arc::clone(&state), admission_middleware))
        .layer(from_fn_with_state(
            Arc::clone(&state),
            authentication_middleware,
        ))
        .layer(from_fn_with_state(Arc::clone(&state), resource_middleware))
        .with_state(Arc::clone(&state));

    Router::new()
        .nest(&state.config.oauth_uri, oauth)
        .merge(protected)
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Terminal handler for protected requests: forward to the upstream
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    state.upstream.forward(request).await
}

/// Precompute the `X-Auth-*` header names for the configured custom claims
#[must_use]
pub fn custom_claim_headers(add_claims: &[String]) -> Vec<(String, HeaderName)> {
    add_claims
        .iter()
        .filter_map(|claim| {
            let name = format!("x-auth-{}", claim.replace('_', "-").to_lowercase());
            HeaderName::try_from(name)
                .ok()
                .map(|header| (claim.clone(), header))
        })
        .collect()
}
