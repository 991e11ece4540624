//! Proxy server assembly and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::config::Config;
use crate::oidc::{OidcClient, ProviderMetadata};
use crate::router::{AppState, create_router, custom_claim_headers};
use crate::store;
use crate::token::Verifier;
use crate::upstream::Upstream;
use crate::{Error, Result};

/// The assembled authenticating proxy
pub struct AuthProxy {
    config: Arc<Config>,
    state: Arc<AppState>,
}

impl AuthProxy {
    /// Validate the configuration, discover the provider and wire the state
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.openid_provider_timeout)
            .build()?;

        let metadata = ProviderMetadata::discover(&http, &config.discovery_url).await?;
        let verifier = Verifier::new(
            http.clone(),
            metadata.issuer.clone(),
            metadata.jwks_uri.clone(),
        );
        let oidc = OidcClient::new(
            http,
            metadata,
            config.client_id.clone(),
            config.client_secret.clone(),
            config.scopes.clone(),
        );

        let store = store::from_url(&config.store_url)?;
        if store.is_some() {
            info!(store_url = %config.store_url, "using session store for refresh tokens");
        }

        let upstream = Upstream::new(&config.upstream_url, config.upstream_timeout)?;

        if config.skip_token_verification {
            warn!("TOKEN VERIFICATION IS DISABLED - do not run this in production");
        }
        if !config.sign_in_page.is_empty() {
            info!(sign_in_page = %config.sign_in_page, "custom sign-in page configured, rendering is delegated");
        }

        // A recorder can only be installed once per process; later
        // instances (tests) fall back to a detached handle
        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle());

        let claim_matches = config.claim_matches()?;
        let custom_claim_headers = custom_claim_headers(&config.add_claims);
        let config = Arc::new(config);

        let state = Arc::new(AppState {
            config: Arc::clone(&config),
            claim_matches,
            custom_claim_headers,
            verifier,
            oidc,
            store,
            upstream,
            metrics,
        });

        Ok(Self { config, state })
    }

    /// The assembled router, also used by the integration tests
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Bind the listener and serve until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!(
            listen = %self.config.listen,
            upstream = %self.config.upstream_url,
            oauth_uri = %self.config.oauth_uri,
            resources = self.config.resources.len(),
            "authgate listening"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!("shutdown complete");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
