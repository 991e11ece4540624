//! Authgate Library
//!
//! An authenticating reverse proxy that fronts arbitrary upstream HTTP
//! services and enforces OpenID Connect / OAuth2 access control on every
//! request.
//!
//! # Features
//!
//! - **Authorization-code flow**: performed on behalf of plain-HTTP clients
//! - **Silent refresh**: expired access tokens are transparently renewed
//! - **Per-resource admission**: role, audience and claim-regex checks
//! - **Identity headers**: `X-Auth-*` headers injected for the upstream
//! - **Cookie vault**: refresh tokens held in AES-GCM encrypted cookies or
//!   an external session store

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod cookies;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod oidc;
pub mod resources;
pub mod router;
pub mod server;
pub mod store;
pub mod token;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Response header carrying the proxy version on health checks
pub const VERSION_HEADER: &str = "X-Auth-Proxy-Version";

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
