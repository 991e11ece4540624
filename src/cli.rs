//! Command-line interface definitions for `authgate`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap`.

use std::path::PathBuf;

use clap::Parser;

/// Authgate - OpenID Connect authenticating reverse proxy
///
/// Sits in front of an upstream HTTP service, performs the OIDC
/// authorization-code flow on behalf of clients, validates tokens on every
/// request and applies per-resource admission rules before forwarding.
#[derive(Parser, Debug)]
#[command(name = "authgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the proxy configuration file (YAML)
    #[arg(short, long, env = "AUTHGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the proxy listens on (overrides config file)
    #[arg(short, long, env = "AUTHGATE_LISTEN")]
    pub listen: Option<String>,

    /// URL of the upstream service to protect (overrides config file)
    #[arg(short, long, env = "AUTHGATE_UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(long, default_value = "info", env = "AUTHGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "AUTHGATE_LOG_FORMAT")]
    pub log_format: Option<String>,
}
