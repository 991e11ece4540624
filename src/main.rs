//! Authgate - OpenID Connect authenticating reverse proxy

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use authgate::{cli::Cli, config::Config, server::AuthProxy, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    // CLI flags win over file and environment
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(upstream_url) = cli.upstream_url {
        config.upstream_url = upstream_url;
    }

    let proxy = match AuthProxy::new(config).await {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(error = %e, "failed to initialize the proxy");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = proxy.run().await {
        error!(error = %e, "proxy terminated with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
