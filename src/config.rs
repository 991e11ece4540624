//! Configuration management

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::resources::Resource;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the proxy listens on
    pub listen: String,
    /// URL of the upstream service being protected
    pub upstream_url: String,
    /// OIDC discovery document URL (the provider's `.well-known` endpoint)
    pub discovery_url: String,
    /// OAuth2 client identifier
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: String,
    /// Scopes requested during the authorization-code flow
    pub scopes: Vec<String>,
    /// Public base URL the provider redirects back to; derived from the
    /// request when empty
    pub redirection_url: String,
    /// AES-GCM key for refresh-token encryption (16 or 32 bytes)
    pub encryption_key: String,
    /// Base path the OAuth endpoints are mounted under
    pub oauth_uri: String,
    /// Exchange refresh tokens to silently renew expired access tokens
    pub enable_refresh_tokens: bool,
    /// Expose the password-grant login endpoint
    pub enable_login_handler: bool,
    /// Forward the access token as an `Authorization: Bearer` header
    pub enable_authorization_header: bool,
    /// Skip signature verification - TESTING ONLY, expiry is still checked
    pub skip_token_verification: bool,
    /// Answer 401/403 instead of redirecting unauthenticated clients
    pub no_redirects: bool,
    /// Claim name to regex; every entry must match for admission
    pub match_claims: HashMap<String, String>,
    /// Claims rendered as extra `X-Auth-*` headers for the upstream
    pub add_claims: Vec<String>,
    /// Static headers set on every upstream request
    pub headers: HashMap<String, String>,
    /// Protected resource descriptors, first match wins
    pub resources: Vec<Resource>,
    /// Token revocation endpoint; the provider's end-session endpoint is
    /// used when empty
    pub revocation_endpoint: String,
    /// Name of the access-token cookie
    pub cookie_access_name: String,
    /// Name of the encrypted refresh-token cookie
    pub cookie_refresh_name: String,
    /// SameSite attribute for both cookies: "lax", "strict" or "none"
    pub same_site_cookie: String,
    /// Always mark cookies Secure, regardless of the request scheme
    pub secure_cookie: bool,
    /// Session store URL (`memory://` or `file:///path`); cookies only when
    /// empty
    pub store_url: String,
    /// Restrict the metrics endpoint to loopback clients
    pub localhost_metrics: bool,
    /// Allowed Host header values (enforcement is delegated to the fronting
    /// filter, parsed for compatibility)
    pub hostnames: Vec<String>,
    /// Custom sign-in page template path (rendering is delegated, parsed
    /// for compatibility)
    pub sign_in_page: String,
    /// Free-form tags forwarded to the sign-in template model
    pub tags: HashMap<String, String>,
    /// Overall timeout for identity-provider requests
    #[serde(with = "humantime_serde")]
    pub openid_provider_timeout: Duration,
    /// Overall timeout for upstream requests
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_string(),
            upstream_url: String::new(),
            discovery_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: Vec::new(),
            redirection_url: String::new(),
            encryption_key: String::new(),
            oauth_uri: "/oauth".to_string(),
            enable_refresh_tokens: false,
            enable_login_handler: false,
            enable_authorization_header: false,
            skip_token_verification: false,
            no_redirects: false,
            match_claims: HashMap::new(),
            add_claims: Vec::new(),
            headers: HashMap::new(),
            resources: Vec::new(),
            revocation_endpoint: String::new(),
            cookie_access_name: "kc-access".to_string(),
            cookie_refresh_name: "kc-state".to_string(),
            same_site_cookie: "lax".to_string(),
            secure_cookie: false,
            store_url: String::new(),
            localhost_metrics: false,
            hostnames: Vec::new(),
            sign_in_page: String::new(),
            tags: HashMap::new(),
            openid_provider_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (AUTHGATE_ prefix)
        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(config)
    }

    /// Check the configuration is usable before the proxy starts
    pub fn validate(&self) -> Result<()> {
        if self.discovery_url.is_empty() {
            return Err(Error::Config("discovery_url is required".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(Error::Config("client_id is required".to_string()));
        }
        if self.upstream_url.is_empty() {
            return Err(Error::Config("upstream_url is required".to_string()));
        }
        if self.enable_refresh_tokens && !matches!(self.encryption_key.len(), 16 | 32) {
            return Err(Error::Config(
                "encryption_key must be 16 or 32 bytes when refresh tokens are enabled"
                    .to_string(),
            ));
        }
        if !self.oauth_uri.starts_with('/') {
            return Err(Error::Config(format!(
                "oauth_uri must be an absolute path: {}",
                self.oauth_uri
            )));
        }
        if !matches!(self.same_site_cookie.as_str(), "lax" | "strict" | "none") {
            return Err(Error::Config(format!(
                "invalid same_site_cookie: {}",
                self.same_site_cookie
            )));
        }
        Ok(())
    }

    /// Compile the claim matching regexes, once, at load time
    pub fn claim_matches(&self) -> Result<HashMap<String, Regex>> {
        let mut compiled = HashMap::with_capacity(self.match_claims.len());
        for (claim, pattern) in &self.match_claims {
            let regex = Regex::new(pattern).map_err(|e| {
                Error::Config(format!("invalid match_claims regex for {claim}: {e}"))
            })?;
            compiled.insert(claim.clone(), regex);
        }
        Ok(compiled)
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
