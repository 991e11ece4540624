//! OIDC client
//!
//! Wraps the provider's discovery metadata and performs the token-endpoint
//! exchanges: authorization code, refresh, password grant and revocation.

use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::{Error, Result};

/// Scopes requested when the configuration names none
const DEFAULT_SCOPES: &[&str] = &["openid", "email", "profile"];

/// Provider metadata from the OIDC discovery document
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer URL; tokens must carry it in `iss`
    pub issuer: String,
    /// Authorization endpoint for the code flow
    pub authorization_endpoint: String,
    /// Token endpoint for all grant exchanges
    pub token_endpoint: String,
    /// JWKS document URL
    pub jwks_uri: String,
    /// End-session endpoint, used as the revocation fallback
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    /// Dedicated revocation endpoint when the provider has one
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
}

impl ProviderMetadata {
    /// Fetch and validate the discovery document
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdPUnavailable`] on network failure and
    /// [`Error::Config`] when mandatory fields are missing.
    pub async fn discover(http: &reqwest::Client, discovery_url: &str) -> Result<Self> {
        let metadata: Self = http
            .get(discovery_url)
            .send()
            .await
            .map_err(|e| Error::IdPUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::IdPUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::IdPUnavailable(e.to_string()))?;

        if metadata.issuer.is_empty()
            || metadata.authorization_endpoint.is_empty()
            || metadata.token_endpoint.is_empty()
            || metadata.jwks_uri.is_empty()
        {
            return Err(Error::Config(
                "discovery document is missing mandatory fields".to_string(),
            ));
        }

        info!(issuer = %metadata.issuer, "discovered OIDC provider");
        Ok(metadata)
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    /// Access token, the session credential
    pub access_token: String,
    /// ID token from the code exchange
    #[serde(default)]
    pub id_token: Option<String>,
    /// Refresh token, absent when the provider does not issue one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Client for the provider's token and revocation endpoints
pub struct OidcClient {
    http: reqwest::Client,
    metadata: ProviderMetadata,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
}

impl OidcClient {
    /// Create a client; empty scope lists fall back to the OIDC defaults
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        metadata: ProviderMetadata,
        client_id: String,
        client_secret: String,
        scopes: Vec<String>,
    ) -> Self {
        let scopes = if scopes.is_empty() {
            DEFAULT_SCOPES.iter().map(ToString::to_string).collect()
        } else {
            scopes
        };
        Self {
            http,
            metadata,
            client_id,
            client_secret,
            scopes,
        }
    }

    /// Discovered provider metadata
    #[must_use]
    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    /// True when `offline` is among the requested scopes
    #[must_use]
    pub fn offline_scope(&self) -> bool {
        self.scopes.iter().any(|s| s == "offline")
    }

    /// Build the provider authorize URL for the code flow
    pub fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.metadata.authorization_endpoint)
            .map_err(|e| Error::Config(format!("invalid authorization endpoint: {e}")))?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.client_id);
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("scope", &self.scopes.join(" "));
            if !state.is_empty() {
                params.append_pair("state", state);
            }
            if self.offline_scope() {
                params.append_pair("access_type", "offline");
            }
        }

        Ok(url.to_string())
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    /// Exchange a refresh token for a new access token
    ///
    /// # Errors
    ///
    /// `invalid_grant` becomes [`Error::RefreshTokenExpired`]; the caller
    /// keeps the previous refresh token when none is returned.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
        .map_err(|e| match e {
            Error::InvalidGrant => Error::RefreshTokenExpired,
            other => other,
        })
    }

    /// Resource-owner password grant
    pub async fn password_grant(&self, username: &str, password: &str) -> Result<TokenSet> {
        self.token_request(&[
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
            ("scope", &self.scopes.join(" ")),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    /// Revoke a token, best effort
    ///
    /// Posts `refresh_token=<token>` with HTTP Basic client credentials.
    /// Responses other than 204 are logged and swallowed; only transport
    /// failures surface as errors.
    pub async fn revoke(&self, revocation_url: &str, token: &str) -> Result<()> {
        let response = self
            .http
            .post(revocation_url)
            .basic_auth(
                urlencode(&self.client_id),
                Some(urlencode(&self.client_secret)),
            )
            .form(&[("refresh_token", token)])
            .send()
            .await
            .map_err(|e| Error::IdPUnavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            info!("session revoked at the provider");
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, response = %body, "unexpected response from revocation endpoint");
        }

        Ok(())
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet> {
        let response = self
            .http
            .post(&self.metadata.token_endpoint)
            .form(params)
            .send()
            .await
            .map_err(|e| Error::IdPUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::IdPUnavailable(format!("bad token response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(Error::IdPUnavailable(format!("HTTP {status} - {body}")));
        }

        if let Ok(err) = serde_json::from_str::<TokenEndpointError>(&body) {
            if err.error == "invalid_grant" {
                return Err(Error::InvalidGrant);
            }
            return Err(Error::Internal(format!(
                "token request failed: {} {}",
                err.error, err.error_description
            )));
        }

        Err(Error::Internal(format!(
            "token request failed: HTTP {status} - {body}"
        )))
    }
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
