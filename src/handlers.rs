//! OAuth flow handlers
//!
//! The user-facing state machine: starting the authorization-code flow,
//! receiving the provider callback, password-grant login, logout with
//! revocation, plus the token/expiry/health/metrics probes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Form, Query, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::cookies;
use crate::crypto;
use crate::middleware::{
    access_forbidden, client_ip, get_identity, is_secure_request, retrieve_refresh_token,
};
use crate::router::AppState;
use crate::store::token_fingerprint;
use crate::token::{self, Identity};
use crate::{Error, VERSION_HEADER};

/// Query parameters of the authorize endpoint
#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    /// Opaque state passed through the provider round-trip
    #[serde(default)]
    pub state: Option<String>,
}

/// GET /oauth/authorize - start the authorization-code flow
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizeParams>,
    request: Request<Body>,
) -> Response {
    // no provider round-trip will verify anything in this mode
    if state.config.skip_token_verification {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let redirect_uri = derive_redirection_url(request.headers(), &state.config);
    let auth_url = match state
        .oidc
        .authorize_url(&redirect_uri, params.state.as_deref().unwrap_or(""))
    {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "failed to build the provider authorize URL");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    debug!(
        auth_url = %auth_url,
        client_ip = %client_ip(&request),
        "incoming authorization request"
    );

    Redirect::temporary(&auth_url).into_response()
}

/// Query parameters of the callback endpoint
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code issued by the provider
    #[serde(default)]
    pub code: Option<String>,
    /// Base64-encoded post-login redirect target
    #[serde(default)]
    pub state: Option<String>,
}

/// GET /oauth/callback - the provider redirect sink
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
    request: Request<Body>,
) -> Response {
    let config = &state.config;

    if config.skip_token_verification {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let redirect_uri = derive_redirection_url(request.headers(), &state.config);
    let tokens = match state.oidc.exchange_code(code, &redirect_uri).await {
        Ok(tokens) => tokens,
        Err(Error::IdPUnavailable(e)) => {
            error!(error = %e, "provider unavailable during code exchange");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Err(e) => {
            error!(error = %e, "unable to exchange code for access token");
            return access_forbidden(&state, &request);
        }
    };

    // The ID token establishes the session; verify it before trusting
    let id_token = tokens.id_token.as_deref().unwrap_or(&tokens.access_token);
    let mut identity = match Identity::from_encoded(id_token) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "unable to parse id token for identity");
            return access_forbidden(&state, &request);
        }
    };
    if let Err(e) = state.verifier.verify(&identity).await {
        error!(error = %e, "unable to verify the id token");
        return access_forbidden(&state, &request);
    }

    // Prefer the access token as the session credential when it parses;
    // some providers issue opaque access tokens, then the ID token serves
    match Identity::from_encoded(&tokens.access_token) {
        Ok(access_identity) => identity = access_identity,
        Err(e) => {
            warn!(error = %e, "unable to parse the access token, using id token only");
        }
    }

    info!(
        email = %identity.email,
        expires = %identity.expires_at.to_rfc3339(),
        "issuing access token for user"
    );

    let secure = is_secure_request(request.headers(), config);
    let target = params
        .state
        .as_deref()
        .and_then(decode_state)
        .unwrap_or_else(|| "/".to_string());
    let mut response = Redirect::temporary(&target).into_response();

    if config.enable_refresh_tokens && tokens.refresh_token.is_some() {
        let refresh = tokens.refresh_token.as_deref().unwrap_or_default();
        let encrypted = match crypto::encode_text(refresh, config.encryption_key.as_bytes()) {
            Ok(blob) => blob,
            Err(e) => {
                error!(error = %e, "failed to encrypt the refresh token");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let lifetime = token::access_cookie_lifetime(&identity, Some(refresh));
        cookies::drop_access_cookie(response.headers_mut(), config, &identity.token, lifetime, secure);

        match &state.store {
            Some(store) => {
                let ttl = token::refresh_lifetime(refresh);
                if let Err(e) = store
                    .put(&token_fingerprint(&identity.token), &encrypted, ttl)
                    .await
                {
                    warn!(error = %e, "failed to save the refresh token in the store");
                }
            }
            None => {
                let ttl = token::refresh_lifetime(refresh);
                cookies::drop_refresh_cookie(response.headers_mut(), config, &encrypted, ttl, secure);
            }
        }
    } else {
        let lifetime = token::access_cookie_lifetime(&identity, None);
        cookies::drop_access_cookie(response.headers_mut(), config, &identity.token, lifetime, secure);
    }

    response
}

/// Form body of the login endpoint
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    /// Resource-owner username
    #[serde(default)]
    pub username: Option<String>,
    /// Resource-owner password
    #[serde(default)]
    pub password: Option<String>,
}

/// POST /oauth/login - password-grant login
pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let config = &state.config;

    if !config.enable_login_handler {
        warn!("attempt to login when the login handler is disabled");
        return StatusCode::NOT_IMPLEMENTED.into_response();
    }

    let (Some(username), Some(password)) = (
        form.username.filter(|u| !u.is_empty()),
        form.password.filter(|p| !p.is_empty()),
    ) else {
        warn!("login request does not have both username and password");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let tokens = match state.oidc.password_grant(&username, &password).await {
        Ok(tokens) => tokens,
        Err(Error::InvalidGrant) => {
            warn!(username = %username, "invalid user credentials provided");
            metrics::counter!("authgate_login_total", "result" => "invalid").increment(1);
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(e) => {
            error!(error = %e, "unable to request the access token via password grant");
            metrics::counter!("authgate_login_total", "result" => "error").increment(1);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let identity = match Identity::from_encoded(&tokens.access_token) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "unable to decode the access token");
            return StatusCode::NOT_IMPLEMENTED.into_response();
        }
    };

    metrics::counter!("authgate_login_total", "result" => "success").increment(1);

    let secure = is_secure_request(&headers, config);
    let lifetime = token::access_cookie_lifetime(&identity, None);
    let mut response = Json(json!({
        "id_token": tokens.id_token,
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "expires_in": tokens.expires_in,
        "scope": tokens.scope,
    }))
    .into_response();
    cookies::drop_access_cookie(response.headers_mut(), config, &tokens.access_token, lifetime, secure);
    response
}

/// Query parameters of the logout endpoint
#[derive(Debug, Deserialize)]
pub struct LogoutParams {
    /// Where to send the user agent after logout
    #[serde(default)]
    pub redirect: Option<String>,
}

/// GET /oauth/logout - revoke the session and clear the cookies
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogoutParams>,
    request: Request<Body>,
) -> Response {
    let config = &state.config;

    let Ok(user) = get_identity(request.headers(), config) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // The refresh token is the preferred revocation subject; it is the
    // long-lived credential
    let mut revocation_subject = user.token.clone();
    if let Ok(refresh) = retrieve_refresh_token(&state, request.headers(), &user).await {
        revocation_subject = refresh;
    }

    let secure = is_secure_request(request.headers(), config);

    if let Some(store) = state.store.clone() {
        let fingerprint = token_fingerprint(&user.token);
        tokio::spawn(async move {
            if let Err(e) = store.delete(&fingerprint).await {
                error!(error = %e, "unable to remove the refresh token from store");
            }
        });
    }

    let revocation_url = if config.revocation_endpoint.is_empty() {
        state
            .oidc
            .metadata()
            .end_session_endpoint
            .clone()
            .unwrap_or_default()
    } else {
        config.revocation_endpoint.clone()
    };

    if revocation_url.is_empty() {
        debug!("no revocation endpoint configured or discovered, skipping");
    } else if let Err(e) = state.oidc.revoke(&revocation_url, &revocation_subject).await {
        error!(error = %e, "unable to post to revocation endpoint");
    } else {
        info!(email = %user.email, "user logged out of the endpoint");
    }

    let mut response = match params.redirect.as_deref().filter(|r| !r.is_empty()) {
        Some(target) => Redirect::temporary(target).into_response(),
        None => StatusCode::OK.into_response(),
    };
    cookies::clear_all_cookies(response.headers_mut(), config, secure);
    response
}

/// GET /oauth/token - dump the decoded token payload, a debug aid
pub async fn token(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    match get_identity(request.headers(), &state.config) {
        Ok(user) => Json(Value::Object(user.claims)).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            format!("unable to retrieve session, error: {e}"),
        )
            .into_response(),
    }
}

/// GET /oauth/expired - probe whether the request carries a live session
pub async fn expired(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    match get_identity(request.headers(), &state.config) {
        Ok(user) if !user.is_expired() => StatusCode::OK.into_response(),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// GET /oauth/health - liveness probe
pub async fn health() -> impl IntoResponse {
    ([(VERSION_HEADER, env!("CARGO_PKG_VERSION"))], "OK\n")
}

/// GET /oauth/metrics - Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    if state.config.localhost_metrics {
        let loopback = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .is_some_and(|info| info.0.ip().is_loopback());
        if !loopback {
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// Derive the redirect URI handed to the provider
///
/// The configured URL wins; otherwise forwarded headers, falling back to
/// the request host with the scheme http (TLS terminates elsewhere, https
/// arrives via `X-Forwarded-Proto`).
fn derive_redirection_url(headers: &HeaderMap, config: &crate::config::Config) -> String {
    let base = if config.redirection_url.is_empty() {
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        let host = headers
            .get("x-forwarded-host")
            .or_else(|| headers.get(header::HOST))
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("{scheme}://{host}")
    } else {
        config.redirection_url.trim_end_matches('/').to_string()
    };

    format!("{base}{}/callback", config.oauth_uri)
}

/// Decode the state parameter: standard base64 first, then the url-safe
/// alphabet the middleware uses for redirects
fn decode_state(encoded: &str) -> Option<String> {
    let raw = STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .ok()?;
    let target = String::from_utf8(raw).ok()?;
    if target.chars().any(char::is_control) {
        return None;
    }
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_state_accepts_both_alphabets() {
        assert_eq!(decode_state("L2Rlc3Q=").as_deref(), Some("/dest"));
        assert_eq!(decode_state("L2Rlc3Q").as_deref(), Some("/dest"));
        assert_eq!(
            decode_state(&URL_SAFE_NO_PAD.encode("/a?b=c&d=e")).as_deref(),
            Some("/a?b=c&d=e")
        );
        assert!(decode_state("%%%").is_none());
    }
}
