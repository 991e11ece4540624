//! Request pipeline middleware
//!
//! Protected requests flow through four stages: resource matching,
//! authentication (with silent refresh), admission, and identity header
//! injection, before being forwarded upstream. Each stage runs on the
//! request's own task; nothing here takes a process-wide lock.
//!
//! Silent refresh is deliberately racy: two requests carrying the same
//! expired access token may each exchange the refresh token. The provider
//! tolerates repeated refreshes and store writes are last-writer-wins keyed
//! by the newest access-token fingerprint, so no cross-request lock is
//! needed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::cookies;
use crate::crypto;
use crate::resources::{self, Resource};
use crate::router::AppState;
use crate::store::token_fingerprint;
use crate::token::{self, Identity};
use crate::{Error, Result};

/// Count every request by method and response code
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let response = next.run(request).await;
    metrics::counter!(
        "authgate_http_requests_total",
        "method" => method,
        "code" => response.status().as_u16().to_string(),
    )
    .increment(1);
    response
}

/// Match the request against the configured resources
///
/// Matching happens on the canonicalized path; a literal `..` segment in
/// the request is refused outright so traversal can never reach a guarded
/// subtree under a different descriptor.
pub async fn resource_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let raw_path = request.uri().path().to_string();
    if resources::has_traversal(&raw_path) {
        warn!(path = %raw_path, client_ip = %client_ip(&request), "refusing path traversal");
        return StatusCode::FORBIDDEN.into_response();
    }

    let cleaned = resources::clean_path(&raw_path);
    let method = request.method().as_str().to_string();
    if let Some(resource) = resources::match_resource(&state.config.resources, &method, &cleaned) {
        debug!(resource = %resource.url, path = %cleaned, "request matched protected resource");
        request.extensions_mut().insert(resource.clone());
    }

    next.run(request).await
}

/// Authenticate the request and silently refresh an expired access token
pub async fn authentication_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(resource) = request.extensions().get::<Resource>().cloned() else {
        return next.run(request).await;
    };
    if resource.white_listed {
        debug!(resource = %resource.url, "whitelisted resource, skipping authentication");
        return next.run(request).await;
    }

    let config = &state.config;
    let client_ip = client_ip(&request);
    let secure = is_secure_request(request.headers(), config);

    let identity = match get_identity(request.headers(), config) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(client_ip = %client_ip, error = %e, "no session found in request, redirecting for authorization");
            return redirect_to_authorization(&state, &request);
        }
    };

    if config.skip_token_verification {
        warn!("skip token verification enabled, signatures not checked - TESTING ONLY");
        if identity.is_expired() {
            warn!(client_ip = %client_ip, username = %identity.name, "session has expired with verification switched off");
            return redirect_to_authorization(&state, &request);
        }
        request.extensions_mut().insert(identity);
        return next.run(request).await;
    }

    match state.verifier.verify(&identity).await {
        Ok(()) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(Error::AccessTokenExpired) => {
            refresh_session(state.clone(), request, next, identity, &client_ip, secure).await
        }
        Err(Error::IdPUnavailable(e)) => {
            warn!(client_ip = %client_ip, error = %e, "provider unavailable during verification");
            redirect_to_authorization(&state, &request)
        }
        Err(e) => {
            error!(client_ip = %client_ip, error = %e, "access token failed verification");
            access_forbidden(&state, &request)
        }
    }
}

/// The silent refresh branch of the authentication middleware
async fn refresh_session(
    state: Arc<AppState>,
    mut request: Request<Body>,
    next: Next,
    identity: Identity,
    client_ip: &str,
    secure: bool,
) -> Response {
    let config = &state.config;

    if !config.enable_refresh_tokens {
        warn!(client_ip = %client_ip, email = %identity.email, "session expired and access token refreshing is disabled");
        return redirect_to_authorization(&state, &request);
    }

    info!(client_ip = %client_ip, email = %identity.email, "access token expired, attempting to refresh");

    let refresh_token = match retrieve_refresh_token(&state, request.headers(), &identity).await {
        Ok(token) => token,
        Err(e) => {
            warn!(client_ip = %client_ip, email = %identity.email, error = %e, "unable to find a refresh token for user");
            return redirect_to_authorization(&state, &request);
        }
    };

    let tokens = match state.oidc.refresh(&refresh_token).await {
        Ok(tokens) => tokens,
        Err(Error::RefreshTokenExpired) => {
            warn!(client_ip = %client_ip, email = %identity.email, "refresh token has expired, cannot retrieve access token");
            metrics::counter!("authgate_token_refresh_total", "result" => "expired").increment(1);
            let mut response = redirect_to_authorization(&state, &request);
            cookies::clear_all_cookies(response.headers_mut(), config, secure);
            return response;
        }
        Err(e) => {
            error!(error = %e, "failed to refresh the access token");
            metrics::counter!("authgate_token_refresh_total", "result" => "error").increment(1);
            return redirect_to_authorization(&state, &request);
        }
    };

    let new_identity = match Identity::from_encoded(&tokens.access_token) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "refreshed access token is unparseable");
            return access_forbidden(&state, &request);
        }
    };

    // The provider may rotate the refresh token; otherwise keep the old one
    let active_refresh = tokens.refresh_token.unwrap_or(refresh_token);
    let expires_in = token::access_cookie_lifetime(&new_identity, Some(&active_refresh));
    metrics::counter!("authgate_token_refresh_total", "result" => "success").increment(1);

    info!(
        client_ip = %client_ip,
        cookie_name = %config.cookie_access_name,
        email = %new_identity.email,
        expires_in = ?expires_in,
        "injecting the refreshed access token cookie"
    );

    // Store maintenance is fire-and-forget: the cookie-backed state is
    // already complete, a failed write only costs a future store miss
    if let Some(store) = state.store.clone() {
        let old_fingerprint = token_fingerprint(&identity.token);
        let new_fingerprint = token_fingerprint(&new_identity.token);
        let ttl = token::refresh_lifetime(&active_refresh);
        match crypto::encode_text(&active_refresh, config.encryption_key.as_bytes()) {
            Ok(encrypted) => {
                tokio::spawn(async move {
                    if let Err(e) = store.delete(&old_fingerprint).await {
                        warn!(error = %e, "failed to remove the old refresh record");
                    }
                    if let Err(e) = store.put(&new_fingerprint, &encrypted, ttl).await {
                        warn!(error = %e, "failed to store the refresh record");
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to encrypt the refresh token for the store"),
        }
    }

    let access_token = new_identity.token.clone();
    request.extensions_mut().insert(new_identity);
    let mut response = next.run(request).await;
    cookies::drop_access_cookie(response.headers_mut(), config, &access_token, expires_in, secure);
    response
}

/// Check the authenticated identity against the matched resource
pub async fn admission_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(resource) = request.extensions().get::<Resource>().cloned() else {
        return next.run(request).await;
    };
    if resource.white_listed {
        return next.run(request).await;
    }
    let Some(user) = request.extensions().get::<Identity>().cloned() else {
        return access_forbidden(&state, &request);
    };

    let config = &state.config;

    // the token must have been issued for us
    if !config.client_id.is_empty() && !user.is_audience(&config.client_id) {
        warn!(
            client_id = %config.client_id,
            email = %user.email,
            audience = ?user.audience,
            "access token audience is not us, denying access"
        );
        return access_forbidden(&state, &request);
    }

    if !resource.roles.is_empty() {
        let missing = resource
            .roles
            .iter()
            .any(|role| !user.roles.contains(role));
        if missing {
            warn!(
                access = "denied",
                email = %user.email,
                resource = %resource.url,
                required = ?resource.roles,
                "access denied, invalid roles"
            );
            return access_forbidden(&state, &request);
        }
    }

    for (claim, matcher) in &state.claim_matches {
        match user.string_claim(claim) {
            Some(value) if matcher.is_match(value) => {}
            Some(value) => {
                warn!(
                    access = "denied",
                    claim = %claim,
                    email = %user.email,
                    issued = %value,
                    resource = %resource.url,
                    "token claim does not match the claim requirement"
                );
                return access_forbidden(&state, &request);
            }
            None => {
                warn!(
                    access = "denied",
                    claim = %claim,
                    email = %user.email,
                    resource = %resource.url,
                    "token does not have the claim"
                );
                return access_forbidden(&state, &request);
            }
        }
    }

    debug!(
        access = "permitted",
        email = %user.email,
        resource = %resource.url,
        "access permitted to resource"
    );
    next.run(request).await
}

/// Inject the identity headers for the upstream
pub async fn headers_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    for (name, value) in &state.config.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            request.headers_mut().insert(name, value);
        }
    }

    if let Some(user) = request.extensions().get::<Identity>().cloned() {
        let headers = request.headers_mut();
        set_header(headers, "x-auth-email", &user.email);
        set_header(headers, "x-auth-expiresin", &user.expires_at.to_rfc3339());
        set_header(headers, "x-auth-roles", &user.roles.join(","));
        set_header(headers, "x-auth-subject", &user.id);
        set_header(headers, "x-auth-token", &user.token);
        set_header(headers, "x-auth-userid", &user.name);
        set_header(headers, "x-auth-username", &user.name);

        if state.config.enable_authorization_header {
            set_header(headers, "authorization", &format!("Bearer {}", user.token));
        }

        for (claim, header_name) in &state.custom_claim_headers {
            if let Some(value) = user.claims.get(claim) {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if let Ok(value) = HeaderValue::from_str(&rendered) {
                    request.headers_mut().insert(header_name.clone(), value);
                }
            }
        }
    }

    next.run(request).await
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Extract the identity from the access cookie or the bearer header
///
/// # Errors
///
/// Returns [`Error::NoSession`] when neither is present or the token does
/// not parse.
pub fn get_identity(headers: &HeaderMap, config: &Config) -> Result<Identity> {
    let raw = cookies::request_cookie(headers, &config.cookie_access_name)
        .or_else(|| bearer_token(headers))
        .ok_or(Error::NoSession)?;
    Identity::from_encoded(&raw).map_err(|_| Error::NoSession)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(String::from)
}

/// Load and decrypt the refresh token from the store, else the cookie
pub async fn retrieve_refresh_token(
    state: &AppState,
    headers: &HeaderMap,
    identity: &Identity,
) -> Result<String> {
    let blob = match &state.store {
        Some(store) => match store.get(&token_fingerprint(&identity.token)).await {
            Ok(found) => found,
            Err(e) => {
                // store outages must never fail the request
                warn!(error = %e, "session store read failed, falling back to cookie");
                None
            }
        },
        None => None,
    };

    let blob = blob
        .or_else(|| cookies::request_cookie(headers, &state.config.cookie_refresh_name))
        .ok_or(Error::RefreshTokenMissing)?;

    crypto::decode_text(&blob, state.config.encryption_key.as_bytes())
}

/// Redirect the client into the authorization flow, or 401 when redirects
/// are disabled
pub fn redirect_to_authorization(state: &AppState, request: &Request<Body>) -> Response {
    if state.config.no_redirects {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let uri = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let encoded = URL_SAFE_NO_PAD.encode(uri);
    Redirect::temporary(&format!(
        "{}/authorize?state={encoded}",
        state.config.oauth_uri
    ))
    .into_response()
}

/// Deny the request: 403 when redirects are disabled, else back to the
/// authorization flow. Never 200.
pub fn access_forbidden(state: &AppState, request: &Request<Body>) -> Response {
    if state.config.no_redirects {
        return StatusCode::FORBIDDEN.into_response();
    }
    redirect_to_authorization(state, request)
}

/// Best-effort client address for log correlation
pub fn client_ip(request: &Request<Body>) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return forwarded.trim().to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

/// Whether cookies must be marked Secure for this request
pub fn is_secure_request(headers: &HeaderMap, config: &Config) -> bool {
    if config.secure_cookie {
        return true;
    }
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::json;

    use super::*;

    fn encode_jwt(payload: &Value) -> String {
        let header = json!({"alg": "RS256", "kid": "test"});
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap()),
            URL_SAFE_NO_PAD.encode(b"sig")
        )
    }

    fn valid_token() -> String {
        encode_jwt(&json!({
            "sub": "user-1",
            "exp": chrono::Utc::now().timestamp() + 600,
        }))
    }

    #[test]
    fn identity_from_cookie() {
        let config = Config::default();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("kc-access={}", valid_token())).unwrap(),
        );
        let identity = get_identity(&headers, &config).unwrap();
        assert_eq!(identity.id, "user-1");
    }

    #[test]
    fn identity_from_bearer_header() {
        let config = Config::default();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", valid_token())).unwrap(),
        );
        let identity = get_identity(&headers, &config).unwrap();
        assert_eq!(identity.id, "user-1");
    }

    #[test]
    fn missing_or_garbage_session_is_no_session() {
        let config = Config::default();
        let headers = HeaderMap::new();
        assert!(matches!(
            get_identity(&headers, &config),
            Err(Error::NoSession)
        ));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("kc-access=garbage"));
        assert!(matches!(
            get_identity(&headers, &config),
            Err(Error::NoSession)
        ));
    }

    #[test]
    fn secure_request_detection() {
        let config = Config::default();
        let mut headers = HeaderMap::new();
        assert!(!is_secure_request(&headers, &config));

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert!(is_secure_request(&headers, &config));

        let forced = Config {
            secure_cookie: true,
            ..Config::default()
        };
        assert!(is_secure_request(&HeaderMap::new(), &forced));
    }
}
