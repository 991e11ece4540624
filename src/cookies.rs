//! Access and refresh cookie handling
//!
//! The access cookie carries the encoded JWT verbatim; the refresh cookie
//! carries the vault-encrypted refresh token. Both are `HttpOnly`, scoped to
//! `/`, marked `Secure` when the effective scheme is https, and carry the
//! configured `SameSite` attribute.

use std::time::Duration;

use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, SET_COOKIE},
};
use tracing::warn;

use crate::config::Config;

/// Extract a cookie value from the request headers
#[must_use]
pub fn request_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn build_cookie(
    name: &str,
    value: &str,
    max_age: Duration,
    secure: bool,
    same_site: &str,
) -> String {
    let mut cookie = format!(
        "{name}={value}; Path=/; Max-Age={}; HttpOnly",
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    match same_site {
        "strict" => cookie.push_str("; SameSite=Strict"),
        "none" => cookie.push_str("; SameSite=None"),
        _ => cookie.push_str("; SameSite=Lax"),
    }
    cookie
}

fn append_cookie(headers: &mut HeaderMap, cookie: &str) {
    match HeaderValue::from_str(cookie) {
        Ok(value) => {
            headers.append(SET_COOKIE, value);
        }
        Err(e) => warn!(error = %e, "dropping unrepresentable cookie value"),
    }
}

/// Install the access-token cookie on the response
pub fn drop_access_cookie(
    headers: &mut HeaderMap,
    config: &Config,
    token: &str,
    max_age: Duration,
    secure: bool,
) {
    let cookie = build_cookie(
        &config.cookie_access_name,
        token,
        max_age,
        secure,
        &config.same_site_cookie,
    );
    append_cookie(headers, &cookie);
}

/// Install the encrypted refresh-token cookie on the response
pub fn drop_refresh_cookie(
    headers: &mut HeaderMap,
    config: &Config,
    blob: &str,
    max_age: Duration,
    secure: bool,
) {
    let cookie = build_cookie(
        &config.cookie_refresh_name,
        blob,
        max_age,
        secure,
        &config.same_site_cookie,
    );
    append_cookie(headers, &cookie);
}

/// Expire both session cookies on the response
pub fn clear_all_cookies(headers: &mut HeaderMap, config: &Config, secure: bool) {
    for name in [&config.cookie_access_name, &config.cookie_refresh_name] {
        let cookie = build_cookie(name, "", Duration::ZERO, secure, &config.same_site_cookie);
        append_cookie(headers, &cookie);
    }
}
