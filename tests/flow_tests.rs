//! End-to-end tests of the OAuth flow handlers: authorize, callback, login,
//! logout, and the token/expiry/health/metrics probes.

mod common;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::Value;

fn set_cookies(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(ToString::to_string)
        .collect()
}

#[tokio::test]
async fn authorize_redirects_to_the_provider() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let response = http_client()
        .get(format!("{proxy}/oauth/authorize"))
        .query(&[("state", "abc123")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 307);
    let location = response.headers()["location"].to_str().unwrap();
    assert!(location.starts_with(&format!("{}/authorize?", idp.base_url)));
    assert!(location.contains("client_id=test-client"));
    assert!(location.contains("state=abc123"));
    assert!(location.contains("oauth%2Fcallback"));
}

#[tokio::test]
async fn authorize_is_not_acceptable_without_verification() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let mut config = base_config(&idp, &upstream);
    config.skip_token_verification = true;
    let proxy = spawn_proxy(config).await;

    let response = http_client()
        .get(format!("{proxy}/oauth/authorize"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 406);
}

#[tokio::test]
async fn callback_exchanges_the_code_and_installs_cookies() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let mut config = base_config(&idp, &upstream);
    config.enable_refresh_tokens = true;
    let proxy = spawn_proxy(config).await;

    let state = STANDARD.encode("/dest");
    let response = http_client()
        .get(format!("{proxy}/oauth/callback"))
        .query(&[("code", "valid-code"), ("state", state.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 307);
    assert_eq!(response.headers()["location"], "/dest");

    let cookies = set_cookies(&response);
    let access = cookies
        .iter()
        .find(|c| c.starts_with("kc-access="))
        .expect("access cookie installed");
    assert!(access.contains("HttpOnly"));
    assert!(access.contains("Path=/"));

    // refresh token present and enabled: the encrypted refresh cookie rides
    // along with the opaque-token fallback lifetime
    let refresh = cookies
        .iter()
        .find(|c| c.starts_with("kc-state="))
        .expect("refresh cookie installed");
    assert!(refresh.contains(&format!("Max-Age={}", 240 * 3600)));

    // the cookie value decodes back to the provider's refresh token
    let blob = refresh
        .strip_prefix("kc-state=")
        .unwrap()
        .split(';')
        .next()
        .unwrap();
    let plain = authgate::crypto::decode_text(blob, ENCRYPTION_KEY.as_bytes()).unwrap();
    assert_eq!(plain, REFRESH_TOKEN);
}

#[tokio::test]
async fn callback_defaults_the_redirect_target() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let response = http_client()
        .get(format!("{proxy}/oauth/callback"))
        .query(&[("code", "valid-code")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 307);
    assert_eq!(response.headers()["location"], "/");
}

#[tokio::test]
async fn callback_without_code_is_bad_request() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let response = http_client()
        .get(format!("{proxy}/oauth/callback"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn login_issues_tokens_with_valid_credentials() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let mut config = base_config(&idp, &upstream);
    config.enable_login_handler = true;
    let proxy = spawn_proxy(config).await;

    let response = http_client()
        .post(format!("{proxy}/oauth/login"))
        .form(&[("username", "alice"), ("password", "password")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let cookies = set_cookies(&response);
    assert!(cookies.iter().any(|c| c.starts_with("kc-access=")));

    let body: Value = response.json().await.unwrap();
    assert!(body["access_token"].as_str().is_some_and(|t| !t.is_empty()));
    assert_eq!(body["refresh_token"], REFRESH_TOKEN);
    assert_eq!(body["expires_in"], 300);
    assert_eq!(body["scope"], "openid");
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let mut config = base_config(&idp, &upstream);
    config.enable_login_handler = true;
    let proxy = spawn_proxy(config).await;

    let response = http_client()
        .post(format!("{proxy}/oauth/login"))
        .form(&[("username", "alice"), ("password", "wrong")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn login_requires_both_credentials() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let mut config = base_config(&idp, &upstream);
    config.enable_login_handler = true;
    let proxy = spawn_proxy(config).await;

    let response = http_client()
        .post(format!("{proxy}/oauth/login"))
        .form(&[("username", "alice")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn login_is_not_implemented_when_disabled() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let response = http_client()
        .post(format!("{proxy}/oauth/login"))
        .form(&[("username", "alice"), ("password", "password")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 501);
}

#[tokio::test]
async fn logout_revokes_and_clears_the_session() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let mut config = base_config(&idp, &upstream);
    config.enable_refresh_tokens = true;
    let proxy = spawn_proxy(config).await;

    let token = idp.sign_token(&["user"], 300);
    let blob = authgate::crypto::encode_text(REFRESH_TOKEN, ENCRYPTION_KEY.as_bytes()).unwrap();

    let response = http_client()
        .get(format!("{proxy}/oauth/logout"))
        .header("cookie", format!("kc-access={token}; kc-state={blob}"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);

    // both cookies are expired on the response
    let cookies = set_cookies(&response);
    assert!(
        cookies
            .iter()
            .any(|c| c.starts_with("kc-access=;") && c.contains("Max-Age=0"))
    );
    assert!(
        cookies
            .iter()
            .any(|c| c.starts_with("kc-state=;") && c.contains("Max-Age=0"))
    );

    // the provider saw exactly one revocation, for the refresh token,
    // authenticated with the client credentials
    let revocations = idp.revocations();
    assert_eq!(revocations.len(), 1);
    let (authorization, body) = &revocations[0];
    assert_eq!(body, &format!("refresh_token={REFRESH_TOKEN}"));

    let encoded = authorization.strip_prefix("Basic ").expect("basic auth");
    let decoded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
    assert_eq!(decoded, format!("{CLIENT_ID}:{CLIENT_SECRET}"));
}

#[tokio::test]
async fn logout_redirects_when_asked() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let token = idp.sign_token(&["user"], 300);
    let response = http_client()
        .get(format!("{proxy}/oauth/logout"))
        .query(&[("redirect", "https://example.com/bye")])
        .header("cookie", format!("kc-access={token}"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 307);
    assert_eq!(response.headers()["location"], "https://example.com/bye");
}

#[tokio::test]
async fn logout_without_session_is_bad_request() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let response = http_client()
        .get(format!("{proxy}/oauth/logout"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn token_endpoint_dumps_the_claims() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let token = idp.sign_token(&["user"], 300);
    let response = http_client()
        .get(format!("{proxy}/oauth/token"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["sub"], "test-subject");
    assert_eq!(body["email"], "alice@example.com");

    let response = http_client()
        .get(format!("{proxy}/oauth/token"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn expired_endpoint_probes_session_validity() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let live = idp.sign_token(&["user"], 300);
    let response = http_client()
        .get(format!("{proxy}/oauth/expired"))
        .bearer_auth(live)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let stale = idp.sign_token(&["user"], -5);
    let response = http_client()
        .get(format!("{proxy}/oauth/expired"))
        .bearer_auth(stale)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = http_client()
        .get(format!("{proxy}/oauth/expired"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn health_reports_ok_with_the_version_header() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(base_config(&idp, &upstream)).await;

    let response = http_client()
        .get(format!("{proxy}/oauth/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().contains_key("x-auth-proxy-version"));
    assert_eq!(response.text().await.unwrap(), "OK\n");
}

#[tokio::test]
async fn metrics_endpoint_serves_the_text_exposition() {
    let idp = spawn_idp().await;
    let upstream = spawn_upstream().await;
    let mut config = base_config(&idp, &upstream);
    config.localhost_metrics = true;
    let proxy = spawn_proxy(config).await;

    let response = http_client()
        .get(format!("{proxy}/oauth/metrics"))
        .send()
        .await
        .unwrap();

    // the test client connects over loopback, so the restriction admits it
    assert_eq!(response.status().as_u16(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}
