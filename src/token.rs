//! Token codec and verification - JWT parsing, identity projection, JWKS
//! signature validation.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached; refreshed once on unknown `kid`).
//! 3. Verify the signature, then the `iss` claim, then `exp`.
//!
//! Expiry is reported as the distinct [`Error::AccessTokenExpired`] sentinel
//! so the middleware can attempt a silent refresh; every other failure is a
//! hard reject.

use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{Error, Result};

/// Fallback lifetime for refresh records whose token carries no readable
/// expiry (opaque refresh tokens, e.g. Google's)
pub const DEFAULT_REFRESH_LIFETIME: Duration = Duration::from_secs(240 * 3600);

/// Signature algorithms the verifier accepts; a token naming anything else
/// is rejected outright, never downgraded
const ACCEPTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Immutable identity projection of a parsed access or ID token
///
/// Parsing performs no verification; an `Identity` may only be trusted once
/// [`Verifier::verify`] has accepted its `token`.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Subject (`sub` claim)
    pub id: String,
    /// Preferred username
    pub name: String,
    /// Email address
    pub email: String,
    /// Realm and resource roles, order preserved
    pub roles: Vec<String>,
    /// Audience list (`aud` claim, string or array form)
    pub audience: Vec<String>,
    /// Absolute expiry instant (`exp` claim)
    pub expires_at: DateTime<Utc>,
    /// Full payload, retained for claim matching and custom headers
    pub claims: Map<String, Value>,
    /// The encoded compact JWT, forwarded verbatim upstream
    pub token: String,
}

impl Identity {
    /// Parse a compact JWT into its identity projection
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenInvalid`] when the token is not three base64url
    /// segments of JSON, or the payload lacks `exp` or `sub`.
    pub fn from_encoded(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 {
            return Err(Error::TokenInvalid(
                "expected three dot-separated segments".to_string(),
            ));
        }

        let _header: Map<String, Value> = decode_segment(parts[0])?;
        let claims: Map<String, Value> = decode_segment(parts[1])?;

        let exp = claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::TokenInvalid("missing exp claim".to_string()))?;
        let expires_at = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| Error::TokenInvalid("exp out of range".to_string()))?;

        let id = claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::TokenInvalid("missing sub claim".to_string()))?
            .to_string();

        let name = claims
            .get("preferred_username")
            .or_else(|| claims.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let email = claims
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            id,
            name,
            email,
            roles: extract_roles(&claims),
            audience: extract_audience(claims.get("aud")),
            expires_at,
            claims,
            token: raw.to_string(),
        })
    }

    /// True when the token expiry has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// True when the audience list contains `client_id`
    #[must_use]
    pub fn is_audience(&self, client_id: &str) -> bool {
        self.audience.iter().any(|a| a == client_id)
    }

    /// Look up a string-valued claim by name
    #[must_use]
    pub fn string_claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

fn decode_segment(segment: &str) -> Result<Map<String, Value>> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| Error::TokenInvalid("invalid base64url segment".to_string()))?;
    serde_json::from_slice(&raw).map_err(|_| Error::TokenInvalid("segment is not JSON".to_string()))
}

/// Realm roles come from `realm_access.roles`; client roles from
/// `resource_access.<client>.roles`, prefixed `<client>:<role>`.
fn extract_roles(claims: &Map<String, Value>) -> Vec<String> {
    let mut roles = Vec::new();

    if let Some(realm) = claims
        .get("realm_access")
        .and_then(|v| v.get("roles"))
        .and_then(Value::as_array)
    {
        roles.extend(realm.iter().filter_map(Value::as_str).map(String::from));
    }

    if let Some(resource) = claims.get("resource_access").and_then(Value::as_object) {
        for (client, access) in resource {
            if let Some(client_roles) = access.get("roles").and_then(Value::as_array) {
                roles.extend(
                    client_roles
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|r| format!("{client}:{r}")),
                );
            }
        }
    }

    roles
}

fn extract_audience(aud: Option<&Value>) -> Vec<String> {
    match aud {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Compute the access cookie lifetime: the access token expiry, capped by
/// the refresh token expiry when one is readable
#[must_use]
pub fn access_cookie_lifetime(identity: &Identity, refresh_token: Option<&str>) -> Duration {
    let now = Utc::now();
    let mut lifetime = (identity.expires_at - now).to_std().unwrap_or_default();
    if let Some(refresh) = refresh_token {
        if let Ok(refresh_identity) = Identity::from_encoded(refresh) {
            let refresh_lifetime = (refresh_identity.expires_at - now)
                .to_std()
                .unwrap_or_default();
            lifetime = lifetime.min(refresh_lifetime);
        }
    }
    lifetime
}

/// Compute the refresh cookie/record lifetime from the refresh token's own
/// expiry, falling back to [`DEFAULT_REFRESH_LIFETIME`] when it is opaque
#[must_use]
pub fn refresh_lifetime(refresh_token: &str) -> Duration {
    Identity::from_encoded(refresh_token)
        .ok()
        .and_then(|identity| (identity.expires_at - Utc::now()).to_std().ok())
        .unwrap_or(DEFAULT_REFRESH_LIFETIME)
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Token verifier - holds the expected issuer and the cached JWKS
pub struct Verifier {
    http: reqwest::Client,
    issuer: String,
    jwks_uri: String,
    cache: RwLock<Option<CachedJwks>>,
    ttl: Duration,
}

impl Verifier {
    /// Create a verifier for the given issuer with a 1-hour JWKS cache
    #[must_use]
    pub fn new(http: reqwest::Client, issuer: String, jwks_uri: String) -> Self {
        Self {
            http,
            issuer,
            jwks_uri,
            cache: RwLock::new(None),
            ttl: Duration::from_secs(3600),
        }
    }

    /// Verify signature, issuer and expiry of a parsed identity
    ///
    /// # Errors
    ///
    /// [`Error::AccessTokenExpired`] when only the expiry failed;
    /// [`Error::TokenInvalid`] for structural, signature or issuer failures;
    /// [`Error::IdPUnavailable`] when the JWKS could not be fetched.
    pub async fn verify(&self, identity: &Identity) -> Result<()> {
        let header = jsonwebtoken::decode_header(&identity.token)
            .map_err(|e| Error::TokenInvalid(e.to_string()))?;
        let kid = header
            .kid
            .clone()
            .ok_or_else(|| Error::TokenInvalid("missing kid in header".to_string()))?;

        let validation = signature_validation(header.alg)?;
        let decoding_key = self.decoding_key(&kid).await?;

        let token_data: TokenData<Map<String, Value>> =
            jsonwebtoken::decode(&identity.token, &decoding_key, &validation)
                .map_err(|e| Error::TokenInvalid(e.to_string()))?;

        let issuer = token_data
            .claims
            .get("iss")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if issuer != self.issuer {
            return Err(Error::TokenInvalid(format!(
                "issuer mismatch: expected {}, got {issuer}",
                self.issuer
            )));
        }

        if identity.is_expired() {
            return Err(Error::AccessTokenExpired);
        }

        Ok(())
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once if not found
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        let jwks = self.jwks(false).await?;
        if let Some(key) = decoding_key_for(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "key not found in cached JWKS, refreshing");
        let jwks = self.jwks(true).await?;
        decoding_key_for(&jwks, kid)
            .ok_or_else(|| Error::TokenInvalid(format!("unknown key id: {kid}")))
    }

    async fn jwks(&self, force_refresh: bool) -> Result<JwkSet> {
        if !force_refresh {
            let guard = self.cache.read();
            if let Some(cached) = &*guard {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(jwks_uri = %self.jwks_uri, "fetching JWKS");
        let jwks: JwkSet = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| Error::IdPUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::IdPUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::IdPUnavailable(e.to_string()))?;

        *self.cache.write() = Some(CachedJwks {
            keys: jwks.clone(),
            fetched_at: Instant::now(),
        });

        Ok(jwks)
    }
}

/// Configure `jsonwebtoken` to check nothing but the signature
///
/// Issuer and expiry are this module's own checks (see [`Verifier::verify`])
/// so that expiry can surface as its distinct sentinel. Expiry gets no
/// clock-skew allowance either: a token counts as lapsed the moment its
/// `exp` passes, which is what lets the silent refresh take over seamlessly.
fn signature_validation(alg: Algorithm) -> Result<Validation> {
    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(Error::TokenInvalid(format!(
            "token algorithm {alg:?} is not accepted"
        )));
    }

    let mut validation = Validation::new(alg);
    validation.leeway = 0;
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    Ok(validation)
}

/// Look up the JWK published under `kid` and turn it into a `DecodingKey`
///
/// Only asymmetric key material qualifies; a provider never publishes the
/// symmetric secrets its tokens would need.
fn decoding_key_for(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|candidate| candidate.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(params) => {
            DecodingKey::from_rsa_components(&params.n, &params.e).ok()
        }
        AlgorithmParameters::EllipticCurve(params) => {
            DecodingKey::from_ec_components(&params.x, &params.y).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn encode_jwt(payload: &Value) -> String {
        let header = json!({"alg": "RS256", "typ": "JWT", "kid": "test"});
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap()),
            URL_SAFE_NO_PAD.encode(b"unsigned")
        )
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3600
    }

    #[test]
    fn parse_projects_identity_fields() {
        let token = encode_jwt(&json!({
            "sub": "user-1",
            "exp": future_exp(),
            "email": "alice@example.com",
            "preferred_username": "alice",
            "aud": "my-client",
            "realm_access": {"roles": ["user", "admin"]},
        }));

        let identity = Identity::from_encoded(&token).unwrap();
        assert_eq!(identity.id, "user-1");
        assert_eq!(identity.name, "alice");
        assert_eq!(identity.email, "alice@example.com");
        assert_eq!(identity.roles, vec!["user", "admin"]);
        assert_eq!(identity.audience, vec!["my-client"]);
        assert!(!identity.is_expired());
        assert_eq!(identity.token, token);
    }

    #[test]
    fn parse_collects_resource_roles() {
        let token = encode_jwt(&json!({
            "sub": "user-1",
            "exp": future_exp(),
            "realm_access": {"roles": ["user"]},
            "resource_access": {"account": {"roles": ["manage"]}},
        }));

        let identity = Identity::from_encoded(&token).unwrap();
        assert!(identity.roles.contains(&"user".to_string()));
        assert!(identity.roles.contains(&"account:manage".to_string()));
    }

    #[test]
    fn parse_accepts_audience_array() {
        let token = encode_jwt(&json!({
            "sub": "user-1",
            "exp": future_exp(),
            "aud": ["first", "second"],
        }));

        let identity = Identity::from_encoded(&token).unwrap();
        assert!(identity.is_audience("first"));
        assert!(identity.is_audience("second"));
        assert!(!identity.is_audience("third"));
    }

    #[test]
    fn parse_rejects_missing_exp_or_sub() {
        let no_exp = encode_jwt(&json!({"sub": "user-1"}));
        assert!(matches!(
            Identity::from_encoded(&no_exp),
            Err(Error::TokenInvalid(_))
        ));

        let no_sub = encode_jwt(&json!({"exp": future_exp()}));
        assert!(matches!(
            Identity::from_encoded(&no_sub),
            Err(Error::TokenInvalid(_))
        ));
    }

    #[test]
    fn parse_rejects_opaque_tokens() {
        assert!(Identity::from_encoded("not-a-jwt").is_err());
        assert!(Identity::from_encoded("a.b").is_err());
        assert!(Identity::from_encoded("!!.!!.!!").is_err());
    }

    #[test]
    fn expired_token_parses_but_reports_expired() {
        let token = encode_jwt(&json!({
            "sub": "user-1",
            "exp": Utc::now().timestamp() - 10,
        }));
        let identity = Identity::from_encoded(&token).unwrap();
        assert!(identity.is_expired());
    }

    #[test]
    fn string_claim_lookup() {
        let token = encode_jwt(&json!({
            "sub": "user-1",
            "exp": future_exp(),
            "item": "test",
            "count": 3,
        }));
        let identity = Identity::from_encoded(&token).unwrap();
        assert_eq!(identity.string_claim("item"), Some("test"));
        assert_eq!(identity.string_claim("count"), None);
        assert_eq!(identity.string_claim("absent"), None);
    }

    #[test]
    fn access_lifetime_capped_by_refresh_expiry() {
        let access = encode_jwt(&json!({"sub": "s", "exp": Utc::now().timestamp() + 3600}));
        let refresh = encode_jwt(&json!({"sub": "s", "exp": Utc::now().timestamp() + 60}));
        let identity = Identity::from_encoded(&access).unwrap();

        let lifetime = access_cookie_lifetime(&identity, Some(&refresh));
        assert!(lifetime <= Duration::from_secs(60));

        let uncapped = access_cookie_lifetime(&identity, None);
        assert!(uncapped > Duration::from_secs(3500));
    }

    #[test]
    fn unaccepted_algorithms_are_refused() {
        assert!(signature_validation(Algorithm::HS256).is_err());
        assert!(signature_validation(Algorithm::HS512).is_err());

        let validation = signature_validation(Algorithm::RS256).unwrap();
        assert_eq!(validation.leeway, 0);
        assert!(!validation.validate_exp);
        assert!(!validation.validate_aud);
        assert!(validation.required_spec_claims.is_empty());
    }

    #[test]
    fn jwks_lookup_requires_kid_and_asymmetric_material() {
        let jwks: JwkSet = serde_json::from_value(json!({
            "keys": [
                {"kty": "oct", "kid": "symmetric", "k": "c2VjcmV0"},
                {"kty": "RSA", "kid": "signing", "n": "c29tZS1tb2R1bHVz", "e": "AQAB"},
            ]
        }))
        .unwrap();

        assert!(decoding_key_for(&jwks, "absent").is_none());
        assert!(decoding_key_for(&jwks, "symmetric").is_none());
        assert!(decoding_key_for(&jwks, "signing").is_some());
    }

    #[test]
    fn opaque_refresh_lifetime_falls_back_to_default() {
        assert_eq!(refresh_lifetime("opaque-google-token"), DEFAULT_REFRESH_LIFETIME);

        let refresh = encode_jwt(&json!({"sub": "s", "exp": Utc::now().timestamp() + 120}));
        assert!(refresh_lifetime(&refresh) <= Duration::from_secs(120));
    }
}
