//! Error types for authgate

use std::io;

use thiserror::Error;

/// Result type alias for authgate
pub type Result<T> = std::result::Result<T, Error>;

/// Authgate errors
///
/// The session variants are sentinels the middleware matches on:
/// [`Error::AccessTokenExpired`] is the only verification failure that may
/// trigger a silent refresh; everything else is a hard reject.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No access token in the request, or the token was unparseable
    #[error("No session found in request")]
    NoSession,

    /// The access token is well-formed and signed, but past its expiry
    #[error("Access token has expired")]
    AccessTokenExpired,

    /// Signature, issuer or structure of the token is bad
    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    /// The refresh exchange was rejected for expiry
    #[error("Refresh token has expired")]
    RefreshTokenExpired,

    /// No refresh blob found in the store or the refresh cookie
    #[error("No refresh token for session")]
    RefreshTokenMissing,

    /// The identity provider rejected the grant
    #[error("Invalid grant")]
    InvalidGrant,

    /// Transient session store failure; logged, never user-surfaced
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// Network failure or 5xx from the identity provider
    #[error("Identity provider unavailable: {0}")]
    IdPUnavailable(String),

    /// Audience, role or claim admission check failed
    #[error("Admission denied: {0}")]
    AdmissionDenied(String),

    /// Encryption or decryption failure in the cookie vault
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
