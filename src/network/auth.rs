//! Token Authentication
//!
//! Validates HS256 tokens presented in the connection handshake.
//! The broker does NOT issue tokens in production; `issue_token` exists for
//! tooling and tests sharing the same secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// HS256 shared secret. `None` disables token auth.
    pub secret: Option<String>,
    /// Clock skew tolerated when checking expiry.
    pub leeway: Duration,
}

impl AuthConfig {
    /// Config for a shared secret with the default leeway.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            leeway: crate::config::DEFAULT_AUTH_LEEWAY,
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.secret().is_some()
    }

    fn secret(&self) -> Option<&str> {
        self.secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
    }
}

/// Claims carried by a broker token.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, used as the client id.
    #[serde(default)]
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: i64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: i64,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Validate a token against the current wall clock.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    validate_token_at(token, config, unix_now())
}

/// Validate a token as of `now` (Unix seconds).
pub fn validate_token_at(token: &str, config: &AuthConfig, now: i64) -> Result<TokenClaims, AuthError> {
    let secret = config.secret().ok_or(AuthError::NotConfigured)?;

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidFormat);
    }

    // Expiry is checked below so the leeway applies exactly once
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_aud = false;

    let key = DecodingKey::from_secret(secret.as_bytes());
    let claims = decode::<TokenClaims>(token, &key, &validation)
        .map_err(map_jwt_error)?
        .claims;

    if claims.sub.trim().is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    if claims.exp <= 0 {
        return Err(AuthError::MissingClaim("exp".into()));
    }

    let leeway = i64::try_from(config.leeway.as_secs()).unwrap_or(i64::MAX);
    if claims.exp.saturating_add(leeway) < now {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

/// Sign a token for `subject` valid for `ttl`.
pub fn issue_token(subject: &str, ttl: Duration, config: &AuthConfig) -> Result<String, AuthError> {
    let secret = config.secret().ok_or(AuthError::NotConfigured)?;
    let now = unix_now();
    let claims = TokenClaims {
        sub: subject.to_string(),
        exp: now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
        iat: now,
        aud: None,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::DecodeError(e.to_string()))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidToken | ErrorKind::InvalidAlgorithm | ErrorKind::Base64(_) => {
            AuthError::InvalidFormat
        }
        ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn create_test_token(claims: &TokenClaims, secret: &str, algorithm: Algorithm) -> String {
        let header = Header::new(algorithm);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn test_claims(exp: i64) -> TokenClaims {
        TokenClaims {
            sub: "pilot-7".into(),
            exp,
            iat: 1_000,
            aud: Some("drift".into()),
        }
    }

    #[test]
    fn test_valid_token_validation() {
        let token = create_test_token(&test_claims(2_000), SECRET, Algorithm::HS256);
        let claims = validate_token_at(&token, &AuthConfig::with_secret(SECRET), 1_500).unwrap();
        assert_eq!(claims.sub, "pilot-7");
        assert_eq!(claims.aud.as_deref(), Some("drift"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = create_test_token(&test_claims(1_000), SECRET, Algorithm::HS256);
        let config = AuthConfig::with_secret(SECRET);

        // Inside the leeway window
        assert!(validate_token_at(&token, &config, 1_002).is_ok());
        assert_eq!(validate_token_at(&token, &config, 1_003), Err(AuthError::Expired));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = create_test_token(&test_claims(2_000), "correct-secret-key-here!!!!!", Algorithm::HS256);
        let result = validate_token_at(&token, &AuthConfig::with_secret("wrong-secret-key-here!!!!!!"), 1_500);
        assert_eq!(result, Err(AuthError::InvalidSignature));
    }

    #[test]
    fn test_wrong_algorithm_rejected() {
        let token = create_test_token(&test_claims(2_000), SECRET, Algorithm::HS512);
        let result = validate_token_at(&token, &AuthConfig::with_secret(SECRET), 1_500);
        assert_eq!(result, Err(AuthError::InvalidFormat));
    }

    #[test]
    fn test_missing_claims_rejected() {
        let config = AuthConfig::with_secret(SECRET);

        let mut claims = test_claims(2_000);
        claims.sub = "  ".into();
        let token = create_test_token(&claims, SECRET, Algorithm::HS256);
        assert_eq!(
            validate_token_at(&token, &config, 1_500),
            Err(AuthError::MissingClaim("sub".into()))
        );

        let token = create_test_token(&test_claims(0), SECRET, Algorithm::HS256);
        assert_eq!(
            validate_token_at(&token, &config, 1_500),
            Err(AuthError::MissingClaim("exp".into()))
        );
    }

    #[test]
    fn test_malformed_token() {
        let config = AuthConfig::with_secret(SECRET);
        assert_eq!(validate_token("", &config), Err(AuthError::InvalidFormat));
        assert!(validate_token("not.a.jwt", &config).is_err());
    }

    #[test]
    fn test_not_configured_error() {
        assert_eq!(
            validate_token("some.jwt.token", &AuthConfig::default()),
            Err(AuthError::NotConfigured)
        );
        let blank = AuthConfig::with_secret("   ");
        assert!(!blank.is_configured());
    }

    #[test]
    fn test_issue_token_round_trip() {
        let config = AuthConfig::with_secret(SECRET);
        let token = issue_token("pilot-9", Duration::from_secs(60), &config).unwrap();
        assert_eq!(validate_token(&token, &config).unwrap().sub, "pilot-9");
    }
}
