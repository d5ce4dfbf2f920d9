use crate::error::PostError;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token has no username")]
    MissingUsername,
}

impl From<AuthError> for PostError {
    fn from(err: AuthError) -> Self {
        PostError::Unauthorized(err.to_string())
    }
}

/// Claims carried by a bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    pub exp: i64,
    pub iat: i64,
}

/// Verified caller, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub username: String,
}

/// HS256 token verification with a shared secret
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Sign a token for `username`, valid for `ttl`
    ///
    /// Tokens are normally issued by the login service sharing the secret.
    pub fn issue_token(&self, username: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            username: username.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)?.claims;

        if claims.username.trim().is_empty() {
            return Err(AuthError::MissingUsername);
        }

        Ok(claims)
    }

    /// Verify the `Authorization: Bearer` header of a request
    pub fn authenticate(&self, header: Option<&str>) -> Result<AuthUser, AuthError> {
        let token = header
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let claims = self.verify_token(token)?;
        Ok(AuthUser {
            username: claims.username,
        })
    }
}

/// Reject requests without a valid bearer token
pub async fn require_auth(
    State(jwt): State<Arc<JwtService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, PostError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let user = jwt.authenticate(header).map_err(|e| {
        debug!(error = %e, path = %request.uri().path(), "Authentication failed");
        PostError::from(e)
    })?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_secret_key";

    #[test]
    fn test_issue_and_verify() {
        let jwt = JwtService::new(SECRET);
        let token = jwt.issue_token("john", Duration::hours(24)).unwrap();

        let claims = jwt.verify_token(&token).unwrap();
        assert_eq!(claims.username, "john");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret() {
        let token = JwtService::new("secret1")
            .issue_token("john", Duration::hours(1))
            .unwrap();

        let result = JwtService::new("secret2").verify_token(&token);
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token() {
        let jwt = JwtService::new(SECRET);
        let token = jwt.issue_token("john", Duration::hours(-2)).unwrap();

        assert!(matches!(
            jwt.verify_token(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_empty_username_rejected() {
        let jwt = JwtService::new(SECRET);
        let token = jwt.issue_token("  ", Duration::hours(1)).unwrap();

        assert!(matches!(
            jwt.verify_token(&token),
            Err(AuthError::MissingUsername)
        ));
    }

    #[test]
    fn test_authenticate_header() {
        let jwt = JwtService::new(SECRET);
        let token = jwt.issue_token("john", Duration::hours(1)).unwrap();

        let user = jwt
            .authenticate(Some(&format!("Bearer {}", token)))
            .unwrap();
        assert_eq!(user.username, "john");

        assert!(matches!(
            jwt.authenticate(None),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            jwt.authenticate(Some(&token)),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            jwt.authenticate(Some("Bearer ")),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            jwt.authenticate(Some("Bearer not.a.token")),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_auth_error_maps_to_unauthorized() {
        let err = PostError::from(AuthError::MissingToken);
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
