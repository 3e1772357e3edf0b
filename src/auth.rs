use crate::db;
use crate::types::{HeliographError, ObservedError, Result, UserId};
use crate::AppState;
use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Uri};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub username: String,
    /// Expiry, seconds since epoch.
    pub exp: usize,
}

#[derive(Clone)]
pub struct AuthConfig {
    jwt_secret: String,
    pub token_ttl_secs: i64,
}

impl AuthConfig {
    pub fn new(jwt_secret: impl Into<String>, token_ttl_secs: i64) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            token_ttl_secs,
        }
    }

    /// Reads `JWT_SECRET` (required) and `TOKEN_TTL_SECS` (default 3600).
    pub fn from_env() -> Result<Self> {
        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                return Err(HeliographError::InvalidRequest(
                    "environment variable JWT_SECRET is missing or empty".to_string(),
                )
                .into())
            }
        };
        let token_ttl_secs = std::env::var("TOKEN_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);
        Ok(Self {
            jwt_secret,
            token_ttl_secs,
        })
    }

    pub fn issue_token(&self, user_id: UserId, username: &str) -> Result<String> {
        let exp = chrono::Utc::now() + chrono::Duration::seconds(self.token_ttl_secs);
        let claims = Claims {
            sub: user_id.0,
            username: username.to_string(),
            exp: exp.timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| {
            HeliographError::Internal(
                format!("failed to sign token: {}", e),
                tracing_error::SpanTrace::capture(),
            )
            .into()
        })
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map(|data| data.claims)
        .map_err(|e| {
            HeliographError::Unauthorized(format!("invalid or expired token: {}", e)).into()
        })
    }
}

/// --- BEARER EXTRACTION ---

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The push-connection transport (EventSource) cannot set custom headers, so
/// `?token=` is accepted as an equivalent credential carrier.
fn token_from_query(uri: &Uri) -> Option<String> {
    let query = Query::<TokenQuery>::try_from_uri(uri).ok()?;
    query.0.token.filter(|t| !t.is_empty())
}

/// Authenticated caller, resolved from the bearer credential. The gate wraps
/// the push-open and message-submit endpoints; a token whose user has been
/// deleted since issuance is rejected.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: UserId,
    pub username: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = ObservedError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = match bearer_from_headers(&parts.headers).or_else(|| token_from_query(&parts.uri))
        {
            Some(token) => token,
            None => {
                tracing::warn!("[🖥️  -> ⚙️ ] Rejected request: missing bearer token");
                return Err(HeliographError::Unauthorized(
                    "missing bearer token".to_string(),
                )
                .into());
            }
        };

        let claims = state.auth.verify_token(&token).map_err(|e| {
            tracing::warn!("[🖥️  -> ⚙️ ] Rejected request: {}", e);
            e
        })?;

        match db::find_user_by_id(&state.db, UserId(claims.sub)).await? {
            Some(user) => Ok(AuthedUser {
                user_id: UserId(user.id),
                username: user.username,
            }),
            None => {
                tracing::warn!(
                    "[🖥️  -> ⚙️ ] Token references unknown user {}",
                    claims.sub
                );
                Err(HeliographError::Unauthorized("user no longer exists".to_string()).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig::new("test-secret", 3600)
    }

    #[test]
    fn test_issue_and_verify_roundtrip() {
        let auth = config();
        let token = auth.issue_token(UserId(7), "alice").unwrap();
        let claims = auth.verify_token(&token).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.username, "alice");
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let auth = config();
        let claims = Claims {
            sub: 7,
            username: "alice".to_string(),
            exp: 1_000,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        let result = auth.verify_token(&token);
        assert!(result.is_err());
    }

    #[test]
    fn test_token_signed_with_other_secret_is_rejected() {
        let token = AuthConfig::new("other-secret", 3600)
            .issue_token(UserId(1), "bob")
            .unwrap();
        assert!(config().verify_token(&token).is_err());
    }

    #[test]
    fn test_bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(
            bearer_from_headers(&headers).as_deref(),
            Some("abc.def.ghi")
        );

        headers.insert(AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert!(bearer_from_headers(&headers).is_none());
    }

    #[test]
    fn test_token_query_parsing() {
        let uri: Uri = "/chat/stream?token=tok-123".parse().unwrap();
        assert_eq!(token_from_query(&uri).as_deref(), Some("tok-123"));

        let bare: Uri = "/chat/stream".parse().unwrap();
        assert!(token_from_query(&bare).is_none());

        let empty: Uri = "/chat/stream?token=".parse().unwrap();
        assert!(token_from_query(&empty).is_none());
    }
}
