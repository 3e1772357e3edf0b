use crate::db;
use crate::types::{HeliographError, Result, UserId};
use crate::AppState;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| {
        HeliographError::Internal(
            format!("failed to hash password: {}", e),
            tracing_error::SpanTrace::capture(),
        )
    })?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        HeliographError::Internal(
            format!("invalid password hash: {}", e),
            tracing_error::SpanTrace::capture(),
        )
    })?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[derive(Deserialize, Debug)]
pub struct RegisterBody {
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct LoginBody {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// POST /auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let (username, password) = match (body.username, body.password) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u, p),
        _ => {
            return Err(HeliographError::InvalidRequest(
                "username and password are required".to_string(),
            )
            .into())
        }
    };

    if username.chars().count() < 3 || username.chars().count() > 50 {
        return Err(HeliographError::InvalidRequest(
            "username must be between 3 and 50 characters".to_string(),
        )
        .into());
    }
    if password.chars().count() < 6 {
        return Err(HeliographError::InvalidRequest(
            "password must be at least 6 characters".to_string(),
        )
        .into());
    }

    if db::find_user_by_username(&state.db, &username)
        .await?
        .is_some()
    {
        return Err(HeliographError::Conflict("username already exists".to_string()).into());
    }

    let password_hash = hash_password(&password)?;
    let user = db::create_user(&state.db, &username, &password_hash, body.email.as_deref()).await?;

    tracing::info!("New user registered: {} (id {})", user.username, user.id);

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": "registration successful",
            "user": {
                "id": user.id,
                "username": user.username,
                "email": user.email,
            },
        })),
    ))
}

/// POST /auth/login
///
/// Unknown user and wrong password get the same rejection; the response never
/// says which one it was.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<Json<serde_json::Value>> {
    let (username, password) = match (body.username, body.password) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u, p),
        _ => {
            return Err(HeliographError::InvalidRequest(
                "username and password are required".to_string(),
            )
            .into())
        }
    };

    let user = match db::find_user_by_username(&state.db, &username).await? {
        Some(user) => user,
        None => {
            tracing::warn!("Login failed: unknown user {}", username);
            return Err(
                HeliographError::Unauthorized("invalid username or password".to_string()).into(),
            );
        }
    };

    if !verify_password(&password, &user.password_hash)? {
        tracing::warn!("Login failed: bad password for {}", username);
        return Err(
            HeliographError::Unauthorized("invalid username or password".to_string()).into(),
        );
    }

    let token = state.auth.issue_token(UserId(user.id), &user.username)?;
    tracing::info!("User logged in: {} (id {})", user.username, user.id);

    Ok(Json(serde_json::json!({
        "token": token,
        "user": {
            "id": user.id,
            "username": user.username,
            "email": user.email,
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify_password() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn test_same_password_different_salts() {
        let h1 = hash_password("same").unwrap();
        let h2 = hash_password("same").unwrap();
        assert_ne!(h1, h2);
        assert!(verify_password("same", &h1).unwrap());
        assert!(verify_password("same", &h2).unwrap());
    }
}
