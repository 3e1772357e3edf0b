use crate::types::{ClientId, HeliographError, Result, UserId};
use sqlx::sqlite::SqlitePool;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(HeliographError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(HeliographError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(HeliographError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    // WAL mode and performance pragmas
    let pragmas = [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA busy_timeout = 5000",
    ];

    for pragma in pragmas {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(HeliographError::Database(e).into());
        }
    }
    Ok(())
}

/// --- IDENTITY STORE ---

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
}

pub async fn create_user(
    pool: &DbPool,
    username: &str,
    password_hash: &str,
    email: Option<&str>,
) -> Result<UserRecord> {
    let user = sqlx::query_as::<_, UserRecord>(
        "INSERT INTO users (username, password_hash, email) VALUES (?, ?, ?) \
         RETURNING id, username, password_hash, email",
    )
    .bind(username)
    .bind(password_hash)
    .bind(email)
    .fetch_one(pool)
    .await?;
    Ok(user)
}

pub async fn find_user_by_username(pool: &DbPool, username: &str) -> Result<Option<UserRecord>> {
    let user = sqlx::query_as::<_, UserRecord>(
        "SELECT id, username, password_hash, email FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn find_user_by_id(pool: &DbPool, user_id: UserId) -> Result<Option<UserRecord>> {
    let user = sqlx::query_as::<_, UserRecord>(
        "SELECT id, username, password_hash, email FROM users WHERE id = ?",
    )
    .bind(user_id.0)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// --- CHAT HISTORY ---

/// Best-effort write of one chat message. Callers log failures and move on;
/// a failed write never aborts a turn.
pub async fn save_message(
    pool: &DbPool,
    user_id: UserId,
    role: &str,
    content: &str,
    thinking_process: Option<&str>,
    client_id: &ClientId,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (user_id, role, content, thinking_process, client_id) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id.0)
    .bind(role)
    .bind(content)
    .bind(thinking_process)
    .bind(&client_id.0)
    .execute(pool)
    .await?;
    Ok(())
}
