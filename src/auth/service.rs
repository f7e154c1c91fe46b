// src/auth/service.rs
// User storage and credential checks (bcrypt)

use crate::db::DatabasePool;
use crate::error::{AgentError, Result};
use anyhow::Result as AnyResult;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Public user record attached to authenticated requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: i64,
    pub last_login_at: Option<i64>,
}

fn ensure_users_schema(conn: &mut Connection) -> AnyResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_login_at INTEGER
        );",
    )?;
    Ok(())
}

fn get_user_row_sync(conn: &Connection, username: &str) -> AnyResult<Option<(User, String)>> {
    let row = conn
        .query_row(
            "SELECT id, username, password_hash, created_at, last_login_at
             FROM users WHERE username = ?1",
            params![username],
            |row| {
                Ok((
                    User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: row.get(3)?,
                        last_login_at: row.get(4)?,
                    },
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(row)
}

/// User registry over a SQLite pool
pub struct AuthService {
    pool: Arc<DatabasePool>,
}

impl AuthService {
    pub async fn open(pool: Arc<DatabasePool>) -> Result<Self> {
        pool.interact(ensure_users_schema).await?;
        Ok(Self { pool })
    }

    /// Create a user with a bcrypt-hashed password.
    pub async fn register(&self, username: &str, password: &str) -> Result<User> {
        if username.trim().is_empty() || password.len() < 6 {
            return Err(AgentError::BadInput(
                "username required, password must be at least 6 characters".to_string(),
            ));
        }
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| AgentError::Internal(format!("hashing failed: {}", e)))?;
        let user = User {
            id: uuid::Uuid::new_v4().simple().to_string(),
            username: username.trim().to_string(),
            created_at: chrono::Utc::now().timestamp(),
            last_login_at: None,
        };
        let insert = user.clone();
        self.pool
            .interact(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO users (id, username, password_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![insert.id, insert.username, hash, insert.created_at],
                )?;
                Ok(n)
            })
            .await
            .map_err(AgentError::from)
            .and_then(|n| {
                if n == 0 {
                    Err(AgentError::BadInput(format!(
                        "username '{}' is taken",
                        user.username
                    )))
                } else {
                    Ok(())
                }
            })?;
        Ok(user)
    }

    /// Verify credentials; records the login time on success.
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        let username_owned = username.to_string();
        let row = self
            .pool
            .interact(move |conn| get_user_row_sync(conn, &username_owned))
            .await?;
        let Some((mut user, password_hash)) = row else {
            return Err(AgentError::NotPermitted("invalid credentials".to_string()));
        };
        let valid = bcrypt::verify(password, &password_hash)
            .map_err(|e| AgentError::Internal(format!("verify failed: {}", e)))?;
        if !valid {
            return Err(AgentError::NotPermitted("invalid credentials".to_string()));
        }

        let now = chrono::Utc::now().timestamp();
        let user_id = user.id.clone();
        self.pool
            .interact(move |conn| {
                conn.execute(
                    "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                    params![now, user_id],
                )?;
                Ok(())
            })
            .await?;
        user.last_login_at = Some(now);
        Ok(user)
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let username = username.to_string();
        let row = self
            .pool
            .interact(move |conn| get_user_row_sync(conn, &username))
            .await?;
        Ok(row.map(|(user, _)| user))
    }
}
