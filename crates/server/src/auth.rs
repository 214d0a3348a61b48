//! Authentication Module
//!
//! Handles user registration, login, and session tokens.
//! All user data stored in SQLite database at <CHAT_ROOT>/chat.sqlite

use anyhow::{Context, Result};
use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ChatError;
use crate::models::Identity;

/// Resolves a bearer token into the identity bound to a connection.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn validate(&self, token: &str) -> crate::error::Result<Identity>;
}

/// User record stored in database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Public user info (no sensitive data)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
            created_at: user.created_at,
        }
    }
}

impl From<UserInfo> for Identity {
    fn from(user: UserInfo) -> Self {
        Identity::new(user.id, user.username)
    }
}

/// Session token for authenticated requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Auth manager handles all authentication
pub struct AuthManager {
    pool: SqlitePool,
    session_ttl: Duration,
    hash_cost: u32,
    /// In-memory session cache
    sessions: RwLock<HashMap<String, Session>>,
}

impl AuthManager {
    pub async fn new(pool: SqlitePool, session_ttl: Duration) -> Result<Self> {
        let manager = Self {
            pool,
            session_ttl,
            hash_cost: DEFAULT_COST,
            sessions: RwLock::new(HashMap::new()),
        };

        manager.init_db().await?;

        info!("[Auth] Initialized");

        Ok(manager)
    }

    /// Override the bcrypt cost (tests use the minimum).
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                username TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_login TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create sessions table")?;

        Ok(())
    }

    /// Register a new user
    pub async fn signup(&self, email: String, username: String, password: String) -> Result<User> {
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE email = ?")
            .bind(&email)
            .fetch_optional(&self.pool)
            .await?;

        if existing.is_some() {
            return Err(anyhow::anyhow!("Email already registered"));
        }

        let password_hash = hash(&password, self.hash_cost).context("Failed to hash password")?;

        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
            username,
            password_hash,
            created_at: Utc::now(),
            last_login: None,
        };

        sqlx::query(
            "INSERT INTO users (id, email, username, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!("[Auth] User registered: {} ({})", user.username, user.email);

        Ok(user)
    }

    /// Login user and create session
    pub async fn login(&self, email: String, password: String) -> Result<(User, Session)> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, email, username, password_hash, created_at FROM users WHERE email = ?",
        )
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?;

        let (user_id, email, username, password_hash, created_at) =
            row.ok_or_else(|| anyhow::anyhow!("Invalid email or password"))?;

        let valid = verify(&password, &password_hash).context("Failed to verify password")?;

        if !valid {
            warn!("[Auth] Failed login attempt for {}", email);
            return Err(anyhow::anyhow!("Invalid email or password"));
        }

        let now = Utc::now();
        sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(&user_id)
            .execute(&self.pool)
            .await?;

        let session = self.create_session(&user_id).await?;

        let user = User {
            id: user_id,
            email,
            username,
            password_hash: String::new(), // Don't return hash
            created_at: created_at.parse().unwrap_or(now),
            last_login: Some(now),
        };

        info!("[Auth] User logged in: {}", user.username);

        Ok((user, session))
    }

    async fn create_session(&self, user_id: &str) -> Result<Session> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(self.session_ttl)
            .ok_or_else(|| anyhow::anyhow!("Session lifetime out of range"))?;
        let session = Session {
            token: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at,
        };

        sqlx::query(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.token)
        .bind(&session.user_id)
        .bind(session.created_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());

        Ok(session)
    }

    /// Validate session token
    pub async fn validate_session(&self, token: &str) -> Result<UserInfo> {
        let cached = self.sessions.read().await.get(token).cloned();

        let session = match cached {
            Some(session) => session,
            None => {
                let row: Option<(String, String, String)> = sqlx::query_as(
                    "SELECT user_id, created_at, expires_at FROM sessions WHERE token = ?",
                )
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

                let (user_id, created_at, expires_at) =
                    row.ok_or_else(|| anyhow::anyhow!("Invalid or expired session"))?;
                let session = Session {
                    token: token.to_string(),
                    user_id,
                    created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                    expires_at: expires_at
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid date"))?,
                };
                self.sessions
                    .write()
                    .await
                    .insert(session.token.clone(), session.clone());
                session
            }
        };

        if session.expires_at <= Utc::now() {
            self.sessions.write().await.remove(token);
            return Err(anyhow::anyhow!("Invalid or expired session"));
        }

        self.get_user(&session.user_id).await
    }

    /// Logout user (invalidate session)
    pub async fn logout(&self, token: &str) -> Result<()> {
        self.sessions.write().await.remove(token);

        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;

        info!("[Auth] Session invalidated");

        Ok(())
    }

    /// Get user by ID
    pub async fn get_user(&self, user_id: &str) -> Result<UserInfo> {
        self.find_user(user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User not found"))
    }

    /// Look up a user by ID; `None` if no such user exists.
    pub async fn find_user(&self, user_id: &str) -> Result<Option<UserInfo>> {
        let row: Option<(String, String, String, String)> =
            sqlx::query_as("SELECT id, email, username, created_at FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, email, username, created_at)| UserInfo {
            id,
            email,
            username,
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        }))
    }
}

#[async_trait]
impl AuthGateway for AuthManager {
    async fn validate(&self, token: &str) -> crate::error::Result<Identity> {
        match self.validate_session(token).await {
            Ok(user) => Ok(user.into()),
            Err(e) => {
                debug!("[Auth] Token rejected: {}", e);
                Err(ChatError::Unauthorized)
            }
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
