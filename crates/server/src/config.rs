//! Chat server configuration

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::auth::{AuthGateway, AuthManager};
use crate::directory::{RoomDirectory, RoomStore};
use crate::registry::RoomRegistry;
use crate::router::MessageRouter;

/// Configuration for the chat server
#[derive(Clone, Debug)]
pub struct ChatServerConfig {
    /// Data directory holding chat.sqlite
    pub data_dir: PathBuf,
    /// Listen address
    pub bind_addr: SocketAddr,
    /// Per-connection outbound queue capacity
    pub outbound_buffer: usize,
    /// Bound on each handshake step (auth, room lookup)
    pub handshake_timeout: Duration,
    /// Server ping period
    pub ping_interval: Duration,
    /// Read idle time after which a connection is considered dead
    pub idle_timeout: Duration,
    /// Session token lifetime
    pub session_ttl: chrono::Duration,
}

impl Default for ChatServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("chat_data"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8088)),
            outbound_buffer: 256,
            handshake_timeout: Duration::from_millis(5000),
            ping_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(25),
            session_ttl: chrono::Duration::days(30),
        }
    }
}

impl ChatServerConfig {
    /// Create config with custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CHAT_*` / `PORT` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = env_parse("PORT", defaults.bind_addr.port());

        Self {
            data_dir: std::env::var("CHAT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            outbound_buffer: env_parse("CHAT_OUTBOUND_BUFFER", defaults.outbound_buffer).max(1),
            handshake_timeout: Duration::from_millis(env_parse(
                "CHAT_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout.as_millis() as u64,
            )),
            ping_interval: Duration::from_secs(
                env_parse("CHAT_PING_INTERVAL_SECS", defaults.ping_interval.as_secs()).max(1),
            ),
            idle_timeout: Duration::from_secs(
                env_parse("CHAT_IDLE_TIMEOUT_SECS", defaults.idle_timeout.as_secs()).max(1),
            ),
            session_ttl: session_ttl_days(
                env_parse("CHAT_SESSION_TTL_DAYS", defaults.session_ttl.num_days()),
                defaults.session_ttl,
            ),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chat.sqlite")
    }

    /// Ensure all directories exist
    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.data_dir))?;
        Ok(())
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

/// Session lifetime of `days`, or `default` when no expiry computed from
/// now would be representable.
fn session_ttl_days(days: i64, default: chrono::Duration) -> chrono::Duration {
    chrono::Duration::try_days(days)
        .filter(|ttl| chrono::Utc::now().checked_add_signed(*ttl).is_some())
        .unwrap_or_else(|| {
            warn!("Ignoring out of range CHAT_SESSION_TTL_DAYS={}", days);
            default
        })
}

/// Open (creating if needed) the SQLite database shared by auth and rooms.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database at {:?}", path))
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChatServerConfig>,
    pub registry: Arc<RoomRegistry>,
    pub router: Arc<MessageRouter>,
    pub gateway: Arc<dyn AuthGateway>,
    pub directory: Arc<dyn RoomDirectory>,
    pub auth: Arc<AuthManager>,
    pub rooms: Arc<RoomStore>,
}

impl AppState {
    /// Wire every component against the database under `config.data_dir`.
    pub async fn initialize(config: ChatServerConfig) -> Result<Self> {
        config.ensure_dirs().await?;
        let pool = open_pool(&config.database_path()).await?;

        let auth = Arc::new(AuthManager::new(pool.clone(), config.session_ttl).await?);
        let rooms = Arc::new(RoomStore::new(pool).await?);
        Ok(Self::from_parts(config, auth, rooms))
    }

    pub fn from_parts(
        config: ChatServerConfig,
        auth: Arc<AuthManager>,
        rooms: Arc<RoomStore>,
    ) -> Self {
        let directory: Arc<dyn RoomDirectory> = rooms.clone();
        let registry = Arc::new(RoomRegistry::with_lookup_timeout(
            directory.clone(),
            config.handshake_timeout,
        ));
        let router = Arc::new(MessageRouter::new(registry.clone()));

        Self {
            config: Arc::new(config),
            registry,
            router,
            gateway: auth.clone(),
            directory,
            auth,
            rooms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatServerConfig::with_data_dir("/tmp/chat");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/chat/chat.sqlite"));
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.bind_addr.port(), 8088);
        assert!(config.idle_timeout > config.ping_interval);
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("CHAT_TEST_UNSET_VARIABLE", 7u64), 7);
    }

    #[test]
    fn test_out_of_range_session_ttl_falls_back() {
        let default = chrono::Duration::days(30);
        assert_eq!(session_ttl_days(7, default), chrono::Duration::days(7));
        assert_eq!(session_ttl_days(i64::MAX, default), default);
        assert_eq!(session_ttl_days(100_000_000, default), default);
    }
}
