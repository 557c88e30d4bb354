//! Shared-store plumbing: connection setup, per-operation deadlines, and
//! the user and mail records.

use crate::config::Config;
use crate::error::Error;
use crate::queue::QueuedMessage;
use crate::utils::epoch_now;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::env;
use std::future::Future;
use std::time::Duration;

/// Deadline applied to every session-path store round-trip.
pub(crate) const STORE_DEADLINE: Duration = Duration::from_secs(3);

/// Opens a connection to the shared store and verifies it with a PING.
///
/// The `REDIS_URL` environment variable overrides the configured endpoint.
pub async fn connect(config: &Config) -> Result<ConnectionManager, Error> {
    let url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis_url.clone());
    let client = redis::Client::open(url.as_str())?;
    let mut conn = ConnectionManager::new(client).await?;
    let _: () = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(conn)
}

/// Bounds a store round-trip so a dead store turns into an error instead of
/// a stalled session.
pub(crate) async fn with_deadline<T>(
    op: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T, Error> {
    match tokio::time::timeout(STORE_DEADLINE, op).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::StoreTimeout),
    }
}

/// A user's registry entry.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub password_hash: String,
    pub email: String,
}

/// Typed access to the user registry and the mail records.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
}

impl Store {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Looks up a user's password hash and bound sender address.
    pub async fn lookup_user(&self, username: &str) -> Result<Option<UserRecord>, Error> {
        let mut conn = self.conn.clone();
        let key = format!("user:{username}");
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(&key).arg("password").arg("email");
        let (password, email): (Option<String>, Option<String>) =
            with_deadline(cmd.query_async(&mut conn)).await?;
        Ok(match (password, email) {
            (Some(password_hash), Some(email)) => Some(UserRecord {
                password_hash,
                email,
            }),
            _ => None,
        })
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let key = format!("user:{username}");
        let exists: bool = with_deadline(conn.exists(&key)).await?;
        Ok(exists)
    }

    /// Writes a freshly provisioned user record.
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: &str,
    ) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = format!("user:{username}");
        let _: () = with_deadline(
            conn.hset_multiple(&key, &[("password", password_hash), ("email", email)]),
        )
        .await?;
        Ok(())
    }

    /// Stores a message for a local-domain recipient as a mailbox record.
    pub async fn save_mailbox(&self, msg: &QueuedMessage) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = format!("mailbox:{}:{}", msg.username, msg.id);
        let fields = msg.hash_fields();
        let _: () = with_deadline(conn.hset_multiple(&key, &fields)).await?;
        Ok(())
    }

    /// Records a successfully delivered message under its id.
    pub async fn save_delivered(&self, msg: &QueuedMessage) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let key = format!("mail:{}", msg.id);
        let fields = [
            ("from", msg.from.clone()),
            ("to", msg.to.clone()),
            ("username", msg.username.clone()),
            ("data", msg.data.clone()),
            ("time", epoch_now().to_string()),
            ("retry", msg.retry.to_string()),
        ];
        let _: () = with_deadline(conn.hset_multiple(&key, &fields)).await?;
        Ok(())
    }
}
