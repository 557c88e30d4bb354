//! Module for rate limiting login attempts.

use crate::config::Config;
use crate::error::Error;
use crate::store::with_deadline;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::net::IpAddr;
use std::time::Duration;

/// Window-limited attempt counters, kept per identity and per source
/// address.
///
/// The counters live in the shared store so that every server process
/// observes the same counts.
#[derive(Clone)]
pub struct RateLimiter {
    conn: ConnectionManager,
    user_limit: i64,
    ip_limit: i64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(conn: ConnectionManager, config: &Config) -> Self {
        Self {
            conn,
            user_limit: config.user_attempt_limit,
            ip_limit: config.ip_attempt_limit,
            window: Duration::from_secs(config.attempt_window_secs),
        }
    }

    /// Counts one attempt against both buckets and reports whether the
    /// caller is still within the limits. Each bucket gets its window TTL
    /// on the first increment.
    pub async fn validate(&self, username: &str, addr: IpAddr) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let ip_key = format!("auth:ip:{addr}");
        let user_key = format!("auth:user:{username}");

        let ip_count: i64 = with_deadline(conn.incr(&ip_key, 1)).await?;
        let user_count: i64 = with_deadline(conn.incr(&user_key, 1)).await?;

        if ip_count == 1 {
            let _: () = with_deadline(conn.expire(&ip_key, self.window.as_secs() as i64)).await?;
        }
        if user_count == 1 {
            let _: () = with_deadline(conn.expire(&user_key, self.window.as_secs() as i64)).await?;
        }

        Ok(ip_count <= self.ip_limit && user_count <= self.user_limit)
    }
}
