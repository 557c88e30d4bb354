//! Authentication failure tracking and account lockout.

use crate::config::Config;
use crate::error::Error;
use crate::store::with_deadline;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Counts failed logins per identity in the shared store and locks repeat
/// offenders for an escalating cooldown.
#[derive(Clone)]
pub struct AuthTracker {
    conn: ConnectionManager,
    fail_limit: i64,
    fail_window: Duration,
    lock_base: Duration,
}

impl AuthTracker {
    pub fn new(conn: ConnectionManager, config: &Config) -> Self {
        Self {
            conn,
            fail_limit: config.fail_limit,
            fail_window: Duration::from_secs(config.fail_window_secs),
            lock_base: Duration::from_secs(config.lock_base_secs),
        }
    }

    /// Notes one failed authentication. The counter gets its window TTL on
    /// the first increment; reaching the fail limit arms the lock flag.
    pub async fn note_failure(&self, username: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let fail_key = format!("auth:fail:user:{username}");

        let fails: i64 = with_deadline(conn.incr(&fail_key, 1)).await?;
        if fails == 1 {
            let _: () =
                with_deadline(conn.expire(&fail_key, self.fail_window.as_secs() as i64)).await?;
        }

        if let Some(lock) = lock_duration(fails, self.fail_limit, self.lock_base) {
            let lock_key = format!("lock:user:{username}");
            let _: () = with_deadline(conn.set_ex(&lock_key, "1", lock.as_secs())).await?;
        }
        Ok(())
    }

    /// A present lock flag means the account is still cooling down.
    pub async fn is_locked(&self, username: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let lock_key = format!("lock:user:{username}");
        let locked: bool = with_deadline(conn.exists(&lock_key)).await?;
        Ok(locked)
    }

    /// Forgets the failure count after a successful login. The lock flag is
    /// left to expire on its own.
    pub async fn clear(&self, username: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let fail_key = format!("auth:fail:user:{username}");
        let _: () = with_deadline(conn.del(&fail_key)).await?;
        Ok(())
    }
}

/// Lock duration for a post-increment failure count; escalates at two and
/// three times the fail limit.
fn lock_duration(fails: i64, limit: i64, base: Duration) -> Option<Duration> {
    if fails < limit {
        return None;
    }
    Some(if fails >= 3 * limit {
        base * 6
    } else if fails >= 2 * limit {
        base * 3
    } else {
        base
    })
}
