//! Retry scheduling with a dead-letter terminal state.

use crate::config::Config;
use crate::error::Error;
use crate::queue::{QueuedMessage, SubmissionQueue};
use crate::store::with_deadline;
use crate::utils::epoch_now;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Store key of the time-scored retry set.
pub const RETRY_KEY: &str = "mail_retry_queue";
/// Store key of the dead-letter list.
pub const DEAD_LETTER_KEY: &str = "failed_mail_queue";

/// Retry bucket for persistence failures after an otherwise delivered
/// message; retried most aggressively.
pub const BUCKET_PERSIST: u32 = 1;
/// Retry bucket for MX lookup failures.
pub const BUCKET_RESOLVE: u32 = 2;
/// Retry bucket for delivery failures, local or remote.
pub const BUCKET_DELIVER: u32 = 3;

/// Schedules failed deliveries for another attempt and promotes them back
/// into the submission queue once due.
#[derive(Clone)]
pub struct RetryScheduler {
    conn: ConnectionManager,
    queue: SubmissionQueue,
    max_retries: u32,
    backoff_base: Duration,
}

impl RetryScheduler {
    pub fn new(conn: ConnectionManager, queue: SubmissionQueue, config: &Config) -> Self {
        Self {
            conn,
            queue,
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(config.retry_backoff_secs),
        }
    }

    /// Records a failed delivery attempt. The message moves to the
    /// dead-letter list once its retry budget is spent, otherwise it is
    /// scored into the retry set at `now + backoff(bucket)`.
    pub async fn add_retry(&self, mut msg: QueuedMessage, err: &str, bucket: u32) {
        msg.retry += 1;
        msg.error = Some(err.to_string());

        if msg.retry > self.max_retries {
            log::warn!("dropping message {}, last error: {err}", msg.id);
            if let Err(e) = self.push_dead_letter(&msg).await {
                log::error!("failed to dead-letter message {}: {e}", msg.id);
            }
            return;
        }

        log::info!("scheduling retry {} for message {}: {err}", msg.retry, msg.id);
        if let Err(e) = self.schedule(&msg, bucket).await {
            log::error!("failed to schedule retry for message {}: {e}", msg.id);
        }
    }

    async fn push_dead_letter(&self, msg: &QueuedMessage) -> Result<(), Error> {
        let payload = serde_json::to_string(msg)?;
        let mut conn = self.conn.clone();
        let _: () = with_deadline(conn.rpush(DEAD_LETTER_KEY, payload)).await?;
        Ok(())
    }

    async fn schedule(&self, msg: &QueuedMessage, bucket: u32) -> Result<(), Error> {
        let payload = serde_json::to_string(msg)?;
        let due = epoch_now() + backoff(bucket, self.backoff_base).as_secs();
        let mut conn = self.conn.clone();
        let _: () = with_deadline(conn.zadd(RETRY_KEY, payload, due)).await?;
        Ok(())
    }

    /// Promotes every due retry back into the submission queue.
    ///
    /// Best-effort: racing against a concurrent promoter only re-enqueues a
    /// message twice, and the pipeline is at-least-once anyway.
    pub async fn promote_due(&self) -> Result<(), Error> {
        let now = epoch_now();
        let mut conn = self.conn.clone();
        let due: Vec<String> = with_deadline(conn.zrangebyscore(RETRY_KEY, 0, now)).await?;
        for payload in due {
            self.queue.push_payload(&payload).await?;
            let _: () = with_deadline(conn.zrem(RETRY_KEY, &payload)).await?;
        }
        Ok(())
    }

    /// Timer loop driving the promotion pass.
    pub async fn run(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            if let Err(e) = self.promote_due().await {
                log::warn!("retry promotion failed: {e}");
            }
        }
    }
}

/// Backoff before a bucket's next attempt; higher buckets wait longer.
fn backoff(bucket: u32, base: Duration) -> Duration {
    base * bucket
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(BUCKET_PERSIST, 60)]
    #[case(BUCKET_RESOLVE, 120)]
    #[case(BUCKET_DELIVER, 180)]
    fn test_backoff(#[case] bucket: u32, #[case] expected_secs: u64) {
        assert_eq!(backoff(bucket, Duration::from_secs(60)).as_secs(), expected_secs);
    }
}
