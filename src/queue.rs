//! The durable submission queue and its message records.

use crate::error::Error;
use crate::store::with_deadline;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

/// Store key of the submission queue list.
pub const QUEUE_KEY: &str = "mail_queue";

/// A self-contained accepted message, serialized as one opaque payload.
///
/// `from` and `to` hold bare addresses with angle brackets stripped; `id`
/// is assigned at enqueue time and never changes. `error` appears once a
/// delivery attempt has failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: u64,
    pub username: String,
    pub from: String,
    pub to: String,
    pub data: String,
    pub time: u64,
    #[serde(default)]
    pub retry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueuedMessage {
    /// The message as store-hash fields.
    pub(crate) fn hash_fields(&self) -> [(&'static str, String); 7] {
        [
            ("id", self.id.to_string()),
            ("username", self.username.clone()),
            ("from", self.from.clone()),
            ("to", self.to.clone()),
            ("data", self.data.clone()),
            ("time", self.time.to_string()),
            ("retry", self.retry.to_string()),
        ]
    }
}

/// Head-push, blocking-tail-pop access to the shared submission queue.
#[derive(Clone)]
pub struct SubmissionQueue {
    conn: ConnectionManager,
}

impl SubmissionQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Serializes and enqueues a newly accepted message.
    pub async fn push(&self, msg: &QueuedMessage) -> Result<(), Error> {
        let payload = serde_json::to_string(msg)?;
        self.push_payload(&payload).await
    }

    /// Re-enqueues an already serialized payload.
    pub async fn push_payload(&self, payload: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = with_deadline(conn.lpush(QUEUE_KEY, payload)).await?;
        Ok(())
    }

    /// Blocks until a message is available and returns its raw payload.
    ///
    /// The wait is unbounded, so callers give the queue its own store
    /// connection.
    pub async fn pop(&self) -> Result<String, Error> {
        let mut conn = self.conn.clone();
        let (_list, payload): (String, String) = redis::cmd("BRPOP")
            .arg(QUEUE_KEY)
            .arg(0)
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    #[test]
    fn wire_shape_parses() -> TestResult {
        let payload = concat!(
            r#"{"id":42,"username":"testuser","from":"testuser@example.com","#,
            r#""to":"testuser2@example.com","data":"Subject: Test\nHello World!\n","#,
            r#""time":1767230000,"retry":0}"#,
        );
        let msg: QueuedMessage = serde_json::from_str(payload)?;
        assert_eq!(msg.id, 42);
        assert_eq!(msg.username, "testuser");
        assert_eq!(msg.to, "testuser2@example.com");
        assert_eq!(msg.retry, 0);
        assert_eq!(msg.error, None);
        Ok(())
    }

    #[test]
    fn error_field_is_omitted_until_set() -> TestResult {
        let msg = QueuedMessage {
            id: 1,
            username: "testuser".into(),
            from: "testuser@example.com".into(),
            to: "peer@example.net".into(),
            data: String::new(),
            time: 0,
            retry: 0,
            error: None,
        };
        let json = serde_json::to_string(&msg)?;
        assert!(!json.contains("error"));

        let mut failed = msg;
        failed.retry = 1;
        failed.error = Some("mx lookup failed".into());
        let back: QueuedMessage = serde_json::from_str(&serde_json::to_string(&failed)?)?;
        assert_eq!(back.retry, 1);
        assert_eq!(back.error.as_deref(), Some("mx lookup failed"));
        Ok(())
    }
}
