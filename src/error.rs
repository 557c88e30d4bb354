//! Error types.

/// Error type for relaymail.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Config is invalid: {0}")]
    Config(#[from] serini::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),
    #[error("Store operation timed out")]
    StoreTimeout,
    #[error("Invalid message payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("MX lookup failed: {0}")]
    Resolve(#[from] hickory_resolver::error::ResolveError),
    #[error("No mail exchanger for {0:?}")]
    NoMailExchanger(String),
    #[error("Failed to send mail during {context}: {raw_smtp_answer}")]
    MailSend {
        context: String,
        raw_smtp_answer: String,
    },
    #[error("Message id space exhausted")]
    IdExhausted,
}
