use thiserror::Error;
use uuid::Uuid;

/// Errors raised while publishing an event to the broker.
///
/// Every variant is treated as transient by the outbox processor: the
/// row keeps its place in the outbox and is retried later.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker connection not available")]
    NotConnected,

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("timed out waiting for broker confirmation")]
    ConfirmTimeout,

    #[error("broker rejected message {0}")]
    Rejected(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
