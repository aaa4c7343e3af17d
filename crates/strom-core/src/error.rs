use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Event type does not belong to subscription: {0}")]
    WrongEventType(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
