//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No resource index is registered")]
    NotRegistered,
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Failures talking to the chain node.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Subscription closed by the node")]
    SubscriptionClosed,
}

/// Low-level SCALE decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("invalid compact prefix")]
    InvalidCompact,

    #[error("value does not fit into {0}")]
    Overflow(&'static str),

    #[error("unknown event {event} in pallet {pallet}")]
    UnknownEvent { pallet: u8, event: u8 },

    #[error("invalid variant index {index}")]
    InvalidVariant { index: u8 },

    #[error("invalid phase tag {0}")]
    InvalidPhase(u8),

    #[error("missing or ill-typed field `{0}`")]
    MissingField(String),

    #[error("{0} trailing bytes after the last record")]
    TrailingBytes(usize),
}

/// A change-set whose event records could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("failed to decode event records: {0}")]
    Records(ScaleError),

    #[error("failed to decode {kind} event: {cause}")]
    Event { kind: String, cause: ScaleError },
}

/// Errors surfaced by `ChainListener::set_state`, naming the failed step.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("loading provider configuration failed: {0}")]
    Configuration(ProviderError),

    #[error("resource registration failed: {0}")]
    Registration(ProviderError),

    #[error("resource removal failed: {0}")]
    Removal(ProviderError),

    #[error("no resource index is registered")]
    NotRegistered,
}
