//! Error types for the bridge tracker

use thiserror::Error;

/// Main error type for the tracker
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("HTTP error from {source_name}: {message}")]
    Http {
        source_name: &'static str,
        message: String,
    },

    #[error("Unexpected status {status} from {source_name}")]
    HttpStatus {
        source_name: &'static str,
        status: u16,
    },

    #[error("Websocket error: {0}")]
    Websocket(String),

    #[error("{source_name} rejected our credentials (status {status})")]
    Unauthorized {
        source_name: &'static str,
        status: u16,
    },

    #[error("Failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    #[error("Subscription error for transfer {transfer_id}: {message}")]
    Subscription {
        transfer_id: String,
        message: String,
    },

    #[error("Transfer {id} not found")]
    TransferNotFound { id: String },

    #[error("Transfer {id} already tracked")]
    DuplicateTransfer { id: String },

    #[error("Transfer {id} already finalized")]
    AlreadyFinalized { id: String },

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrackerError {
    /// Check if error is transient and the operation should be retried next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackerError::Database(_)
                | TrackerError::Persistence(_)
                | TrackerError::Http { .. }
                | TrackerError::HttpStatus { .. }
                | TrackerError::Websocket(_)
                | TrackerError::Subscription { .. }
        )
    }

    /// Short label used as a metrics dimension
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::Config(_) => "config",
            TrackerError::Database(_) => "database",
            TrackerError::Persistence(_) => "persistence",
            TrackerError::Http { .. } => "http",
            TrackerError::HttpStatus { .. } => "http_status",
            TrackerError::Websocket(_) => "websocket",
            TrackerError::Unauthorized { .. } => "unauthorized",
            TrackerError::Decode { .. } => "decode",
            TrackerError::Subscription { .. } => "subscription",
            TrackerError::TransferNotFound { .. } => "not_found",
            TrackerError::DuplicateTransfer { .. } => "duplicate",
            TrackerError::AlreadyFinalized { .. } => "already_finalized",
            TrackerError::InvalidTransfer(_) => "invalid_transfer",
            TrackerError::ChannelClosed(_) => "channel_closed",
            TrackerError::Internal(_) => "internal",
        }
    }

    pub(crate) fn http(source_name: &'static str, err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if is_auth_status(status.as_u16()) => TrackerError::Unauthorized {
                source_name,
                status: status.as_u16(),
            },
            Some(status) => TrackerError::HttpStatus {
                source_name,
                status: status.as_u16(),
            },
            None => TrackerError::Http {
                source_name,
                message: err.to_string(),
            },
        }
    }
}

fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 403
}

impl From<tokio_tungstenite::tungstenite::Error> for TrackerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Http(response) if is_auth_status(response.status().as_u16()) => {
                TrackerError::Unauthorized {
                    source_name: "subscription",
                    status: response.status().as_u16(),
                }
            }
            other => TrackerError::Websocket(other.to_string()),
        }
    }
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;
