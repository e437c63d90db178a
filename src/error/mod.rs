//! Application error types for robust error handling.

use thiserror::Error;

use crate::json::JsonError;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("TLS mode mismatch on socket '{socket}': socket tls={established}, requested tls={requested}")]
    TlsMismatch {
        socket: String,
        established: bool,
        requested: bool,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] JsonError),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Session error: {0}")]
    Session(String),
}

impl AppError {
    /// True for failures of the transport itself (as opposed to protocol or session errors).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::Io(_) | AppError::Socket(_) | AppError::TlsMismatch { .. } | AppError::Tls(_)
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;
