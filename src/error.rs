//! Error types for the chat and notification layer.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Rejections raised before anything is persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message body is empty")]
    EmptyMessage,

    #[error("message exceeds {max} characters")]
    MessageTooLong { max: usize },

    #[error("malformed room key: {0}")]
    InvalidRoomKey(String),
}

/// Errors from a message or notification store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Bearer-token failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Missing => "TOKEN_MISSING",
            AuthError::Expired => "TOKEN_EXPIRED",
            AuthError::Invalid(_) => "TOKEN_INVALID",
        }
    }
}

/// Errors from the external user directory.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("directory lookup failed: {0}")]
    Lookup(String),

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
}

/// The service-boundary error taxonomy.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("message body is empty")]
    EmptyMessage,

    #[error("message exceeds {max} characters")]
    MessageTooLong { max: usize },

    #[error("rate limit exceeded: at most {limit} messages per {window_secs}s")]
    RateLimitExceeded { limit: u32, window_secs: u64 },

    #[error("malformed room key: {0}")]
    InvalidRoomKey(String),

    #[error("not found")]
    NotFound,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// The store failed; details are logged, not exposed.
    #[error("storage unavailable")]
    StorageUnavailable,
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::EmptyMessage => "EMPTY_MESSAGE",
            ChatError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            ChatError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ChatError::InvalidRoomKey(_) => "INVALID_ROOM_KEY",
            ChatError::NotFound => "NOT_FOUND",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::Unauthorized(_) => "UNAUTHORIZED",
            ChatError::StorageUnavailable => "STORAGE_UNAVAILABLE",
        }
    }

    /// Client errors are reported to the sender; everything else is ours.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ChatError::StorageUnavailable)
    }
}

impl From<ValidationError> for ChatError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::EmptyMessage => ChatError::EmptyMessage,
            ValidationError::MessageTooLong { max } => ChatError::MessageTooLong { max },
            ValidationError::InvalidRoomKey(key) => ChatError::InvalidRoomKey(key),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(v) => v.into(),
            other => {
                log::error!("message store failure: {other}");
                ChatError::StorageUnavailable
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::EmptyMessage
            | ChatError::MessageTooLong { .. }
            | ChatError::InvalidRoomKey(_) => StatusCode::BAD_REQUEST,
            ChatError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChatError::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = match self {
            ChatError::Unauthorized(auth) => auth.code(),
            other => other.code(),
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code,
            message: self.to_string(),
        })
    }
}
