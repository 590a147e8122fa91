use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::error::Error as StdError;
use sqlx::error::Error as SqlxError;

use crate::services::relay_queue::QueueError;

#[derive(Debug)]
pub enum AppError {
    /// Envelope failed the schema or the cmd/ret invariant
    MalformedMessage(String),
    /// Terminal connection lost
    ChannelClosed(String),
    /// Relay queue backing store unreachable
    QueueUnavailable(String),
    /// Dispatch wait elapsed without a terminal reply
    NoResponse(String),
    Unauthorized(String),
    Validation(String),
    /// Log Sink persistence failure; never surfaced to a terminal
    LogSink(String),
    Configuration(String),
    Internal(String),
    Serialization(String),
    NotFound(String),
    TooManyRequests(String),
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    code: u16,
    message: String,
    error_type: String,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::MalformedMessage(e) => write!(f, "Malformed message: {}", e),
            AppError::ChannelClosed(e) => write!(f, "Channel closed: {}", e),
            AppError::QueueUnavailable(e) => write!(f, "Relay queue unavailable: {}", e),
            AppError::NoResponse(e) => write!(f, "No response: {}", e),
            AppError::Unauthorized(e) => write!(f, "Unauthorized: {}", e),
            AppError::Validation(e) => write!(f, "Validation error: {}", e),
            AppError::LogSink(e) => write!(f, "Log sink error: {}", e),
            AppError::Configuration(e) => write!(f, "Configuration error: {}", e),
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::Serialization(e) => write!(f, "Serialization error: {}", e),
            AppError::NotFound(e) => write!(f, "Not found: {}", e),
            AppError::TooManyRequests(e) => write!(f, "Too many requests: {}", e),
        }
    }
}

impl StdError for AppError {}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::MalformedMessage(_) => "malformed_message",
            AppError::ChannelClosed(_) => "channel_closed",
            AppError::QueueUnavailable(_) => "queue_unavailable",
            AppError::NoResponse(_) => "no_response",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Validation(_) => "validation_error",
            AppError::LogSink(_) => "log_sink_error",
            AppError::Configuration(_) => "configuration_error",
            AppError::Internal(_) => "internal_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::NotFound(_) => "not_found",
            AppError::TooManyRequests(_) => "too_many_requests",
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: self.to_string(),
            error_type: self.error_type().to_string(),
        };

        HttpResponse::build(status_code).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            AppError::ChannelClosed(_) => StatusCode::BAD_GATEWAY,
            AppError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NoResponse(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::LogSink(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        AppError::LogSink(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Serialization(format!("JSON deserialization/serialization error: {}", error))
    }
}

impl From<QueueError> for AppError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Unavailable(e) => AppError::QueueUnavailable(e.to_string()),
            QueueError::CorruptEntry { key, source } => {
                AppError::MalformedMessage(format!("queued entry on {} is not a valid envelope: {}", key, source))
            }
            QueueError::Encode(e) => AppError::Serialization(e.to_string()),
        }
    }
}

// Define AppResult type alias for Result<T, AppError>
pub type AppResult<T> = Result<T, AppError>;
