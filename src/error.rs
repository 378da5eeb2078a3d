use std::sync::OnceLock;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use log::error;
use mongodb::error::{ErrorKind, WriteFailure};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

const DUPLICATE_KEY: i32 = 11000;
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Token expired")]
    TokenExpired,
    #[error("Invalid token")]
    InvalidToken,
    #[error(transparent)]
    Database(#[from] mongodb::error::Error),
    #[error("Password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("Serialization failed: {0}")]
    Serialization(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    message: String,
    error: &'a str,
}

impl AppError {
    pub fn not_found(what: &str) -> Self {
        AppError::NotFound(format!("{} not found", what))
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        AppError::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    /// Stable machine-readable tag sent in the `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::InvalidId(_) => "invalid_id",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::TokenExpired => "token_expired",
            AppError::InvalidToken => "invalid_token",
            AppError::Database(err) => match db_error_code(err) {
                Some(DUPLICATE_KEY) => "duplicate_key",
                Some(DOCUMENT_VALIDATION_FAILURE) => "validation_error",
                _ => "database_error",
            },
            AppError::Hash(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// The message the client sees. Internal failures never leak details.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Database(err) => match db_error_code(err) {
                Some(DUPLICATE_KEY) => match duplicate_field(err) {
                    Some(field) => format!("Duplicate value for {}", field),
                    None => "Duplicate value".to_string(),
                },
                Some(DOCUMENT_VALIDATION_FAILURE) => "Document failed validation".to_string(),
                _ => "Database error".to_string(),
            },
            AppError::Hash(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidId(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) | AppError::TokenExpired | AppError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Database(err) => match db_error_code(err) {
                Some(DUPLICATE_KEY) => StatusCode::CONFLICT,
                Some(DOCUMENT_VALIDATION_FAILURE) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Hash(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        HttpResponse::build(status).json(ErrorBody {
            success: false,
            message: self.client_message(),
            error: self.kind(),
        })
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            JwtErrorKind::ExpiredSignature => AppError::TokenExpired,
            _ => AppError::InvalidToken,
        }
    }
}

impl From<mongodb::bson::ser::Error> for AppError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<mongodb::bson::de::Error> for AppError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

fn db_error_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => Some(write_error.code),
        ErrorKind::Command(command_error) => Some(command_error.code),
        _ => None,
    }
}

fn duplicate_field(err: &mongodb::error::Error) -> Option<String> {
    static DUP_KEY: OnceLock<Regex> = OnceLock::new();
    let re = DUP_KEY.get_or_init(|| {
        Regex::new(r#"dup key: \{ ?"?([A-Za-z0-9_.]+)"?\s*:"#).expect("static regex")
    });
    let message = match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.message.clone(),
        ErrorKind::Command(command_error) => command_error.message.clone(),
        _ => return None,
    };
    re.captures(&message).map(|caps| caps[1].to_string())
}
