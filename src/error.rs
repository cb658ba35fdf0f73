use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Search engine error: {0}")]
    Search(String),

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("SQL gateway error: {0}")]
    SqlGateway(String),

    /// The SQL gateway forgot our session (404 or "does not exist" body).
    /// Handled internally with a one-shot session rebuild and retry.
    #[error("SQL session expired")]
    SessionExpired,

    #[error("Invalid rule: {0}")]
    RuleValidation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn search<S: Into<String>>(msg: S) -> Self {
        EngineError::Search(msg.into())
    }

    pub fn kafka<S: Into<String>>(msg: S) -> Self {
        EngineError::Kafka(msg.into())
    }

    pub fn sql_gateway<S: Into<String>>(msg: S) -> Self {
        EngineError::SqlGateway(msg.into())
    }

    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        EngineError::BadRequest(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        EngineError::Internal(msg.into())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::RuleValidation(_) | EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
