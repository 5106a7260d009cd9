use std::{path::PathBuf, time::Duration};

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("invalid API key")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failures of the hub registry's backing store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read registry store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry store {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("registry store contains duplicate id {0:?}")]
    DuplicateId(String),
    #[error("failed to encode registry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write registry store: {0}")]
    Write(#[from] std::io::Error),
    #[error("registry persistence did not finish within {0:?}")]
    Timeout(Duration),
    #[error("registry persistence task failed: {0}")]
    Task(String),
}

/// Failures reported by an inference backend.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("model {0:?} is not loaded")]
    ModelNotLoaded(String),
    #[error("inference backend unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Failed(String),
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(%rejection, "rejected request body");
        ServiceError::BadRequest("invalid request body".into())
    }
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServiceError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Engine(EngineError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ServiceError::Engine(EngineError::ModelNotLoaded(_)) => StatusCode::NOT_FOUND,
            ServiceError::Engine(EngineError::Unavailable(_)) => StatusCode::BAD_GATEWAY,
            ServiceError::Engine(EngineError::Failed(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to clients. Storage and engine internals stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Storage(err) => {
                tracing::error!(error = %err, "registry storage failure");
                "registry storage failure".to_string()
            }
            ServiceError::Engine(EngineError::InvalidRequest(message)) => message.clone(),
            ServiceError::Engine(EngineError::ModelNotLoaded(_)) => "model not found".to_string(),
            ServiceError::Engine(err) => {
                tracing::error!(error = %err, "inference backend error");
                "inference backend error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_gateway_statuses() {
        let missing = ServiceError::from(EngineError::ModelNotLoaded("m".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.public_message(), "model not found");

        let upstream = ServiceError::from(EngineError::Unavailable("connect refused".into()));
        assert_eq!(upstream.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.public_message(), "inference backend error");
    }

    #[test]
    fn storage_errors_hide_paths() {
        let err = ServiceError::from(StorageError::Read {
            path: PathBuf::from("/secret/registry.json"),
            source: std::io::Error::other("denied"),
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("/secret"));
    }
}
