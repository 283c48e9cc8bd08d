use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy surfaced to callers of the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    CatalogUnavailable,
    EmbeddingServiceError,
    ModelTimeout,
    ModelUnavailable,
    UnsafeQuery,
    SchemaViolation,
    BlockedFunction,
    BlockedKeyword,
    NotSelect,
    ConnectionError,
    QueryTimeout,
    ExecutionError,
    InvalidRequest,
}

impl ErrorKind {
    /// Only connection failures are safe to retry automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ConnectionError)
    }

    /// Kinds produced by the guardrail; recoverable by reprompting the model.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ErrorKind::NotSelect
                | ErrorKind::SchemaViolation
                | ErrorKind::BlockedFunction
                | ErrorKind::BlockedKeyword
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CatalogUnavailable => "CatalogUnavailable",
            ErrorKind::EmbeddingServiceError => "EmbeddingServiceError",
            ErrorKind::ModelTimeout => "ModelTimeout",
            ErrorKind::ModelUnavailable => "ModelUnavailable",
            ErrorKind::UnsafeQuery => "UnsafeQuery",
            ErrorKind::SchemaViolation => "SchemaViolation",
            ErrorKind::BlockedFunction => "BlockedFunction",
            ErrorKind::BlockedKeyword => "BlockedKeyword",
            ErrorKind::NotSelect => "NotSelect",
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::QueryTimeout => "QueryTimeout",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::InvalidRequest => "InvalidRequest",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum BiError {
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Embedding service error: {0}")]
    EmbeddingService(String),

    #[error("Language model did not answer within {0:?}")]
    ModelTimeout(Duration),

    #[error("Language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model kept producing unsafe SQL after {attempts} attempts (last {last}: {detail})")]
    UnsafeQuery {
        attempts: u32,
        last: ErrorKind,
        detail: String,
    },

    #[error("Query rejected ({kind}): {detail}")]
    Rejected { kind: ErrorKind, detail: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query exceeded timeout of {0:?}")]
    QueryTimeout(Duration),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BiError::CatalogUnavailable(_) => ErrorKind::CatalogUnavailable,
            BiError::EmbeddingService(_) => ErrorKind::EmbeddingServiceError,
            BiError::ModelTimeout(_) => ErrorKind::ModelTimeout,
            BiError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            BiError::UnsafeQuery { .. } => ErrorKind::UnsafeQuery,
            BiError::Rejected { kind, .. } => *kind,
            BiError::Connection(_) => ErrorKind::ConnectionError,
            BiError::QueryTimeout(_) => ErrorKind::QueryTimeout,
            BiError::Execution(_) => ErrorKind::ExecutionError,
            BiError::InvalidRequest(_) | BiError::Config(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type Result<T> = std::result::Result<T, BiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            BiError::Connection("refused".into()).kind(),
            ErrorKind::ConnectionError
        );
        assert_eq!(
            BiError::Config("missing".into()).kind(),
            ErrorKind::InvalidRequest
        );
        let rejected = BiError::Rejected {
            kind: ErrorKind::BlockedKeyword,
            detail: "DROP".into(),
        };
        assert_eq!(rejected.kind(), ErrorKind::BlockedKeyword);
        assert!(rejected.kind().is_rejection());
    }

    #[test]
    fn test_only_connection_errors_retry() {
        assert!(BiError::Connection("reset".into()).is_retryable());
        assert!(!BiError::QueryTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!BiError::Execution("syntax".into()).is_retryable());
    }
}
