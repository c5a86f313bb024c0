use thiserror::Error;

/// Unified error type for all connector operations
#[derive(Error, Debug)]
pub enum DataError {
    /// Connection failed (authentication, network, etc.)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost or closed unexpectedly
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Query timeout
    #[error("Query timeout after {0}ms")]
    QueryTimeout(u64),

    /// Schema/introspection error
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Data source or connector not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not supported by this backend
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Value could not be decoded or bound
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataError {
    /// Create a "not found" error with custom message
    pub fn not_found(msg: impl Into<String>) -> Self {
        DataError::NotFound(msg.into())
    }

    /// Create an operation not supported error
    pub fn operation_not_supported(msg: impl Into<String>) -> Self {
        DataError::OperationNotSupported(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        DataError::InvalidConfiguration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
