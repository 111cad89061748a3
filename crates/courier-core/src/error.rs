use thiserror::Error;

/// Core error types for Courier operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Unknown change-feed table: {schema}.{table}")]
    UnknownTable { schema: String, table: String },

    #[error("Change record for {table} carries no row data")]
    MissingRecord { table: String },

    #[error("Invalid change filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid record for {kind}: {message}")]
    InvalidRecord { kind: &'static str, message: String },
}

impl CoreError {
    /// Create a new UnknownTable error
    pub fn unknown_table(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self::UnknownTable {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Create a new MissingRecord error
    pub fn missing_record(table: impl Into<String>) -> Self {
        Self::MissingRecord {
            table: table.into(),
        }
    }

    /// Create a new InvalidFilter error
    pub fn invalid_filter(filter: impl Into<String>) -> Self {
        Self::InvalidFilter(filter.into())
    }

    /// Create a new InvalidRecord error
    pub fn invalid_record(kind: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            kind,
            message: message.into(),
        }
    }
}

/// Result type alias for Courier core operations
pub type Result<T> = std::result::Result<T, CoreError>;
