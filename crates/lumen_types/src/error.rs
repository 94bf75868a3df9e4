//! Schema parsing errors

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a JSON array of devices")]
    NotAnArray,

    #[error("Device #{index} is malformed: {source}")]
    InvalidDevice {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for schema parsing
pub type SchemaResult<T> = Result<T, SchemaError>;
