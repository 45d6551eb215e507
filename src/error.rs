use thiserror::Error;

/// Main error type for querytune
#[derive(Error, Debug)]
pub enum QuerytuneError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A feature slot declared more than one value where exactly one is required
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Search backend / transport errors
    #[error("Search client error: {0}")]
    SearchClient(String),

    /// Experiment not found, duplicate names, similar lookup failures
    #[error("Experiment error: {0}")]
    Experiment(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenient Result type using QuerytuneError
pub type Result<T> = std::result::Result<T, QuerytuneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QuerytuneError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: QuerytuneError = rusqlite_err.into();
        assert!(matches!(err, QuerytuneError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: QuerytuneError = io_err.into();
        assert!(matches!(err, QuerytuneError::Io(_)));
    }
}
