//! Error taxonomy shared by the loader, store, pipeline and query service.

use std::path::PathBuf;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by library operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store could not be reached.
    #[error("failed to connect to the book store: {0}")]
    Connection(#[source] tokio_postgres::Error),

    /// An ingestion input path does not exist.
    #[error("source not found: {}", path.display())]
    SourceNotFound {
        /// Offending path.
        path: PathBuf,
    },

    /// Table rows and embedding rows disagree in whole-file mode.
    #[error("data ({rows} rows) and embeddings ({vectors} rows) length mismatch")]
    Alignment {
        /// Rows read from the tabular source.
        rows: usize,
        /// Rows in the embedding array.
        vectors: usize,
    },

    /// A vector does not have the configured embedding dimension.
    #[error("embedding dimension mismatch: expected {expected}, found {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension encountered.
        actual: usize,
    },

    /// An input file could not be decoded.
    #[error("invalid data in {}: {message}", path.display())]
    DataFormat {
        /// File being decoded.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },

    /// One batch transaction failed and was rolled back.
    #[error("batch {batch} failed: {source}")]
    BatchWrite {
        /// Zero-based batch index within the run.
        batch: usize,
        /// Underlying store error.
        #[source]
        source: Box<Error>,
    },

    /// Point lookup found nothing.
    #[error("book {0} not found")]
    NotFound(i64),

    /// Request parameters were rejected before touching the store.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The store failed while executing a statement.
    #[error("query execution failed: {0}")]
    QueryExecution(String),

    /// The embedding provider failed.
    #[error("embedding provider failed: {0}")]
    Embedding(String),

    /// Local I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidRequest`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    /// Shorthand for [`Error::DataFormat`].
    pub fn data_format(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Error::DataFormat {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::QueryExecution(err.to_string())
    }
}
