//! Semantic search over a book catalog stored in Postgres with pgvector.

pub mod api;
pub mod book;
pub mod config;
pub mod dataset;
pub mod embedder;
pub mod error;
pub mod ingest;
pub mod search;
pub mod store;
pub mod telemetry;

pub use book::{Book, BookRecord};
pub use dataset::DatasetSource;
pub use error::{Error, Result};
pub use ingest::{
    IngestControl, IngestOptions, IngestState, IngestSummary, Ingestor, LoadReport, WriteMode,
};
pub use search::{Page, SearchHit, SearchMode, SearchRequest, SearchService, SearchSettings};
pub use store::{BookStore, DistanceMetric, MemoryStore, PgStore, SearchFilters, TableName};
