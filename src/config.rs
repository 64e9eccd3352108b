//! Command-line and environment configuration shared by the binaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, ValueEnum};

use crate::dataset::DatasetSource;
use crate::embedder::{Embedder, OpenAiEmbedder, QdrantEmbedder};
use crate::error::{Error, Result};
use crate::search::SearchSettings;
use crate::store::{DistanceMetric, HybridWeights, PgStoreOptions, TableName, VectorIndex};

/// Postgres connection and table location.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Postgres connection string (postgres://...); overrides the POSTGRES_* parts
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_USER", default_value = "postgres")]
    pub postgres_user: String,

    #[arg(long, env = "POSTGRES_PASSWORD", hide_env_values = true)]
    pub postgres_password: Option<String>,

    #[arg(long, env = "POSTGRES_DB", default_value = "postgres")]
    pub postgres_db: String,

    /// Schema holding the books table
    #[arg(long, env = "BOOKSEARCH_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Books table name
    #[arg(long, env = "BOOKSEARCH_TABLE", default_value = "books")]
    pub table: String,

    /// Connection attempts before giving up at startup
    #[arg(long, env = "BOOKSEARCH_CONNECT_ATTEMPTS", default_value_t = 5)]
    pub connect_attempts: usize,
}

impl DatabaseArgs {
    pub fn pg_config(&self) -> Result<tokio_postgres::Config> {
        if let Some(url) = self.database_url.as_deref().filter(|url| !url.trim().is_empty()) {
            return url
                .parse()
                .map_err(|err| Error::invalid(format!("invalid DATABASE_URL: {err}")));
        }
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.postgres_host)
            .port(self.postgres_port)
            .user(&self.postgres_user)
            .dbname(&self.postgres_db);
        if let Some(password) = &self.postgres_password {
            config.password(password);
        }
        Ok(config)
    }

    pub fn table_name(&self) -> Result<TableName> {
        TableName::new(&self.schema, &self.table)
    }
}

/// Index flavour selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VectorIndexKind {
    Hnsw,
    Ivfflat,
}

/// Table layout, distance metric and index tuning.
#[derive(Args, Debug, Clone)]
pub struct IndexArgs {
    /// Embedding vector length
    #[arg(long, env = "VECTOR_DIMENSION", default_value_t = 384)]
    pub dimension: usize,

    /// Distance used for ordering and index operator class
    #[arg(long, env = "BOOKSEARCH_DISTANCE", value_enum, default_value_t = DistanceMetric::L2)]
    pub metric: DistanceMetric,

    #[arg(long, env = "BOOKSEARCH_VECTOR_INDEX", value_enum, default_value_t = VectorIndexKind::Hnsw)]
    pub vector_index: VectorIndexKind,

    #[arg(long, env = "BOOKSEARCH_HNSW_M", default_value_t = 16)]
    pub hnsw_m: u32,

    #[arg(long, env = "BOOKSEARCH_HNSW_EF_CONSTRUCTION", default_value_t = 200)]
    pub hnsw_ef_construction: u32,

    #[arg(long, env = "BOOKSEARCH_IVFFLAT_LISTS", default_value_t = 100)]
    pub ivfflat_lists: u32,

    /// Postgres text search configuration
    #[arg(long, env = "BOOKSEARCH_TEXT_CONFIG", default_value = "english")]
    pub text_config: String,
}

impl IndexArgs {
    pub fn vector_index(&self) -> VectorIndex {
        match self.vector_index {
            VectorIndexKind::Hnsw => VectorIndex::Hnsw {
                m: self.hnsw_m.max(2),
                ef_construction: self.hnsw_ef_construction.max(4),
            },
            VectorIndexKind::Ivfflat => VectorIndex::IvfFlat {
                lists: self.ivfflat_lists.max(1),
            },
        }
    }

    pub fn store_options(&self, table: TableName) -> PgStoreOptions {
        PgStoreOptions {
            table,
            dimension: self.dimension,
            metric: self.metric,
            vector_index: self.vector_index(),
            text_config: self.text_config.clone(),
        }
    }
}

/// Query limits, ranking weights and response shaping.
#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Largest top_k or limit a request may ask for
    #[arg(long, env = "DEFAULT_MAX_RESULTS", default_value_t = 100)]
    pub max_results: usize,

    #[arg(long, env = "DEFAULT_TOP_K", default_value_t = 5)]
    pub default_top_k: usize,

    /// Default distance cutoff for raw-vector search
    #[arg(long, env = "DEFAULT_SIMILARITY_THRESHOLD", default_value_t = 0.7)]
    pub similarity_threshold: f64,

    #[arg(long, env = "DEFAULT_VECTOR_LIMIT", default_value_t = 10)]
    pub vector_limit: usize,

    #[arg(long, env = "DEFAULT_PAGE_SIZE", default_value_t = 20)]
    pub default_page_size: u64,

    #[arg(long, env = "MAX_PAGE_SIZE", default_value_t = 100)]
    pub max_page_size: u64,

    #[arg(long, env = "BOOKSEARCH_VECTOR_WEIGHT", default_value_t = 0.7)]
    pub vector_weight: f64,

    #[arg(long, env = "BOOKSEARCH_LEXICAL_WEIGHT", default_value_t = 0.3)]
    pub lexical_weight: f64,

    /// Distance at which hybrid vector similarity reaches zero
    #[arg(long, env = "BOOKSEARCH_DISTANCE_DIVISOR", default_value_t = 10.0)]
    pub distance_divisor: f64,

    #[arg(long, env = "BOOKSEARCH_DESCRIPTION_CHARS", default_value_t = 500)]
    pub description_max_chars: usize,

    #[arg(long, env = "BOOKSEARCH_QUERY_TIMEOUT_SECS", default_value_t = 30)]
    pub query_timeout_secs: u64,

    /// Max cached query embeddings kept in-memory (0 disables caching)
    #[arg(long, env = "BOOKSEARCH_EMBEDDING_CACHE", default_value_t = 1024)]
    pub embedding_cache_size: usize,
}

impl SearchArgs {
    pub fn weights(&self) -> Result<HybridWeights> {
        if self.distance_divisor.is_nan() || self.distance_divisor <= 0.0 {
            return Err(Error::invalid("distance divisor must be positive"));
        }
        if self.vector_weight < 0.0 || self.lexical_weight < 0.0 {
            return Err(Error::invalid("hybrid weights must not be negative"));
        }
        Ok(HybridWeights {
            vector: self.vector_weight,
            lexical: self.lexical_weight,
            distance_divisor: self.distance_divisor,
        })
    }

    pub fn settings(&self, index: &IndexArgs) -> Result<SearchSettings> {
        let defaults = SearchSettings::default();
        Ok(SearchSettings {
            dimension: index.dimension,
            metric: index.metric,
            weights: self.weights()?,
            max_results: self.max_results.max(1),
            default_top_k: self.default_top_k.clamp(1, self.max_results.max(1)),
            similarity_threshold: self.similarity_threshold,
            vector_limit: self.vector_limit.clamp(1, self.max_results.max(1)),
            default_page_size: self.default_page_size.clamp(1, self.max_page_size.max(1)),
            max_page_size: self.max_page_size.max(1),
            description_max_chars: self.description_max_chars,
            query_timeout: Duration::from_secs(self.query_timeout_secs.max(1)),
            embedding_cache_size: self.embedding_cache_size,
            ..defaults
        })
    }
}

/// Embedding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderProvider {
    /// OpenAI-compatible `/embeddings` endpoint.
    Openai,
    /// Qdrant Cloud Inference.
    Qdrant,
}

/// Query embedding provider settings.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    #[arg(long, env = "BOOKSEARCH_EMBEDDER", value_enum, default_value_t = EmbedderProvider::Openai)]
    pub embedder: EmbedderProvider,

    /// Base URL (OpenAI-compatible) or full inference endpoint (Qdrant)
    #[arg(
        long,
        env = "BOOKSEARCH_EMBEDDER_URL",
        default_value = "http://127.0.0.1:8081/v1"
    )]
    pub embedder_url: String,

    #[arg(
        long,
        env = "BOOKSEARCH_EMBEDDER_MODEL",
        default_value = "sentence-transformers/all-MiniLM-L6-v2"
    )]
    pub embedder_model: String,

    #[arg(long, env = "BOOKSEARCH_EMBEDDER_API_KEY", hide_env_values = true)]
    pub embedder_api_key: Option<String>,

    /// Optional output dimension sent to providers that support it
    #[arg(long, env = "BOOKSEARCH_EMBEDDER_DIMENSIONS")]
    pub embedder_dimensions: Option<usize>,

    #[arg(long, env = "BOOKSEARCH_EMBEDDER_TIMEOUT_SECS", default_value_t = 30)]
    pub embedder_timeout_secs: u64,

    /// Retry attempts for transient embedding errors
    #[arg(long, env = "BOOKSEARCH_EMBEDDER_MAX_RETRIES", default_value_t = 5)]
    pub embedder_max_retries: usize,
}

impl EmbedderArgs {
    pub fn build(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        let timeout = Duration::from_secs(self.embedder_timeout_secs.max(1));
        let retries = self.embedder_max_retries.max(1);
        let embedder: Arc<dyn Embedder> = match self.embedder {
            EmbedderProvider::Openai => Arc::new(OpenAiEmbedder::new(
                self.embedder_api_key.as_deref(),
                &self.embedder_url,
                &self.embedder_model,
                self.embedder_dimensions,
                timeout,
                retries,
            )?),
            EmbedderProvider::Qdrant => {
                let key = self
                    .embedder_api_key
                    .as_deref()
                    .context("--embedder-api-key is required for the qdrant embedder")?;
                Arc::new(QdrantEmbedder::new(
                    key,
                    &self.embedder_url,
                    &self.embedder_model,
                    timeout,
                    retries,
                )?)
            }
        };
        Ok(embedder)
    }
}

/// Default dataset locations.
#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    /// Book metadata (csv, json or jsonl)
    #[arg(long = "data", env = "CSV_PATH", default_value = "data/books.csv")]
    pub data_path: PathBuf,

    /// Row-aligned embedding array (npy or json)
    #[arg(long = "embeddings", env = "EMBEDDINGS_PATH", default_value = "data/embeddings.npy")]
    pub embeddings_path: PathBuf,
}

impl DataArgs {
    pub fn source(&self) -> DatasetSource {
        DatasetSource::new(&self.data_path, &self.embeddings_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        index: IndexArgs,
        #[command(flatten)]
        search: SearchArgs,
    }

    #[test]
    fn defaults_match_documented_values() {
        let harness = Harness::try_parse_from(["booksearch"]).unwrap();
        let settings = harness.search.settings(&harness.index).unwrap();
        assert_eq!(settings.dimension, 384);
        assert_eq!(settings.max_results, 100);
        assert_eq!(settings.default_page_size, 20);
        assert_eq!(settings.weights, HybridWeights::default());
        assert_eq!(harness.index.vector_index(), VectorIndex::default());
        assert_eq!(harness.database.table_name().unwrap(), TableName::default());
    }

    #[test]
    fn parses_metric_and_index_flags() {
        let harness = Harness::try_parse_from([
            "booksearch",
            "--metric",
            "inner_product",
            "--vector-index",
            "ivfflat",
            "--ivfflat-lists",
            "50",
            "--database-url",
            "postgres://books:secret@db:5433/library",
        ])
        .unwrap();
        assert_eq!(harness.index.metric, DistanceMetric::InnerProduct);
        assert_eq!(
            harness.index.vector_index(),
            VectorIndex::IvfFlat { lists: 50 }
        );
        let config = harness.database.pg_config().unwrap();
        assert_eq!(config.get_dbname(), Some("library"));
        assert_eq!(config.get_ports(), &[5433]);
    }

    #[test]
    fn rejects_non_positive_divisor() {
        let harness =
            Harness::try_parse_from(["booksearch", "--distance-divisor", "0"]).unwrap();
        assert!(harness.search.weights().is_err());
    }
}
