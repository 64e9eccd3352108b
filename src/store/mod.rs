//! Persistence boundary: schema management, batched writes and ranked reads.

mod memory;
mod postgres;
mod table;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::book::{Book, BookRecord};
use crate::error::{Error, Result};

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreOptions};
pub use table::TableName;

/// Storage backend for book records.
///
/// Writes are transactional per batch; reads carry no isolation guarantee and
/// may observe a table that is still being loaded.
#[async_trait]
pub trait BookStore: Send + Sync {
    /// Creates the table and vector index when absent. Safe to call repeatedly.
    async fn ensure_schema(&self) -> Result<()>;

    /// Creates lexical indexes for each searchable field plus the vector index.
    async fn ensure_indexes(&self) -> Result<()>;

    /// Writes one batch atomically.
    ///
    /// On failure nothing from the batch is kept and the error is
    /// [`Error::BatchWrite`] carrying `batch`.
    async fn write_batch(&self, batch: usize, records: &[BookRecord]) -> Result<usize>;

    /// Removes every record.
    async fn clear_all(&self) -> Result<()>;

    /// Runs a ranked retrieval.
    async fn query(&self, query: &StoreQuery) -> Result<Vec<RankedBook>>;

    async fn get(&self, book_id: i64) -> Result<Option<Book>>;

    async fn embedding_of(&self, book_id: i64) -> Result<Option<Vec<f32>>>;

    async fn count(&self) -> Result<u64>;

    /// Books ordered by identifier.
    async fn list(&self, offset: u64, limit: u64) -> Result<Vec<Book>>;

    /// Case-insensitive title substring matches ordered by identifier.
    async fn find_by_title(&self, fragment: &str, limit: u64) -> Result<Vec<Book>>;

    /// Case-insensitive substring matches over title, author or description.
    async fn substring_search(&self, term: &str, offset: u64, limit: u64) -> Result<Vec<Book>>;

    async fn count_substring(&self, term: &str) -> Result<u64>;
}

/// Distance function used for nearest-neighbour ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    L2,
    Cosine,
    #[value(name = "inner_product")]
    InnerProduct,
}

impl DistanceMetric {
    /// pgvector operator.
    pub fn operator(self) -> &'static str {
        match self {
            DistanceMetric::L2 => "<->",
            DistanceMetric::Cosine => "<=>",
            DistanceMetric::InnerProduct => "<#>",
        }
    }

    /// pgvector operator class for index creation.
    pub fn operator_class(self) -> &'static str {
        match self {
            DistanceMetric::L2 => "vector_l2_ops",
            DistanceMetric::Cosine => "vector_cosine_ops",
            DistanceMetric::InnerProduct => "vector_ip_ops",
        }
    }

    /// Distance as pgvector computes it; inner product is negated so smaller is closer.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f64 {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
        match self {
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (*x as f64 - *y as f64).powi(2))
                .sum::<f64>()
                .sqrt(),
            DistanceMetric::Cosine => {
                let norm_a = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
                let norm_b = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return f64::NAN;
                }
                1.0 - dot / (norm_a * norm_b)
            }
            DistanceMetric::InnerProduct => -dot,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::InnerProduct => "inner_product",
        })
    }
}

impl FromStr for DistanceMetric {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "l2" => Ok(DistanceMetric::L2),
            "cosine" => Ok(DistanceMetric::Cosine),
            "inner_product" => Ok(DistanceMetric::InnerProduct),
            other => Err(Error::invalid(format!(
                "invalid distance strategy {other:?}; must be one of 'cosine', 'l2', 'inner_product'"
            ))),
        }
    }
}

/// Approximate-nearest-neighbour index built over the embedding column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorIndex {
    Hnsw { m: u32, ef_construction: u32 },
    IvfFlat { lists: u32 },
}

impl Default for VectorIndex {
    fn default() -> Self {
        VectorIndex::Hnsw {
            m: 16,
            ef_construction: 200,
        }
    }
}

/// Fixed linear blend of vector similarity and lexical rank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub vector: f64,
    pub lexical: f64,
    /// Distances at or above this value map to zero similarity.
    pub distance_divisor: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            lexical: 0.3,
            distance_divisor: 10.0,
        }
    }
}

impl HybridWeights {
    /// Display similarity `1 - clamp(distance / divisor, 0, 1)`.
    ///
    /// A heuristic for ranking and display, not a calibrated probability.
    pub fn similarity(&self, distance: f64) -> f64 {
        1.0 - (distance / self.distance_divisor).clamp(0.0, 1.0)
    }

    /// Weighted sum of similarity and lexical rank (0 when the text did not match).
    pub fn blend(&self, distance: f64, lexical_rank: Option<f64>) -> f64 {
        self.vector * self.similarity(distance) + self.lexical * lexical_rank.unwrap_or(0.0)
    }
}

/// Conjunctive restrictions evaluated by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    /// Case-insensitive substring of the author.
    pub author: Option<String>,
    /// Case-insensitive substring of the title.
    pub title: Option<String>,
    /// Minimum description length in characters.
    pub min_content_length: Option<u32>,
    /// Identifier excluded from results.
    pub exclude_id: Option<i64>,
}

impl SearchFilters {
    pub fn matches(&self, book: &Book) -> bool {
        if let Some(author) = &self.author {
            if !contains_ignore_case(&book.author, author) {
                return false;
            }
        }
        if let Some(title) = &self.title {
            if !contains_ignore_case(&book.title, title) {
                return false;
            }
        }
        if let Some(min) = self.min_content_length {
            if book.description.chars().count() < min as usize {
                return false;
            }
        }
        self.exclude_id != Some(book.book_id)
    }
}

pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Lexical query: alphanumeric terms that must all match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LexicalQuery {
    terms: Vec<String>,
}

impl LexicalQuery {
    /// Splits free text on non-alphanumeric characters. Operators and quotes in
    /// the input never reach the store's query parser.
    pub fn parse(text: &str) -> Self {
        let mut terms: Vec<String> = Vec::new();
        for token in tokenize(text) {
            if !terms.contains(&token) {
                terms.push(token);
            }
        }
        Self { terms }
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// `to_tsquery` expression with every term ANDed.
    pub fn to_tsquery(&self) -> String {
        self.terms.join(" & ")
    }
}

/// Lowercased alphanumeric tokens.
pub(crate) fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// One retrieval request against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreQuery {
    /// Ascending distance; `score` is the raw distance.
    Vector {
        embedding: Vec<f32>,
        metric: DistanceMetric,
        filters: SearchFilters,
        /// Drop hits farther than this distance.
        max_distance: Option<f64>,
        limit: usize,
    },
    /// Descending lexical rank over title, author and description; `score` is the rank.
    Text {
        terms: LexicalQuery,
        filters: SearchFilters,
        limit: usize,
    },
    /// Descending blended score; non-matching text contributes zero.
    Hybrid {
        embedding: Vec<f32>,
        terms: LexicalQuery,
        metric: DistanceMetric,
        weights: HybridWeights,
        filters: SearchFilters,
        limit: usize,
    },
}

/// A stored book with its mode-dependent score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedBook {
    pub book: Book,
    pub score: f64,
}

/// `%term%` with LIKE metacharacters escaped (escape character `\`).
pub(crate) fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}
