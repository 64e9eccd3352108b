//! Read path: embeds queries, validates parameters and shapes store results
//! into response views.

use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::book::{truncate_for_display, Book};
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::store::{
    BookStore, DistanceMetric, HybridWeights, LexicalQuery, RankedBook, SearchFilters, StoreQuery,
};

/// Tunables for the query service.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub weights: HybridWeights,
    /// Upper bound for `top_k` and raw-vector limits.
    pub max_results: usize,
    pub default_top_k: usize,
    /// Default distance cutoff for raw-vector search.
    pub similarity_threshold: f64,
    pub vector_limit: usize,
    pub similar_limit: usize,
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub title_match_limit: u64,
    pub description_max_chars: usize,
    pub query_timeout: Duration,
    /// Cached query embeddings; 0 disables the cache.
    pub embedding_cache_size: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            dimension: 384,
            metric: DistanceMetric::L2,
            weights: HybridWeights::default(),
            max_results: 100,
            default_top_k: 5,
            similarity_threshold: 0.7,
            vector_limit: 10,
            similar_limit: 5,
            default_page_size: 20,
            max_page_size: 100,
            title_match_limit: 20,
            description_max_chars: 500,
            query_timeout: Duration::from_secs(30),
            embedding_cache_size: 1024,
        }
    }
}

/// Retrieval strategy for free-text queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Vector,
    Text,
    #[default]
    Hybrid,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchMode::Vector => "vector",
            SearchMode::Text => "text",
            SearchMode::Hybrid => "hybrid",
        })
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(SearchMode::Vector),
            "text" => Ok(SearchMode::Text),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(Error::invalid(format!(
                "invalid search_type {other:?}; must be one of 'vector', 'text', 'hybrid'"
            ))),
        }
    }
}

/// A free-text search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub mode: SearchMode,
    pub filters: SearchFilters,
}

/// Response view of a ranked book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub book_id: i64,
    pub title: String,
    pub author: String,
    pub average_rating: Option<f64>,
    pub publisher: Option<String>,
    pub description: String,
    pub image_url: Option<String>,
    /// Mode-dependent: display similarity, lexical rank or blended score.
    pub similarity_score: f64,
    /// Raw distance, vector paths only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

impl SearchHit {
    fn new(book: Book, similarity_score: f64, distance: Option<f64>, max_chars: usize) -> Self {
        Self {
            book_id: book.book_id,
            description: truncate_for_display(&book.description, max_chars),
            title: book.title,
            author: book.author,
            average_rating: book.average_rating,
            publisher: book.publisher,
            image_url: book.image_url,
            similarity_score,
            distance,
        }
    }
}

/// One-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub size: u64,
}

impl PageRequest {
    fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.size)
    }
}

/// Paginated listing envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub size: u64,
    pub pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            size: request.size,
            pages: total.div_ceil(request.size),
        }
    }
}

/// Query service over a [`BookStore`] and an [`Embedder`].
pub struct SearchService {
    store: Arc<dyn BookStore>,
    embedder: Arc<dyn Embedder>,
    settings: SearchSettings,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn BookStore>,
        embedder: Arc<dyn Embedder>,
        settings: SearchSettings,
    ) -> Self {
        let cache = NonZeroUsize::new(settings.embedding_cache_size)
            .map(|size| Mutex::new(LruCache::new(size)));
        Self {
            store,
            embedder,
            settings,
            cache,
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn BookStore> {
        &self.store
    }

    /// Dispatches on `request.mode`.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let SearchRequest {
            query,
            top_k,
            mode,
            filters,
        } = request;
        match mode {
            SearchMode::Vector => self.vector_search(query, *top_k, filters).await,
            SearchMode::Text => self.text_search(query, *top_k, filters).await,
            SearchMode::Hybrid => self.hybrid_search(query, *top_k, filters).await,
        }
    }

    /// Nearest neighbours of the query embedding, closest first.
    pub async fn vector_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        self.check_query(query, top_k)?;
        let embedding = self.embed_query(query).await?;
        let ranked = self
            .run(StoreQuery::Vector {
                embedding,
                metric: self.settings.metric,
                filters: filters.clone(),
                max_distance: None,
                limit: top_k,
            })
            .await?;
        Ok(self.distance_hits(ranked))
    }

    /// Lexical matches ranked by the store, best first.
    pub async fn text_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        self.check_query(query, top_k)?;
        let terms = LexicalQuery::parse(query);
        if terms.is_empty() {
            return Err(Error::invalid("query contains no searchable terms"));
        }
        let ranked = self
            .run(StoreQuery::Text {
                terms,
                filters: filters.clone(),
                limit: top_k,
            })
            .await?;
        Ok(self.score_hits(ranked))
    }

    /// Weighted blend of vector similarity and lexical rank, best first.
    pub async fn hybrid_search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        self.check_query(query, top_k)?;
        let embedding = self.embed_query(query).await?;
        let ranked = self
            .run(StoreQuery::Hybrid {
                embedding,
                terms: LexicalQuery::parse(query),
                metric: self.settings.metric,
                weights: self.settings.weights,
                filters: filters.clone(),
                limit: top_k,
            })
            .await?;
        Ok(self.score_hits(ranked))
    }

    pub async fn get_book(&self, book_id: i64) -> Result<Option<Book>> {
        let book = self.bounded(self.store.get(book_id)).await?;
        Ok(book.map(|book| self.display_book(book)))
    }

    /// Books nearest to `book_id`, excluding it; `None` when the id is unknown.
    pub async fn similar_to(&self, book_id: i64, limit: usize) -> Result<Option<Vec<SearchHit>>> {
        self.check_limit(limit)?;
        let Some(embedding) = self.bounded(self.store.embedding_of(book_id)).await? else {
            return Ok(None);
        };
        let ranked = self
            .run(StoreQuery::Vector {
                embedding,
                metric: self.settings.metric,
                filters: SearchFilters {
                    exclude_id: Some(book_id),
                    ..SearchFilters::default()
                },
                max_distance: None,
                limit,
            })
            .await?;
        Ok(Some(self.distance_hits(ranked)))
    }

    /// Search with a caller-supplied vector; hits farther than the threshold are dropped.
    pub async fn vector_search_raw(
        &self,
        vector: Vec<f32>,
        metric: Option<DistanceMetric>,
        threshold: Option<f64>,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        if vector.len() != self.settings.dimension {
            return Err(Error::invalid(format!(
                "vector must have {} values, got {}",
                self.settings.dimension,
                vector.len()
            )));
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(Error::invalid("vector values must be finite"));
        }
        let limit = limit.unwrap_or(self.settings.vector_limit);
        self.check_limit(limit)?;
        let ranked = self
            .run(StoreQuery::Vector {
                embedding: vector,
                metric: metric.unwrap_or(self.settings.metric),
                filters: SearchFilters::default(),
                max_distance: Some(threshold.unwrap_or(self.settings.similarity_threshold)),
                limit,
            })
            .await?;
        Ok(self.distance_hits(ranked))
    }

    /// All books in identifier order.
    pub async fn list_books(&self, page: Option<u64>, size: Option<u64>) -> Result<Page<Book>> {
        let request = self.page_request(page, size)?;
        let total = self.bounded(self.store.count()).await?;
        let items = self
            .bounded(self.store.list(request.offset(), request.size))
            .await?;
        Ok(Page::new(self.display_books(items), total, request))
    }

    /// Case-insensitive title matches, capped at the title match limit.
    pub async fn books_by_title(&self, title: &str) -> Result<Vec<Book>> {
        if title.trim().is_empty() {
            return Err(Error::invalid("title must not be empty"));
        }
        let books = self
            .bounded(
                self.store
                    .find_by_title(title.trim(), self.settings.title_match_limit),
            )
            .await?;
        Ok(self.display_books(books))
    }

    /// Case-insensitive substring matches over title, author or description.
    pub async fn substring_search(
        &self,
        term: &str,
        page: Option<u64>,
        size: Option<u64>,
    ) -> Result<Page<Book>> {
        let term = term.trim();
        if term.is_empty() {
            return Err(Error::invalid("search term must not be empty"));
        }
        let request = self.page_request(page, size)?;
        let total = self.bounded(self.store.count_substring(term)).await?;
        let items = self
            .bounded(
                self.store
                    .substring_search(term, request.offset(), request.size),
            )
            .await?;
        Ok(Page::new(self.display_books(items), total, request))
    }

    /// Validates paging parameters, applying defaults.
    pub fn page_request(&self, page: Option<u64>, size: Option<u64>) -> Result<PageRequest> {
        let page = page.unwrap_or(1);
        let size = size.unwrap_or(self.settings.default_page_size);
        if page == 0 {
            return Err(Error::invalid("page must be at least 1"));
        }
        if size == 0 || size > self.settings.max_page_size {
            return Err(Error::invalid(format!(
                "size must be between 1 and {}",
                self.settings.max_page_size
            )));
        }
        Ok(PageRequest { page, size })
    }

    fn check_query(&self, query: &str, top_k: usize) -> Result<()> {
        if query.trim().is_empty() {
            return Err(Error::invalid("query must not be empty"));
        }
        self.check_limit(top_k)
    }

    fn check_limit(&self, limit: usize) -> Result<()> {
        if limit == 0 || limit > self.settings.max_results {
            return Err(Error::invalid(format!(
                "top_k must be between 1 and {}",
                self.settings.max_results
            )));
        }
        Ok(())
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let key = query.trim().to_string();
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().await.get(&key).cloned() {
                debug!("query embedding cache hit");
                return Ok(hit);
            }
        }
        let embedder = self.embedder.clone();
        let text = key.clone();
        let embedding = tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|err| Error::Embedding(format!("embedding task join error: {err}")))?
            .map_err(|err| Error::Embedding(format!("{err:#}")))?;
        if embedding.len() != self.settings.dimension {
            return Err(Error::Embedding(format!(
                "provider returned {} values, expected {}",
                embedding.len(),
                self.settings.dimension
            )));
        }
        if let Some(cache) = &self.cache {
            cache.lock().await.put(key, embedding.clone());
        }
        Ok(embedding)
    }

    async fn run(&self, query: StoreQuery) -> Result<Vec<RankedBook>> {
        self.bounded(self.store.query(&query)).await
    }

    /// Applies the query timeout to one store round trip.
    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.settings.query_timeout;
        tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| Error::QueryExecution(format!("query timed out after {limit:?}")))?
    }

    fn distance_hits(&self, ranked: Vec<RankedBook>) -> Vec<SearchHit> {
        let max_chars = self.settings.description_max_chars;
        ranked
            .into_iter()
            .map(|hit| {
                let similarity = self.settings.weights.similarity(hit.score);
                SearchHit::new(hit.book, similarity, Some(hit.score), max_chars)
            })
            .collect()
    }

    fn score_hits(&self, ranked: Vec<RankedBook>) -> Vec<SearchHit> {
        let max_chars = self.settings.description_max_chars;
        ranked
            .into_iter()
            .map(|hit| SearchHit::new(hit.book, hit.score, None, max_chars))
            .collect()
    }

    fn display_book(&self, mut book: Book) -> Book {
        book.description =
            truncate_for_display(&book.description, self.settings.description_max_chars);
        book
    }

    fn display_books(&self, books: Vec<Book>) -> Vec<Book> {
        books.into_iter().map(|book| self.display_book(book)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::BookRecord;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    /// Maps a few keywords onto fixed 2-d directions.
    struct Keywords;

    impl Embedder for Keywords {
        fn embed_batch(&self, inputs: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(inputs
                .iter()
                .map(|text| {
                    if text.contains("garden") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    async fn service(records: Vec<BookRecord>) -> SearchService {
        let store = Arc::new(MemoryStore::new(2));
        if !records.is_empty() {
            store.write_batch(0, &records).await.unwrap();
        }
        let settings = SearchSettings {
            dimension: 2,
            ..SearchSettings::default()
        };
        SearchService::new(store, Arc::new(Keywords), settings)
    }

    fn record(id: i64, title: &str, embedding: Vec<f32>) -> BookRecord {
        BookRecord {
            book: Book::new(id, title, "Author", "d".repeat(id as usize * 300)),
            embedding,
        }
    }

    #[test]
    fn pagination_arithmetic() {
        let request = PageRequest { page: 3, size: 20 };
        let page = Page::new(vec![(); 5], 45, request);
        assert_eq!(page.pages, 3);
        assert_eq!(request.offset(), 40);
        assert_eq!(Page::<()>::new(Vec::new(), 0, request).pages, 0);
    }

    #[test]
    fn search_mode_rejects_unknown_values() {
        assert_eq!("HYBRID".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!(matches!(
            "fuzzy".parse::<SearchMode>(),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_parameters_before_touching_the_store() {
        let svc = service(Vec::new()).await;
        let none = SearchFilters::default();
        assert!(matches!(
            svc.vector_search("  ", 5, &none).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(svc.hybrid_search("garden", 0, &none).await.is_err());
        assert!(svc.hybrid_search("garden", 101, &none).await.is_err());
        assert!(svc.text_search("?!", 5, &none).await.is_err());
        assert!(svc.page_request(Some(0), None).is_err());
        assert!(svc.page_request(None, Some(101)).is_err());
        assert!(svc
            .vector_search_raw(vec![0.0; 3], None, None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn vector_hits_carry_distance_and_truncated_description() {
        let svc = service(vec![
            record(1, "Gardening", vec![1.0, 0.0]),
            record(2, "Cooking", vec![0.0, 1.0]),
        ])
        .await;
        let hits = svc
            .vector_search("garden tips", 2, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits[0].book_id, 1);
        assert_eq!(hits[0].distance, Some(0.0));
        assert_eq!(hits[0].similarity_score, 1.0);
        assert_eq!(hits[1].description.chars().count(), 503);
        assert!(hits[1].description.ends_with("..."));
    }

    #[tokio::test]
    async fn similar_to_excludes_source_and_handles_unknown_ids() {
        let svc = service(vec![
            record(1, "A", vec![1.0, 0.0]),
            record(2, "B", vec![0.9, 0.1]),
            record(3, "C", vec![0.0, 1.0]),
        ])
        .await;
        let hits = svc.similar_to(1, 5).await.unwrap().unwrap();
        assert_eq!(
            hits.iter().map(|h| h.book_id).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(svc.similar_to(42, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_vector_search_applies_threshold() {
        let svc = service(vec![
            record(1, "A", vec![1.0, 0.0]),
            record(2, "B", vec![0.0, 1.0]),
        ])
        .await;
        let hits = svc
            .vector_search_raw(vec![1.0, 0.0], Some(DistanceMetric::Cosine), None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].book_id, 1);
    }

    #[tokio::test]
    async fn listing_pages_past_the_end_are_empty() {
        let svc = service((1..=3).map(|id| record(id, "T", vec![0.0, 1.0])).collect()).await;
        let page = svc.list_books(Some(2), Some(2)).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.pages, 2);
        let beyond = svc.list_books(Some(9), Some(2)).await.unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 3);
    }
}
