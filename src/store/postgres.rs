//! pgvector-backed [`BookStore`].
//!
//! Every operation opens its own connection and drops it when done, so an
//! ingestion run never pins a session that queries need.

use std::time::Duration;

use async_trait::async_trait;
use pgvector::Vector;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, info, warn};

use super::{
    like_pattern, BookStore, DistanceMetric, RankedBook, SearchFilters, StoreQuery, TableName,
    VectorIndex,
};
use crate::book::{Book, BookRecord};
use crate::error::{Error, Result};

const BOOK_COLUMNS: &str = "book_id, title, author, author_id, work_id, language, \
    average_rating, ratings_count, publication_date, original_publication_date, format, \
    edition_information, publisher, num_pages, series_name, series_position, description, \
    image_url, shelves, rating_distribution";

/// Table layout and index tuning.
#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    pub table: TableName,
    /// Length of the `VECTOR(D)` column.
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub vector_index: VectorIndex,
    /// Text search configuration, e.g. `english`.
    pub text_config: String,
}

impl PgStoreOptions {
    pub fn new(table: TableName, dimension: usize) -> Self {
        Self {
            table,
            dimension,
            metric: DistanceMetric::default(),
            vector_index: VectorIndex::default(),
            text_config: "english".to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(Error::invalid("embedding dimension must be positive"));
        }
        let config_ok = !self.text_config.is_empty()
            && self
                .text_config
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !config_ok {
            return Err(Error::invalid(format!(
                "invalid text search configuration {:?}",
                self.text_config
            )));
        }
        Ok(())
    }

    fn regconfig(&self) -> String {
        format!("'{}'::regconfig", self.text_config)
    }
}

/// Postgres store using tokio-postgres and the pgvector extension.
pub struct PgStore {
    config: Config,
    options: PgStoreOptions,
}

impl PgStore {
    /// Builds the store and probes connectivity, retrying with exponential
    /// backoff up to `attempts` times before failing with [`Error::Connection`].
    pub async fn connect(config: Config, options: PgStoreOptions, attempts: usize) -> Result<Self> {
        options.validate()?;
        let store = Self { config, options };
        let attempts = attempts.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match store.client().await {
                Ok(client) => {
                    client.simple_query("SELECT 1").await?;
                    info!(table = %store.options.table.qualified(), "connected to Postgres");
                    return Ok(store);
                }
                Err(err) if attempt < attempts => {
                    let delay = Duration::from_millis(250 * (1 << attempt.min(6)));
                    warn!(attempt, error = %err, ?delay, "Postgres unavailable; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn options(&self) -> &PgStoreOptions {
        &self.options
    }

    async fn client(&self) -> Result<Client> {
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(Error::Connection)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "postgres connection error");
            }
        });
        Ok(client)
    }

    /// Dimension of an existing `embedding` column, or `None` if the table is absent.
    async fn existing_dimension(&self, client: &Client) -> Result<Option<usize>> {
        let row = client
            .query_opt(
                "SELECT a.atttypmod FROM pg_attribute a \
                 WHERE a.attrelid = to_regclass($1::text) AND a.attname = 'embedding' \
                 AND NOT a.attisdropped",
                &[&self.options.table.qualified()],
            )
            .await?;
        Ok(row.map(|row| row.get::<_, i32>(0).max(0) as usize))
    }

    async fn query_books(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Book>> {
        let client = self.client().await?;
        let rows = client.query(sql, params).await?;
        rows.iter().map(book_from_row).collect()
    }

    async fn insert_batch(&self, records: &[BookRecord]) -> Result<usize> {
        let mut client = self.client().await?;
        let sql = insert_sql(&self.options.table);
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        for record in records {
            if record.embedding.len() != self.options.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.options.dimension,
                    actual: record.embedding.len(),
                });
            }
            let book = &record.book;
            let vector = Vector::from(record.embedding.clone());
            transaction
                .execute(
                    &statement,
                    &[
                        &book.book_id,
                        &book.title,
                        &book.author,
                        &book.author_id,
                        &book.work_id,
                        &book.language,
                        &book.average_rating,
                        &book.ratings_count,
                        &book.publication_date,
                        &book.original_publication_date,
                        &book.format,
                        &book.edition_information,
                        &book.publisher,
                        &book.num_pages,
                        &book.series_name,
                        &book.series_position,
                        &book.description,
                        &book.image_url,
                        &book.shelves,
                        &book.rating_distribution,
                        &vector,
                    ],
                )
                .await?;
        }
        // An early return above drops the transaction, which rolls it back.
        transaction.commit().await?;
        Ok(records.len())
    }
}

#[async_trait]
impl BookStore for PgStore {
    async fn ensure_schema(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await?;
        if let Some(actual) = self.existing_dimension(&client).await? {
            if actual != self.options.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.options.dimension,
                    actual,
                });
            }
        }
        for statement in schema_ddl(&self.options) {
            client.execute(&statement, &[]).await?;
        }
        debug!(table = %self.options.table.qualified(), "schema ensured");
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let client = self.client().await?;
        for statement in index_ddl(&self.options) {
            client.execute(&statement, &[]).await?;
        }
        // VACUUM refuses transaction blocks, so it goes over the simple protocol.
        let vacuum = format!("VACUUM ANALYZE {}", self.options.table.qualified());
        client.batch_execute(&vacuum).await?;
        info!(table = %self.options.table.qualified(), "indexes ensured");
        Ok(())
    }

    async fn write_batch(&self, batch: usize, records: &[BookRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.insert_batch(records)
            .await
            .map_err(|source| Error::BatchWrite {
                batch,
                source: Box::new(source),
            })
    }

    async fn clear_all(&self) -> Result<()> {
        let client = self.client().await?;
        let sql = format!("TRUNCATE TABLE {}", self.options.table.qualified());
        client.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<RankedBook>> {
        let (sql, params) = ranked_sql(&self.options, query);
        let client = self.client().await?;
        let rows = client.query(&sql, &params.refs()).await?;
        rows.iter()
            .map(|row| {
                Ok(RankedBook {
                    book: book_from_row(row)?,
                    score: row.try_get("score")?,
                })
            })
            .collect()
    }

    async fn get(&self, book_id: i64) -> Result<Option<Book>> {
        let sql = format!(
            "SELECT {BOOK_COLUMNS} FROM {} WHERE book_id = $1",
            self.options.table.qualified()
        );
        Ok(self.query_books(&sql, &[&book_id]).await?.into_iter().next())
    }

    async fn embedding_of(&self, book_id: i64) -> Result<Option<Vec<f32>>> {
        let sql = format!(
            "SELECT embedding FROM {} WHERE book_id = $1",
            self.options.table.qualified()
        );
        let client = self.client().await?;
        let row = client.query_opt(&sql, &[&book_id]).await?;
        row.map(|row| row.try_get::<_, Vector>(0).map(|vector| vector.to_vec()))
            .transpose()
            .map_err(Error::from)
    }

    async fn count(&self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.options.table.qualified());
        let client = self.client().await?;
        let total: i64 = client.query_one(&sql, &[]).await?.try_get(0)?;
        Ok(total.max(0) as u64)
    }

    async fn list(&self, offset: u64, limit: u64) -> Result<Vec<Book>> {
        let sql = format!(
            "SELECT {BOOK_COLUMNS} FROM {} ORDER BY book_id ASC LIMIT $1 OFFSET $2",
            self.options.table.qualified()
        );
        self.query_books(&sql, &[&to_i64(limit), &to_i64(offset)])
            .await
    }

    async fn find_by_title(&self, fragment: &str, limit: u64) -> Result<Vec<Book>> {
        let sql = format!(
            "SELECT {BOOK_COLUMNS} FROM {} WHERE title ILIKE $1 ESCAPE '\\' \
             ORDER BY book_id ASC LIMIT $2",
            self.options.table.qualified()
        );
        self.query_books(&sql, &[&like_pattern(fragment), &to_i64(limit)])
            .await
    }

    async fn substring_search(&self, term: &str, offset: u64, limit: u64) -> Result<Vec<Book>> {
        let sql = format!(
            "SELECT {BOOK_COLUMNS} FROM {} WHERE {} ORDER BY book_id ASC LIMIT $2 OFFSET $3",
            self.options.table.qualified(),
            SUBSTRING_PREDICATE
        );
        self.query_books(&sql, &[&like_pattern(term), &to_i64(limit), &to_i64(offset)])
            .await
    }

    async fn count_substring(&self, term: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            self.options.table.qualified(),
            SUBSTRING_PREDICATE
        );
        let client = self.client().await?;
        let total: i64 = client
            .query_one(&sql, &[&like_pattern(term)])
            .await?
            .try_get(0)?;
        Ok(total.max(0) as u64)
    }
}

const SUBSTRING_PREDICATE: &str = "(title ILIKE $1 ESCAPE '\\' OR author ILIKE $1 ESCAPE '\\' \
    OR description ILIKE $1 ESCAPE '\\')";

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn book_from_row(row: &Row) -> Result<Book> {
    Ok(Book {
        book_id: row.try_get("book_id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        author_id: row.try_get("author_id")?,
        work_id: row.try_get("work_id")?,
        language: row.try_get("language")?,
        average_rating: row.try_get("average_rating")?,
        ratings_count: row.try_get("ratings_count")?,
        publication_date: row.try_get("publication_date")?,
        original_publication_date: row.try_get("original_publication_date")?,
        format: row.try_get("format")?,
        edition_information: row.try_get("edition_information")?,
        publisher: row.try_get("publisher")?,
        num_pages: row.try_get("num_pages")?,
        series_name: row.try_get("series_name")?,
        series_position: row.try_get("series_position")?,
        description: row.try_get("description")?,
        image_url: row.try_get("image_url")?,
        shelves: row.try_get("shelves")?,
        rating_distribution: row.try_get("rating_distribution")?,
    })
}

/// Statements run by `ensure_schema` once the extension exists.
fn schema_ddl(options: &PgStoreOptions) -> Vec<String> {
    vec![table_ddl(options), vector_index_ddl(options)]
}

/// Statements run by `ensure_indexes` before the table is vacuumed.
fn index_ddl(options: &PgStoreOptions) -> Vec<String> {
    let mut statements = lexical_index_ddl(options);
    statements.push(vector_index_ddl(options));
    statements
}

fn table_ddl(options: &PgStoreOptions) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            book_id BIGINT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            author_id BIGINT,
            work_id BIGINT,
            language TEXT,
            average_rating DOUBLE PRECISION,
            ratings_count BIGINT,
            publication_date TEXT,
            original_publication_date TEXT,
            format TEXT,
            edition_information TEXT,
            publisher TEXT,
            num_pages DOUBLE PRECISION,
            series_name TEXT,
            series_position TEXT,
            description TEXT NOT NULL,
            image_url TEXT,
            shelves TEXT,
            rating_distribution TEXT,
            embedding VECTOR({dims}) NOT NULL,
            search_tsv TSVECTOR GENERATED ALWAYS AS (
                to_tsvector({config}, title || ' ' || author || ' ' || description)
            ) STORED
        )",
        table = options.table.qualified(),
        dims = options.dimension,
        config = options.regconfig(),
    )
}

fn vector_index_ddl(options: &PgStoreOptions) -> String {
    let table = &options.table;
    let opclass = options.metric.operator_class();
    match options.vector_index {
        VectorIndex::Hnsw { m, ef_construction } => format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING hnsw (embedding {opclass}) \
             WITH (m = {m}, ef_construction = {ef_construction})",
            table.index_name(&format!("embedding_hnsw_{}", options.metric)),
            table.qualified(),
        ),
        VectorIndex::IvfFlat { lists } => format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING ivfflat (embedding {opclass}) \
             WITH (lists = {lists})",
            table.index_name(&format!("embedding_ivfflat_{}", options.metric)),
            table.qualified(),
        ),
    }
}

fn lexical_index_ddl(options: &PgStoreOptions) -> Vec<String> {
    let table = &options.table;
    let config = options.regconfig();
    let mut statements: Vec<String> = ["title", "author", "description"]
        .iter()
        .map(|field| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} USING GIN (to_tsvector({config}, {field}))",
                table.index_name(&format!("{field}_gin")),
                table.qualified(),
            )
        })
        .collect();
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING GIN (search_tsv)",
        table.index_name("search_tsv_gin"),
        table.qualified(),
    ));
    statements
}

fn insert_sql(table: &TableName) -> String {
    format!(
        "INSERT INTO {} ({BOOK_COLUMNS}, embedding) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
         $19, $20, $21)",
        table.qualified()
    )
}

/// Positional bind parameters collected while a statement is assembled.
#[derive(Default)]
struct Params {
    values: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl Params {
    /// Stores `value` and returns its placeholder.
    fn bind<T: ToSql + Sync + Send + 'static>(&mut self, value: T) -> String {
        self.values.push(Box::new(value));
        format!("${}", self.values.len())
    }

    fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|value| value.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

fn filter_clauses(filters: &SearchFilters, params: &mut Params) -> Vec<String> {
    let mut clauses = Vec::new();
    if let Some(author) = &filters.author {
        clauses.push(format!(
            "author ILIKE {} ESCAPE '\\'",
            params.bind(like_pattern(author))
        ));
    }
    if let Some(title) = &filters.title {
        clauses.push(format!(
            "title ILIKE {} ESCAPE '\\'",
            params.bind(like_pattern(title))
        ));
    }
    if let Some(min) = filters.min_content_length {
        clauses.push(format!(
            "char_length(description) >= {}::bigint",
            params.bind(i64::from(min))
        ));
    }
    if let Some(id) = filters.exclude_id {
        clauses.push(format!("book_id <> {}", params.bind(id)));
    }
    clauses
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

/// Builds the ranked retrieval statement; every caller-supplied value is bound.
fn ranked_sql(options: &PgStoreOptions, query: &StoreQuery) -> (String, Params) {
    let table = options.table.qualified();
    let config = options.regconfig();
    let mut params = Params::default();
    let sql = match query {
        StoreQuery::Vector {
            embedding,
            metric,
            filters,
            max_distance,
            limit,
        } => {
            let vector = params.bind(Vector::from(embedding.clone()));
            let distance = format!("(embedding {} {vector})", metric.operator());
            let mut clauses = filter_clauses(filters, &mut params);
            if let Some(max) = max_distance {
                clauses.push(format!("{distance} <= {}::float8", params.bind(*max)));
            }
            let limit = params.bind(*limit as i64);
            format!(
                "SELECT {BOOK_COLUMNS}, {distance} AS score FROM {table} {} \
                 ORDER BY score ASC, book_id ASC LIMIT {limit}",
                where_sql(&clauses)
            )
        }
        StoreQuery::Text {
            terms,
            filters,
            limit,
        } => {
            let tsquery = params.bind(terms.to_tsquery());
            let mut clauses = vec!["search_tsv @@ q.tsq".to_string()];
            clauses.extend(filter_clauses(filters, &mut params));
            let limit = params.bind(*limit as i64);
            format!(
                "SELECT {BOOK_COLUMNS}, ts_rank(search_tsv, q.tsq)::float8 AS score \
                 FROM {table}, to_tsquery({config}, {tsquery}) AS q(tsq) {} \
                 ORDER BY score DESC, book_id ASC LIMIT {limit}",
                where_sql(&clauses)
            )
        }
        StoreQuery::Hybrid {
            embedding,
            terms,
            metric,
            weights,
            filters,
            limit,
        } => {
            let vector = params.bind(Vector::from(embedding.clone()));
            let tsquery = params.bind(terms.to_tsquery());
            let vector_weight = params.bind(weights.vector);
            let lexical_weight = params.bind(weights.lexical);
            let divisor = params.bind(weights.distance_divisor);
            let clauses = filter_clauses(filters, &mut params);
            let limit = params.bind(*limit as i64);
            format!(
                "SELECT {BOOK_COLUMNS}, \
                 ({vector_weight}::float8 * (1 - LEAST(GREATEST((embedding {op} {vector}) / {divisor}::float8, 0), 1)) \
                 + {lexical_weight}::float8 * COALESCE(CASE WHEN search_tsv @@ q.tsq \
                 THEN ts_rank(search_tsv, q.tsq) END, 0)::float8) AS score \
                 FROM {table}, to_tsquery({config}, {tsquery}) AS q(tsq) {} \
                 ORDER BY score DESC, book_id ASC LIMIT {limit}",
                where_sql(&clauses),
                op = metric.operator(),
            )
        }
    };
    (sql, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HybridWeights, LexicalQuery};

    fn options() -> PgStoreOptions {
        PgStoreOptions::new(TableName::default(), 3)
    }

    #[test]
    fn vector_sql_binds_filters_and_breaks_ties_by_id() {
        let query = StoreQuery::Vector {
            embedding: vec![0.0; 3],
            metric: DistanceMetric::L2,
            filters: SearchFilters {
                author: Some("O'Brien'; DROP TABLE books; --".into()),
                title: Some("Mining".into()),
                min_content_length: Some(500),
                exclude_id: Some(9),
            },
            max_distance: Some(0.7),
            limit: 5,
        };
        let (sql, params) = ranked_sql(&options(), &query);
        assert_eq!(params.len(), 7);
        assert!(!sql.contains("DROP TABLE"));
        assert!(sql.contains("(embedding <-> $1)"));
        assert!(sql.contains("author ILIKE $2 ESCAPE"));
        assert!(sql.contains("book_id <> $5"));
        assert!(sql.contains("ORDER BY score ASC, book_id ASC LIMIT $7"));
    }

    #[test]
    fn text_sql_uses_generated_column() {
        let query = StoreQuery::Text {
            terms: LexicalQuery::parse("gardening basics"),
            filters: SearchFilters::default(),
            limit: 3,
        };
        let (sql, params) = ranked_sql(&options(), &query);
        assert_eq!(params.len(), 2);
        assert!(sql.contains("to_tsquery('english'::regconfig, $1)"));
        assert!(sql.contains("WHERE search_tsv @@ q.tsq"));
        assert!(sql.contains("ORDER BY score DESC, book_id ASC LIMIT $2"));
    }

    #[test]
    fn hybrid_sql_outer_joins_lexical_rank() {
        let query = StoreQuery::Hybrid {
            embedding: vec![0.0; 3],
            terms: LexicalQuery::parse("neural"),
            metric: DistanceMetric::Cosine,
            weights: HybridWeights::default(),
            filters: SearchFilters::default(),
            limit: 5,
        };
        let (sql, params) = ranked_sql(&options(), &query);
        assert_eq!(params.len(), 6);
        assert!(sql.contains("(embedding <=> $1)"));
        assert!(sql.contains("COALESCE(CASE WHEN search_tsv @@ q.tsq"));
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn ddl_follows_configuration() {
        let mut opts = options();
        assert!(table_ddl(&opts).contains("embedding VECTOR(3) NOT NULL"));
        assert!(vector_index_ddl(&opts).contains("USING hnsw (embedding vector_l2_ops)"));
        assert!(vector_index_ddl(&opts).contains("m = 16, ef_construction = 200"));
        opts.metric = DistanceMetric::Cosine;
        opts.vector_index = VectorIndex::IvfFlat { lists: 100 };
        assert!(vector_index_ddl(&opts).contains("ivfflat (embedding vector_cosine_ops)"));
        assert_eq!(lexical_index_ddl(&opts).len(), 4);
    }

    #[test]
    fn every_schema_statement_can_be_rerun() {
        for index in [
            VectorIndex::Hnsw {
                m: 16,
                ef_construction: 200,
            },
            VectorIndex::IvfFlat { lists: 100 },
        ] {
            let mut opts = options();
            opts.vector_index = index;
            let schema = schema_ddl(&opts);
            assert!(schema[0].starts_with("CREATE TABLE IF NOT EXISTS"));
            assert!(schema[1..]
                .iter()
                .all(|sql| sql.starts_with("CREATE INDEX IF NOT EXISTS")));
            let indexes = index_ddl(&opts);
            assert_eq!(indexes.len(), 5);
            assert!(indexes
                .iter()
                .all(|sql| sql.starts_with("CREATE INDEX IF NOT EXISTS")));
        }
    }

    #[test]
    fn rejects_unsafe_text_config() {
        let mut opts = options();
        opts.text_config = "english'); DROP".into();
        assert!(opts.validate().is_err());
        opts.text_config = "simple".into();
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn insert_has_one_placeholder_per_column() {
        let sql = insert_sql(&TableName::default());
        let columns = BOOK_COLUMNS.split(',').count() + 1;
        assert!(sql.contains(&format!("${columns})")));
        assert!(!sql.contains(&format!("${}", columns + 1)));
    }
}
