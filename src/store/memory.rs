//! In-process [`BookStore`] with the same ordering rules as [`super::PgStore`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{contains_ignore_case, tokenize, BookStore, LexicalQuery, RankedBook, StoreQuery};
use crate::book::{Book, BookRecord};
use crate::error::{Error, Result};

/// Records keyed by `book_id`; iteration order is identifier order.
pub struct MemoryStore {
    dimension: usize,
    records: RwLock<BTreeMap<i64, BookRecord>>,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Share of document tokens hit by the query, or `None` unless every term occurs.
fn lexical_rank(book: &Book, terms: &LexicalQuery) -> Option<f64> {
    if terms.is_empty() {
        return None;
    }
    let tokens: Vec<String> = tokenize(&book.lexical_text()).collect();
    if !terms.terms().iter().all(|term| tokens.contains(term)) {
        return None;
    }
    let hits = tokens
        .iter()
        .filter(|token| terms.terms().contains(token))
        .count();
    Some(hits as f64 / tokens.len() as f64)
}

type Order = fn(&RankedBook, &RankedBook) -> Ordering;

fn ascending(a: &RankedBook, b: &RankedBook) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then(a.book.book_id.cmp(&b.book.book_id))
}

fn descending(a: &RankedBook, b: &RankedBook) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.book.book_id.cmp(&b.book.book_id))
}

#[async_trait]
impl BookStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&self, batch: usize, records: &[BookRecord]) -> Result<usize> {
        let mut stored = self.records.write().await;
        let fail = |source: Error| Error::BatchWrite {
            batch,
            source: Box::new(source),
        };
        let mut seen = HashSet::new();
        for record in records {
            if record.embedding.len() != self.dimension {
                return Err(fail(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: record.embedding.len(),
                }));
            }
            let id = record.book.book_id;
            if stored.contains_key(&id) || !seen.insert(id) {
                return Err(fail(Error::QueryExecution(format!(
                    "duplicate key value violates unique constraint: book_id={id}"
                ))));
            }
        }
        for record in records {
            stored.insert(record.book.book_id, record.clone());
        }
        Ok(records.len())
    }

    async fn clear_all(&self) -> Result<()> {
        self.records.write().await.clear();
        Ok(())
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<RankedBook>> {
        let stored = self.records.read().await;
        let (mut hits, order, limit): (Vec<RankedBook>, Order, usize) =
            match query {
                StoreQuery::Vector {
                    embedding,
                    metric,
                    filters,
                    max_distance,
                    limit,
                } => {
                    let hits = stored
                        .values()
                        .filter(|record| filters.matches(&record.book))
                        .map(|record| RankedBook {
                            score: metric.distance(&record.embedding, embedding),
                            book: record.book.clone(),
                        })
                        .filter(|hit| max_distance.map_or(true, |max| hit.score <= max))
                        .collect();
                    (hits, ascending as Order, *limit)
                }
                StoreQuery::Text {
                    terms,
                    filters,
                    limit,
                } => {
                    let hits = stored
                        .values()
                        .filter(|record| filters.matches(&record.book))
                        .filter_map(|record| {
                            lexical_rank(&record.book, terms).map(|score| RankedBook {
                                score,
                                book: record.book.clone(),
                            })
                        })
                        .collect();
                    (hits, descending as Order, *limit)
                }
                StoreQuery::Hybrid {
                    embedding,
                    terms,
                    metric,
                    weights,
                    filters,
                    limit,
                } => {
                    let hits = stored
                        .values()
                        .filter(|record| filters.matches(&record.book))
                        .map(|record| {
                            let distance = metric.distance(&record.embedding, embedding);
                            RankedBook {
                                score: weights.blend(distance, lexical_rank(&record.book, terms)),
                                book: record.book.clone(),
                            }
                        })
                        .collect();
                    (hits, descending as Order, *limit)
                }
            };
        hits.sort_by(order);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get(&self, book_id: i64) -> Result<Option<Book>> {
        let stored = self.records.read().await;
        Ok(stored.get(&book_id).map(|record| record.book.clone()))
    }

    async fn embedding_of(&self, book_id: i64) -> Result<Option<Vec<f32>>> {
        let stored = self.records.read().await;
        Ok(stored.get(&book_id).map(|record| record.embedding.clone()))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.read().await.len() as u64)
    }

    async fn list(&self, offset: u64, limit: u64) -> Result<Vec<Book>> {
        let stored = self.records.read().await;
        Ok(stored
            .values()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|record| record.book.clone())
            .collect())
    }

    async fn find_by_title(&self, fragment: &str, limit: u64) -> Result<Vec<Book>> {
        let stored = self.records.read().await;
        Ok(stored
            .values()
            .filter(|record| contains_ignore_case(&record.book.title, fragment))
            .take(limit as usize)
            .map(|record| record.book.clone())
            .collect())
    }

    async fn substring_search(&self, term: &str, offset: u64, limit: u64) -> Result<Vec<Book>> {
        let stored = self.records.read().await;
        Ok(stored
            .values()
            .filter(|record| substring_match(&record.book, term))
            .skip(offset as usize)
            .take(limit as usize)
            .map(|record| record.book.clone())
            .collect())
    }

    async fn count_substring(&self, term: &str) -> Result<u64> {
        let stored = self.records.read().await;
        Ok(stored
            .values()
            .filter(|record| substring_match(&record.book, term))
            .count() as u64)
    }
}

fn substring_match(book: &Book, term: &str) -> bool {
    contains_ignore_case(&book.title, term)
        || contains_ignore_case(&book.author, term)
        || contains_ignore_case(&book.description, term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DistanceMetric, HybridWeights, SearchFilters};
    use pretty_assertions::assert_eq;

    fn record(id: i64, title: &str, description: &str, embedding: Vec<f32>) -> BookRecord {
        BookRecord {
            book: Book::new(id, title, "Anon", description),
            embedding,
        }
    }

    fn ids(hits: &[RankedBook]) -> Vec<i64> {
        hits.iter().map(|hit| hit.book.book_id).collect()
    }

    #[tokio::test]
    async fn schema_setup_can_be_repeated() {
        let store = MemoryStore::new(2);
        store.ensure_schema().await.unwrap();
        store
            .write_batch(0, &[record(1, "a", "", vec![0.0, 1.0])])
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        store.ensure_indexes().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.embedding_of(1).await.unwrap(), Some(vec![0.0, 1.0]));
    }

    #[tokio::test]
    async fn failed_batch_keeps_nothing() {
        let store = MemoryStore::new(2);
        store
            .write_batch(0, &[record(1, "a", "", vec![0.0, 0.0])])
            .await
            .unwrap();
        let err = store
            .write_batch(
                1,
                &[
                    record(2, "b", "", vec![0.0, 0.0]),
                    record(1, "dup", "", vec![0.0, 0.0]),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BatchWrite { batch: 1, .. }));
        assert_eq!(store.count().await.unwrap(), 1);

        let err = store
            .write_batch(2, &[record(3, "c", "", vec![0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BatchWrite { batch: 2, .. }));
    }

    #[tokio::test]
    async fn equal_distances_order_by_id() {
        let store = MemoryStore::new(2);
        store
            .write_batch(
                0,
                &[
                    record(9, "x", "", vec![1.0, 0.0]),
                    record(4, "y", "", vec![0.0, 1.0]),
                    record(6, "z", "", vec![5.0, 5.0]),
                ],
            )
            .await
            .unwrap();
        let hits = store
            .query(&StoreQuery::Vector {
                embedding: vec![0.0, 0.0],
                metric: DistanceMetric::L2,
                filters: SearchFilters::default(),
                max_distance: Some(2.0),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec![4, 9]);
    }

    #[tokio::test]
    async fn text_requires_every_term() {
        let store = MemoryStore::new(1);
        store
            .write_batch(
                0,
                &[
                    record(1, "Deep Learning", "neural networks", vec![0.0]),
                    record(2, "Learning to Cook", "kitchen basics", vec![0.0]),
                ],
            )
            .await
            .unwrap();
        let hits = store
            .query(&StoreQuery::Text {
                terms: LexicalQuery::parse("deep learning"),
                filters: SearchFilters::default(),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec![1]);
        assert!(hits[0].score > 0.0 && hits[0].score <= 1.0);
    }

    #[tokio::test]
    async fn hybrid_keeps_non_matching_text_with_zero_rank() {
        let store = MemoryStore::new(1);
        store
            .write_batch(
                0,
                &[
                    record(1, "Gardening", "soil", vec![0.0]),
                    record(2, "Cooking", "pans", vec![0.0]),
                ],
            )
            .await
            .unwrap();
        let hits = store
            .query(&StoreQuery::Hybrid {
                embedding: vec![0.0],
                terms: LexicalQuery::parse("gardening"),
                metric: DistanceMetric::L2,
                weights: HybridWeights::default(),
                filters: SearchFilters::default(),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec![1, 2]);
        assert!((hits[1].score - 0.7).abs() < 1e-12);
    }

    #[tokio::test]
    async fn substring_lookups_page_by_id() {
        let store = MemoryStore::new(1);
        let records: Vec<BookRecord> = (1..=5)
            .map(|id| record(id, &format!("Volume {id}"), "", vec![0.0]))
            .collect();
        store.write_batch(0, &records).await.unwrap();
        assert_eq!(store.count_substring("VOLUME").await.unwrap(), 5);
        let page = store.substring_search("volume", 3, 10).await.unwrap();
        assert_eq!(page.iter().map(|b| b.book_id).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(store.find_by_title("ume 2", 20).await.unwrap().len(), 1);
    }
}
