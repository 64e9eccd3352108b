mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use booksearch::api::{router, AppState, IngestLock};
use booksearch::store::{RankedBook, StoreQuery};
use booksearch::{
    Book, BookRecord, BookStore, DatasetSource, MemoryStore, Result, SearchService,
    SearchSettings,
};
use common::{three_book_fixture, KeywordEmbedder, DIMENSION};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::{Notify, Semaphore};
use tower::ServiceExt;

fn app(source: DatasetSource) -> Router {
    app_with(source, Arc::new(MemoryStore::new(DIMENSION)), IngestLock::default())
}

fn app_with(source: DatasetSource, store: Arc<dyn BookStore>, lock: IngestLock) -> Router {
    let settings = SearchSettings {
        dimension: DIMENSION,
        ..SearchSettings::default()
    };
    let service = Arc::new(SearchService::new(store, Arc::new(KeywordEmbedder), settings));
    router(AppState::new(service, source).with_ingest_lock(lock))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    read_json(response).await
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn loaded_app(dir: &Path) -> Router {
    let app = app(three_book_fixture(dir));
    let (status, report) = send(
        &app,
        Method::POST,
        "/load-data",
        Some(json!({"mode": "replace"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(report["status"], "success");
    assert_eq!(report["records_loaded"], 3);
    app
}

fn result_ids(body: &Value) -> Vec<i64> {
    body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|hit| hit["book_id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn healthz_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (status, _) = send(&app(three_book_fixture(dir.path())), Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn search_modes_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = loaded_app(dir.path()).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/search",
        Some(json!({"query": "neural networks", "top_k": 2, "search_type": "vector"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_ids(&body), vec![1, 3]);
    assert!(body["results"][0]["distance"].is_number());

    let (_, body) = send(
        &app,
        Method::POST,
        "/search",
        Some(json!({"query": "gardening", "search_type": "text"})),
    )
    .await;
    assert_eq!(result_ids(&body), vec![2]);

    let (status, body) = send(
        &app,
        Method::POST,
        "/search",
        Some(json!({"query": "neural", "author_filter": "turing"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_ids(&body), vec![3]);
}

#[tokio::test]
async fn invalid_requests_are_rejected_with_a_message() {
    let dir = tempfile::tempdir().unwrap();
    let app = loaded_app(dir.path()).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/search",
        Some(json!({"query": "neural", "search_type": "fuzzy"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("search_type"));

    let (status, _) = send(
        &app,
        Method::POST,
        "/search",
        Some(json!({"query": "neural", "top_k": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/vector-search",
        Some(json!({"vector": [1.0, 0.0]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::GET, "/books?page=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn book_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let app = loaded_app(dir.path()).await;

    let (status, body) = send(&app, Method::GET, "/books/2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Gardening Basics");

    let (status, body) = send(&app, Method::GET, "/books/99", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "book 99 not found");

    let (_, body) = send(&app, Method::GET, "/books?page=1&size=2", None).await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["pages"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (_, body) = send(&app, Method::GET, "/search?q=GARDEN", None).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["book_id"], 2);

    let (_, body) = send(
        &app,
        Method::POST,
        "/by-title",
        Some(json!({"title": "deep"})),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn similar_and_raw_vector_search() {
    let dir = tempfile::tempdir().unwrap();
    let app = loaded_app(dir.path()).await;

    let (status, body) = send(&app, Method::GET, "/similar/1?limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_ids(&body), vec![3]);

    let (status, _) = send(&app, Method::GET, "/similar/77", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::POST,
        "/vector-search",
        Some(json!({"vector": [0.0, 1.0, 0.0], "distance_strategy": "l2", "threshold": 0.5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let hits = body.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["book_id"], 2);
}

#[tokio::test]
async fn load_data_reports_failures() {
    let dir = tempfile::tempdir().unwrap();
    let app = loaded_app(dir.path()).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/load-data",
        Some(json!({"mode": "append"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["records_loaded"], 0);
    assert_eq!(body["failed_batches"].as_array().unwrap().len(), 1);

    let missing = dir.path().join("missing.csv");
    let (status, body) = send(
        &app,
        Method::POST,
        "/load-data",
        Some(json!({"mode": "replace", "data_path": missing})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["message"].as_str().unwrap().contains("source not found"));

    let (_, body) = send(&app, Method::GET, "/books", None).await;
    assert_eq!(body["total"], 3);
}

/// Parks every batch write until the test hands out a permit.
struct GatedStore {
    inner: MemoryStore,
    entered: Notify,
    gate: Semaphore,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(DIMENSION),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl BookStore for GatedStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.inner.ensure_schema().await
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.inner.ensure_indexes().await
    }

    async fn write_batch(&self, batch: usize, records: &[BookRecord]) -> Result<usize> {
        self.entered.notify_one();
        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();
        self.inner.write_batch(batch, records).await
    }

    async fn clear_all(&self) -> Result<()> {
        self.inner.clear_all().await
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<RankedBook>> {
        self.inner.query(query).await
    }

    async fn get(&self, book_id: i64) -> Result<Option<Book>> {
        self.inner.get(book_id).await
    }

    async fn embedding_of(&self, book_id: i64) -> Result<Option<Vec<f32>>> {
        self.inner.embedding_of(book_id).await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }

    async fn list(&self, offset: u64, limit: u64) -> Result<Vec<Book>> {
        self.inner.list(offset, limit).await
    }

    async fn find_by_title(&self, fragment: &str, limit: u64) -> Result<Vec<Book>> {
        self.inner.find_by_title(fragment, limit).await
    }

    async fn substring_search(&self, term: &str, offset: u64, limit: u64) -> Result<Vec<Book>> {
        self.inner.substring_search(term, offset, limit).await
    }

    async fn count_substring(&self, term: &str) -> Result<u64> {
        self.inner.count_substring(term).await
    }
}

fn load_request(mode: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/load-data")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "mode": mode }).to_string()))
        .unwrap()
}

#[tokio::test]
async fn overlapping_loads_are_refused_until_the_run_ends() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(GatedStore::new());
    let lock = IngestLock::default();
    let app = app_with(three_book_fixture(dir.path()), store.clone(), lock.clone());

    let first = tokio::spawn(app.clone().oneshot(load_request("replace")));
    store.entered.notified().await;

    let (status, body) = send(&app, Method::POST, "/load-data", Some(json!({"mode": "replace"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().unwrap().contains("in progress"));

    // The caller going away must not release the run's claim.
    first.abort();
    let _ = first.await;
    let (status, _) = send(&app, Method::POST, "/load-data", Some(json!({"mode": "append"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    store.gate.add_permits(1);
    for _ in 0..200 {
        if lock.try_lock().is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(lock.try_lock().is_ok());
    assert_eq!(store.count().await.unwrap(), 3);
}

#[tokio::test]
async fn load_data_is_refused_during_an_external_run() {
    let dir = tempfile::tempdir().unwrap();
    let lock = IngestLock::default();
    let store = Arc::new(MemoryStore::new(DIMENSION));
    let app = app_with(three_book_fixture(dir.path()), store, lock.clone());

    let startup = booksearch::api::try_claim_ingest(&lock).expect("free lock");
    let (status, _) = send(&app, Method::POST, "/load-data", Some(json!({"mode": "replace"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    drop(startup);
    let response = app.clone().oneshot(load_request("replace")).await.unwrap();
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["records_loaded"], 3);
}

#[tokio::test]
async fn oversized_batch_size_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(three_book_fixture(dir.path()));
    let (status, body) = send(
        &app,
        Method::POST,
        "/load-data",
        Some(json!({"mode": "append", "batch_size": 1_099_511_627_776_u64})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("batch_size"));

    let (_, body) = send(&app, Method::GET, "/books", None).await;
    assert_eq!(body["total"], 0);
}
