//! HTTP surface over the query service and the ingestion pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info};

use crate::book::Book;
use crate::dataset::DatasetSource;
use crate::error::Error;
use crate::ingest::{IngestOptions, Ingestor, LoadReport, WriteMode, DEFAULT_BATCH_SIZE};

/// Held for the lifetime of an ingestion run; at most one run at a time.
pub type IngestLock = Arc<Mutex<()>>;
use crate::search::{Page, SearchHit, SearchMode, SearchRequest, SearchService};
use crate::store::{DistanceMetric, SearchFilters};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    search: Arc<SearchService>,
    default_source: DatasetSource,
    ingest_lock: IngestLock,
}

impl AppState {
    /// `default_source` is used when `/load-data` omits paths.
    pub fn new(search: Arc<SearchService>, default_source: DatasetSource) -> Self {
        Self {
            search,
            default_source,
            ingest_lock: IngestLock::default(),
        }
    }

    /// Shares `lock` with runs started outside the router, such as a startup load.
    pub fn with_ingest_lock(mut self, lock: IngestLock) -> Self {
        self.ingest_lock = lock;
        self
    }
}

/// Claims the ingestion lock without waiting.
pub fn try_claim_ingest(lock: &IngestLock) -> Option<OwnedMutexGuard<()>> {
    lock.clone().try_lock_owned().ok()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/search", post(search_handler).get(substring_handler))
        .route("/vector-search", post(vector_search_handler))
        .route("/by-title", post(by_title_handler))
        .route("/books", get(list_handler))
        .route("/books/{id}", get(book_handler))
        .route("/similar/{id}", get(similar_handler))
        .route("/load-data", post(load_data_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

/// Handler failure rendered as `{message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidRequest(_) | Error::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                message: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    author_filter: Option<String>,
    #[serde(default)]
    title_keyword: Option<String>,
    #[serde(default)]
    min_content_length: Option<u32>,
    #[serde(default)]
    search_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

async fn search_handler(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> ApiResult<SearchResponse> {
    let mode = match body.search_type.as_deref() {
        Some(raw) => raw.parse::<SearchMode>()?,
        None => SearchMode::default(),
    };
    let request = SearchRequest {
        query: body.query,
        top_k: body.top_k.unwrap_or(state.search.settings().default_top_k),
        mode,
        filters: SearchFilters {
            author: non_blank(body.author_filter),
            title: non_blank(body.title_keyword),
            min_content_length: body.min_content_length,
            exclude_id: None,
        },
    };
    let results = state.search.search(&request).await?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default)]
    page: Option<u64>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SubstringParams {
    q: String,
    #[serde(default)]
    page: Option<u64>,
    #[serde(default)]
    size: Option<u64>,
}

async fn substring_handler(
    State(state): State<AppState>,
    Query(params): Query<SubstringParams>,
) -> ApiResult<Page<Book>> {
    let page = state
        .search
        .substring_search(&params.q, params.page, params.size)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct VectorSearchBody {
    vector: Vec<f32>,
    #[serde(default)]
    distance_strategy: Option<String>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn vector_search_handler(
    State(state): State<AppState>,
    Json(body): Json<VectorSearchBody>,
) -> ApiResult<Vec<SearchHit>> {
    let metric = match body.distance_strategy.as_deref() {
        Some(raw) => raw.parse::<DistanceMetric>()?,
        None => DistanceMetric::Cosine,
    };
    let hits = state
        .search
        .vector_search_raw(body.vector, Some(metric), body.threshold, body.limit)
        .await?;
    Ok(Json(hits))
}

#[derive(Debug, Deserialize)]
struct TitleBody {
    title: String,
}

async fn by_title_handler(
    State(state): State<AppState>,
    Json(body): Json<TitleBody>,
) -> ApiResult<Vec<Book>> {
    Ok(Json(state.search.books_by_title(&body.title).await?))
}

async fn list_handler(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Page<Book>> {
    Ok(Json(state.search.list_books(params.page, params.size).await?))
}

async fn book_handler(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Book> {
    let book = state.search.get_book(id).await?.ok_or(Error::NotFound(id))?;
    Ok(Json(book))
}

#[derive(Debug, Deserialize)]
struct SimilarParams {
    #[serde(default)]
    limit: Option<usize>,
}

async fn similar_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<SimilarParams>,
) -> ApiResult<SearchResponse> {
    let limit = params
        .limit
        .unwrap_or(state.search.settings().similar_limit);
    let results = state
        .search
        .similar_to(id, limit)
        .await?
        .ok_or(Error::NotFound(id))?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Debug, Deserialize)]
struct LoadBody {
    mode: WriteMode,
    #[serde(default)]
    data_path: Option<PathBuf>,
    #[serde(default)]
    embeddings_path: Option<PathBuf>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    chunked: bool,
}

async fn load_data_handler(
    State(state): State<AppState>,
    Json(body): Json<LoadBody>,
) -> Result<(StatusCode, Json<LoadReport>), ApiError> {
    let Some(guard) = try_claim_ingest(&state.ingest_lock) else {
        return Err(ApiError {
            status: StatusCode::CONFLICT,
            message: "an ingestion run is already in progress".to_string(),
        });
    };
    let source = DatasetSource::new(
        body.data_path
            .unwrap_or_else(|| state.default_source.table.clone()),
        body.embeddings_path
            .unwrap_or_else(|| state.default_source.embeddings.clone()),
    );
    let mut options = IngestOptions::new(source, body.mode, state.search.settings().dimension);
    options.batch_size = body.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
    options.chunked = body.chunked;
    info!(mode = ?options.mode, chunked = options.chunked, "load-data requested");

    // The guard moves into the task so a dropped request cannot release it early.
    let store = state.search.store().clone();
    let result = tokio::spawn(async move {
        let _guard = guard;
        Ingestor::new(store).run(options).await
    })
    .await
    .map_err(|err| ApiError::internal(format!("ingestion task failed: {err}")))?;
    let report = LoadReport::from_result(&result);
    match result {
        Ok(_) => Ok((StatusCode::CREATED, Json(report))),
        Err(err) => Err(ApiError::from(err)),
    }
}
