//! Ingestion pipeline: validate sources, optionally clear, then write aligned
//! chunks in sequential batches with per-batch failure isolation.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::book::BookRecord;
use crate::dataset::{self, AlignedChunk, DatasetSource, DEFAULT_CHUNK_ROWS};
use crate::error::{Error, Result};
use crate::store::BookStore;

/// Default number of records per write transaction.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Largest accepted `batch_size`.
pub const MAX_BATCH_SIZE: usize = 50_000;

/// Largest accepted `chunk_rows`.
pub const MAX_CHUNK_ROWS: usize = 100_000;

/// Pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Idle,
    Validating,
    Clearing,
    Loading,
    Writing,
    Done,
    Failed,
}

impl IngestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IngestState::Done | IngestState::Failed)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: IngestState) -> bool {
        use IngestState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Clearing)
                | (Validating, Loading)
                | (Clearing, Loading)
                | (Loading, Writing)
                | (Loading, Done)
                | (Writing, Writing)
                | (Writing, Loading)
                | (Writing, Done)
        )
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What happens to rows already in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Clear the table, then load.
    Replace,
    /// Keep existing rows; duplicate identifiers fail their batch.
    Append,
}

impl FromStr for WriteMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(WriteMode::Replace),
            "append" => Ok(WriteMode::Append),
            other => Err(Error::invalid(format!(
                "invalid mode {other:?}; must be 'replace' or 'append'"
            ))),
        }
    }
}

/// Parameters for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub source: DatasetSource,
    pub mode: WriteMode,
    /// Expected vector length.
    pub dimension: usize,
    pub batch_size: usize,
    /// Stream the sources instead of materializing them.
    pub chunked: bool,
    pub chunk_rows: usize,
}

impl IngestOptions {
    pub fn new(source: DatasetSource, mode: WriteMode, dimension: usize) -> Self {
        Self {
            source,
            mode,
            dimension,
            batch_size: DEFAULT_BATCH_SIZE,
            chunked: false,
            chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }

    /// Rejects sizes outside `1..=MAX_*` before anything is opened.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(Error::invalid(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if !(1..=MAX_CHUNK_ROWS).contains(&self.chunk_rows) {
            return Err(Error::invalid(format!(
                "chunk_rows must be between 1 and {MAX_CHUNK_ROWS}, got {}",
                self.chunk_rows
            )));
        }
        Ok(())
    }
}

/// Cancellation handle, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct IngestControl {
    cancelled: Arc<AtomicBool>,
}

impl IngestControl {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestProgress {
    pub state: IngestState,
    pub records_written: usize,
    pub batches_attempted: usize,
}

pub type ProgressFn = Arc<dyn Fn(&IngestProgress) + Send + Sync>;

/// A batch whose transaction rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBatch {
    pub batch: usize,
    /// Records lost with the batch.
    pub records: usize,
    pub error: String,
}

/// A source row that never reached the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    /// Zero-based row index in the source files.
    pub row: usize,
    pub reason: String,
}

/// Outcome of a run that reached `Done`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub records_written: usize,
    pub batches_attempted: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub rejected_rows: Vec<RejectedRow>,
    pub cancelled: bool,
}

/// JSON report printed by the importer and returned by `POST /load-data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    /// `success` or `error`.
    pub status: &'static str,
    pub records_loaded: usize,
    pub batches_attempted: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub rejected_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LoadReport {
    pub fn from_result(result: &Result<IngestSummary>) -> Self {
        match result {
            Ok(summary) => {
                let mut notes = Vec::new();
                if !summary.failed_batches.is_empty() {
                    let lost: usize = summary.failed_batches.iter().map(|b| b.records).sum();
                    notes.push(format!(
                        "{} batch(es) failed, {lost} records not loaded",
                        summary.failed_batches.len()
                    ));
                }
                if !summary.rejected_rows.is_empty() {
                    notes.push(format!("{} rows rejected", summary.rejected_rows.len()));
                }
                if summary.cancelled {
                    notes.push("cancelled before completion".to_string());
                }
                LoadReport {
                    status: "success",
                    records_loaded: summary.records_written,
                    batches_attempted: summary.batches_attempted,
                    failed_batches: summary.failed_batches.clone(),
                    rejected_rows: summary.rejected_rows.len(),
                    message: (!notes.is_empty()).then(|| notes.join("; ")),
                }
            }
            Err(err) => LoadReport {
                status: "error",
                records_loaded: 0,
                batches_attempted: 0,
                failed_batches: Vec::new(),
                rejected_rows: 0,
                message: Some(err.to_string()),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Drives one ingestion run against a store.
pub struct Ingestor {
    store: Arc<dyn BookStore>,
    control: IngestControl,
    progress: Option<ProgressFn>,
    state: IngestState,
    summary: IngestSummary,
}

impl Ingestor {
    pub fn new(store: Arc<dyn BookStore>) -> Self {
        Self {
            store,
            control: IngestControl::default(),
            progress: None,
            state: IngestState::Idle,
            summary: IngestSummary::default(),
        }
    }

    pub fn with_control(mut self, control: IngestControl) -> Self {
        self.control = control;
        self
    }

    pub fn on_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    /// Runs the pipeline to `Done`, or to `Failed` with the error returned.
    ///
    /// Batch failures do not fail the run; they are listed in the summary.
    pub async fn run(&mut self, options: IngestOptions) -> Result<IngestSummary> {
        if self.state != IngestState::Idle {
            return Err(Error::invalid("ingestion run already started"));
        }
        match self.drive(options).await {
            Ok(()) => {
                self.transition(IngestState::Done)?;
                info!(
                    records = self.summary.records_written,
                    batches = self.summary.batches_attempted,
                    failed = self.summary.failed_batches.len(),
                    rejected = self.summary.rejected_rows.len(),
                    cancelled = self.summary.cancelled,
                    "ingestion finished"
                );
                Ok(std::mem::take(&mut self.summary))
            }
            Err(err) => {
                warn!(state = %self.state, error = %err, "ingestion failed");
                self.transition(IngestState::Failed)?;
                Err(err)
            }
        }
    }

    async fn drive(&mut self, options: IngestOptions) -> Result<()> {
        options.validate()?;
        self.transition(IngestState::Validating)?;
        let batch_size = options.batch_size;
        let mut chunks = self.validate_and_open(&options).await?;

        if options.mode == WriteMode::Replace {
            self.transition(IngestState::Clearing)?;
            self.store.clear_all().await?;
            debug!("cleared existing records");
        }

        self.transition(IngestState::Loading)?;
        let mut pending: Vec<BookRecord> = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;
            if self.state == IngestState::Writing {
                self.transition(IngestState::Loading)?;
            }
            debug!(offset = chunk.offset, rows = chunk.len(), "chunk loaded");
            self.convert(chunk, options.dimension, &mut pending);
            while pending.len() >= batch_size {
                let batch: Vec<BookRecord> = pending.drain(..batch_size).collect();
                if !self.write(&batch).await? {
                    return Ok(());
                }
            }
        }
        if !pending.is_empty() {
            self.write(&pending).await?;
        }
        Ok(())
    }

    /// Runs every pre-write check and starts the loader thread.
    async fn validate_and_open(
        &mut self,
        options: &IngestOptions,
    ) -> Result<mpsc::Receiver<Result<AlignedChunk>>> {
        let source = options.source.clone();
        source.check_exists()?;
        let declared = source.embedding_dimension()?;
        if declared != 0 && declared != options.dimension {
            return Err(Error::DimensionMismatch {
                expected: options.dimension,
                actual: declared,
            });
        }
        let chunk_rows = options.chunk_rows;
        let (tx, rx) = mpsc::channel::<Result<AlignedChunk>>(1);
        if options.chunked {
            let loader = dataset::open_chunked(&source, chunk_rows)?;
            tokio::task::spawn_blocking(move || {
                for chunk in loader {
                    if tx.blocking_send(chunk).is_err() {
                        break;
                    }
                }
            });
        } else {
            let whole = tokio::task::spawn_blocking(move || dataset::load_whole(&source))
                .await
                .map_err(|err| Error::Io(std::io::Error::other(err)))??;
            info!(rows = whole.len(), "dataset validated");
            tokio::task::spawn_blocking(move || {
                for chunk in whole.into_chunks(chunk_rows) {
                    if tx.blocking_send(Ok(chunk)).is_err() {
                        break;
                    }
                }
            });
        }
        Ok(rx)
    }

    fn convert(&mut self, chunk: AlignedChunk, dimension: usize, out: &mut Vec<BookRecord>) {
        for (index, (raw, embedding)) in chunk.rows.into_iter().enumerate() {
            match BookRecord::from_raw(&raw, embedding, dimension) {
                Ok(record) => out.push(record),
                Err(reason) => {
                    let row = chunk.offset + index;
                    debug!(row, %reason, "row rejected");
                    self.summary.rejected_rows.push(RejectedRow { row, reason });
                }
            }
        }
    }

    /// Writes one batch; returns `false` when the run was cancelled instead.
    async fn write(&mut self, batch: &[BookRecord]) -> Result<bool> {
        if self.control.is_cancelled() {
            info!(
                records = self.summary.records_written,
                "ingestion cancelled between batches"
            );
            self.summary.cancelled = true;
            return Ok(false);
        }
        self.transition(IngestState::Writing)?;
        let index = self.summary.batches_attempted;
        self.summary.batches_attempted += 1;
        match self.store.write_batch(index, batch).await {
            Ok(written) => {
                self.summary.records_written += written;
                info!(
                    batch = index,
                    records = self.summary.records_written,
                    "batch written"
                );
            }
            Err(err) => {
                warn!(batch = index, records = batch.len(), error = %err, "batch failed");
                self.summary.failed_batches.push(FailedBatch {
                    batch: index,
                    records: batch.len(),
                    error: err.to_string(),
                });
            }
        }
        self.report();
        Ok(true)
    }

    fn transition(&mut self, next: IngestState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid(format!(
                "illegal ingestion transition {} -> {}",
                self.state, next
            )));
        }
        if self.state != next {
            debug!(from = %self.state, to = %next, "ingestion state");
        }
        self.state = next;
        self.report();
        Ok(())
    }

    fn report(&self) {
        if let Some(progress) = &self.progress {
            progress(&IngestProgress {
                state: self.state,
                records_written: self.summary.records_written,
                batches_attempted: self.summary.batches_attempted,
            });
        }
    }
}
