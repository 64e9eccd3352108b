//! Loads book rows and their row-aligned embedding vectors from disk.

pub mod npy;

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::book::RawRow;
use crate::error::{Error, Result};
use npy::NpyMatrix;

/// Default number of rows per chunk in chunked mode.
pub const DEFAULT_CHUNK_ROWS: usize = 1000;

/// Paths to the tabular metadata and the embedding array.
#[derive(Debug, Clone)]
pub struct DatasetSource {
    /// CSV, JSON array or JSON Lines file.
    pub table: PathBuf,
    /// `.npy` matrix or JSON array of arrays.
    pub embeddings: PathBuf,
}

impl DatasetSource {
    pub fn new(table: impl Into<PathBuf>, embeddings: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
            embeddings: embeddings.into(),
        }
    }

    /// Fails with [`Error::SourceNotFound`] naming the first missing path.
    pub fn check_exists(&self) -> Result<()> {
        for path in [&self.table, &self.embeddings] {
            if !path.exists() {
                return Err(Error::SourceNotFound { path: path.clone() });
            }
        }
        Ok(())
    }

    /// Opens the embedding file and reports its declared vector dimension.
    pub fn embedding_dimension(&self) -> Result<usize> {
        Ok(VectorSource::open(&self.embeddings)?.dimension())
    }
}

/// One aligned window of rows and vectors.
#[derive(Debug, Clone)]
pub struct AlignedChunk {
    /// Zero-based row index of the first pair in the source files.
    pub offset: usize,
    pub rows: Vec<(RawRow, Vec<f32>)>,
}

impl AlignedChunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Fully materialized dataset, validated for alignment.
#[derive(Debug, Clone)]
pub struct Dataset {
    rows: Vec<RawRow>,
    vectors: Vec<Vec<f32>>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Splits the dataset into aligned chunks of at most `chunk_rows` pairs.
    pub fn into_chunks(self, chunk_rows: usize) -> impl Iterator<Item = AlignedChunk> {
        let chunk_rows = chunk_rows.max(1);
        let mut pairs = self.rows.into_iter().zip(self.vectors).peekable();
        let mut offset = 0usize;
        std::iter::from_fn(move || {
            pairs.peek()?;
            let rows: Vec<_> = pairs.by_ref().take(chunk_rows).collect();
            let chunk = AlignedChunk { offset, rows };
            offset += chunk.len();
            Some(chunk)
        })
    }
}

/// Reads both sources whole and requires equal row counts.
pub fn load_whole(source: &DatasetSource) -> Result<Dataset> {
    source.check_exists()?;
    let rows = RowReader::open(&source.table)?.collect::<Result<Vec<_>>>()?;
    let mut vectors = VectorSource::open(&source.embeddings)?;
    if rows.len() != vectors.len() {
        return Err(Error::Alignment {
            rows: rows.len(),
            vectors: vectors.len(),
        });
    }
    let vectors = vectors.read(0, rows.len())?;
    debug!(rows = rows.len(), "loaded dataset into memory");
    Ok(Dataset { rows, vectors })
}

/// Opens both sources for bounded-memory chunked iteration.
pub fn open_chunked(source: &DatasetSource, chunk_rows: usize) -> Result<ChunkedLoader> {
    source.check_exists()?;
    Ok(ChunkedLoader {
        rows: RowReader::open(&source.table)?,
        vectors: VectorSource::open(&source.embeddings)?,
        chunk_rows: chunk_rows.max(1),
        next_row: 0,
        next_vector: 0,
        finished: false,
    })
}

/// Iterator over aligned chunks; each chunk is truncated to the vectors that remain.
pub struct ChunkedLoader {
    rows: RowReader,
    vectors: VectorSource,
    chunk_rows: usize,
    next_row: usize,
    next_vector: usize,
    finished: bool,
}

impl ChunkedLoader {
    /// Dimension declared by the embedding source.
    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    fn next_chunk(&mut self) -> Result<Option<AlignedChunk>> {
        let mut rows = Vec::with_capacity(self.chunk_rows);
        for row in self.rows.by_ref().take(self.chunk_rows) {
            rows.push(row?);
        }
        if rows.is_empty() {
            let leftover = self.vectors.len().saturating_sub(self.next_vector);
            if leftover > 0 {
                warn!(
                    leftover,
                    "embedding array has more rows than the table; extra vectors ignored"
                );
            }
            return Ok(None);
        }

        let offset = self.next_row;
        self.next_row += rows.len();
        let vectors = self.vectors.read(self.next_vector, rows.len())?;
        self.next_vector += vectors.len();
        if vectors.is_empty() {
            let unpaired = rows.len() + self.rows.by_ref().count();
            warn!(
                offset,
                unpaired, "embedding array exhausted; remaining rows have no vectors"
            );
            return Ok(None);
        }
        if vectors.len() != rows.len() {
            warn!(
                offset,
                chunk_rows = rows.len(),
                vectors = vectors.len(),
                "chunk and embedding sizes differ; truncating chunk"
            );
            rows.truncate(vectors.len());
        }
        Ok(Some(AlignedChunk {
            offset,
            rows: rows.into_iter().zip(vectors).collect(),
        }))
    }
}

impl Iterator for ChunkedLoader {
    type Item = Result<AlignedChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Streaming reader over tabular rows.
enum RowReader {
    Csv {
        path: PathBuf,
        headers: csv::StringRecord,
        records: csv::StringRecordsIntoIter<BufReader<File>>,
    },
    JsonArray(std::vec::IntoIter<Value>, PathBuf),
    JsonLines {
        path: PathBuf,
        lines: std::iter::Enumerate<Lines<BufReader<File>>>,
    },
}

impl RowReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        match extension(path).as_str() {
            "csv" => {
                let mut reader = csv::ReaderBuilder::new()
                    .flexible(true)
                    .from_reader(BufReader::new(file));
                let headers = reader
                    .headers()
                    .map_err(|err| Error::data_format(path, err))?
                    .clone();
                Ok(RowReader::Csv {
                    path: path.to_path_buf(),
                    headers,
                    records: reader.into_records(),
                })
            }
            "json" => {
                let value: Value = serde_json::from_reader(BufReader::new(file))
                    .map_err(|err| Error::data_format(path, err))?;
                match value {
                    Value::Array(items) => {
                        Ok(RowReader::JsonArray(items.into_iter(), path.to_path_buf()))
                    }
                    _ => Err(Error::data_format(path, "expected a JSON array of objects")),
                }
            }
            "jsonl" | "ndjson" => Ok(RowReader::JsonLines {
                path: path.to_path_buf(),
                lines: BufReader::new(file).lines().enumerate(),
            }),
            other => Err(Error::data_format(
                path,
                format!("unsupported table format {other:?}; use csv, json or jsonl"),
            )),
        }
    }
}

impl Iterator for RowReader {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RowReader::Csv {
                path,
                headers,
                records,
            } => {
                let record = match records.next()? {
                    Ok(record) => record,
                    Err(err) => return Some(Err(Error::data_format(path.as_path(), err))),
                };
                let mut row = RawRow::new();
                for (key, cell) in headers.iter().zip(record.iter()) {
                    if !cell.is_empty() {
                        row.insert(key.to_string(), Value::String(cell.to_string()));
                    }
                }
                Some(Ok(row))
            }
            RowReader::JsonArray(items, path) => match items.next()? {
                Value::Object(map) => Some(Ok(map)),
                _ => Some(Err(Error::data_format(
                    path.as_path(),
                    "array element is not an object",
                ))),
            },
            RowReader::JsonLines { path, lines } => loop {
                let (line_no, line) = lines.next()?;
                let line = match line {
                    Ok(line) => line,
                    Err(err) => return Some(Err(err.into())),
                };
                if line.trim().is_empty() {
                    continue;
                }
                return Some(match serde_json::from_str::<Value>(&line) {
                    Ok(Value::Object(map)) => Ok(map),
                    Ok(_) => Err(Error::data_format(
                        path.as_path(),
                        format!("line {} is not an object", line_no + 1),
                    )),
                    Err(err) => Err(Error::data_format(
                        path.as_path(),
                        format!("invalid record at line {}: {err}", line_no + 1),
                    )),
                });
            },
        }
    }
}

/// Random-access view over the embedding array.
enum VectorSource {
    Npy(NpyMatrix),
    Json(Vec<Vec<f32>>),
}

impl VectorSource {
    fn open(path: &Path) -> Result<Self> {
        match extension(path).as_str() {
            "npy" => Ok(VectorSource::Npy(NpyMatrix::open(path)?)),
            "json" => {
                let file = File::open(path)?;
                let vectors: Vec<Vec<f32>> = serde_json::from_reader(BufReader::new(file))
                    .map_err(|err| Error::data_format(path, err))?;
                Ok(VectorSource::Json(vectors))
            }
            other => Err(Error::data_format(
                path,
                format!("unsupported embedding format {other:?}; use npy or json"),
            )),
        }
    }

    fn len(&self) -> usize {
        match self {
            VectorSource::Npy(matrix) => matrix.rows(),
            VectorSource::Json(vectors) => vectors.len(),
        }
    }

    fn dimension(&self) -> usize {
        match self {
            VectorSource::Npy(matrix) => matrix.dimension(),
            VectorSource::Json(vectors) => vectors.first().map(Vec::len).unwrap_or(0),
        }
    }

    fn read(&mut self, start: usize, count: usize) -> Result<Vec<Vec<f32>>> {
        match self {
            VectorSource::Npy(matrix) => matrix.read_rows(start, count),
            VectorSource::Json(vectors) => {
                let end = start.saturating_add(count).min(vectors.len());
                Ok(vectors.get(start..end).map(<[_]>::to_vec).unwrap_or_default())
            }
        }
    }
}
