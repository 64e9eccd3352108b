//! Book records as stored, plus coercion from loosely-typed source rows.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One loosely-typed row read from the tabular source, keyed by column name.
pub type RawRow = Map<String, Value>;

/// Catalog metadata persisted for each book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    /// Externally-assigned identifier, unique in the store.
    pub book_id: i64,
    pub title: String,
    pub author: String,
    pub author_id: Option<i64>,
    pub work_id: Option<i64>,
    pub language: Option<String>,
    pub average_rating: Option<f64>,
    pub ratings_count: Option<i64>,
    pub publication_date: Option<String>,
    pub original_publication_date: Option<String>,
    pub format: Option<String>,
    pub edition_information: Option<String>,
    pub publisher: Option<String>,
    pub num_pages: Option<f64>,
    pub series_name: Option<String>,
    pub series_position: Option<String>,
    pub description: String,
    pub image_url: Option<String>,
    /// Shelf tags, serialized JSON text.
    pub shelves: Option<String>,
    /// Rating histogram, serialized JSON text.
    pub rating_distribution: Option<String>,
}

impl Book {
    /// Minimal record with only the required fields populated.
    pub fn new(
        book_id: i64,
        title: impl Into<String>,
        author: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            book_id,
            title: title.into(),
            author: author.into(),
            author_id: None,
            work_id: None,
            language: None,
            average_rating: None,
            ratings_count: None,
            publication_date: None,
            original_publication_date: None,
            format: None,
            edition_information: None,
            publisher: None,
            num_pages: None,
            series_name: None,
            series_position: None,
            description: description.into(),
            image_url: None,
            shelves: None,
            rating_distribution: None,
        }
    }

    /// Text searched by the lexical path.
    pub fn lexical_text(&self) -> String {
        format!("{} {} {}", self.title, self.author, self.description)
    }
}

/// A book paired with its embedding, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct BookRecord {
    pub book: Book,
    pub embedding: Vec<f32>,
}

impl BookRecord {
    /// Coerces a source row and its aligned vector into a record.
    ///
    /// Rejects rows without a usable `book_id` and vectors whose length is not
    /// `dimension`. Missing title, author and description become empty strings.
    pub fn from_raw(row: &RawRow, embedding: Vec<f32>, dimension: usize) -> Result<Self, String> {
        if embedding.len() != dimension {
            return Err(format!(
                "embedding has {} values, expected {}",
                embedding.len(),
                dimension
            ));
        }
        let book_id = int_field(row, "book_id")?.ok_or_else(|| "missing book_id".to_string())?;
        let book = Book {
            book_id,
            title: text_field(row, "title").unwrap_or_default(),
            author: text_field(row, "author").unwrap_or_default(),
            author_id: int_field(row, "author_id")?,
            work_id: int_field(row, "work_id")?,
            language: text_field(row, "language"),
            average_rating: float_field(row, "average_rating")?,
            ratings_count: int_field(row, "ratings_count")?,
            publication_date: text_field(row, "publication_date"),
            original_publication_date: text_field(row, "original_publication_date"),
            format: text_field(row, "format"),
            edition_information: text_field(row, "edition_information"),
            publisher: text_field(row, "publisher"),
            num_pages: float_field(row, "num_pages")?,
            series_name: text_field(row, "series_name"),
            series_position: text_field(row, "series_position"),
            description: text_field(row, "description").unwrap_or_default(),
            image_url: text_field(row, "image_url"),
            shelves: text_field(row, "shelves"),
            rating_distribution: text_field(row, "rating_distribution"),
        };
        Ok(Self { book, embedding })
    }
}

fn is_missing(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("nan")
        || trimmed.eq_ignore_ascii_case("null")
        || trimmed.eq_ignore_ascii_case("none")
}

/// Strings pass through; structured JSON values are re-serialized to text.
fn text_field(row: &RawRow, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::Null => None,
        Value::String(text) if is_missing(text) => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn float_field(row: &RawRow, key: &str) -> Result<Option<f64>, String> {
    match row.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(num)) => Ok(num.as_f64()),
        Some(Value::String(text)) if is_missing(text) => Ok(None),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("{key} value {text:?} is not a number")),
        Some(other) => Err(format!("{key} value {other} is not a number")),
    }
}

/// Largest magnitude an `f64` holds without losing integer precision.
const EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

fn int_field(row: &RawRow, key: &str) -> Result<Option<i64>, String> {
    match row.get(key) {
        Some(Value::Number(num)) if num.is_i64() => return Ok(num.as_i64()),
        Some(Value::String(text)) if !is_missing(text) => {
            if let Ok(exact) = text.trim().parse::<i64>() {
                return Ok(Some(exact));
            }
        }
        _ => {}
    }
    let Some(value) = float_field(row, key)? else {
        return Ok(None);
    };
    // CSV exports of nullable integer columns often carry a trailing `.0`.
    if value.fract() != 0.0 || !value.is_finite() || value.abs() >= EXACT_F64_INT {
        return Err(format!("{key} value {value} is not an exact integer"));
    }
    Ok(Some(value as i64))
}

/// Cuts `text` to at most `max_chars` characters, appending `...` when shortened.
pub fn truncate_for_display(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
