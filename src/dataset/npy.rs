//! Minimal reader for 2-D little-endian float `.npy` arrays.
//!
//! Rows are fetched by seeking, so a chunked load only keeps the requested
//! window of vectors in memory.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    F32,
    F64,
}

impl Element {
    fn width(self) -> usize {
        match self {
            Element::F32 => 4,
            Element::F64 => 8,
        }
    }
}

/// Open handle on an `.npy` matrix of shape `(rows, dimension)`.
pub struct NpyMatrix {
    path: PathBuf,
    reader: BufReader<File>,
    element: Element,
    rows: usize,
    dimension: usize,
    data_offset: u64,
}

impl NpyMatrix {
    /// Opens the file and parses its header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let header = read_header(&mut reader).map_err(|msg| Error::data_format(path, msg))?;
        let data_offset = reader.stream_position()?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            element: header.element,
            rows: header.rows,
            dimension: header.dimension,
            data_offset,
        })
    }

    /// Number of vectors (first axis).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Vector length (second axis).
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Reads up to `count` rows starting at `start`, clamped to the array end.
    pub fn read_rows(&mut self, start: usize, count: usize) -> Result<Vec<Vec<f32>>> {
        if start >= self.rows || count == 0 {
            return Ok(Vec::new());
        }
        let count = count.min(self.rows - start);
        let row_bytes = self.dimension * self.element.width();
        let offset = self.data_offset + (start * row_bytes) as u64;
        self.reader.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; row_bytes];
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            self.reader.read_exact(&mut buf).map_err(|err| {
                Error::data_format(&self.path, format!("truncated array data: {err}"))
            })?;
            out.push(decode_row(&buf, self.element));
        }
        Ok(out)
    }
}

fn decode_row(buf: &[u8], element: Element) -> Vec<f32> {
    match element {
        Element::F32 => buf
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Element::F64 => buf
            .chunks_exact(8)
            .map(|b| {
                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
            })
            .collect(),
    }
}

struct Header {
    element: Element,
    rows: usize,
    dimension: usize,
}

fn read_header<R: Read>(reader: &mut R) -> std::result::Result<Header, String> {
    let mut prefix = [0u8; 8];
    reader
        .read_exact(&mut prefix)
        .map_err(|_| "file too short for an npy header".to_string())?;
    if &prefix[..6] != MAGIC {
        return Err("missing npy magic string".to_string());
    }
    let major = prefix[6];
    let header_len = match major {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len).map_err(|e| e.to_string())?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len).map_err(|e| e.to_string())?;
            u32::from_le_bytes(len) as usize
        }
        other => return Err(format!("unsupported npy version {other}")),
    };
    let mut text = vec![0u8; header_len];
    reader.read_exact(&mut text).map_err(|e| e.to_string())?;
    let text = String::from_utf8_lossy(&text);
    parse_header_dict(&text)
}

/// Parses the Python-literal header, e.g.
/// `{'descr': '<f4', 'fortran_order': False, 'shape': (3, 384), }`.
fn parse_header_dict(text: &str) -> std::result::Result<Header, String> {
    let descr = dict_value(text, "descr").ok_or("header missing 'descr'")?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    let element = match descr {
        "<f4" | "=f4" => Element::F32,
        "<f8" | "=f8" => Element::F64,
        other => return Err(format!("unsupported dtype {other}; expected <f4 or <f8")),
    };

    let fortran = dict_value(text, "fortran_order").ok_or("header missing 'fortran_order'")?;
    if fortran.trim() != "False" {
        return Err("fortran-ordered arrays are not supported".to_string());
    }

    let shape_start = text.find("'shape'").ok_or("header missing 'shape'")?;
    let open = text[shape_start..]
        .find('(')
        .map(|idx| shape_start + idx)
        .ok_or("malformed shape")?;
    let close = text[open..]
        .find(')')
        .map(|idx| open + idx)
        .ok_or("malformed shape")?;
    let dims = text[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<usize>().map_err(|_| format!("bad shape entry {part}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    match dims.as_slice() {
        [rows, dimension] => Ok(Header {
            element,
            rows: *rows,
            dimension: *dimension,
        }),
        other => Err(format!(
            "expected a 2-D array, found {} dimension(s)",
            other.len()
        )),
    }
}

fn dict_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}':");
    let start = text.find(&needle)? + needle.len();
    let rest = &text[start..];
    let end = rest.find(',').unwrap_or(rest.len());
    Some(rest[..end].trim())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Writes a version 1.0 float32 `.npy` file.
    pub(crate) fn write_f32(path: &Path, rows: &[Vec<f32>]) {
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        let mut header = format!(
            "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
            rows.len(),
            dim
        );
        while (MAGIC.len() + 4 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');
        let mut file = File::create(path).expect("create npy");
        file.write_all(MAGIC).unwrap();
        file.write_all(&[1, 0]).unwrap();
        file.write_all(&(header.len() as u16).to_le_bytes()).unwrap();
        file.write_all(header.as_bytes()).unwrap();
        for row in rows {
            for value in row {
                file.write_all(&value.to_le_bytes()).unwrap();
            }
        }
    }

    #[test]
    fn reads_windows_by_seeking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emb.npy");
        let rows: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32, i as f32 + 0.5]).collect();
        write_f32(&path, &rows);

        let mut matrix = NpyMatrix::open(&path).expect("open");
        assert_eq!(matrix.rows(), 5);
        assert_eq!(matrix.dimension(), 2);
        assert_eq!(matrix.read_rows(3, 10).unwrap(), vec![vec![3.0, 3.5], vec![4.0, 4.5]]);
        assert_eq!(matrix.read_rows(0, 1).unwrap(), vec![vec![0.0, 0.5]]);
        assert!(matrix.read_rows(5, 1).unwrap().is_empty());
    }

    #[test]
    fn parses_header_variants() {
        let header =
            parse_header_dict("{'descr': '<f8', 'fortran_order': False, 'shape': (10, 384), }")
                .expect("header");
        assert_eq!(header.element, Element::F64);
        assert_eq!((header.rows, header.dimension), (10, 384));

        assert!(parse_header_dict("{'descr': '<i4', 'fortran_order': False, 'shape': (1, 1), }")
            .is_err());
        assert!(parse_header_dict("{'descr': '<f4', 'fortran_order': True, 'shape': (1, 1), }")
            .is_err());
        assert!(parse_header_dict("{'descr': '<f4', 'fortran_order': False, 'shape': (7,), }")
            .is_err());
    }

    #[test]
    fn rejects_non_npy_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.npy");
        std::fs::write(&path, b"not an array at all").unwrap();
        assert!(matches!(
            NpyMatrix::open(&path),
            Err(Error::DataFormat { .. })
        ));
    }
}
