#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;

use booksearch::embedder::Embedder;
use booksearch::DatasetSource;

pub const DIMENSION: usize = 3;

/// Embeds text by keyword so tests can predict neighbours.
pub struct KeywordEmbedder;

impl Embedder for KeywordEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|text| keyword_vector(text)).collect())
    }
}

pub fn keyword_vector(text: &str) -> Vec<f32> {
    let text = text.to_lowercase();
    if text.contains("neural") {
        vec![1.0, 0.0, 0.0]
    } else if text.contains("garden") {
        vec![0.0, 1.0, 0.0]
    } else {
        vec![0.0, 0.0, 1.0]
    }
}

/// Writes a version 1.0 float32 `.npy` matrix.
pub fn write_npy(path: &Path, rows: &[Vec<f32>]) {
    let dim = rows.first().map(Vec::len).unwrap_or(0);
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
        rows.len(),
        dim
    );
    while (6 + 4 + header.len() + 1) % 64 != 0 {
        header.push(' ');
    }
    header.push('\n');
    let mut file = File::create(path).unwrap();
    file.write_all(b"\x93NUMPY").unwrap();
    file.write_all(&[1, 0]).unwrap();
    file.write_all(&(header.len() as u16).to_le_bytes()).unwrap();
    file.write_all(header.as_bytes()).unwrap();
    for value in rows.iter().flatten() {
        file.write_all(&value.to_le_bytes()).unwrap();
    }
}

/// Three books; rows 1 and 3 have near-identical embeddings.
pub fn three_book_fixture(dir: &Path) -> DatasetSource {
    let table = dir.join("books.csv");
    std::fs::write(
        &table,
        "book_id,title,author,description,average_rating,shelves\n\
         1,Neural Networks,Ada Byron,An introduction to neural computation.,4.1,\"[\"\"ml\"\"]\"\n\
         2,Gardening Basics,Gertrude Jekyll,Grow vegetables in small spaces.,3.9,\n\
         3,Deep Learning Primer,Alan Turing,Layered representation learning.,4.5,\n",
    )
    .unwrap();
    let embeddings = dir.join("embeddings.npy");
    write_npy(
        &embeddings,
        &[
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.99, 0.01, 0.0],
        ],
    );
    DatasetSource::new(table, embeddings)
}

/// `count` numbered books with identical embeddings.
pub fn numbered_fixture(dir: &Path, count: usize) -> DatasetSource {
    let table = dir.join("numbered.jsonl");
    let mut body = String::new();
    for id in 1..=count {
        body.push_str(&format!(
            "{{\"book_id\": {id}, \"title\": \"Volume {id}\", \"author\": \"Series\", \"description\": null}}\n"
        ));
    }
    std::fs::write(&table, body).unwrap();
    let embeddings = dir.join("numbered.npy");
    write_npy(&embeddings, &vec![vec![0.0, 0.0, 1.0]; count]);
    DatasetSource::new(table, embeddings)
}
