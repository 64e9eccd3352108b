use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use booksearch::config::{DatabaseArgs, IndexArgs};
use booksearch::ingest::{IngestProgress, ProgressFn};
use booksearch::{
    telemetry, BookStore, DatasetSource, IngestOptions, Ingestor, LoadReport, PgStore, WriteMode,
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "booksearch-import",
    about = "Load book metadata and precomputed embeddings into a pgvector table"
)]
struct ImportCli {
    /// Book metadata (csv, json or jsonl)
    #[arg(long, env = "CSV_PATH")]
    data: Option<PathBuf>,

    /// Row-aligned embedding array (npy or json)
    #[arg(long, env = "EMBEDDINGS_PATH")]
    embeddings: Option<PathBuf>,

    /// Records per INSERT transaction
    #[arg(long, env = "BOOKSEARCH_BATCH_SIZE", default_value_t = 1000)]
    batch_size: usize,

    /// Stream the sources in bounded chunks instead of loading them whole
    #[arg(long, default_value_t = false)]
    chunked: bool,

    /// Rows per chunk in chunked mode
    #[arg(long, default_value_t = 1000)]
    chunk_rows: usize,

    /// Replace clears the table first; append keeps existing rows
    #[arg(long, value_enum)]
    mode: Option<WriteMode>,

    /// Create the vector extension, table and vector index
    #[arg(long, default_value_t = false)]
    initialize: bool,

    /// Create lexical and vector indexes and refresh planner statistics
    #[arg(long, default_value_t = false)]
    create_indexes: bool,

    /// Suppress the interactive progress line
    #[arg(long, default_value_t = false)]
    quiet: bool,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    index: IndexArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = ImportCli::parse();
    let importing = cli.data.is_some() || cli.embeddings.is_some();
    anyhow::ensure!(
        importing || cli.initialize || cli.create_indexes,
        "nothing to do; pass --data/--embeddings, --initialize or --create-indexes"
    );

    let table = cli.database.table_name()?;
    let store = PgStore::connect(
        cli.database.pg_config()?,
        cli.index.store_options(table.clone()),
        cli.database.connect_attempts,
    )
    .await
    .context("failed to connect to Postgres")?;
    let store: Arc<dyn BookStore> = Arc::new(store);

    if cli.initialize {
        store
            .ensure_schema()
            .await
            .with_context(|| format!("failed to initialize {}", table.qualified()))?;
    }

    if importing {
        let report = import(&cli, store.clone()).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.is_success() {
            std::process::exit(1);
        }
    }

    if cli.create_indexes {
        store
            .ensure_indexes()
            .await
            .with_context(|| format!("failed to create indexes on {}", table.qualified()))?;
    }
    Ok(())
}

async fn import(cli: &ImportCli, store: Arc<dyn BookStore>) -> Result<LoadReport> {
    let data = cli.data.clone().context("--data is required for an import")?;
    let embeddings = cli
        .embeddings
        .clone()
        .context("--embeddings is required for an import")?;
    let mode = cli
        .mode
        .context("--mode replace|append is required for an import")?;

    let mut options = IngestOptions::new(
        DatasetSource::new(data, embeddings),
        mode,
        cli.index.dimension,
    );
    options.batch_size = cli.batch_size;
    options.chunked = cli.chunked;
    options.chunk_rows = cli.chunk_rows;

    let mut ingestor = Ingestor::new(store);
    if !cli.quiet {
        let progress: ProgressFn = Arc::new(|p: &IngestProgress| {
            if p.batches_attempted > 0 {
                let _ = render_progress(p.records_written, p.batches_attempted);
            }
        });
        ingestor = ingestor.on_progress(progress);
    }
    let result = ingestor.run(options).await;
    if !cli.quiet {
        eprintln!();
    }
    Ok(LoadReport::from_result(&result))
}

fn render_progress(inserted: usize, batches: usize) -> Result<()> {
    let plural = if inserted == 1 { "" } else { "s" };
    eprint!("\rInserted {inserted} record{plural} in {batches} batches...");
    io::stderr().flush()?;
    Ok(())
}
