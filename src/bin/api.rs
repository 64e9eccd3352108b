use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use booksearch::api::{router, try_claim_ingest, AppState, IngestLock};
use booksearch::config::{DataArgs, DatabaseArgs, EmbedderArgs, IndexArgs, SearchArgs};
use booksearch::{telemetry, BookStore, IngestOptions, Ingestor, PgStore, SearchService, WriteMode};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "booksearch-api",
    about = "HTTP API for vector, text and hybrid book search"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "BOOKSEARCH_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Ensure the schema exists before serving.
    #[arg(long, env = "BOOKSEARCH_INITIALIZE", default_value_t = true)]
    initialize: bool,

    /// Load the default dataset in the background when the table is empty.
    #[arg(long, env = "RUN_INGEST", default_value_t = false)]
    run_ingest: bool,

    #[command(flatten)]
    data: DataArgs,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    index: IndexArgs,

    #[command(flatten)]
    search: SearchArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = ApiCli::parse();
    let settings = cli.search.settings(&cli.index)?;
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
    let ingest_lock = IngestLock::default();
    if cli.run_ingest {
        spawn_startup_ingest(store.clone(), &cli, &ingest_lock);
    }

    let service = Arc::new(SearchService::new(store, cli.embedder.build()?, settings));
    let state = AppState::new(service, cli.data.source()).with_ingest_lock(ingest_lock);
    let app = router(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    info!(%addr, table = %table.qualified(), "booksearch-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

/// Appends the default dataset when the table is empty; never blocks serving.
///
/// Holds the ingestion lock for the whole run, so `/load-data` answers 409 meanwhile.
fn spawn_startup_ingest(store: Arc<dyn BookStore>, cli: &ApiCli, lock: &IngestLock) {
    let Some(guard) = try_claim_ingest(lock) else {
        warn!("an ingestion run is already in progress; skipping startup load");
        return;
    };
    let options = IngestOptions {
        chunked: true,
        ..IngestOptions::new(cli.data.source(), WriteMode::Append, cli.index.dimension)
    };
    tokio::spawn(async move {
        let _guard = guard;
        match store.count().await {
            Ok(0) => {}
            Ok(existing) => {
                info!(existing, "data already ingested; skipping startup load");
                return;
            }
            Err(err) => {
                warn!(error = %err, "could not count existing books; skipping startup load");
                return;
            }
        }
        match Ingestor::new(store).run(options).await {
            Ok(summary) => info!(
                records = summary.records_written,
                failed = summary.failed_batches.len(),
                "startup load finished"
            ),
            Err(err) => warn!(error = %err, "startup load failed"),
        }
    });
}
