use std::sync::Arc;

use anyhow::{Context, Result};
use booksearch::config::{DatabaseArgs, EmbedderArgs, IndexArgs, SearchArgs};
use booksearch::{
    telemetry, BookStore, PgStore, SearchFilters, SearchHit, SearchMode, SearchRequest,
    SearchService,
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "booksearch-query",
    about = "Search the book catalog from the command line"
)]
struct QueryCli {
    /// Free-text query
    query: Option<String>,

    #[arg(long, value_enum, default_value_t = SearchMode::Hybrid)]
    search_type: SearchMode,

    /// Number of results to return
    #[arg(long, default_value_t = 5)]
    top_k: usize,

    /// Case-insensitive author substring
    #[arg(long)]
    author_filter: Option<String>,

    /// Case-insensitive title substring
    #[arg(long)]
    title_keyword: Option<String>,

    /// Minimum description length in characters
    #[arg(long)]
    min_content_length: Option<u32>,

    /// Show books similar to this book_id instead of running a query
    #[arg(long, conflicts_with = "query")]
    similar_to: Option<i64>,

    /// Print results as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

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
    let cli = QueryCli::parse();
    let settings = cli.search.settings(&cli.index)?;
    let store = PgStore::connect(
        cli.database.pg_config()?,
        cli.index.store_options(cli.database.table_name()?),
        cli.database.connect_attempts,
    )
    .await
    .context("failed to connect to Postgres")?;
    let store: Arc<dyn BookStore> = Arc::new(store);
    let service = SearchService::new(store, cli.embedder.build()?, settings);

    let hits = if let Some(book_id) = cli.similar_to {
        service
            .similar_to(book_id, cli.top_k)
            .await?
            .with_context(|| format!("book {book_id} not found"))?
    } else {
        let query = cli
            .query
            .clone()
            .context("a query is required unless --similar-to is given")?;
        let request = SearchRequest {
            query,
            top_k: cli.top_k,
            mode: cli.search_type,
            filters: SearchFilters {
                author: cli.author_filter.clone(),
                title: cli.title_keyword.clone(),
                min_content_length: cli.min_content_length,
                exclude_id: None,
            },
        };
        service.search(&request).await?
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else {
        println!("{}", render_hits(&hits));
    }
    Ok(())
}

fn render_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return String::from("No matching books.");
    }
    let mut out = String::new();
    for (rank, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "{}. {} by {} (book_id {})\n   Score: {:.4}",
            rank + 1,
            hit.title,
            hit.author,
            hit.book_id,
            hit.similarity_score
        ));
        if let Some(distance) = hit.distance {
            out.push_str(&format!(" | Distance: {distance:.4}"));
        }
        if let Some(rating) = hit.average_rating {
            out.push_str(&format!(" | Rating: {rating:.2}"));
        }
        out.push('\n');
        if !hit.description.is_empty() {
            out.push_str(&format!("   {}\n", hit.description.trim()));
        }
    }
    out
}
