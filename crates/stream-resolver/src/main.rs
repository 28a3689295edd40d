//! Stream resolver CLI application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use shared::models::AnimeQuery;
use shared::similarity::FreqVectorScorer;
use shared::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stream_resolver::{
    AnimePahe, Dispatcher, HttpFetcher, Orchestrator, PollStatus, StaticRenderer, StreamSource,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resolve anime episodes to direct stream URLs")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Romaji/original title
    #[arg(long)]
    title: Option<String>,

    /// English title
    #[arg(long)]
    english_title: Option<String>,

    /// Japanese title
    #[arg(long)]
    japanese_title: Option<String>,

    /// Episode number (1-based)
    #[arg(short, long)]
    episode: u32,

    /// MyAnimeList ID for identity confirmation
    #[arg(long)]
    mal_id: Option<u32>,

    /// AniList ID for identity confirmation
    #[arg(long)]
    anilist_id: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if args.verbose {
        config.logging.default_level = "debug".to_string();
    }

    shared::logging::init("stream-resolver", &config.logging)?;
    info!(config_file = %args.config.display(), "Stream resolver starting");

    let fetcher = Arc::new(
        HttpFetcher::new(
            Duration::from_secs(config.fetch.timeout_secs),
            Duration::from_millis(config.fetch.min_request_interval_ms),
            Duration::from_millis(config.fetch.retry_delay_ms),
        )
        .context("Failed to initialize crawling substrate")?,
    );
    let renderer = Arc::new(StaticRenderer::new(
        Duration::from_secs(config.fetch.timeout_secs),
        Duration::from_millis(config.fetch.retry_delay_ms),
    ));
    let scorer = Arc::new(FreqVectorScorer::new());

    let sources: Vec<Arc<dyn StreamSource>> = vec![Arc::new(AnimePahe::new(
        &config.animepahe,
        &config.fetch,
        fetcher.clone(),
        renderer,
        scorer,
    ))];

    let orchestrator = Arc::new(Orchestrator::new(
        Dispatcher::new(sources),
        fetcher,
        config.tasks.clone(),
    ));
    let _reclamation = orchestrator.spawn_reclamation();

    let query = AnimeQuery {
        title: args.title,
        english_title: args.english_title,
        japanese_title: args.japanese_title,
        episode_number: args.episode,
        mal_id: args.mal_id,
        anilist_id: args.anilist_id,
    };

    let task_id = match orchestrator.submit(query).await {
        Ok(id) => id,
        Err(e) => bail!("Invalid query: {}", e),
    };
    info!(task_id = %task_id, "Task submitted");

    loop {
        match orchestrator.poll(task_id).await {
            PollStatus::Pending => tokio::time::sleep(Duration::from_millis(500)).await,
            PollStatus::Done(results) => {
                let total: usize = results.iter().map(|r| r.streams.len()).sum();
                info!(streams = total, "Resolution finished");
                println!("{}", serde_json::to_string_pretty(&results)?);
                if total == 0 {
                    bail!("No streams found");
                }
                return Ok(());
            }
            PollStatus::Error(message) => bail!("Resolution failed: {}", message),
            PollStatus::NotFound => bail!("Task disappeared before completion"),
        }
    }
}
