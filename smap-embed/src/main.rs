//! smap-embed - track embedding pipeline
//!
//! Reads a playlist metadata table, resolves and fetches audio for each
//! track, and appends one embedding row per track to the dataset.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use smap_common::config::{
    locate_config_file, resolve_root_folder, resolve_under_root, user_config_path, write_toml_config,
    ROOT_FOLDER_ENV,
};
use smap_common::events::{EventBus, PipelineEvent};
use smap_common::logging::init_tracing;
use smap_embed::config::{EmbedConfig, FetchBackend, ResolvedPaths};
use smap_embed::models::{load_metadata, TrackRecord};
use smap_embed::services::dataset::read_embeddings;
use smap_embed::services::{
    add_column_if_absent, AudioFetcher, BatchOrchestrator, Dataset, FeatureExtractor, HttpFetcher,
    LinkCache, MatchDecision, OnnxEmbeddingModel, Postprocessor, RetrievalWorker, SourceResolver,
    TrackPipeline, YtDlpClient,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Command-line arguments for smap-embed
#[derive(Parser, Debug)]
#[command(name = "smap-embed")]
#[command(about = "Resolve, fetch and embed playlist tracks")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root folder for relative paths
    #[arg(long, global = true, env = ROOT_FOLDER_ENV)]
    root_folder: Option<PathBuf>,

    /// Log level or filter directive (overrides config)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline over a metadata table
    Run(RunArgs),

    /// Add the dataset's embeddings as a column of a metadata table
    MergeColumn {
        /// Metadata table to extend
        #[arg(long)]
        input: PathBuf,

        /// Dataset to read embeddings from (defaults to the configured dataset)
        #[arg(long)]
        dataset: Option<PathBuf>,

        #[arg(long, default_value = "embeddings")]
        column: String,
    },

    /// Resolve one track and print the chosen source
    Resolve {
        #[arg(long)]
        title: String,

        /// Artists, comma separated
        #[arg(long)]
        artists: String,

        /// Target duration, seconds
        #[arg(long)]
        duration: f64,

        #[arg(long)]
        tolerance: Option<f64>,
    },

    /// Write a configuration file with default values
    InitConfig {
        /// Destination (defaults to the per-user config location)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Metadata table (TSV)
    #[arg(long)]
    input: PathBuf,

    /// Dataset output (defaults to the configured dataset)
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Maximum tracks in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Duration tolerance, seconds
    #[arg(long)]
    tolerance: Option<f64>,

    /// After the run, add embeddings to the input table under this column
    #[arg(long)]
    merge_column: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EmbedConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_tracing(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        built = env!("BUILD_TIMESTAMP"),
        profile = env!("BUILD_PROFILE"),
        "smap-embed starting"
    );

    config.validate()?;
    let root_folder = resolve_root_folder(
        cli.root_folder.as_deref(),
        ROOT_FOLDER_ENV,
        config.root_folder.as_deref(),
    );
    let paths = config.resolve_paths(&root_folder);
    info!(root_folder = %root_folder.display(), "Root folder resolved");

    match cli.command {
        Command::Run(args) => run(&config, &paths, args).await,
        Command::MergeColumn {
            input,
            dataset,
            column,
        } => {
            let dataset = dataset
                .map(|p| resolve_under_root(&paths.root_folder, &p))
                .unwrap_or_else(|| paths.dataset.clone());
            let content = tokio::fs::read_to_string(&dataset)
                .await
                .with_context(|| format!("Cannot read dataset {}", dataset.display()))?;
            let embeddings = read_embeddings(&content, &dataset.display().to_string())?;
            merge_column(resolve_under_root(&paths.root_folder, &input), column, embeddings).await
        }
        Command::Resolve {
            title,
            artists,
            duration,
            tolerance,
        } => resolve(&config, &title, &artists, duration, tolerance).await,
        Command::InitConfig { path, force } => init_config(&config, path, force),
    }
}

async fn run(config: &EmbedConfig, paths: &ResolvedPaths, args: RunArgs) -> Result<()> {
    if let Some(tolerance) = args.tolerance {
        if !tolerance.is_finite() || tolerance < 0.0 {
            bail!("--tolerance must be a non-negative number, got {}", tolerance);
        }
    }
    let concurrency = args.concurrency.unwrap_or(config.orchestrator.concurrency);
    if concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    // Everything that can fail for configuration reasons happens before scheduling
    let input = resolve_under_root(&paths.root_folder, &args.input);
    let tracks = load_metadata(&input)?;
    info!(path = %input.display(), tracks = tracks.len(), "Metadata loaded");

    let dataset_path = args
        .dataset
        .map(|p| resolve_under_root(&paths.root_folder, &p))
        .unwrap_or_else(|| paths.dataset.clone());
    let dataset = Arc::new(Dataset::open(&dataset_path).await?);
    let link_cache = Arc::new(LinkCache::open(&paths.link_cache).await?);
    let extractor = build_extractor(config, paths)?;

    let ytdlp = Arc::new(YtDlpClient::new(config.resolver.ytdlp_path.clone()));
    let resolver = Arc::new(SourceResolver::new(ytdlp.clone(), &config.resolver));
    resolver.health_check().await?;

    let fetcher: Arc<dyn AudioFetcher> = match config.retrieval.backend {
        FetchBackend::Ytdlp => ytdlp,
        FetchBackend::Http => Arc::new(HttpFetcher::new(
            &config.retrieval.user_agent,
            config.retrieval.download_timeout(),
        )?),
    };
    let retrieval = Arc::new(RetrievalWorker::from_config(
        fetcher,
        &paths.audio_dir,
        &config.retrieval,
        config.extractor.sample_rate,
    )?);
    retrieval.health_check().await?;

    let pipeline = Arc::new(
        TrackPipeline::new(
            link_cache,
            resolver,
            retrieval,
            extractor,
            Arc::clone(&dataset),
            config.orchestrator.track_timeout(),
        )
        .with_tolerance(args.tolerance),
    );
    let orchestrator = BatchOrchestrator::new(
        pipeline,
        EventBus::new(config.orchestrator.event_capacity),
        config.orchestrator.progress_every,
    );
    tokio::spawn(log_events(orchestrator.event_bus().subscribe()));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let report = orchestrator.run(tracks, concurrency, cancel).await;
    print!("{}", report.summary);

    if let Some(column) = args.merge_column {
        if report.cancelled {
            warn!("Run was cancelled, skipping column merge");
        } else {
            let embeddings = dataset.embeddings_by_track_id().await?;
            merge_column(input, column, embeddings).await?;
        }
    }

    Ok(())
}

/// Mirror pipeline events into the debug log as JSON
async fn log_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => debug!(event = event.event_type(), "{}", json),
                Err(e) => warn!(error = %e, "Failed to serialize pipeline event"),
            },
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Event log fell behind, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn build_extractor(config: &EmbedConfig, paths: &ResolvedPaths) -> Result<FeatureExtractor> {
    let model = OnnxEmbeddingModel::load(&paths.model, &config.extractor)?;
    let postprocessor = Postprocessor::load(&paths.pca_params)?;
    Ok(FeatureExtractor::new(
        Arc::new(model),
        Some(postprocessor),
        config.extractor.clone(),
    )?)
}

async fn merge_column(table: PathBuf, column: String, embeddings: HashMap<String, String>) -> Result<()> {
    let filled = tokio::task::spawn_blocking(move || add_column_if_absent(&table, &column, &embeddings))
        .await
        .context("Column merge task failed")??;
    println!("Merged embeddings into {} rows", filled);
    Ok(())
}

async fn resolve(
    config: &EmbedConfig,
    title: &str,
    artists: &str,
    duration: f64,
    tolerance: Option<f64>,
) -> Result<()> {
    let backend = Arc::new(YtDlpClient::new(config.resolver.ytdlp_path.clone()));
    let resolver = SourceResolver::new(backend, &config.resolver);
    resolver.health_check().await?;

    let artists = artists.split(',').map(|a| a.trim().to_string()).collect();
    let query = TrackRecord::new("", title, artists, "", duration).search_query();
    match resolver.resolve(&query, duration, tolerance).await? {
        MatchDecision::Match { candidate, diff } => {
            println!("{}\t(duration diff {:.2}s)", candidate.url, diff);
        }
        MatchDecision::NoMatch { best_diff } => match best_diff {
            Some(diff) => println!("no match (closest candidate off by {:.2}s)", diff),
            None => println!("no match"),
        },
    }
    Ok(())
}

fn init_config(config: &EmbedConfig, path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_toml_config(config, &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn default_config_path() -> Result<PathBuf> {
    if let Some(existing) = locate_config_file(None)? {
        return Ok(existing);
    }
    user_config_path().context("No per-user configuration directory on this platform")
}
