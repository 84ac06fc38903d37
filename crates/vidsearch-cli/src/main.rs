//! vidsearch CLI: Semantic video frame search

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use vidsearch_core::build::{self, ProgressEvent};
use vidsearch_core::{
    Config, Context, IndexBuilder, MetadataLedger, Query, SearchEngine, SearchHit, VS_DIR,
    discover,
};

#[derive(Parser)]
#[command(name = "vidsearch")]
#[command(about = "Semantic video frame search", long_about = None)]
#[command(version)]
struct Cli {
    /// Log progress details
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new .vidsearch repository
    Init,

    /// Index staged videos
    Build {
        /// Skip the consistency check after building
        #[arg(long)]
        no_verify: bool,
    },

    /// Check that the index, ledger and thumbnails agree
    Verify,

    /// Search indexed frames with text or an image
    Search {
        /// Text query
        query: Vec<String>,

        /// Search with an image file instead of text
        #[arg(long, conflicts_with = "query")]
        image: Option<PathBuf>,

        /// Maximum number of results
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show index status and statistics
    Status,

    /// Delete the index, ledger and thumbnails
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    match cli.command {
        Commands::Init => cmd_init()?,
        Commands::Build { no_verify } => cmd_build(no_verify)?,
        Commands::Verify => cmd_verify()?,
        Commands::Search {
            query,
            image,
            limit,
            json,
        } => {
            let query = match image {
                Some(path) => Query::Image(
                    std::fs::read(&path)
                        .with_context(|| format!("Could not read {}", path.display()))?,
                ),
                None if query.is_empty() => anyhow::bail!("Give a text query or --image FILE"),
                None => Query::Text(query.join(" ")),
            };
            cmd_search(query, limit, json)?;
        }
        Commands::Status => cmd_status()?,
        Commands::Reset { yes } => cmd_reset(yes)?,
    }

    Ok(())
}

fn repo_root() -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    discover::find_vs_root(&cwd).context("Not in a vidsearch repository. Run 'vidsearch init' first.")
}

fn cmd_init() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let vs_dir = cwd.join(VS_DIR);

    if vs_dir.exists() {
        anyhow::bail!("Already initialized: {} exists", vs_dir.display());
    }

    std::fs::create_dir(&vs_dir)?;

    let config = Config::default();
    config.save(&cwd)?;
    std::fs::create_dir_all(config.video_dir(&cwd))?;

    println!("Initialized vidsearch repository in {}", vs_dir.display());
    println!(
        "Put videos in {} and run 'vidsearch build'.",
        config.video_dir(&cwd).display()
    );

    Ok(())
}

fn cmd_build(no_verify: bool) -> Result<()> {
    let ctx = Context::open(repo_root()?)?;
    let mut builder = IndexBuilder::new(&ctx)?;

    let assets = builder.discover_assets();
    if assets.is_empty() {
        println!("No videos to index in {}", ctx.video_dir().display());
        return Ok(());
    }

    let pb = ProgressBar::new(assets.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓░"),
    );

    builder.set_progress_callback(Box::new({
        let pb = pb.clone();
        move |event| match event {
            ProgressEvent::Asset { current, path, .. } => {
                pb.set_position(current.saturating_sub(1) as u64);
                pb.set_message(path.file_name().unwrap_or_default().to_string_lossy().to_string());
            }
            ProgressEvent::Batch { video_id, frames } => {
                pb.set_message(format!("{}: +{} frames", video_id, frames));
            }
            ProgressEvent::Checkpointed { video_id, rows } => {
                pb.inc(1);
                pb.set_message(format!("{} checkpointed ({} rows)", video_id, rows));
            }
        }
    }));

    let stats = builder.build(&assets);
    pb.finish_and_clear();
    let stats = stats.context("Build aborted; unfinished videos will be retried on the next run")?;

    println!("✓ Build complete:");
    println!("  Videos found:           {}", stats.assets_seen);
    println!("  Videos indexed:         {}", stats.assets_indexed);
    println!("  Videos already indexed: {}", stats.assets_already_indexed);
    println!("  Videos skipped:         {}", stats.assets_skipped);
    println!("  Frames indexed:         {}", stats.frames_indexed);
    println!("  Frames skipped:         {}", stats.frames_skipped);

    if !no_verify {
        let report = builder
            .verify()
            .context("Verification failed; run 'vidsearch reset --yes' and rebuild")?;
        println!("✓ Verified {} frames from {} videos", report.rows, report.videos);
    }

    Ok(())
}

fn cmd_verify() -> Result<()> {
    let root = repo_root()?;
    // Verification reads files only; no model is needed.
    let ctx = Context::open_without_model(root)?;

    let report =
        build::verify(&ctx).context("Verification failed; run 'vidsearch reset --yes' and rebuild")?;
    println!("✓ Verified {} frames from {} videos", report.rows, report.videos);
    Ok(())
}

fn cmd_search(query: Query, limit: usize, json: bool) -> Result<()> {
    let root = repo_root()?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message("Searching...");

    let ctx = Context::open(root)?;
    let timeout = ctx.config().query_timeout();
    let engine = Arc::new(SearchEngine::open(&ctx)?);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let results = runtime.block_on(engine.search_with_timeout(query.clone(), limit, timeout));

    pb.finish_and_clear();
    let results = results?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    let label = match &query {
        Query::Text(text) => text.clone(),
        Query::Image(_) => "image query".to_string(),
    };

    if results.is_empty() {
        println!("No results found for: {}", label);
        return Ok(());
    }

    println!("Results for: {}\n", label);
    for (i, hit) in results.iter().enumerate() {
        print_hit(i + 1, hit);
    }

    Ok(())
}

/// Print one result line.
fn print_hit(index: usize, hit: &SearchHit) {
    let score_color = if hit.similarity_score > 0.7 {
        "\x1b[32m" // Green for high scores
    } else if hit.similarity_score > 0.5 {
        "\x1b[33m" // Yellow for medium scores
    } else {
        "\x1b[31m" // Red for low scores
    };

    println!(
        "\x1b[1;36m[{}]\x1b[0m {}{:.3}\x1b[0m  \x1b[1m{}\x1b[0m @ \x1b[33m{:.2}s\x1b[0m",
        index, score_color, hit.similarity_score, hit.video_id, hit.timestamp,
    );
    println!("    {}", hit.thumbnail_path.display());
}

fn cmd_status() -> Result<()> {
    let root = repo_root()?;
    let config = Config::load(&root)?;

    println!("vidsearch repository: {}", root.display());
    println!();
    println!("Configuration:");
    println!("  Model: {}", config.model);
    println!("  Dimension: {}", config.dimension);
    println!("  Sample interval: {}s", config.sample_interval_secs);
    println!("  Batch size: {}", config.batch_size);
    println!("  Workers: {}", config.workers);
    println!();

    let staged = discover::find_assets(&config.video_dir(&root), &config.video_extensions);
    let ledger_path = discover::ledger_path(&root);
    let ledger = if ledger_path.exists() {
        MetadataLedger::load(&ledger_path)?
    } else {
        MetadataLedger::new()
    };
    // Records of one video are contiguous.
    let mut videos: Vec<&str> = ledger.records().iter().map(|r| r.video_id.as_str()).collect();
    videos.dedup();

    println!("Index:");
    println!("  Videos indexed: {}", videos.len());
    println!("  Frames indexed: {}", ledger.len());
    println!("  Videos staged:  {}", staged.len());

    Ok(())
}

fn cmd_reset(yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("This deletes the whole index. Re-run with --yes to confirm.");
    }
    let root = repo_root()?;
    let ctx = Context::open_without_model(root)?;

    let mut builder = IndexBuilder::new(&ctx)?;
    builder.reset()?;
    println!("✓ Index reset");
    Ok(())
}
