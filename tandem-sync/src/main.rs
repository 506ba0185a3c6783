use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tandem_core::{SearchFilters, TandemConfig, VectorStore};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use tandem_sync::subsystems::migrate::{MigrationOptions, FATAL_EXIT_CODE};
use tandem_sync::AppContext;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "tandem.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Embed changed records and upsert them into the vector store
    Migrate {
        /// Validate records without embedding, writing or checkpointing
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        concurrency: Option<usize>,

        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Delete the checkpoint before starting
        #[arg(long)]
        reset: bool,
    },

    /// Check database, pgvector and schema
    Health,

    /// Semantic search over stored embeddings
    Search {
        text: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        #[arg(long, default_value_t = 0.0)]
        threshold: f64,

        #[arg(long)]
        model_version: Option<String>,

        #[arg(long)]
        chunk_type: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            eprintln!("tandem-sync: {:#}", e);
            FATAL_EXIT_CODE
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let config = TandemConfig::load(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {}", args.config, e))?;

    let default_level = config
        .service
        .log_level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();

    let ctx = AppContext::connect(config).await?;
    run_command(&ctx, args.command).await
}

/// Run one command and close the context whether or not it succeeded.
async fn run_command(ctx: &AppContext, command: Command) -> anyhow::Result<i32> {
    let result = execute(ctx, command).await;
    ctx.close().await;
    result
}

async fn execute(ctx: &AppContext, command: Command) -> anyhow::Result<i32> {
    let code = match command {
        Command::Migrate {
            dry_run,
            batch_size,
            concurrency,
            checkpoint,
            reset,
        } => {
            let mut options =
                MigrationOptions::from_config(&ctx.config.migration, &ctx.config.vector_store);
            if let Some(n) = batch_size {
                options.batch_size = n.max(1);
            }
            if let Some(n) = concurrency {
                options.concurrency = n.max(1);
            }
            if let Some(path) = checkpoint {
                options.checkpoint_path = path;
            }

            let orchestrator = ctx.migration(options)?;
            if reset {
                orchestrator.reset_checkpoint()?;
            }

            let (tx, mut rx) = broadcast::channel(1);
            let shutdown_tx = tx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received, finishing current batch");
                    let _ = shutdown_tx.send(());
                }
            });

            let report = orchestrator.run(dry_run, &mut rx).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            report.exit_code()
        }

        Command::Health => {
            let report = ctx.vector_store.health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Ok(version) = tandem_core::db::check_pgvector(&ctx.pool).await {
                tracing::info!(version = %version, "pgvector available");
            }
            if report.is_healthy() {
                0
            } else {
                1
            }
        }

        Command::Search {
            text,
            limit,
            threshold,
            model_version,
            chunk_type,
        } => {
            let query = ctx.embeddings.generate_query(&text).await?;
            if query.fallback {
                tracing::warn!("Query embedded with the fallback provider; results may be poor");
            }
            let filters = SearchFilters {
                model_version,
                chunk_type,
            };
            let hits = ctx
                .vector_store
                .similarity_search(&query.vector, threshold, limit, &filters)
                .await?;
            for hit in &hits {
                println!("{}", serde_json::to_string(hit)?);
            }
            0
        }
    };

    Ok(code)
}
