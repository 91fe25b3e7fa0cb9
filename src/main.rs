use anyhow::{Context, Result};
use background_service::{EmbeddingBackfill, RecomputeQueue};
use clap::{Parser, Subcommand};
use database::Database;
use llm_interface::OpenAiProvider;
use memefeed_core::{AppConfig, ErrorReporter, UserId};
use preference_engine::{PreferenceAggregator, WeightTable};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Preference maintenance for the meme feed
#[derive(Parser)]
#[command(name = "memefeed", version, about = "Meme feed preference maintenance")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "memefeed.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Rebuild the preference vector of one user
    Recompute {
        #[arg(short, long)]
        user: UserId,
    },

    /// Rebuild the preference vector of every user
    RecomputeAll,

    /// Embed one batch of posts that have no embedding yet
    Backfill,

    /// Run the embedding backfill and recompute queue until Ctrl-C
    ServeWorker,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(
                    "memefeed=info,preference_engine=info,database=info,llm_interface=info,background_service=info",
                )
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config).context("Failed to load configuration")?;

    let mut database =
        Database::new(config.database_url.clone()).with_embedding_dimension(config.embedding_dimension);
    database.connect().await.context("Failed to connect to database")?;
    database
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    let result = run(cli.command, &config, &database).await;
    database.close().await;
    result
}

async fn run(command: Commands, config: &AppConfig, database: &Database) -> Result<()> {
    let weights = Arc::new(WeightTable::from_config(&config.reactions));
    let aggregator = Arc::new(
        PreferenceAggregator::new(database.clone(), weights)
            .with_dimension(config.embedding_dimension),
    );

    match command {
        Commands::Migrate => {
            tracing::info!("Database is up to date");
        }
        Commands::Recompute { user } => {
            let preference = aggregator
                .recompute(user)
                .await
                .with_context(|| format!("Failed to recompute preferences of user {}", user))?;
            match preference {
                Some(vector) => println!("{}: {} dimensions", user, vector.len()),
                None => println!("{}: no preference signal", user),
            }
        }
        Commands::RecomputeAll => {
            let users = database.all_user_ids().await?;
            let mut failures = ErrorReporter::new("recompute-all");
            for user in &users {
                if let Err(e) = aggregator.recompute(*user).await {
                    failures.report(format_args!("user {}", user), &e);
                }
            }
            failures.log_summary();
            println!(
                "Recomputed {} users, {}",
                users.len() - failures.failures(),
                failures
            );
        }
        Commands::Backfill => {
            let provider = openai_provider(config)?;
            let backfill =
                EmbeddingBackfill::new(database.clone(), provider, aggregator, &config.worker);
            let report = backfill.run_once().await?;
            println!(
                "Embedded {} posts ({} skipped, {} failed), refreshed {} users ({} refused)",
                report.embedded,
                report.skipped,
                report.failed,
                report.triggered,
                report.trigger_failures
            );
        }
        Commands::ServeWorker => {
            let provider = openai_provider(config)?;
            let queue = RecomputeQueue::start(aggregator, config.worker.queue_capacity);
            let backfill =
                EmbeddingBackfill::new(database.clone(), provider, queue.clone(), &config.worker);

            backfill
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await;

            if let Some(stats) = queue.stop().await? {
                tracing::info!(
                    "Worker stopped: {} recomputed, {} coalesced, {} failed",
                    stats.processed,
                    stats.coalesced,
                    stats.failed
                );
            }
        }
    }

    Ok(())
}

fn openai_provider(config: &AppConfig) -> Result<OpenAiProvider> {
    let api_key = config.openai_api_key()?.to_string();
    Ok(OpenAiProvider::new(&config.openai, api_key)?)
}
