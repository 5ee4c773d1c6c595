//! `orchestrator` — the operational CLI (§6). Grounded on
//! `bin/migrate_cli.rs`'s `clap` derive style, extended to the full
//! subcommand surface: `start`, `scrape`, `incremental`, `dedupe`,
//! `enrich`, `status`, `migrate`.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use registries::{Registry, RegistryAdapter};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pipeline_core::domains::dedup::Deduplicator;
use pipeline_core::domains::jobs::{HandlerRegistry, JobQueueStore};
use pipeline_core::domains::monitoring::{Monitor, MonitoringRepository};
use pipeline_core::domains::orchestrator::{Orchestrator, OrchestratorConfig};
use pipeline_core::domains::scraper::ScrapingJobRepository;
use pipeline_core::domains::trials::{TrialEmbeddingRepository, TrialRepository};
use pipeline_core::handlers::{DedupHandler, EnrichHandler, GeocodeHandler, ScrapeHandler};
use pipeline_core::kernel::{CheckpointStore, GeocodingClient, OpenAiEmbeddingClient, RateLimitedClient};
use pipeline_core::Config;

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Clinical trial registry ingestion, deduplication, and matching pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending database migrations.
    Migrate,
    /// Bootstrap the worker pool, auto-scaler, scheduler, and monitoring loops.
    Start,
    /// Enqueue a full scrape for one registry (or all, if omitted).
    Scrape { registry: Option<String> },
    /// Enqueue an incremental scrape for one registry (or all, if omitted).
    Incremental {
        registry: Option<String>,
        #[arg(long)]
        since: Option<String>,
    },
    /// Enqueue a deduplication pass.
    Dedupe {
        #[arg(long, default_value_t = 1000)]
        batch: usize,
    },
    /// Enqueue an embedding-refresh pass over stale trials.
    Enrich,
    /// Print health and queue-depth metrics as JSON.
    Status,
}

const ALL_REGISTRIES: [Registry; 5] = [
    Registry::CtGov,
    Registry::EuCtr,
    Registry::Ctis,
    Registry::Isrctn,
    Registry::Ictrp,
];

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("operational error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    if matches!(cli.command, Commands::Migrate) {
        sqlx::migrate!("../../migrations").run(&pool).await.context("migration failed")?;
        println!("migrations applied");
        return Ok(());
    }

    let queue = Arc::new(JobQueueStore::new(pool.clone()));

    match cli.command {
        Commands::Migrate => unreachable!("handled above"),
        Commands::Start => cmd_start(&config, pool, queue).await,
        Commands::Scrape { registry } => cmd_enqueue_scrape(&queue, registry, "scrape_full", None).await,
        Commands::Incremental { registry, since } => {
            cmd_enqueue_scrape(&queue, registry, "scrape_incremental", since).await
        }
        Commands::Dedupe { batch } => {
            queue
                .enqueue("dedupe", "deduplicate", serde_json::json!({"batch_size": batch}), 0, None)
                .await?;
            println!("enqueued deduplicate (batch_size={batch})");
            Ok(())
        }
        Commands::Enrich => {
            queue.enqueue("enrich", "enrich", serde_json::json!({}), 0, None).await?;
            println!("enqueued enrich");
            Ok(())
        }
        Commands::Status => cmd_status(&queue, &pool).await,
    }
}

fn parse_registry(name: &str) -> Result<Registry> {
    match name.to_lowercase().as_str() {
        "ctgov" | "clinicaltrials" | "clinicaltrials.gov" => Ok(Registry::CtGov),
        "euctr" => Ok(Registry::EuCtr),
        "ctis" => Ok(Registry::Ctis),
        "isrctn" => Ok(Registry::Isrctn),
        "ictrp" | "who" => Ok(Registry::Ictrp),
        other => Err(anyhow::anyhow!("unknown registry `{other}`")),
    }
}

async fn cmd_enqueue_scrape(
    queue: &JobQueueStore,
    registry: Option<String>,
    job_type: &str,
    since: Option<String>,
) -> Result<()> {
    let registries: Vec<Registry> = match registry {
        Some(r) => vec![parse_registry(&r)?],
        None => ALL_REGISTRIES.to_vec(),
    };

    let since = since
        .map(|s| s.parse::<chrono::DateTime<chrono::Utc>>())
        .transpose()
        .context("--since must be an ISO-8601 date")?;

    for registry in registries {
        queue
            .enqueue(
                "scrape",
                job_type,
                serde_json::json!({"registry": registry, "since": since}),
                0,
                None,
            )
            .await?;
        println!("enqueued {job_type} for {registry:?}");
    }
    Ok(())
}

async fn cmd_status(queue: &JobQueueStore, pool: &sqlx::PgPool) -> Result<()> {
    let pending = queue.pending_count(None).await?;
    let failure_rate = queue.failure_rate_last_hour().await?;
    let monitoring = MonitoringRepository::new(pool.clone());
    let alerts = monitoring.recent_alerts(10).await?;

    let status = serde_json::json!({
        "pending_jobs": pending,
        "failure_rate_last_hour": failure_rate,
        "recent_alerts": alerts.len(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_start(config: &Config, pool: sqlx::PgPool, queue: Arc<JobQueueStore>) -> Result<()> {
    let http = Arc::new(RateLimitedClient::new(&config.geocoding_user_agent)?);

    let mut adapters: HashMap<Registry, Arc<dyn RegistryAdapter>> = HashMap::new();
    adapters.insert(
        Registry::CtGov,
        Arc::new(registries::ctgov::CtGovAdapter::new(http.clone(), config.ctgov_base_url.as_str())),
    );
    adapters.insert(
        Registry::Isrctn,
        Arc::new(registries::isrctn::IsrctnAdapter::new(http.clone(), config.isrctn_base_url.as_str())),
    );
    adapters.insert(
        Registry::Ctis,
        Arc::new(registries::ctis::CtisAdapter::new(http.clone(), config.ctis_base_url.as_str())),
    );
    adapters.insert(
        Registry::EuCtr,
        Arc::new(registries::euctr::EuCtrAdapter::new(registries::BulkDropDirectory::new(
            config.euctr_bulk_dir.clone(),
        ))),
    );
    adapters.insert(
        Registry::Ictrp,
        Arc::new(registries::ictrp::IctrpAdapter::new(registries::BulkDropDirectory::new(
            config.ictrp_bulk_dir.clone(),
        ))),
    );

    let trials = TrialRepository::new(pool.clone());
    let embeddings = TrialEmbeddingRepository::new(pool.clone());
    let checkpoints = Arc::new(CheckpointStore::new(pool.clone()));
    let scraping_jobs = Arc::new(ScrapingJobRepository::new(pool.clone()));
    let monitoring = MonitoringRepository::new(pool.clone());

    let mut handlers = HandlerRegistry::new();
    handlers = handlers.register(
        "scrape_full",
        Arc::new(ScrapeHandler::new(
            adapters.clone(),
            trials.clone(),
            checkpoints.clone(),
            scraping_jobs.clone(),
            monitoring.clone(),
        )),
    );
    handlers = handlers.register(
        "scrape_incremental",
        Arc::new(ScrapeHandler::new(
            adapters.clone(),
            trials.clone(),
            checkpoints.clone(),
            scraping_jobs.clone(),
            monitoring.clone(),
        )),
    );
    handlers = handlers.register("deduplicate", Arc::new(DedupHandler::new(Deduplicator::new(pool.clone()))));

    if let Some(api_key) = config.embeddings_api_key.clone() {
        let embedding_client = Arc::new(OpenAiEmbeddingClient::new(config.embeddings_base_url.as_str(), api_key));
        handlers = handlers.register("enrich", Arc::new(EnrichHandler::new(trials.clone(), embeddings, embedding_client)));
    } else {
        tracing::warn!("EMBEDDINGS_API_KEY not set, enrich jobs will have no handler");
    }

    let geocoding_client = Arc::new(GeocodingClient::new(config.geocoding_base_url.as_str(), &config.geocoding_user_agent)?);
    handlers = handlers.register("geocode", Arc::new(GeocodeHandler::new(trials.clone(), geocoding_client)));

    let orchestrator_config = OrchestratorConfig {
        queues: config.queues.clone(),
        visibility_timeout: config.default_visibility_timeout,
        worker_min: config.worker_min,
        worker_max: config.worker_max,
    };
    let orchestrator = Orchestrator::new(orchestrator_config, queue.clone(), pool.clone(), handlers);

    let monitor = Arc::new(Monitor::new(
        monitoring.clone(),
        queue.clone(),
        scraping_jobs.clone(),
        http.clone(),
        config.default_visibility_timeout,
    ));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    orchestrator.run(Some(monitor), shutdown).await
}
