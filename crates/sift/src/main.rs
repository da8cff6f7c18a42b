//! sift daemon - tiered memory service for conversational agents

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sift::admin::{self, AppState};
use sift::alerts::{
    AlertEngine, AlertNotifier, SqliteAlertRepository, SqliteRuleConfigStore,
};
use sift::config::Config;
use sift::embedding::{Embedder, OpenAiEmbedder};
use sift::engine::schedulers::spawn_schedulers;
use sift::engine::MemoryEngine;
use sift::error::Result;
use sift::judge::Judge;
use sift::llm::OpenAiClient;
use sift::metrics::{persistence::init_schema, Dashboard, MetricsCollector, MetricsPersistence};
use sift::storage::redis::{RedisListStore, RedisStagingStore};
use sift::storage::{
    InMemoryListStore, InMemoryStagingStore, ListStore, SqliteEndUserStore, StagingStore,
    InMemoryVectorStore,
};

/// sift - funnel memory daemon: capture, judge, stage, promote, decay
#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Tiered memory daemon for conversational agents")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default command)
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("sift failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Daily-rotated file log plus stderr, filtered by RUST_LOG
    let file_appender = tracing_appender::rolling::daily(&config.log.dir, "sift.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!(backend = %config.storage.backend, "starting sift");

    // Relational persistence
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database.url)
        .await?;
    init_schema(&pool).await?;

    // Store ports
    let (list_store, staging): (Arc<dyn ListStore>, Arc<dyn StagingStore>) =
        match config.storage.backend.as_str() {
            "redis" => {
                let list = RedisListStore::connect(&config.storage.redis_url).await?;
                let staging =
                    RedisStagingStore::connect(&config.storage.redis_url, config.staging.ttl_days)
                        .await?;
                (Arc::new(list), Arc::new(staging))
            }
            _ => (
                Arc::new(InMemoryListStore::new()),
                Arc::new(InMemoryStagingStore::new(config.staging.ttl_days)),
            ),
        };
    let vector_store = Arc::new(InMemoryVectorStore::new());
    let end_users = Arc::new(SqliteEndUserStore::new(pool.clone()));

    // Model ports
    let llm = Arc::new(OpenAiClient::new(&config.llm)?);
    let judge = Judge::new(
        llm,
        &config.llm.judge_model,
        &config.llm.extract_model,
    );
    let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(&config.embedding)?);

    // Metrics
    let metrics = Arc::new(MetricsCollector::new());
    let persistence = Arc::new(MetricsPersistence::new(
        pool.clone(),
        config.metrics.persist_interval_minutes,
        config.metrics.memory_retention_hours,
    ));
    if let Err(e) = persistence.load_cumulative(&metrics).await {
        warn!(error = %e, "no cumulative metrics to restore");
    }
    if let Err(e) = persistence
        .load_recent(&metrics, config.metrics.history_load_hours)
        .await
    {
        warn!(error = %e, "no metrics history to reload");
    }

    // Engine
    let engine = Arc::new(
        MemoryEngine::new(
            config.clone(),
            vector_store,
            list_store,
            staging.clone(),
            embedder,
            judge,
            metrics.clone(),
        )
        .with_end_user_store(end_users),
    );

    // Alerts
    let repository = Arc::new(SqliteAlertRepository::new(pool.clone()));
    let rule_configs = Arc::new(SqliteRuleConfigStore::new(pool.clone()));
    let notifier = Arc::new(AlertNotifier::new(config.alerts.notify.clone())?);
    let alert_engine = Arc::new(
        AlertEngine::new(
            &config.alerts,
            repository,
            rule_configs,
            staging.clone(),
            metrics.clone(),
        )
        .with_notifier(notifier),
    );
    alert_engine.init_rule_configs(&config.alerts).await?;
    alert_engine.stats_sync().attach_pool(pool.clone());
    if let Err(e) = alert_engine.stats_sync().load().await {
        warn!(error = %e, "no alert stats to restore");
    }

    let dashboard = Arc::new(Dashboard::new(pool.clone(), metrics.clone(), staging));

    // Background tasks share one shutdown signal; shutdown waits for all
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = spawn_schedulers(engine.clone(), shutdown_rx.clone());
    tasks.push(persistence.clone().spawn(
        metrics.clone(),
        config.metrics.retention_days,
        shutdown_rx.clone(),
    ));
    tasks.push(alert_engine.clone().spawn(shutdown_rx.clone()));

    let state = AppState {
        engine,
        alerts: alert_engine,
        dashboard,
    };

    let server = tokio::spawn({
        let listen_addr = config.server.listen_addr.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = admin::serve(state, &listen_addr, shutdown_rx).await {
                error!(error = %e, "admin server exited");
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| sift::SiftError::Io(e))?;
    info!("shutdown signal received, draining tasks");

    let _ = shutdown_tx.send(true);
    tasks.join_all().await;
    let _ = server.await;
    pool.close().await;

    info!("sift stopped");
    Ok(())
}
