use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Use the library instead of redeclaring modules
use banksync::{
    config::Config,
    crypto::TokenCipher,
    database::{
        AccountStore, ConnectionStore, Database, SchedulerStore, TransactionStore,
    },
    provider::{BankProviderClient, HttpProviderClient},
    queue::{
        JobName, JobRegistry, MessageQueue, PgQueueDriver, QueueDriver, QueueName, WorkerOptions,
    },
    sync::{
        scheduler, AccountSyncJob, BalanceSyncService, InitialSyncJob, PeriodicSyncJob,
        TransactionSyncService,
    },
    tokens::ConnectionService,
};

#[derive(Parser)]
#[command(name = "banksync")]
#[command(version = "0.1.0")]
#[command(about = "Background bank-data synchronization service")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with specified level
    let log_filter = format!("banksync={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting banksync v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration from specified file
    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("Database connection established and migrations applied");

    // Token encryption keys are validated here so a misconfigured key id
    // fails the process before any job can observe it
    let cipher = Arc::new(
        TokenCipher::from_config(&config.crypto)
            .map_err(|e| anyhow::anyhow!("Token encryption misconfigured: {e}"))?,
    );

    let provider: Arc<dyn BankProviderClient> =
        Arc::new(HttpProviderClient::new(config.provider.clone()));

    let driver = Arc::new(PgQueueDriver::new(database.pool(), config.queue.clone()));
    let queue = MessageQueue::new(driver.clone() as Arc<dyn QueueDriver>, QueueName::Default)
        .await?;

    // Explicit composition: every collaborator is passed in at construction
    let db = Arc::new(database);
    let connection_store: Arc<dyn ConnectionStore> = db.clone();
    let account_store: Arc<dyn AccountStore> = db.clone();
    let transaction_store: Arc<dyn TransactionStore> = db.clone();
    let scheduler_store: Arc<dyn SchedulerStore> = db.clone();

    let connections = Arc::new(ConnectionService::new(
        connection_store,
        account_store.clone(),
        provider.clone(),
        cipher,
        queue.clone(),
    ));
    let transaction_sync = Arc::new(TransactionSyncService::new(
        connections.clone(),
        provider.clone(),
        account_store.clone(),
        transaction_store,
        config.sync.clone(),
    ));
    let balance_sync = Arc::new(BalanceSyncService::new(
        connections.clone(),
        provider.clone(),
        account_store.clone(),
    ));

    let account_sync_job = Arc::new(AccountSyncJob::new(
        transaction_sync.clone(),
        balance_sync.clone(),
        account_store,
    ));
    let initial_sync_job = Arc::new(InitialSyncJob::new(
        transaction_sync,
        balance_sync,
        config.sync.initial_lookback_days,
    ));
    let periodic_sync_job = Arc::new(PeriodicSyncJob::new(
        scheduler_store,
        queue.clone(),
        config.sync.clone(),
    ));

    // Explicit job registry: duplicate registrations fail here, at startup
    let mut registry = JobRegistry::new();
    registry.register_cron(
        QueueName::Default,
        JobName::PeriodicSync,
        scheduler::SCHEDULER_ID,
        scheduler::CRON_PATTERN,
        serde_json::json!({}),
        periodic_sync_job.handler(),
    )?;
    registry.register(
        QueueName::Default,
        JobName::AccountSync,
        account_sync_job.handler(),
    )?;
    registry.register(
        QueueName::Default,
        JobName::InitialSync,
        initial_sync_job.handler(),
    )?;

    let mut queues = HashMap::new();
    queues.insert(QueueName::Default, queue);
    registry
        .install(
            &queues,
            WorkerOptions {
                concurrency: config.queue.concurrency,
            },
        )
        .await?;
    info!("Job handlers installed; waiting for work");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    driver.close().await?;

    Ok(())
}
