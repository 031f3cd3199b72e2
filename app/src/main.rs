use cf_bus::{EventBus, EventHandler, InProcessBus, RedisBus};
use cf_config::Config;
use cf_core::telemetry;
use cf_db::{Db, PoolConfig};
use cf_sched::{
    EngineEventHandler, ExecutorClient, HealthChecker, HealthCheckerConfig, RunnerConfig,
    Scheduler, SchedulerOptions, TaskRunner,
};
use cf_web::AppState;
use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "cronfleet")]
#[command(about = "Distributed cron scheduler dispatching to HTTP executors")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the database schema and exit
    Migrate,
    /// Start the scheduler replica (default)
    Start,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    telemetry::init_tracing(&config.log.level, config.log.json(), "cronfleet");
    tracing::debug!(?config, "Configuration loaded");

    let pool_config = PoolConfig {
        max_conns: config.database.max_conns,
        min_conns: config.database.min_conns,
        conn_max_lifetime: Duration::from_secs(config.database.conn_max_lifetime_secs),
    };
    let db = match Db::connect(&config.database.url(), pool_config).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = db.health_check().await {
        tracing::error!("Database health check failed: {}", e);
        process::exit(1);
    }

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Migrate => {
            // Db::connect already ran the migration
            tracing::info!("Database schema is up to date");
        }
        Commands::Start => {
            tracing::info!(instance = %config.scheduler.instance_id, "cronfleet starting");
            if let Err(e) = run(config, db).await {
                tracing::error!("Scheduler exited with error: {}", e);
                process::exit(1);
            }
        }
    }
}

async fn run(config: Config, db: Db) -> cf_core::Result<()> {
    let runner = Arc::new(TaskRunner::new(
        db.clone(),
        RunnerConfig {
            workers: config.scheduler.max_workers,
            callback_base: config.server.callback_base(),
        },
    ));
    runner.start();

    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        runner.clone(),
        SchedulerOptions {
            instance_id: config.scheduler.instance_id.clone(),
            lock_key: config.scheduler.lock_key.clone(),
            lock_timeout: Duration::from_secs(config.scheduler.lock_timeout_secs),
            heartbeat: Duration::from_secs(config.scheduler.heartbeat_interval_secs),
            host: config.server.host.clone(),
            port: config.server.port,
        },
    ));
    scheduler.start().await?;

    let health = HealthChecker::new(
        db.clone(),
        HealthCheckerConfig {
            enabled: config.health_check.enabled,
            interval: Duration::from_secs(config.health_check.interval_secs),
            timeout: Duration::from_secs(config.health_check.timeout_secs),
            failure_threshold: config.health_check.failure_threshold,
            recovery_threshold: config.health_check.recovery_threshold,
            ..Default::default()
        },
        runner.clone(),
    );
    let health_loop = health.start();

    // The bus choice is config-driven; make it explicit in the log.
    let handler: Arc<dyn EventHandler> =
        EngineEventHandler::new(scheduler.clone(), runner.clone());
    let bus_token = CancellationToken::new();
    let (bus, bus_forwards): (Arc<dyn EventBus>, bool) = if config.redis.enabled {
        let redis_bus = RedisBus::connect(
            &config.redis.url(),
            &config.redis.channel,
            &config.scheduler.instance_id,
        )
        .await?;
        let _subscriber = RedisBus::spawn_subscriber(
            &config.redis.url(),
            &config.redis.channel,
            handler.clone(),
            bus_token.clone(),
        )
        .await?;
        (Arc::new(redis_bus), true)
    } else {
        (
            Arc::new(InProcessBus::new(
                &config.scheduler.instance_id,
                handler.clone(),
            )),
            false,
        )
    };

    let state = AppState {
        db,
        scheduler: scheduler.clone(),
        runner: runner.clone(),
        bus,
        bus_forwards,
        client: ExecutorClient::new(),
    };

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let client_timeout = Duration::from_secs(config.server.client_timeout_secs);

    tokio::select! {
        result = cf_web::start_server(&bind_addr, state, client_timeout) => {
            tracing::error!("API server exited");
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    bus_token.cancel();
    health.stop();
    if let Some(handle) = health_loop {
        let _ = handle.await;
    }
    scheduler.stop().await;
    runner.stop().await;
    tracing::info!("cronfleet stopped");

    Ok(())
}
