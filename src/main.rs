//! testpulse Binary Entry Point
//!
//! Runs the aggregator API, feeds session statistics through the collector
//! pipeline and queries the local run history.
//! Core functionality is provided by the `testpulse` library crate.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use testpulse::{
    Collector, EmbeddedStore, LocalPersist, RemoteUpload, RunResult, RunSink, SessionMode,
    SessionStats, StorageBuilder, TestSession, Uploader,
    config::{AppConfig, DEFAULT_CONFIG_PATH, parse_duration},
    server::{AppState, create_router},
    storage::defaults,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// testpulse - Test Result Telemetry
#[derive(Parser, Debug)]
#[command(name = "testpulse", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        default_value = DEFAULT_CONFIG_PATH,
        env = "TESTPULSE_CONFIG"
    )]
    config: String,

    /// Embedded history database (overrides config file)
    #[arg(long, global = true, env = "TESTPULSE_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the aggregator REST API
    Serve {
        /// Server bind address (overrides config file)
        #[arg(long, env = "TESTPULSE_SERVER_BIND")]
        bind: Option<String>,

        /// Server port (overrides config file)
        #[arg(long, env = "TESTPULSE_SERVER_PORT")]
        port: Option<u16>,

        /// Aggregator database (overrides config file)
        #[arg(long, env = "TESTPULSE_AGGREGATOR_DB")]
        aggregator_db: Option<String>,
    },

    /// Record a finished session from a statistics JSON file
    Record {
        /// Session statistics file
        stats: PathBuf,

        /// Upload to the aggregator instead of the local history
        #[arg(long)]
        remote: bool,

        #[command(flatten)]
        worker: WorkerArgs,

        /// Bounded wait for the collector to drain
        #[arg(long, value_parser = parse_duration)]
        stop_timeout: Option<Duration>,
    },

    /// Upload one run JSON file to the aggregator
    Upload {
        /// Run file
        file: PathBuf,

        #[command(flatten)]
        worker: WorkerArgs,
    },

    /// Show the most recent run
    Report,

    /// List recent runs, newest first
    History {
        #[arg(short, long, default_value_t = defaults::DEFAULT_HISTORY_LIMIT)]
        limit: u32,
    },

    /// Show the pass-rate trend, oldest first
    Trend {
        #[arg(short, long, default_value_t = defaults::EMBEDDED_TREND_LIMIT)]
        limit: u32,
    },

    /// List the failures of the most recent run
    Failures,

    /// Rank tests by failure frequency over recent runs
    Stats {
        #[arg(short, long, default_value_t = defaults::EMBEDDED_STATS_WINDOW)]
        limit: u32,
    },
}

/// Worker-side overrides shared by `record` and `upload`.
#[derive(clap::Args, Debug)]
struct WorkerArgs {
    /// Aggregator base URL (overrides config file)
    #[arg(long, env = "MASTER_URL")]
    master_url: Option<String>,

    /// Worker id (defaults to the host name)
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    #[arg(long, env = "PROJECT")]
    project: Option<String>,

    #[arg(long, env = "BRANCH")]
    branch: Option<String>,
}

impl WorkerArgs {
    fn apply(self, config: &mut AppConfig) {
        if let Some(url) = self.master_url {
            config.uploader.endpoint = url;
        }
        if let Some(worker_id) = self.worker_id {
            config.worker.worker_id = Some(worker_id);
        }
        if let Some(project) = self.project {
            config.worker.project = project;
        }
        if let Some(branch) = self.branch {
            config.worker.branch = branch;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing; stdout is reserved for command output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,testpulse=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    tracing::debug!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load_or_default(&cli.config)?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    match cli.command {
        Command::Serve {
            bind,
            port,
            aggregator_db,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(path) = aggregator_db {
                config.database.aggregator_path = path;
            }
            config.validate()?;
            serve(config)
        }
        Command::Record {
            stats,
            remote,
            worker,
            stop_timeout,
        } => {
            worker.apply(&mut config);
            if let Some(timeout) = stop_timeout {
                config.collector.stop_timeout = timeout;
            }
            config.validate()?;
            record(&config, &stats, remote)
        }
        Command::Upload { file, worker } => {
            worker.apply(&mut config);
            config.validate()?;
            upload(&config, &file)
        }
        Command::Report => report(&open_history(&config)?),
        Command::History { limit } => history(&open_history(&config)?, limit),
        Command::Trend { limit } => trend(&open_history(&config)?, limit),
        Command::Failures => failures(&open_history(&config)?),
        Command::Stats { limit } => stats(&open_history(&config)?, limit),
    }
}

// =============================================================================
// Aggregator server
// =============================================================================

fn serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        "Server: {}:{}, Database: {}",
        config.server.bind,
        config.server.port,
        config.database.aggregator_path,
    );

    let store = StorageBuilder::new(&config.database.aggregator_path)
        .pool_size(config.database.pool_size)
        .build_aggregator()?;
    tracing::info!("Storage initialized");

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_server(config, AppState { store }))
}

async fn run_server(config: AppConfig, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    tracing::info!("Aggregator listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}

// =============================================================================
// Worker commands
// =============================================================================

fn record(
    config: &AppConfig,
    stats_path: &Path,
    remote: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(stats_path)?;
    let stats: Option<SessionStats> = match serde_json::from_str(&content) {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable session statistics, recording empty run");
            None
        }
    };

    let sink: Arc<dyn RunSink>;
    let mode;
    if remote {
        sink = Arc::new(RemoteUpload::new(Uploader::new(config.uploader.clone())?));
        mode = SessionMode::Worker(config.worker.identity());
    } else {
        sink = Arc::new(LocalPersist::new(open_history(config)?));
        mode = SessionMode::Embedded;
    }

    let collector = Collector::new(sink, config.collector.clone());
    let mut session = TestSession::new(collector, mode);
    session.session_start();
    let drained = session.session_finish(stats.as_ref());

    let collector = session.collector();
    println!(
        "recorded: persisted={} failed={} dropped={} drained={}",
        collector.persisted(),
        collector.failed(),
        collector.dropped(),
        drained
    );
    Ok(())
}

fn upload(config: &AppConfig, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let mut run: RunResult = serde_json::from_str(&content)?;

    let identity = config.worker.identity();
    if run.run_id.as_deref().is_none_or(str::is_empty) {
        run.run_id = Some(uuid::Uuid::new_v4().to_string());
    }
    if run.worker_id.is_empty() {
        run.worker_id = identity.worker_id;
    }
    if run.project.is_empty() {
        run.project = identity.project;
    }
    if run.branch.is_empty() {
        run.branch = identity.branch;
    }
    run.normalize();

    let uploader = Uploader::new(config.uploader.clone())?;
    let run_id = uploader.upload(&run)?;
    println!("uploaded: {run_id}");
    Ok(())
}

// =============================================================================
// History queries
// =============================================================================

fn open_history(config: &AppConfig) -> Result<EmbeddedStore, Box<dyn std::error::Error>> {
    Ok(StorageBuilder::new(&config.database.path)
        .pool_size(config.database.pool_size)
        .build_embedded()?)
}

fn report(store: &EmbeddedStore) -> Result<(), Box<dyn std::error::Error>> {
    let Some(last) = store.get_last()? else {
        println!("no runs recorded");
        return Ok(());
    };
    let run = &last.run;
    println!("run #{} at {}", run.id, run.timestamp.to_rfc3339());
    println!(
        "  passed={} failed={} error={} skipped={} total={}",
        run.passed, run.failed, run.error, run.skipped, run.total
    );
    println!("  pass rate {:.1}%  duration {:.2}s", run.pass_rate, run.duration);
    println!("  failures: {}", last.failures.len());
    Ok(())
}

fn history(store: &EmbeddedStore, limit: u32) -> Result<(), Box<dyn std::error::Error>> {
    for detail in store.get_history(limit)? {
        let run = &detail.run;
        println!(
            "#{:<6} {}  {:>3}/{:<3} {:>5.1}%  {:.2}s",
            run.id,
            run.timestamp.to_rfc3339(),
            run.passed,
            run.total,
            run.pass_rate,
            run.duration
        );
    }
    Ok(())
}

fn trend(store: &EmbeddedStore, limit: u32) -> Result<(), Box<dyn std::error::Error>> {
    for point in store.get_trend(limit)? {
        println!(
            "{}  {:>5.1}%  passed={} failed={} total={}",
            point.timestamp.to_rfc3339(),
            point.pass_rate,
            point.passed,
            point.failed,
            point.total
        );
    }
    Ok(())
}

fn failures(store: &EmbeddedStore) -> Result<(), Box<dyn std::error::Error>> {
    let Some(last) = store.get_last()? else {
        println!("no runs recorded");
        return Ok(());
    };
    if last.failures.is_empty() {
        println!("run #{} has no failures", last.run.id);
    }
    for failure in &last.failures {
        println!("{}  ({:.3}s)", failure.nodeid, failure.duration);
        if let Some(first_line) = failure.message.lines().next() {
            println!("    {first_line}");
        }
    }
    Ok(())
}

fn stats(store: &EmbeddedStore, limit: u32) -> Result<(), Box<dyn std::error::Error>> {
    for stat in store.get_failure_stats(limit)? {
        println!("{:>4}  {}", stat.fail_count, stat.nodeid);
    }
    Ok(())
}
