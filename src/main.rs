use actix::prelude::*;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hivewatch_service::actors::{ArtifactActor, HiveRegistry, SupervisorActor};
use hivewatch_service::api::{self, parse_bound, ApiState};
use hivewatch_service::batch;
use hivewatch_service::config::Config;
use hivewatch_service::consumer::{KafkaTransport, QueueConsumer};
use hivewatch_service::error::HivewatchError;
use hivewatch_service::messages::supervisor::{RegisterActor, SystemShutdown};
use hivewatch_service::messages::ActorFailed;
use hivewatch_service::store::{DateRange, DetectionQuery, ResultStore, SqliteResultStore};

#[derive(Parser)]
#[command(version, about, long_about = None, name = "Hivewatch")]
struct Args {
    #[arg(short, long, env = "HIVEWATCH_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume frames from the broker and serve the query API (default)
    Run,
    /// Process a directory of images for one hive
    Batch {
        #[arg(long)]
        hive: String,
        #[arg(long)]
        input: PathBuf,
    },
    /// Write stored results for one hive as CSV
    Export {
        #[arg(long)]
        hive: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long, default_value = "results.csv")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hivewatch_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config)?;
    info!("Loaded configuration from {}", args.config.display());

    let system = System::new();
    system.block_on(async move {
        match args.command.unwrap_or(Command::Run) {
            Command::Run => run_service(config).await,
            Command::Batch { hive, input } => run_batch(config, hive, input).await,
            Command::Export {
                hive,
                start,
                end,
                output,
            } => run_export(config, hive, start, end, output).await,
        }
    })?;

    info!("Application shutdown complete.");
    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<dyn ResultStore>, HivewatchError> {
    let store = SqliteResultStore::open(&config.store.path, config.store.timeout())?;
    Ok(Arc::new(store))
}

async fn run_service(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();
    let supervisor = SupervisorActor::new(shutdown.clone()).start();
    let store = open_store(&config)?;

    let mut registry =
        HiveRegistry::new(config.clone(), store.clone()).with_supervisor(supervisor.clone());
    if config.artifacts.enabled {
        let settings = config.artifacts.clone();
        let artifacts = SyncArbiter::start(1, move || ArtifactActor::from_config(&settings));
        supervisor.do_send(RegisterActor::new("artifacts"));
        registry = registry.with_artifacts(artifacts);
    }
    let registry = Arc::new(registry);
    registry.preload()?;

    let mut consumers = Vec::new();
    for index in 0..config.consumer.workers.max(1) {
        let name = format!("consumer-{}", index);
        let consumer = QueueConsumer::new(
            name,
            KafkaTransport::from_config(&config),
            registry.clone(),
            config.consumer.clone(),
        )
        .with_supervisor(supervisor.clone());
        consumers.push(actix::spawn(consumer.run(shutdown.clone())));
    }
    info!(
        "Consuming {} with {} consumer(s)",
        config.broker.topic,
        consumers.len()
    );

    let api_task = config.api.enabled.then(|| {
        let state = ApiState {
            store: store.clone(),
            supervisor: Some(supervisor.clone()),
            registry: Some(registry.clone()),
        };
        let bind = config.api.bind.clone();
        let token = shutdown.clone();
        let supervisor = supervisor.clone();
        actix::spawn(async move {
            if let Err(err) = api::serve(&bind, state, token).await {
                error!("Query API failed: {}", err);
                supervisor.do_send(ActorFailed {
                    actor_name: "api".to_string(),
                    error: err.to_string(),
                });
                supervisor.do_send(SystemShutdown {
                    reason: format!("query API failed: {}", err),
                });
            }
        })
    });

    let supervisor_for_signal = supervisor.clone();
    let token = shutdown.clone();
    actix::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    info!("Received Ctrl+C signal, initiating shutdown...");
                    supervisor_for_signal.do_send(SystemShutdown {
                        reason: "ctrl-c".to_string(),
                    });
                }
                Err(err) => {
                    error!("Unable to listen for shutdown signal: {}", err);
                    token.cancel();
                }
            },
        }
    });

    for handle in consumers {
        match handle.await {
            Ok(stats) => info!(
                received = stats.received,
                acked = stats.acked,
                requeued = stats.requeued,
                dead_lettered = stats.dead_lettered,
                reconnects = stats.reconnects,
                "Consumer finished"
            ),
            Err(err) => error!("Consumer task failed: {}", err),
        }
    }
    if let Some(api_task) = api_task {
        if let Err(err) = api_task.await {
            error!("Query API task failed: {}", err);
        }
    }

    registry.shutdown();
    Ok(())
}

async fn run_batch(config: Config, hive: String, input: PathBuf) -> Result<()> {
    let store = open_store(&config)?;
    let summary = batch::run_batch(&config, store, &hive, &input).await?;

    println!("hive:       {}", hive);
    println!("files:      {}", summary.files);
    println!("stored:     {}", summary.stored);
    println!("duplicates: {}", summary.duplicates);
    println!("warming:    {}", summary.warming);
    println!("failed:     {}", summary.failed);
    match (summary.mean, summary.max, summary.min) {
        (Some(mean), Some(max), Some(min)) => {
            println!("coverage:   mean {:.3}%, max {}%, min {}%", mean, max, min)
        }
        _ => println!("coverage:   no measurements"),
    }
    Ok(())
}

async fn run_export(
    config: Config,
    hive: String,
    start: Option<String>,
    end: Option<String>,
    output: PathBuf,
) -> Result<()> {
    let start = start.as_deref().map(|v| parse_bound(v, false)).transpose()?;
    let end = end.as_deref().map(|v| parse_bound(v, true)).transpose()?;
    let mut query = DetectionQuery::for_hive(hive);
    if start.is_some() || end.is_some() {
        query = query.with_range(DateRange::new(start, end)?);
    }

    let store = open_store(&config)?;
    let file = std::fs::File::create(&output).into_diagnostic()?;
    let rows = batch::export_csv(store.as_ref(), &query, BufWriter::new(file)).await?;
    info!("Wrote {} rows to {}", rows, output.display());
    Ok(())
}
