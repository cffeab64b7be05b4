//! drift-monitor - windowed drift detection over sensor readings
//!
//! Usage:
//!   drift-monitor run --config monitor.toml          # Periodic collect/score/retrain loop
//!   drift-monitor check reference.jsonl current.jsonl
//!   drift-monitor export-csv reference.snap -o reference.csv
//!   drift-monitor init-config > monitor.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use monitor::{
    AlertLogSink, BufferedSink, Controller, DriftQuery, DriftService, FanoutSink, FsBlobStore,
    JsonlSource, MetricsRegistry, MetricsSink, MonitorConfig, QueryData, ReadingSource,
    RetrainTrigger, SyntheticSource,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemetry::Reading;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drift-monitor")]
#[command(about = "Windowed drift detection with a collection and retrain controller")]
#[command(version)]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceKind {
    Jsonl,
    Synthetic,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until Ctrl-C
    Run {
        #[arg(long, value_enum, default_value = "jsonl")]
        source: SourceKind,

        /// Log to tail (default: <log_dir>/predictions_YYYYMMDD.jsonl for the UTC day)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Synthetic source: number of machines
        #[arg(long, default_value_t = 10)]
        entities: usize,

        /// Synthetic source: readings per machine per batch
        #[arg(long, default_value_t = 10)]
        per_entity: usize,

        /// Synthetic source: drift factor applied to every field
        #[arg(long, default_value_t = 0.0)]
        drift: f64,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Score one JSONL batch against another and print the report
    Check {
        reference: PathBuf,
        current: PathBuf,

        /// Compare raw fields only, without window features
        #[arg(long)]
        raw: bool,
    },

    /// Write the table of a .snap file as CSV
    #[command(name = "export-csv")]
    ExportCsv {
        snapshot: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the default configuration as TOML
    #[command(name = "init-config")]
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Run {
            source,
            log_file,
            entities,
            per_entity,
            drift,
            seed,
        } => {
            let source: Arc<dyn ReadingSource> = match source {
                SourceKind::Jsonl => match log_file {
                    Some(path) => Arc::new(JsonlSource::new(path, config.drift.window_size)),
                    None => Arc::new(JsonlSource::daily(
                        &config.storage.log_dir,
                        "predictions",
                        config.drift.window_size,
                    )),
                },
                SourceKind::Synthetic => {
                    let mut synthetic = SyntheticSource::new(entities, per_entity).with_drift(drift);
                    if let Some(seed) = seed {
                        synthetic = synthetic.with_seed(seed);
                    }
                    Arc::new(synthetic)
                }
            };
            run(config, source).await
        }
        Commands::Check { reference, current, raw } => check(&config, &reference, &current, raw).await,
        Commands::ExportCsv { snapshot, output } => export_csv(&snapshot, output.as_deref()),
        Commands::InitConfig => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: MonitorConfig, source: Arc<dyn ReadingSource>) -> Result<()> {
    let registry = Arc::new(MetricsRegistry::new());
    let alerts = Arc::new(AlertLogSink::new(config.alert_log_path()));
    let sinks: Vec<Arc<dyn MetricsSink>> = vec![registry.clone(), alerts];
    let fanout: Arc<dyn MetricsSink> = Arc::new(FanoutSink::new(sinks));
    let (sink, drain) = BufferedSink::spawn(fanout, config.schedule.sink_buffer);

    let controller = Arc::new(
        Controller::builder(config.clone(), source)
            .sink(Arc::new(sink))
            .trigger(retrain_trigger()?)
            .store(Arc::new(FsBlobStore::new(&config.storage.store_dir)))
            .build()?,
    );
    controller.restore().await.context("Failed to restore state")?;

    let runner = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run().await })
    };

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("shutting down after the current cycle");
    controller.shutdown();
    runner.await.context("Controller task failed")?;

    // the drain task ends once the last sink handle is gone
    drop(controller);
    drain.await.context("Sink drain task failed")?;

    print!("{}", registry.render());
    Ok(())
}

#[cfg(feature = "webhook")]
fn retrain_trigger() -> Result<Arc<dyn RetrainTrigger>> {
    match std::env::var("RETRAIN_WEBHOOK_URL") {
        Ok(url) => {
            let mut trigger = monitor::WebhookRetrainTrigger::new(url)?;
            if let Ok(token) = std::env::var("RETRAIN_WEBHOOK_TOKEN") {
                trigger = trigger.with_token(token);
            }
            Ok(Arc::new(trigger))
        }
        Err(_) => Ok(Arc::new(monitor::LogRetrainTrigger)),
    }
}

#[cfg(not(feature = "webhook"))]
fn retrain_trigger() -> Result<Arc<dyn RetrainTrigger>> {
    Ok(Arc::new(monitor::LogRetrainTrigger))
}

fn read_readings(path: &Path) -> Result<Vec<Reading>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(JsonlSource::new(path, usize::MAX).parse_lines(&text))
}

async fn check(config: &MonitorConfig, reference: &Path, current: &Path, raw: bool) -> Result<()> {
    let (reference, current) = (read_readings(reference)?, read_readings(current)?);
    let wrap = |readings: Vec<Reading>| {
        if raw {
            QueryData::Rows(readings.iter().map(drift::TableRow::from).collect())
        } else {
            QueryData::Readings(readings)
        }
    };
    let query = DriftQuery {
        current: wrap(current),
        ..Default::default()
    }
    .against(wrap(reference));

    let service = DriftService::new(config, monitor::SharedState::new(monitor::MonitorState::new(1)))?;
    let report = service.calculate(query).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn export_csv(snapshot: &Path, output: Option<&Path>) -> Result<()> {
    let bytes = std::fs::read(snapshot)
        .with_context(|| format!("Failed to read {}", snapshot.display()))?;
    let snapshot = snapshot_format::Snapshot::from_bytes(&bytes)?;

    match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            snapshot_format::write_csv(&snapshot.table, file)?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            snapshot_format::write_csv(&snapshot.table, &mut lock)?;
            lock.flush()?;
        }
    }
    Ok(())
}
