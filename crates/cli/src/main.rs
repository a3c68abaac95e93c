//! Operator tool for the bulk-operation runner.
//!
//! Runs a delimited-file import in-process and streams its progress events as
//! JSON lines, or inspects jobs in a shared Postgres record store.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use bulkops_core::{ActorId, JobId};
use bulkops_events::Subscription;
use bulkops_infra::config::Settings;
use bulkops_infra::ephemeral::{EphemeralStore, InMemoryEphemeralStore};
use bulkops_infra::jobs::{
    ChunkError, CompensatingAction, Compensation, CompensationError, CsvImportJob, ImportSink,
    InMemoryJobRecordStore, JobConfiguration, JobEvent, JobInput, JobRecordStore, JobRunner,
    NotificationBroadcaster, PostgresJobRecordStore, QueueDiagnostics, SubmitRequest,
    CSV_IMPORT_KIND,
};
use bulkops_infra::rate_limit::RateLimiter;

#[derive(Parser, Debug)]
#[command(name = "bulkops")]
#[command(about = "Run and inspect bulk-operation jobs")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a delimited file, writing accepted rows as JSON lines
    Import {
        /// File to import; must resolve inside BULKOPS_IMPORT_ROOT
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Where accepted rows are appended
        #[arg(long, value_name = "OUT", default_value = "imported.jsonl")]
        out: PathBuf,

        #[arg(long)]
        batch_size: Option<u64>,

        /// Header the file must carry (repeatable)
        #[arg(long = "require-header", value_name = "NAME")]
        required_headers: Vec<String>,

        /// Caller-chosen job id
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Show a job record and its latest progress rows
    Status {
        job_id: String,
        #[arg(long, default_value_t = 20)]
        logs: usize,
    },
    /// Report error-rate and stale-queue heuristics
    Diagnose,
    /// Park jobs left running by a crashed process and requeue pending ones
    Recover,
}

/// Appends rows to a JSON-lines file. Appends are not reversible.
struct JsonLinesSink {
    file: Mutex<std::fs::File>,
}

impl JsonLinesSink {
    fn create(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl ImportSink for JsonLinesSink {
    async fn apply(&self, rows: &[JsonValue]) -> Result<Vec<Compensation>, ChunkError> {
        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row).map_err(|e| ChunkError::fatal(e.to_string()))?;
            buf.push(b'\n');
        }
        let mut file = self.file.lock().unwrap();
        file.write_all(&buf)?;
        file.flush()?;
        Ok(Vec::new())
    }

    async fn compensate(&self, _action: &CompensatingAction) -> Result<(), CompensationError> {
        Err(CompensationError::new("json-lines output cannot be rolled back"))
    }

    fn supports_rollback(&self) -> bool {
        false
    }
}

async fn record_store(settings: &Settings) -> Result<Arc<dyn JobRecordStore>> {
    match &settings.database_url {
        Some(url) => {
            let store = PostgresJobRecordStore::connect(url).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; job records live only as long as this process");
            Ok(InMemoryJobRecordStore::arc())
        }
    }
}

fn ephemeral_store(settings: &Settings) -> Result<Arc<dyn EphemeralStore>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &settings.redis_url {
        let store = bulkops_infra::ephemeral::RedisEphemeralStore::new(url, "bulkops:")?;
        return Ok(Arc::new(store));
    }
    let _ = settings;
    Ok(InMemoryEphemeralStore::arc())
}

fn broadcaster(settings: &Settings) -> Result<(NotificationBroadcaster, Subscription<JobEvent>)> {
    #[cfg(feature = "redis")]
    if let Some(url) = &settings.redis_url {
        use bulkops_events::EventBus;
        let bus = bulkops_infra::jobs::broadcast::RedisPubSubBroadcastBus::new(url, settings.channel.clone())?;
        let subscription = bus.subscribe();
        return Ok((NotificationBroadcaster::new(settings.channel.clone(), Arc::new(bus)), subscription));
    }
    let (broadcaster, bus) = NotificationBroadcaster::in_memory(settings.channel.clone());
    let subscription = bulkops_infra::jobs::broadcast::subscribe(&bus);
    Ok((broadcaster, subscription))
}

async fn import(
    settings: Settings,
    file: PathBuf,
    out: PathBuf,
    batch_size: Option<u64>,
    required_headers: Vec<String>,
    job_id: Option<String>,
) -> Result<()> {
    let store = record_store(&settings).await?;
    let (broadcaster, subscription) = broadcaster(&settings)?;

    let headers: Vec<&str> = required_headers.iter().map(String::as_str).collect();
    let job = CsvImportJob::new(settings.import.clone(), Arc::new(JsonLinesSink::create(&out)?))
        .with_required_headers(&headers);

    let runner = JobRunner::builder(store, ephemeral_store(&settings)?)
        .settings(settings.runner.clone())
        .progress(settings.progress.clone())
        .broadcaster(broadcaster)
        .rate_limiter(Arc::new(RateLimiter::new(settings.rate_limit.clone())))
        .register(Arc::new(job))
        .build();

    let mut configuration = JobConfiguration::new();
    if let Some(n) = batch_size {
        configuration.set("batch_size", n);
    }
    let mut request = SubmitRequest::new(CSV_IMPORT_KIND, JobInput::File { path: file }, ActorId::new())
        .with_configuration(configuration);
    if let Some(id) = job_id {
        request = request.with_job_id(JobId::from_version(id)?);
    }

    let id = runner.submit(request).await?;
    info!(job_id = %id, out = %out.display(), "import submitted");

    let printer = tokio::task::spawn_blocking(move || {
        while let Ok(event) = subscription.recv() {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
            if event.is_terminal() {
                break;
            }
        }
    });

    tokio::select! {
        _ = runner.wait(&id) => {}
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %id, "interrupted; pausing at the next chunk boundary");
            runner.shutdown().await;
        }
    }
    let _ = printer.await;

    let query = runner.query(&id, Some(0)).await?;
    let record = query.record;
    info!(
        job_id = %id,
        status = %record.status,
        processed = record.processed_records,
        invalid = record.invalid_items.len(),
        "import finished"
    );
    for item in &record.invalid_items {
        warn!(position = item.position, reason = %item.reason, "invalid row");
    }
    if let Some(err) = record.error_message {
        bail!("job {id} ended {}: {err}", record.status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_env()?;
    bulkops_observability::init_with(settings.log_format);

    match args.command {
        Command::Import {
            file,
            out,
            batch_size,
            required_headers,
            job_id,
        } => import(settings, file, out, batch_size, required_headers, job_id).await,
        Command::Status { job_id, logs } => {
            if settings.database_url.is_none() {
                bail!("status needs DATABASE_URL pointing at the shared record store");
            }
            let store = record_store(&settings).await?;
            let runner = JobRunner::builder(store, ephemeral_store(&settings)?).build();
            let query = runner.query(&JobId::from_version(job_id)?, Some(logs)).await?;
            println!("{}", serde_json::to_string_pretty(&query)?);
            Ok(())
        }
        Command::Diagnose => {
            let store = record_store(&settings).await?;
            let report = QueueDiagnostics::new(settings.diagnostics.clone())
                .evaluate(store.as_ref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Recover => {
            if settings.database_url.is_none() {
                bail!("recover needs DATABASE_URL pointing at the shared record store");
            }
            let store = record_store(&settings).await?;
            let runner = JobRunner::builder(store, ephemeral_store(&settings)?)
                .settings(settings.runner.clone())
                .build();
            let report = runner.recover_interrupted().await?;
            info!(paused = report.paused.len(), requeued = report.requeued.len(), "recovery done");
            for id in &report.paused {
                println!("paused {id}");
            }
            Ok(())
        }
    }
}
