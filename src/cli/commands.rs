//! CLI command definitions for birthday-courier.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::delivery::HttpDeliveryClient;
use crate::geo::{GoogleMapsResolver, TimeZoneId};
use crate::metrics::{export_metrics, MetricsCollector};
use crate::notify::NotificationProcessor;
use crate::people::{NewPersonRequest, PersonService};
use crate::scheduler::{
    BirthdayScheduler, DelayedTaskQueue, Reconciler, RedisDelayedQueue, Scheduled, WorkerPool,
    WorkerPoolConfig,
};
use crate::storage::{PersonStore, PgPersonStore};
use crate::timing::{next_delivery_instant, DEFAULT_DELIVERY_HOUR};

/// Default Redis URL when neither `--redis-url` nor `REDIS_URL` is set.
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default queue name.
const DEFAULT_QUEUE_NAME: &str = "birthdayQueue";

/// Birthday notification scheduler and delivery worker.
#[derive(Parser)]
#[command(name = "birthday-courier")]
#[command(about = "Schedule and deliver birthday messages at 9am local time")]
#[command(version)]
#[command(
    long_about = "birthday-courier registers people, schedules a birthday message for 09:00 in each person's local time zone, and runs the workers that deliver them.\n\nConfiguration is read from the environment (DATABASE_URL, REDIS_URL, GOOGLE_MAPS_API_KEY, DELIVERY_ENDPOINT, ...).\n\nExample usage:\n  birthday-courier migrate\n  birthday-courier register --email ada@example.com --first-name Ada --last-name Lovelace --date-of-birth 1990-06-15 --city \"Los Angeles\" --country USA\n  birthday-courier worker"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create or upgrade the person tables.
    Migrate,

    /// Register a person and schedule their next birthday message.
    #[command(alias = "add")]
    Register(RegisterArgs),

    /// Delete a person. A message already queued for them will be skipped.
    #[command(alias = "rm")]
    Remove(RemoveArgs),

    /// Schedule the next birthday message of an existing person.
    Schedule(ScheduleArgs),

    /// Re-schedule every stored person (safe to repeat).
    Reconcile(ReconcileArgs),

    /// Run delivery workers until interrupted.
    Worker(WorkerArgs),

    /// Show queue depth and dead-lettered jobs.
    QueueStats(QueueStatsArgs),

    /// Preview the next delivery instant without touching any service.
    NextDelivery(NextDeliveryArgs),
}

/// Arguments for `birthday-courier register`.
#[derive(Parser, Debug)]
pub struct RegisterArgs {
    #[arg(long)]
    pub email: String,

    #[arg(long)]
    pub first_name: String,

    #[arg(long)]
    pub last_name: String,

    /// Date of birth (YYYY-MM-DD).
    #[arg(long)]
    pub date_of_birth: NaiveDate,

    #[arg(long)]
    pub city: String,

    #[arg(long)]
    pub country: String,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `birthday-courier remove`.
#[derive(Parser, Debug)]
pub struct RemoveArgs {
    /// Person id.
    pub id: i64,
}

/// Arguments for `birthday-courier schedule`.
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// Person id.
    pub id: i64,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `birthday-courier reconcile`.
#[derive(Parser, Debug)]
pub struct ReconcileArgs {
    /// Number of people scheduled concurrently.
    #[arg(long, default_value = "8")]
    pub concurrency: usize,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `birthday-courier worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Override the number of workers (WORKER_COUNT).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Process every job that is due now, then exit.
    #[arg(long)]
    pub once: bool,
}

/// Arguments for `birthday-courier queue-stats`.
#[derive(Parser, Debug)]
pub struct QueueStatsArgs {
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    #[arg(long, env = "BIRTHDAY_QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
    pub queue_name: String,

    /// Number of dead-lettered jobs to list.
    #[arg(long, default_value = "0")]
    pub dead_letters: usize,

    /// Print the Prometheus exposition text instead of a summary.
    #[arg(long, conflicts_with = "json")]
    pub prometheus: bool,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `birthday-courier next-delivery`.
#[derive(Parser, Debug)]
pub struct NextDeliveryArgs {
    /// Date of birth (YYYY-MM-DD).
    #[arg(long)]
    pub date_of_birth: NaiveDate,

    /// IANA zone identifier, e.g. America/Los_Angeles.
    #[arg(long)]
    pub time_zone: String,

    /// Reference instant (RFC 3339). Defaults to now.
    #[arg(long)]
    pub now: Option<DateTime<Utc>>,

    /// Local delivery hour.
    #[arg(long, default_value_t = DEFAULT_DELIVERY_HOUR)]
    pub hour: u32,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Migrate => run_migrate_command().await,
        Commands::Register(args) => run_register_command(args).await,
        Commands::Remove(args) => run_remove_command(args).await,
        Commands::Schedule(args) => run_schedule_command(args).await,
        Commands::Reconcile(args) => run_reconcile_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::QueueStats(args) => run_queue_stats_command(args).await,
        Commands::NextDelivery(args) => run_next_delivery_command(args),
    }
}

// ============================================================================
// Service wiring
// ============================================================================

/// Connected backends shared by the commands.
struct Services {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    store: Arc<PgPersonStore>,
    queue: Arc<RedisDelayedQueue>,
    scheduler: Arc<BirthdayScheduler>,
}

impl Services {
    async fn connect() -> anyhow::Result<Self> {
        let config = AppConfig::from_env().context("Failed to load configuration")?;

        let store = PgPersonStore::connect(&config.database_url)
            .await
            .context("Failed to connect to the person database")?;

        let queue = RedisDelayedQueue::connect(
            &config.queue.redis_url,
            &config.queue.queue_name,
            config.queue.visibility_timeout,
        )
        .await
        .context("Failed to connect to the delayed queue")?;
        let queue = Arc::new(queue);

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let scheduler = BirthdayScheduler::new(queue.clone(), clock.clone())
            .with_delivery_hour(config.notify.delivery_hour)
            .with_max_attempts(config.queue.max_attempts);

        info!(
            queue = %config.queue.queue_name,
            delivery_hour = config.notify.delivery_hour,
            "Services connected"
        );

        Ok(Self {
            config,
            clock,
            store: Arc::new(store),
            queue,
            scheduler: Arc::new(scheduler),
        })
    }

    fn person_service(&self) -> PersonService {
        let resolver = GoogleMapsResolver::new(self.config.resolver.clone());
        PersonService::new(
            Arc::new(resolver),
            self.store.clone(),
            self.scheduler.clone(),
            self.clock.clone(),
        )
    }

    fn processor(&self) -> NotificationProcessor {
        let client = HttpDeliveryClient::new(&self.config.delivery);
        NotificationProcessor::new(self.store.clone(), Arc::new(client), self.clock.clone())
            .with_subject(self.config.delivery.subject.clone())
            .with_dedup_window(self.config.notify.dedup_window)
            .with_claim_lease(self.config.notify.claim_lease)
    }
}

#[derive(Debug, Serialize)]
struct ScheduleOutput {
    status: &'static str,
    job_id: String,
    person_id: i64,
    not_before: DateTime<Utc>,
    local_date: NaiveDate,
}

impl From<&Scheduled> for ScheduleOutput {
    fn from(scheduled: &Scheduled) -> Self {
        let delivery = scheduled.delivery();
        Self {
            status: if scheduled.is_new() {
                "enqueued"
            } else {
                "already_scheduled"
            },
            job_id: delivery.job_id.to_string(),
            person_id: delivery.person_id,
            not_before: delivery.not_before,
            local_date: delivery.local_date,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output: {}", e))?;
    println!("{json}");
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_migrate_command() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let store = PgPersonStore::connect(&config.database_url)
        .await
        .context("Failed to connect to the person database")?;

    let applied = store.run_migrations().await?;
    println!("Applied {} migration(s)", applied);
    Ok(())
}

async fn run_register_command(args: RegisterArgs) -> anyhow::Result<()> {
    let services = Services::connect().await?;
    let service = services.person_service();

    let registration = service
        .register(NewPersonRequest {
            email: args.email,
            first_name: args.first_name,
            last_name: args.last_name,
            date_of_birth: args.date_of_birth,
            city: args.city,
            country: args.country,
        })
        .await?;

    let person = &registration.person;
    if args.json {
        let scheduled = registration.scheduling.as_ref().ok().map(ScheduleOutput::from);
        let scheduling_error = registration.scheduling.as_ref().err().map(|e| e.to_string());
        print_json(&serde_json::json!({
            "person": person,
            "scheduled": scheduled,
            "scheduling_error": scheduling_error,
        }))?;
        return Ok(());
    }

    println!(
        "Registered {} (id {}) in {}",
        person.full_name(),
        person.id,
        person.time_zone
    );
    match &registration.scheduling {
        Ok(scheduled) => {
            let delivery = scheduled.delivery();
            println!(
                "Next message: {} ({} local date)",
                delivery.not_before, delivery.local_date
            );
        }
        Err(e) => {
            println!("Not scheduled yet: {}", e);
            println!("Run `birthday-courier reconcile` once the queue is reachable.");
        }
    }
    Ok(())
}

async fn run_remove_command(args: RemoveArgs) -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let store = PgPersonStore::connect(&config.database_url)
        .await
        .context("Failed to connect to the person database")?;

    if store.delete(args.id).await? {
        println!("Removed person {}", args.id);
    } else {
        anyhow::bail!("Person {} not found", args.id);
    }
    Ok(())
}

async fn run_schedule_command(args: ScheduleArgs) -> anyhow::Result<()> {
    let services = Services::connect().await?;

    let person = services
        .store
        .find_by_id(args.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Person {} not found", args.id))?;

    let scheduled = services.scheduler.schedule(&person).await?;
    let output = ScheduleOutput::from(&scheduled);

    if args.json {
        print_json(&output)?;
    } else {
        println!(
            "{}: person {} at {} (job {})",
            output.status, output.person_id, output.not_before, output.job_id
        );
    }
    Ok(())
}

async fn run_reconcile_command(args: ReconcileArgs) -> anyhow::Result<()> {
    let services = Services::connect().await?;

    let reconciler = Reconciler::new(services.store.clone(), services.scheduler.clone())
        .with_concurrency(args.concurrency);
    let report = reconciler.sweep().await?;

    if args.json {
        print_json(&serde_json::json!({
            "scanned": report.scanned,
            "enqueued": report.enqueued,
            "already_scheduled": report.already_scheduled,
            "failed": report.failed,
            "missing": report.missing,
        }))?;
    } else {
        println!(
            "Scanned {}: {} enqueued, {} already scheduled, {} failed, {} missing",
            report.scanned, report.enqueued, report.already_scheduled, report.failed, report.missing
        );
    }

    if report.failed > 0 {
        anyhow::bail!("{} person(s) could not be scheduled", report.failed);
    }
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let services = Services::connect().await?;
    let processor = Arc::new(services.processor());

    let mut pool_config = WorkerPoolConfig::from(&services.config.queue);
    if let Some(workers) = args.workers {
        pool_config.num_workers = workers.max(1);
    }

    let queue: Arc<dyn DelayedTaskQueue> = services.queue.clone();
    let mut pool = WorkerPool::new(pool_config, queue, processor, services.clock.clone());

    if args.once {
        let results = pool.drain_due().await?;
        for result in &results {
            println!(
                "{} person {} ({}){}",
                result.job_id,
                result.person_id,
                result.status,
                result
                    .detail
                    .as_deref()
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default()
            );
        }
        println!("Processed {} due job(s)", results.len());
        return Ok(());
    }

    pool.start().await?;
    info!(workers = pool.num_workers(), "Waiting for Ctrl-C");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Worker pool did not shut down cleanly");
    }

    let stats = pool.stats();
    info!(
        sent = stats.jobs_sent,
        skipped = stats.jobs_skipped,
        retried = stats.jobs_retried,
        dead_lettered = stats.jobs_dead_lettered,
        average_ms = stats.average_job_duration.as_millis() as u64,
        "Worker pool stopped"
    );
    Ok(())
}

async fn run_queue_stats_command(args: QueueStatsArgs) -> anyhow::Result<()> {
    // Visibility timeout is irrelevant for read-only access.
    let queue = RedisDelayedQueue::connect(&args.redis_url, &args.queue_name, Duration::from_secs(300))
        .await
        .context("Failed to connect to the delayed queue")?;

    let stats = queue.stats(Utc::now()).await?;
    let dead = if args.dead_letters > 0 {
        queue.dead_letters(args.dead_letters).await?
    } else {
        Vec::new()
    };

    if args.prometheus {
        MetricsCollector::new().update_queue_depth(&stats);
        print!("{}", export_metrics());
        return Ok(());
    }

    if args.json {
        print_json(&serde_json::json!({
            "queue": queue.queue_name(),
            "stats": stats,
            "dead_letters": dead,
        }))?;
        return Ok(());
    }

    println!("Queue: {}", queue.queue_name());
    println!("  pending:     {}", stats.pending);
    println!("  due:         {}", stats.due);
    println!("  processing:  {}", stats.processing);
    println!("  dead letter: {}", stats.dead_letter);

    for entry in &dead {
        println!(
            "  - {} person {} after {} attempt(s) at {}: {}",
            entry.job.id,
            entry.job.payload.person_id,
            entry.job.attempts,
            entry.moved_at,
            entry.error
        );
    }
    Ok(())
}

fn run_next_delivery_command(args: NextDeliveryArgs) -> anyhow::Result<()> {
    let zone = TimeZoneId::parse(&args.time_zone)?;
    let now = args.now.unwrap_or_else(Utc::now);

    let delivery = next_delivery_instant(args.date_of_birth, &zone, now, args.hour)?;

    println!(
        "{} ({} {:02}:00 {})",
        delivery.instant.to_rfc3339(),
        delivery.local_date,
        args.hour,
        zone
    );
    Ok(())
}
