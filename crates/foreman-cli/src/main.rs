//! foreman CLI - durable local job queue supervised by systemd.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use foreman_core::{
    QueueStore, ResourceLimits, RetryPolicy, SchedulingPolicy, SqliteQueue, Supervisor,
    SystemdSupervisor, TaskId, TaskRecord, TaskSpec, TaskStatus, WorkerConfig, WorkerGroup,
};

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Durable local job queue supervised by systemd", long_about = None)]
struct Cli {
    /// Path to the queue database.
    #[arg(long, global = true, default_value = "foreman.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a command; prints the assigned task ID
    Enqueue {
        /// Command and arguments to execute
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,

        /// Higher runs first among eligible tasks
        #[arg(long, default_value_t = 0)]
        priority: i64,

        /// Delay first eligibility by SECONDS
        #[arg(long)]
        delay: Option<u64>,

        /// Task IDs that must reach done first (comma-separated)
        #[arg(long, value_delimiter = ',')]
        depends: Vec<TaskId>,

        /// Total execution budget, including the first attempt
        #[arg(long, default_value_t = TaskSpec::DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,

        /// De-duplication key; rejected while another live task holds it
        #[arg(long)]
        key: Option<String>,

        /// Working directory for the unit
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// KEY=VALUE environment entries for the unit (repeatable)
        #[arg(long = "env")]
        env: Vec<String>,

        /// Nice value for the unit
        #[arg(long)]
        nice: Option<i32>,

        /// Relative CPU weight (1..=10000)
        #[arg(long)]
        cpu_weight: Option<u32>,

        /// CPU ceiling in percent of one core
        #[arg(long)]
        cpu_quota: Option<u32>,

        /// Memory ceiling, e.g. 512M
        #[arg(long)]
        memory_max: Option<String>,

        /// Real-time scheduling priority (1..=99)
        #[arg(long)]
        rt_priority: Option<u32>,

        /// Real-time scheduling class: fifo or rr
        #[arg(long, default_value = "fifo")]
        rt_policy: String,

        /// Hard per-task timeout enforced by the supervisor, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Run worker loops until terminated by SIGINT/SIGTERM
    Worker {
        /// Number of tasks to run concurrently
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Lease duration in seconds; must exceed worst-case task runtime
        #[arg(long, default_value_t = 600)]
        lease_timeout: u64,

        /// Seconds between supervisor state queries
        #[arg(long, default_value_t = 1)]
        poll_interval: u64,

        /// Use the system service manager instead of the per-user one
        #[arg(long)]
        system: bool,
    },

    /// Show one task, or aggregate counts when no ID is given
    Status {
        id: Option<TaskId>,

        #[arg(long)]
        json: bool,
    },

    /// List recent tasks
    List {
        /// Filter by status: queued, running, done, failed
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: u32,

        #[arg(long)]
        json: bool,
    },

    /// Request a graceful supervisor-level stop of a running task's unit
    Stop {
        id: TaskId,

        /// Use the system service manager instead of the per-user one
        #[arg(long)]
        system: bool,
    },

    /// Add dependency edges to a queued task
    Depend {
        id: TaskId,

        /// Task IDs this task must wait for (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        on: Vec<TaskId>,
    },

    /// Delete done/failed tasks older than the retention window
    Prune {
        /// Retention window in seconds
        #[arg(long, default_value_t = 7 * 24 * 3600)]
        older_than: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let queue = Arc::new(
        SqliteQueue::open(&cli.db, RetryPolicy::default())
            .await
            .with_context(|| format!("opening queue database {}", cli.db.display()))?,
    );

    match cli.command {
        Commands::Enqueue {
            command,
            priority,
            delay,
            depends,
            max_attempts,
            key,
            workdir,
            env,
            nice,
            cpu_weight,
            cpu_quota,
            memory_max,
            rt_priority,
            rt_policy,
            timeout,
        } => {
            let scheduling = match rt_priority {
                Some(p) => Some((parse_rt_policy(&rt_policy)?, p)),
                None => None,
            };
            let limits = ResourceLimits {
                nice,
                cpu_weight,
                cpu_quota_pct: cpu_quota,
                memory_max,
                scheduling,
                runtime_max: timeout.map(Duration::from_secs),
            };

            let mut spec = TaskSpec::new(command)
                .with_priority(priority)
                .with_dependencies(depends)
                .with_max_attempts(max_attempts)
                .with_limits(limits);
            if let Some(secs) = delay {
                spec = spec.with_delay(Duration::from_secs(secs));
            }
            if let Some(key) = key {
                spec = spec.with_unique_key(key);
            }
            if let Some(dir) = workdir {
                spec = spec.with_working_dir(dir);
            }
            for entry in env {
                let Some((k, v)) = entry.split_once('=') else {
                    bail!("invalid --env entry {entry:?}, expected KEY=VALUE");
                };
                spec = spec.with_env(k, v);
            }

            let id = queue.enqueue(spec).await?;
            println!("{id}");
        }

        Commands::Worker {
            concurrency,
            lease_timeout,
            poll_interval,
            system,
        } => {
            let supervisor: Arc<dyn Supervisor> = if system {
                Arc::new(SystemdSupervisor::system())
            } else {
                Arc::new(SystemdSupervisor::new())
            };
            let config = WorkerConfig::default()
                .with_concurrency(concurrency)
                .with_lease_timeout(Duration::from_secs(lease_timeout))
                .with_poll_interval(Duration::from_secs(poll_interval));

            info!(concurrency, "starting workers");
            let group = WorkerGroup::start(queue.clone(), supervisor, config).await?;

            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }

            group.shutdown_and_join().await;
            info!("clean shutdown");
        }

        Commands::Status { id: Some(id), json } => {
            let Some(record) = queue.get(id).await? else {
                bail!("task {id} not found");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }

        Commands::Status { id: None, json } => {
            let counts = queue.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                println!(
                    "queued {} | running {} | done {} | failed {} | total {}",
                    counts.queued,
                    counts.running,
                    counts.done,
                    counts.failed,
                    counts.total(),
                );
            }
        }

        Commands::List { status, limit, json } => {
            let status = status
                .map(|s| {
                    TaskStatus::parse(&s)
                        .ok_or_else(|| anyhow::anyhow!("unknown status {s:?}"))
                })
                .transpose()?;
            let tasks = queue.list(status, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                println!("Tasks ({})", tasks.len());
                for task in tasks {
                    println!(
                        "  {} | {} | {} | {}",
                        task.id,
                        task.status.as_str(),
                        task.priority,
                        task.command.join(" "),
                    );
                }
            }
        }

        Commands::Stop { id, system } => {
            let Some(record) = queue.get(id).await? else {
                bail!("task {id} not found");
            };
            if record.status != TaskStatus::Running {
                bail!("task {id} is {}, not running", record.status.as_str());
            }
            let Some(unit) = &record.unit_name else {
                bail!("task {id} has no supervised unit recorded yet");
            };

            let supervisor = if system {
                SystemdSupervisor::system()
            } else {
                SystemdSupervisor::new()
            };
            supervisor.stop(unit).await?;
            println!("stop requested for unit {unit}");
        }

        Commands::Depend { id, on } => {
            for dep in on {
                queue.add_dependency(id, dep).await?;
                println!("{id} now depends on {dep}");
            }
        }

        Commands::Prune { older_than } => {
            let pruned = queue.prune(Duration::from_secs(older_than)).await?;
            println!("pruned {pruned} tasks");
        }
    }

    Ok(())
}

fn parse_rt_policy(s: &str) -> Result<SchedulingPolicy> {
    match s {
        "fifo" => Ok(SchedulingPolicy::Fifo),
        "rr" => Ok(SchedulingPolicy::RoundRobin),
        other => bail!("unknown real-time policy {other:?}, expected fifo or rr"),
    }
}

fn print_record(record: &TaskRecord) {
    println!("Task: {}", record.id);
    println!("  Command: {}", record.command.join(" "));
    println!("  Status: {}", record.status.as_str());
    println!("  Priority: {}", record.priority);
    println!("  Attempts: {}/{}", record.attempts, record.max_attempts);
    println!("  Scheduled: {}", record.scheduled_at);
    if !record.dependencies.is_empty() {
        let deps: Vec<String> = record.dependencies.iter().map(|d| d.to_string()).collect();
        println!("  Depends on: {}", deps.join(", "));
    }
    if let Some(key) = &record.unique_key {
        println!("  Key: {key}");
    }
    if let (Some(owner), Some(expires)) = (&record.lease_owner, record.lease_expires_at) {
        println!("  Lease: {owner} until {expires}");
    }
    if let Some(unit) = &record.unit_name {
        println!("  Unit: {unit}");
    }
    if let Some(code) = record.exit_code {
        println!("  Exit code: {code}");
    }
    if let Some(error) = &record.last_error {
        println!("  Last error: {error}");
    }
    println!("  Created: {}", record.created_at);
}
