mod console;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use pulsebot_cron::{CronService, CronServiceSettings, RunLogOptions};
use pulsebot_types::WakeMode;

#[derive(Parser)]
#[command(name = "pulsebot", about = "Pulsebot cron scheduler CLI")]
struct Cli {
    /// Cron store directory (overrides config)
    #[arg(long, global = true)]
    store_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show scheduler status
    Status,
    /// List jobs
    List {
        /// Include disabled jobs
        #[arg(long)]
        all: bool,
    },
    /// Add a job
    Add {
        /// Full job definition as JSON (flags below are ignored if set)
        #[arg(long)]
        json: Option<String>,

        /// Job name
        #[arg(long)]
        name: Option<String>,

        /// Optional description
        #[arg(long)]
        description: Option<String>,

        /// One-shot: ISO-8601 timestamp
        #[arg(long)]
        at: Option<String>,

        /// Fixed interval in milliseconds (min 10000)
        #[arg(long)]
        every_ms: Option<i64>,

        /// Cron expression (e.g. "0 9 * * *")
        #[arg(long)]
        cron: Option<String>,

        /// IANA timezone for --cron
        #[arg(long)]
        tz: Option<String>,

        /// System event text (main-session job)
        #[arg(long)]
        text: Option<String>,

        /// Agent turn prompt (isolated-session job)
        #[arg(long)]
        message: Option<String>,

        /// Announce the job's output to a channel
        #[arg(long)]
        announce: bool,

        /// Channel to announce to (defaults to "last")
        #[arg(long)]
        channel: Option<String>,

        /// Recipient on the channel
        #[arg(long)]
        to: Option<String>,

        /// Tolerate delivery failures
        #[arg(long)]
        best_effort: bool,

        /// Agent to run isolated turns on
        #[arg(long)]
        agent_id: Option<String>,

        /// Wake mode: "now" or "next-heartbeat"
        #[arg(long)]
        wake_mode: Option<String>,

        /// Create the job disabled
        #[arg(long)]
        disabled: bool,

        /// Keep or delete the job after a successful run
        #[arg(long)]
        delete_after_run: Option<bool>,
    },
    /// Patch a job
    Update {
        id: String,

        /// Patch as JSON, e.g. '{"enabled": false}'
        #[arg(long)]
        patch: String,
    },
    /// Remove a job
    Remove { id: String },
    /// Force-run a job now, regardless of its schedule
    Run { id: String },
    /// Show a job's run history, most recent first
    Runs {
        id: String,

        #[arg(long)]
        limit: Option<usize>,
    },
    /// Emit a system event
    Wake {
        text: String,

        /// "now" or "next-heartbeat"
        #[arg(long, default_value = "now")]
        mode: String,
    },
    /// Preview upcoming runs
    Project {
        /// Horizon in days
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Run the scheduler loop in the foreground
    Serve,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = pulsebot_config::load_config().unwrap_or_default();

    let store_dir = match &cli.store_dir {
        Some(dir) => PathBuf::from(dir),
        None => pulsebot_config::cron_store_dir(&config)?,
    };
    let mut settings = CronServiceSettings::new(&store_dir);
    settings.poll_ceiling_ms = config.cron.poll_ceiling_ms;
    settings.run_log = RunLogOptions {
        max_bytes: config.cron.max_log_bytes,
        keep_lines: config.cron.keep_log_lines,
    };
    settings.known_channels = config.cron.known_channels.clone();

    let service = Arc::new(CronService::load(
        settings,
        Arc::new(console::ConsoleExecutor),
    ));

    match cli.command {
        Commands::Status => {
            let status = service.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::List { all } => {
            let jobs = service.list_jobs(all).await;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Commands::Add {
            json,
            name,
            description,
            at,
            every_ms,
            cron,
            tz,
            text,
            message,
            announce,
            channel,
            to,
            best_effort,
            agent_id,
            wake_mode,
            disabled,
            delete_after_run,
        } => {
            let spec = match json {
                Some(raw) => serde_json::from_str(&raw)?,
                None => build_job_spec(JobFlags {
                    name,
                    description,
                    at,
                    every_ms,
                    cron,
                    tz,
                    text,
                    message,
                    announce,
                    channel,
                    to,
                    best_effort,
                    agent_id,
                    wake_mode,
                    disabled,
                    delete_after_run,
                })?,
            };
            let job = service.create_job(&spec).await?;
            println!("Created job \"{}\" ({})", job.name, job.id);
            if let Some(next) = job.state.next_run_at_ms {
                println!("Next run at {next} ms");
            }
        }
        Commands::Update { id, patch } => {
            let patch: Value = serde_json::from_str(&patch)?;
            let job = service.apply_job_patch(&id, &patch).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Remove { id } => {
            service.remove_job(&id).await?;
            println!("Removed job {id}");
        }
        Commands::Run { id } => {
            let entry = service.run_job(&id).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Commands::Runs { id, limit } => {
            let entries = service.runs(&id, limit).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Wake { text, mode } => {
            service.wake(parse_wake_mode(&mode)?, text).await?;
        }
        Commands::Project { days } => {
            let runs = service.project(days).await;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        Commands::Serve => {
            if !config.cron.enabled {
                anyhow::bail!("cron is disabled in config");
            }
            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                    ctrl_c_cancel.cancel();
                }
            });
            service.run_loop(cancel).await;
        }
    }

    Ok(())
}

fn parse_wake_mode(raw: &str) -> anyhow::Result<WakeMode> {
    match raw {
        "now" => Ok(WakeMode::Now),
        "next-heartbeat" => Ok(WakeMode::NextHeartbeat),
        other => anyhow::bail!("unknown wake mode: {other} (use \"now\" or \"next-heartbeat\")"),
    }
}

struct JobFlags {
    name: Option<String>,
    description: Option<String>,
    at: Option<String>,
    every_ms: Option<i64>,
    cron: Option<String>,
    tz: Option<String>,
    text: Option<String>,
    message: Option<String>,
    announce: bool,
    channel: Option<String>,
    to: Option<String>,
    best_effort: bool,
    agent_id: Option<String>,
    wake_mode: Option<String>,
    disabled: bool,
    delete_after_run: Option<bool>,
}

/// Assemble a job definition from flags. Field-level validation happens in
/// the scheduler; this only shapes the JSON.
fn build_job_spec(flags: JobFlags) -> anyhow::Result<Value> {
    let name = flags
        .name
        .ok_or_else(|| anyhow::anyhow!("--name is required (or pass --json)"))?;

    let schedule = match (&flags.at, flags.every_ms, &flags.cron) {
        (Some(at), None, None) => json!({"kind": "at", "at": at}),
        (None, Some(every_ms), None) => json!({"kind": "every", "everyMs": every_ms}),
        (None, None, Some(expr)) => match &flags.tz {
            Some(tz) => json!({"kind": "cron", "expr": expr, "tz": tz}),
            None => json!({"kind": "cron", "expr": expr}),
        },
        _ => anyhow::bail!("exactly one of --at, --every-ms, --cron is required"),
    };

    let payload = match (&flags.text, &flags.message) {
        (Some(text), None) => json!({"kind": "systemEvent", "text": text}),
        (None, Some(message)) => json!({"kind": "agentTurn", "message": message}),
        _ => anyhow::bail!("exactly one of --text, --message is required"),
    };
    let isolated = flags.message.is_some();

    let mut spec = json!({
        "name": name,
        "schedule": schedule,
        "payload": payload,
        "enabled": !flags.disabled,
    });
    let obj = spec.as_object_mut().expect("spec is an object");

    if let Some(description) = flags.description {
        obj.insert("description".into(), json!(description));
    }
    if let Some(agent_id) = flags.agent_id {
        obj.insert("agentId".into(), json!(agent_id));
    }
    if let Some(wake_mode) = flags.wake_mode {
        parse_wake_mode(&wake_mode)?;
        obj.insert("wakeMode".into(), json!(wake_mode));
    }
    if let Some(delete_after_run) = flags.delete_after_run {
        obj.insert("deleteAfterRun".into(), json!(delete_after_run));
    }

    if isolated && (flags.announce || flags.channel.is_some() || flags.to.is_some()) {
        let mut delivery = serde_json::Map::new();
        delivery.insert(
            "mode".into(),
            json!(if flags.announce { "announce" } else { "none" }),
        );
        if let Some(channel) = flags.channel {
            delivery.insert("channel".into(), json!(channel));
        }
        if let Some(to) = flags.to {
            delivery.insert("to".into(), json!(to));
        }
        if flags.best_effort {
            delivery.insert("bestEffort".into(), json!(true));
        }
        obj.insert("delivery".into(), Value::Object(delivery));
    }

    Ok(spec)
}
