//! hubsync CLI: runs the hub and inspects its job queue.

use clap::{Parser, Subcommand};
use hubsync::config::Config;
use hubsync::hub::Hub;
use hubsync::journal::JournalKind;
use hubsync::model::job::{JobId, JobState};
use hubsync::server::{self, AppState};
use hubsync::telemetry::{TelemetryConfig, init_telemetry};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "hubsync", about = "Webhook to chat synchronization hub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server and the job dispatcher
    Serve,
    /// Job queue operations
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs, newest first
    List {
        /// Filter by state (queued, executing, finished, failed, cancelled)
        #[arg(long)]
        state: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Cancel a job that has not started
    Cancel {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Print journal entries after a sequence number
    Journal {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Jobs { action } => {
            let config = Config::from_env()?;
            let hub = Hub::from_config(&config).await?;
            match action {
                JobsAction::List { state, limit } => cmd_jobs_list(&hub, state, limit).await,
                JobsAction::Show { id } => cmd_jobs_show(&hub, id).await,
                JobsAction::Cancel { id } => cmd_jobs_cancel(&hub, id).await,
                JobsAction::Journal { since } => cmd_jobs_journal(&hub, since).await,
            }
        }
    }
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    let hub = Hub::from_config(&config).await?;
    hub.queue().recover().await?;

    let queue = hub.queue().clone();
    let dispatcher = tokio::spawn(async move { queue.run().await });

    let listener = TcpListener::bind(&config.listen_addr).await?;
    let queue = hub.queue().clone();
    server::serve(listener, AppState::new(hub.engine().clone()), async move {
        tokio::signal::ctrl_c().await.ok();
        queue.shutdown();
    })
    .await?;

    dispatcher.await??;
    Ok(())
}

async fn cmd_jobs_list(hub: &Hub, state: Option<String>, limit: usize) -> anyhow::Result<()> {
    let state_filter: Option<JobState> = match state {
        Some(s) => Some(s.parse().map_err(|_| anyhow::anyhow!("invalid state: {s}"))?),
        None => None,
    };

    let jobs = hub.queue().list(state_filter, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<18}  {:<10}  {:<8}  {:<16}  ERROR",
        "ID", "HANDLER", "STATE", "ATTEMPTS", "RUN AT"
    );
    println!("{}", "-".repeat(100));
    for job in &jobs {
        let short_id = &job.id.to_string()[..8];
        let error = job.last_error.as_deref().unwrap_or("-");
        let error: String = error.chars().take(40).collect();
        println!(
            "{:<8}  {:<18}  {:<10}  {:<8}  {:<16}  {}",
            short_id,
            job.handler,
            job.state,
            format!("{}/{}", job.attempts, job.max_attempts),
            job.run_at.format("%Y-%m-%d %H:%M"),
            error
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

/// Full UUID, or a prefix matching exactly one recent job.
async fn resolve_id(hub: &Hub, id_str: &str) -> anyhow::Result<JobId> {
    if id_str.len() >= 36 {
        return Ok(id_str.parse()?);
    }
    let jobs = hub.queue().list(None, 500).await?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(id_str))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no job matching prefix '{id_str}'"),
        [job] => Ok(job.id),
        many => anyhow::bail!("{} jobs match prefix '{id_str}', be more specific", many.len()),
    }
}

async fn cmd_jobs_show(hub: &Hub, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(hub, &id_str).await?;
    let job = hub.queue().get(id).await?;

    println!("ID:         {}", job.id);
    println!("Handler:    {}", job.handler);
    println!("Pool:       {}", job.pool);
    println!("State:      {}", job.state);
    println!("Attempts:   {}/{}", job.attempts, job.max_attempts);
    println!("Run At:     {}", job.run_at);
    println!("Inline:     {}", job.inline);
    println!("Args:       {}", serde_json::to_string_pretty(&job.args)?);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(finished) = job.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(ref err) = job.last_error {
        println!("Last Error: {err}");
    }
    if let Some(ref result) = job.result {
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}

async fn cmd_jobs_cancel(hub: &Hub, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(hub, &id_str).await?;
    let job = hub.queue().cancel(id).await?;
    println!("Cancelled: {} ({})", job.id, job.handler);
    Ok(())
}

async fn cmd_jobs_journal(hub: &Hub, since: u64) -> anyhow::Result<()> {
    for entry in hub.queue().journal_since(since).await? {
        let kind = match &entry.kind {
            JournalKind::Unknown { raw } => format!("unknown: {raw}"),
            kind => serde_json::to_string(kind)?,
        };
        println!("{:>6}  {}  {kind}", entry.seq, entry.timestamp.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}
