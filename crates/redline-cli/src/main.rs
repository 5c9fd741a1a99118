mod display;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use redline_core::Decision;
use redline_sync::{
    FailurePolicy, JobClient, ReviewEvent, ReviewSession, SyncConfig, SyncState,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "redline", version, about = "Review proposed contract redlines")]
struct Cli {
    /// Analysis backend base URL
    #[arg(
        long,
        global = true,
        env = "REDLINE_BASE_URL",
        default_value = "http://localhost:8000"
    )]
    base_url: String,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "REDLINE_TIMEOUT_SECS", default_value_t = 10)]
    timeout_secs: u64,

    /// Delivery attempts per decision before it is reported failed
    #[arg(long, global = true, env = "REDLINE_SUBMIT_ATTEMPTS", default_value_t = 3)]
    submit_attempts: u32,

    /// What to do with a decision that exhausted its attempts (notify, verify)
    #[arg(
        long,
        global = true,
        env = "REDLINE_FAILURE_POLICY",
        default_value = "notify"
    )]
    failure_policy: FailurePolicy,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a job until its analysis settles, then summarise its redlines
    Watch {
        /// Job ID returned by the upload
        job_id: String,
    },

    /// Print redline cards for a settled job
    Show {
        job_id: String,

        /// Print only this redline
        #[arg(long)]
        id: Option<String>,

        /// Emit JSON instead of cards
        #[arg(long)]
        json: bool,
    },

    /// Accept or reject redlines, e.g. `redline decide job-1 r-1=accept r-2=reject`
    Decide {
        job_id: String,

        /// REDLINE_ID=accept|reject pairs
        #[arg(required = true, value_parser = parse_decision_pair)]
        decisions: Vec<(String, Decision)>,
    },

    /// Download the final document once every redline is decided
    Export {
        job_id: String,

        /// Output path for the final document
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn parse_decision_pair(s: &str) -> Result<(String, Decision), String> {
    let (id, decision) = s
        .split_once('=')
        .ok_or_else(|| format!("expected REDLINE_ID=DECISION, got {s:?}"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("missing redline id in {s:?}"));
    }
    let decision: Decision = decision.parse().map_err(|e| format!("{e}"))?;
    Ok((id.to_string(), decision))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Watch { job_id } => cmd_watch(&cli, job_id).await,
        Commands::Show { job_id, id, json } => cmd_show(&cli, job_id, id.as_deref(), *json).await,
        Commands::Decide { job_id, decisions } => cmd_decide(&cli, job_id, decisions).await,
        Commands::Export { job_id, out } => cmd_export(&cli, job_id, out).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn sync_config(cli: &Cli) -> SyncConfig {
    SyncConfig {
        request_timeout: Duration::from_secs(cli.timeout_secs.max(1)),
        submit_attempts: cli.submit_attempts.max(1),
        failure_policy: cli.failure_policy,
        ..Default::default()
    }
}

fn open_session(cli: &Cli, job_id: &str) -> ReviewSession {
    let client = JobClient::new(cli.base_url.clone());
    tracing::debug!(base_url = client.base_url(), job_id, "connecting");
    ReviewSession::open(Arc::new(client), job_id, sync_config(cli))
}

async fn settle(session: &ReviewSession) -> Result<()> {
    match session.wait_settled().await {
        SyncState::Settled => Ok(()),
        SyncState::Errored(msg) => bail!("job {} cannot be reviewed: {msg}", session.job_id()),
        other => bail!("job {} did not settle ({other})", session.job_id()),
    }
}

// ── Commands ──

async fn cmd_watch(cli: &Cli, job_id: &str) -> Result<()> {
    let session = open_session(cli, job_id);
    let mut events = session.subscribe();

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(ReviewEvent::StatusChanged(job)) => {
                    let now = chrono::Local::now().format("%H:%M:%S");
                    println!("[{now}] {}", display::status_line(&job));
                }
                Ok(ReviewEvent::SyncStateChanged(state)) => {
                    tracing::debug!(%state, "sync state");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status display fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            _ = session.wait_settled() => break,
        }
    }

    settle(&session).await?;
    println!();
    display::print_redline_summary(&session.redlines());
    display::print_counts(&session.counts(), &session.export_readiness());
    Ok(())
}

async fn cmd_show(cli: &Cli, job_id: &str, id: Option<&str>, json: bool) -> Result<()> {
    let session = open_session(cli, job_id);
    settle(&session).await?;

    let redlines = match id {
        Some(id) => vec![
            session
                .redline(id)
                .with_context(|| format!("redline {id} not found in job {job_id}"))?,
        ],
        None => session.redlines(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&redlines)?);
        return Ok(());
    }

    for redline in &redlines {
        display::print_redline_card(redline);
    }
    if id.is_none() {
        display::print_counts(&session.counts(), &session.export_readiness());
    }
    Ok(())
}

async fn cmd_decide(cli: &Cli, job_id: &str, decisions: &[(String, Decision)]) -> Result<()> {
    let session = open_session(cli, job_id);
    settle(&session).await?;
    let mut events = session.subscribe();

    let mut rejected_input = 0usize;
    for (redline_id, decision) in decisions {
        match session.submit_decision(redline_id, *decision) {
            Ok(previous) if previous == *decision => {
                println!("  {redline_id:<12} already {decision}");
            }
            Ok(previous) => println!("  {redline_id:<12} {previous} -> {decision}"),
            Err(e) => {
                rejected_input += 1;
                eprintln!("  {redline_id:<12} {e}");
            }
        }
    }

    session.flush().await;

    let mut confirmed = 0usize;
    loop {
        match events.try_recv() {
            Ok(ReviewEvent::DecisionConfirmed { .. }) => confirmed += 1,
            Ok(ReviewEvent::SubmissionFailed { reason, .. }) => eprintln!("warning: {reason}"),
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }

    let failed = session.failed_submissions();
    println!();
    println!("Confirmed {confirmed}, unconfirmed {}", failed.len());
    if !failed.is_empty() {
        println!("  not yet saved on the server: {}", failed.join(", "));
    }
    display::print_counts(&session.counts(), &session.export_readiness());

    if rejected_input > 0 || !failed.is_empty() {
        bail!(
            "{} decision(s) rejected, {} unconfirmed",
            rejected_input,
            failed.len()
        );
    }
    Ok(())
}

async fn cmd_export(cli: &Cli, job_id: &str, out: &Path) -> Result<()> {
    let session = open_session(cli, job_id);
    settle(&session).await?;

    let bytes = session.export().await?;
    tokio::fs::write(out, &bytes)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    println!("Wrote {} bytes to {}", bytes.len(), out.display());
    Ok(())
}
