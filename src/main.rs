use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sendgate::config::{LogFormat, LoggingConfig, SendgateConfig};
use sendgate::dispatch::{
    Campaign, CampaignDispatcher, CheckpointStore, DispatchOptions, FileCheckpointStore,
    InMemoryCampaignSource, InMemoryCheckpointStore, LogStatisticsSink,
};
use sendgate::email::{sender_from_config, EmailService, OutboundEmail, Recipient};
use sendgate::ratelimit::{RateLimitPolicy, RateLimiter};

#[derive(Parser, Debug)]
#[command(name = "sendgate", version, about = "Rate limited email campaign dispatcher")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a campaign to its recipient list
    Dispatch {
        /// YAML file holding the campaign and its recipients
        #[arg(long)]
        campaign: PathBuf,

        /// Identity of the sending user
        #[arg(long)]
        user: String,
    },
    /// Send a single test message
    SendTest {
        #[arg(long)]
        user: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        content: String,
    },
}

/// Campaign plus recipients, as read from disk.
#[derive(Debug, Deserialize)]
struct CampaignFile {
    campaign: Campaign,
    recipients: Vec<Recipient>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SendgateConfig::from_file(path)?,
        None => SendgateConfig::from_env()?,
    };
    init_tracing(&config.logging);

    info!("Starting Sendgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        quota = config.rate_limiting.quota,
        window_secs = config.rate_limiting.window_secs,
        sender = ?config.sender.kind,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();

    let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(
        config.rate_limiting.quota,
        config.rate_limiting.window(),
    )));
    let reaper = limiter
        .clone()
        .spawn_reaper(config.rate_limiting.reap_interval(), shutdown.clone());

    let email = EmailService::new(limiter, sender_from_config(&config.sender));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let outcome = match cli.command {
        Command::Dispatch { campaign, user } => {
            run_dispatch(&config, email, &campaign, &user, &shutdown).await
        }
        Command::SendTest {
            user,
            to,
            subject,
            content,
        } => {
            let message = OutboundEmail::new(to, subject, content);
            let receipt = email.send_test_email(&user, &message).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
    };

    shutdown.cancel();
    if let Err(e) = reaper.await {
        warn!(error = %e, "Reaper task did not stop cleanly");
    }

    info!("Sendgate stopped");
    outcome
}

async fn run_dispatch(
    config: &SendgateConfig,
    email: EmailService,
    campaign_path: &Path,
    user: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let contents = tokio::fs::read_to_string(campaign_path)
        .await
        .with_context(|| format!("reading campaign file {}", campaign_path.display()))?;
    let file: CampaignFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing campaign file {}", campaign_path.display()))?;
    let campaign_id = file.campaign.id.clone();

    let checkpoints: Arc<dyn CheckpointStore> = match &config.dispatch.checkpoint_dir {
        Some(dir) => Arc::new(FileCheckpointStore::open(dir).await?),
        None => Arc::new(InMemoryCheckpointStore::new()),
    };

    let campaigns: InMemoryCampaignSource = [file.campaign].into_iter().collect();
    let dispatcher =
        CampaignDispatcher::new(email, Arc::new(campaigns), Arc::new(LogStatisticsSink))
            .with_options(DispatchOptions::from(&config.dispatch))
            .with_checkpoints(checkpoints);

    let result = dispatcher
        .dispatch_campaign(user, &campaign_id, &file.recipients, shutdown)
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping after checkpointing progress");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping after checkpointing progress");
        }
    }
}
