//! Deploy service command line client
//!
//! Commands:
//! - trigger: Start a build, optionally watching it until it settles
//! - watch: Watch the deployment created since a timestamp
//! - status: Show the deployment the service is tracking
//! - nonces: Show the action nonces issued to the caller

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deploy_client::{PollOutcome, Poller, PollerConfig, ServiceClient};
use serde::Serialize;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "deployctl")]
#[command(about = "Trigger and watch static site deployments")]
struct Cli {
    /// Deploy service URL
    #[arg(long, env = "DEPLOY_SERVICE_URL", default_value = "http://127.0.0.1:8090")]
    url: String,

    /// Bearer token of a user with the deploy capability
    #[arg(long, env = "DEPLOY_TOKEN", hide_env_values = true)]
    token: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a build through the deploy hook
    Trigger {
        /// Poll the new deployment until it settles
        #[arg(short, long)]
        watch: bool,

        /// Seconds between status checks
        #[arg(short, long, default_value_t = 10)]
        interval: u64,
    },

    /// Poll the deployment created since a timestamp until it settles
    Watch {
        /// Build start time, as returned in the job's createdAt
        #[arg(short, long)]
        from: String,

        /// Seconds between status checks
        #[arg(short, long, default_value_t = 10)]
        interval: u64,
    },

    /// Show the tracked deployment and its previous status
    Status,

    /// Show the action nonces issued to this token
    Nonces,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to format response")?
    );
    Ok(())
}

async fn watch(client: ServiceClient, from: &str, interval: u64) -> Result<()> {
    let poller = Poller::new(
        client,
        PollerConfig {
            interval: Duration::from_secs(interval),
            ..Default::default()
        },
    );

    match poller.run(from).await {
        PollOutcome::Finished { state, details } => {
            print_json(&details.raw)?;
            println!("Deployment finished: {}", state);
            Ok(())
        }
        PollOutcome::UpdateFailed { state, error } => {
            anyhow::bail!("Deployment finished as {} but recording it failed: {}", state, error)
        }
        PollOutcome::Failed { error, ticks } => {
            anyhow::bail!("Status check failed after {} checks: {}", ticks, error)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deploy_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let client = ServiceClient::new(&cli.url, &cli.token, Duration::from_secs(cli.timeout))
        .context("Failed to create client")?;

    match cli.command {
        Commands::Trigger { watch: follow, interval } => {
            let response = client
                .trigger_build()
                .await
                .context("Failed to trigger build")?;
            print_json(&response)?;

            if follow {
                watch(client, &response.job.created_at, interval).await?;
            }
        }
        Commands::Watch { from, interval } => {
            watch(client, &from, interval).await?;
        }
        Commands::Status => {
            let current = client
                .current()
                .await
                .context("Failed to fetch deployment")?;
            print_json(&current)?;
        }
        Commands::Nonces => {
            let nonces = client.nonces().await.context("Failed to fetch nonces")?;
            print_json(&nonces)?;
        }
    }

    Ok(())
}
