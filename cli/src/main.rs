//! embedmesh - route embedding requests across providers from the command line.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use embedmesh_router::{
    BatchCoordinator, GenerateRequest, GenerateResponse, ProfileStore, QueueTicket, RouteOutcome,
    RoutingError,
};

use crate::config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "embedmesh")]
#[command(author, version, about = "Policy-driven embedding router", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "embedmesh.toml")]
    config: PathBuf,

    /// Log filter, e.g. `debug` or `embedmesh_router=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one embedding
    Route {
        /// Agent whose profile drives routing
        #[arg(short, long)]
        agent: String,

        /// Text to embed
        #[arg(short, long)]
        text: String,

        /// Task type selecting the model preference
        #[arg(long)]
        task_type: Option<String>,

        /// Owning tenant (random if omitted)
        #[arg(long)]
        tenant: Option<Uuid>,

        /// Context the embedding belongs to
        #[arg(long)]
        context: Option<Uuid>,
    },

    /// Generate embeddings for a JSON array of requests
    Batch {
        /// Agent whose profile drives routing
        #[arg(short, long)]
        agent: String,

        /// JSON file holding an array of requests
        input: PathBuf,
    },

    /// Validate the configuration and print a summary
    CheckConfig,
}

/// One slot of a batch result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ItemOutput {
    Ok(GenerateResponse),
    Queued(QueueTicket),
    Error(String),
}

impl From<Result<RouteOutcome, RoutingError>> for ItemOutput {
    fn from(result: Result<RouteOutcome, RoutingError>) -> Self {
        match result {
            Ok(RouteOutcome::Embedded(record)) => ItemOutput::Ok(GenerateResponse::from(&record)),
            Ok(RouteOutcome::Queued(ticket)) => ItemOutput::Queued(ticket),
            Err(err) => ItemOutput::Error(err.to_string()),
        }
    }
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling in-flight requests");
            trigger.cancel();
        }
    });
    cancel
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = CliConfig::load(&cli.config)?;

    match cli.command {
        Command::Route {
            agent,
            text,
            task_type,
            tenant,
            context,
        } => {
            let mut request = GenerateRequest::new(agent, text, tenant.unwrap_or_else(Uuid::new_v4));
            request.task_type = task_type;
            request.context_id = context;
            route(&config, request).await
        }
        Command::Batch { agent, input } => batch(&config, &agent, &input).await,
        Command::CheckConfig => check_config(&config, &cli.config),
    }
}

async fn route(config: &CliConfig, request: GenerateRequest) -> Result<()> {
    let profiles = config.profile_store().await?;
    let profile = profiles.get(&request.agent_id).await?;
    let router = config.build_router()?;
    let cancel = cancel_on_interrupt();

    match router.route_with_cancel(&profile, &request, &cancel).await {
        Ok(RouteOutcome::Embedded(record)) => print_json(&GenerateResponse::from(&record)),
        Ok(RouteOutcome::Queued(ticket)) => print_json(&ItemOutput::Queued(ticket)),
        Err(RoutingError::AllProvidersExhausted { attempts }) => {
            for attempt in &attempts {
                warn!("{attempt}");
            }
            anyhow::bail!("all providers exhausted after {} attempts", attempts.len())
        }
        Err(err) => Err(err.into()),
    }
}

async fn batch(config: &CliConfig, agent: &str, input: &Path) -> Result<()> {
    let profiles = config.profile_store().await?;
    let profile = profiles.get(agent).await?;
    let contents = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let requests: Vec<GenerateRequest> = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of requests", input.display()))?;

    let router = Arc::new(config.build_router()?);
    let cancel = cancel_on_interrupt();
    let results = BatchCoordinator::new(router)
        .run_batch_with_cancel(&profile, &requests, &cancel)
        .await?;

    let output: Vec<ItemOutput> = results.into_iter().map(ItemOutput::from).collect();
    print_json(&output)
}

fn check_config(config: &CliConfig, path: &Path) -> Result<()> {
    info!("Configuration {} is valid", path.display());
    println!(
        "standard dimension: {}, provider timeout: {}ms, batch concurrency: {}",
        config.router.standard_dimension,
        config.router.provider_timeout_ms,
        config.router.batch_concurrency
    );

    for provider in &config.providers {
        let models: Vec<String> = provider
            .models
            .iter()
            .map(|m| format!("{} ({}d)", m.id, m.dimensions))
            .collect();
        println!("provider {}: {}", provider.name, models.join(", "));
    }
    for profile in &config.profiles {
        println!(
            "profile {} ({}): {} task types",
            profile.agent_id,
            profile.strategy.as_str(),
            profile.model_preferences.len()
        );
    }

    let unserved = config.unserved_models();
    if !unserved.is_empty() {
        warn!("Models not served by any provider: {}", unserved.join(", "));
    }

    config.build_router()?;
    Ok(())
}
