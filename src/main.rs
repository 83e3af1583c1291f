//! Command-line front end for the analysis pipeline.
//!
//! ```bash
//! # Analyze a description with the built-in catalog and in-memory storage
//! OPENAI_API_KEY=... nutriwealth-pipeline --description "Grilled chicken breast, 6oz"
//!
//! # Use a config file and persist to the HTTP table store
//! nutriwealth-pipeline --config pipeline.toml --store-url https://storage/api \
//!     --description "Walmart receipt, Milk $4.50, Bread $3.25, Total $7.75"
//!
//! # Keyword classification and routing only, no model calls
//! nutriwealth-pipeline --offline --description "Ran 3 miles"
//!
//! # Per-category usage and savings for a user over 30 days
//! nutriwealth-pipeline --store-url https://storage/api --user u-17 --usage-days 30
//!
//! # JSON Schema of the config file
//! nutriwealth-pipeline --print-schema
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter
//! - `OPENAI_API_KEY`, `GROQ_API_KEY`, `ANTHROPIC_API_KEY`, `OLLAMA_URL`: provider access
//! - the variable named by `storage.api_key_env`: table store key

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nutriwealth_pipeline::classifier::KeywordClassifier;
use nutriwealth_pipeline::config::{self, loader::load_from_file, PipelineConfig};
use nutriwealth_pipeline::middleware::MiddlewareStack;
use nutriwealth_pipeline::storage::{HttpTableStore, InMemoryStore, TableStore};
use nutriwealth_pipeline::worker::{AnthropicWorker, OpenAiWorker, ProviderDispatch};
use nutriwealth_pipeline::{
    init_tracing, metrics, ImageRef, ModelWorker, PipelineError, Provider, Submission,
    SubmissionCoordinator, TenantId, UserId,
};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nutriwealth-pipeline")]
#[command(about = "Classify a submission and extract structured food, receipt or workout data")]
struct Cli {
    /// Pipeline configuration file (TOML). Built-in defaults when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Free-form description of the submission.
    #[arg(short, long, default_value = "")]
    description: String,

    /// Publicly reachable image URL.
    #[arg(long)]
    image_url: Option<String>,

    /// Tenant scope for storage calls.
    #[arg(long, default_value = "default")]
    tenant: String,

    /// Submitting user.
    #[arg(long, default_value = "cli")]
    user: String,

    /// HTTP table store endpoint; overrides `storage.url`.
    #[arg(long, env = "STORAGE_URL")]
    store_url: Option<String>,

    /// Classify with the keyword heuristic and print the routing decision
    /// without calling any model.
    #[arg(long)]
    offline: bool,

    /// Print the config JSON Schema and exit.
    #[arg(long)]
    print_schema: bool,

    /// Print usage statistics and Prometheus metrics after the run.
    #[arg(long)]
    stats: bool,

    /// Print `--user`'s usage over the last N days from the cost log
    /// instead of analyzing a submission.
    #[arg(long, value_name = "DAYS")]
    usage_days: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.print_schema {
        println!("{}", serde_json::to_string_pretty(&config::export_schema())?);
        return Ok(());
    }

    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match &cli.config {
        Some(path) => load_from_file(path)?,
        None => PipelineConfig::default(),
    };
    info!(pipeline = %config.pipeline.name, "configuration loaded");

    let mut submission = Submission::new(
        TenantId::new(cli.tenant.clone()),
        UserId::new(cli.user.clone()),
        cli.description.clone(),
    );
    if let Some(url) = &cli.image_url {
        submission = submission.with_image(ImageRef::Url(url.clone()));
    }

    if cli.offline {
        return route_offline(&config, &submission);
    }

    let store = build_store(&config, cli.store_url.as_deref());
    let coordinator = SubmissionCoordinator::new(build_worker(), store, config.clone())?;

    if let Some(days) = cli.usage_days {
        let window = Duration::from_secs(days.saturating_mul(86_400));
        let report = coordinator
            .usage_stats(submission.tenant(), submission.submitter(), window)
            .await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let stack = MiddlewareStack::standard(config.pipeline.max_description_chars);

    let outcome = stack.run(&coordinator, submission).await;
    let printed = match &outcome {
        Ok(resp) => json!({
            "ok": true,
            "warnings": resp.warnings(),
            "response": resp,
        }),
        Err(e) => json!({
            "ok": false,
            "error": e.kind(),
            "retryable": e.is_retryable(),
            "message": e.to_string(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&printed)?);

    if cli.stats {
        println!(
            "{}",
            serde_json::to_string_pretty(&coordinator.meter().snapshot())?
        );
        println!("{}", metrics::gather_metrics());
    }

    outcome.map(|_| ()).map_err(Into::into)
}

/// Heuristic classification plus routing, without network access.
fn route_offline(
    config: &PipelineConfig,
    submission: &Submission,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = nutriwealth_pipeline::coordinator::PipelineSnapshot::build(config.clone())?;
    snapshot.validator.check(submission)?;

    // Same confidence the pipeline assigns to a heuristic fallback.
    let category = KeywordClassifier.classify(submission.description());
    let decision = snapshot.router.route(category, 0.0, submission.has_image())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "category": category,
            "routing": decision,
        }))?
    );
    Ok(())
}

/// One worker per provider whose credentials are present.
fn build_worker() -> Arc<dyn ModelWorker> {
    let mut dispatch =
        ProviderDispatch::new().with(Provider::Ollama, Arc::new(OpenAiWorker::ollama_from_env()));

    let candidates: [(Provider, Result<Arc<dyn ModelWorker>, PipelineError>); 3] = [
        (
            Provider::OpenAi,
            OpenAiWorker::openai_from_env().map(|w| Arc::new(w) as Arc<dyn ModelWorker>),
        ),
        (
            Provider::Groq,
            OpenAiWorker::groq_from_env().map(|w| Arc::new(w) as Arc<dyn ModelWorker>),
        ),
        (
            Provider::Anthropic,
            AnthropicWorker::from_env().map(|w| Arc::new(w) as Arc<dyn ModelWorker>),
        ),
    ];
    for (provider, worker) in candidates {
        match worker {
            Ok(w) => dispatch = dispatch.with(provider, w),
            Err(e) => warn!(provider = provider.as_str(), error = %e, "provider unavailable"),
        }
    }
    Arc::new(dispatch)
}

/// HTTP table store when a URL is configured, otherwise in-memory.
fn build_store(config: &PipelineConfig, override_url: Option<&str>) -> Arc<dyn TableStore> {
    let url = override_url
        .map(str::to_string)
        .or_else(|| config.storage.url.clone());
    match url {
        Some(url) => {
            let key = std::env::var(&config.storage.api_key_env).unwrap_or_default();
            if key.is_empty() {
                warn!(var = %config.storage.api_key_env, "storage API key not set");
            }
            info!(%url, "using HTTP table store");
            Arc::new(HttpTableStore::new(url, key).with_namespace(config.storage.namespace.clone()))
        }
        None => {
            info!("using in-memory table store");
            Arc::new(InMemoryStore::new())
        }
    }
}
