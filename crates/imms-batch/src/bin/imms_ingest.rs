//! Local bulk file ingestion.
//!
//! Runs the whole pipeline in memory over the given files: intake, row processing,
//! forwarding, acknowledgment and change-feed sync. Prints each file's final
//! ledger status and acknowledgments.

#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;

use imms_batch::{
    IntakeDecision, LocalPipeline, StaticPermissionPolicy, StaticSubmitterDirectory,
};
use imms_core::metrics::register_metrics;
use imms_core::{LogFormat, MemoryBackend, MessageId, PipelineConfig, init_logging};
use imms_delta::{ChangeFeedSync, ColumnFlattener, InMemoryDeadLetterSink, SyncOutcome};

/// Ingest bulk vaccination files locally.
#[derive(Debug, Parser)]
#[command(name = "imms-ingest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Storage environment name.
    #[arg(long, env = "IMMS_ENVIRONMENT")]
    environment: Option<String>,

    /// Log output format (`json` or `pretty`).
    #[arg(long)]
    log_format: Option<String>,

    /// Submitter code mapping, e.g. `ABC12=EMIS`. Repeatable.
    #[arg(long = "submitter-code", value_parser = parse_pair)]
    submitter_codes: Vec<(String, String)>,

    /// Permission grant, e.g. `EMIS=COVID.CRUD`. Repeatable.
    #[arg(long = "permission", value_parser = parse_pair)]
    permissions: Vec<(String, String)>,

    /// Bulk files, ingested in the order given.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn parse_pair(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.trim().is_empty() && !val.trim().is_empty() => {
            Ok((key.trim().to_string(), val.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {value:?}")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env().context("loading configuration")?;
    if let Some(environment) = &cli.environment {
        config = config.with_environment(environment.clone());
    }
    if let Some(format) = &cli.log_format {
        config.log_format = match format.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => bail!("unknown log format {other:?}"),
        };
    }
    for (code, system) in &cli.submitter_codes {
        config = config.with_submitter_code(code.clone(), system.clone());
    }

    init_logging(config.log_format);
    register_metrics();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: PipelineConfig) -> Result<()> {
    let permissions = cli
        .permissions
        .iter()
        .fold(StaticPermissionPolicy::new(), |policy, (submitter, grant)| {
            policy.with_grant(submitter, grant)
        });
    let pipeline = LocalPipeline::new(
        Arc::new(MemoryBackend::new()),
        &config,
        Arc::new(StaticSubmitterDirectory::from_config(&config)),
        Arc::new(permissions),
    )?;

    let mut arrivals: Vec<(String, Option<MessageId>)> = Vec::new();
    for path in &cli.files {
        let file_key = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?
            .to_string();
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

        let decision = pipeline.submit(&file_key, Bytes::from(data)).await?;
        let message_id = match &decision {
            IntakeDecision::Proceed(entry) | IntakeDecision::Queued(entry) => Some(entry.message_id),
            IntakeDecision::Rejected { entry, reason } => {
                println!("{file_key}: rejected ({reason})");
                entry.as_ref().map(|e| e.message_id)
            }
        };
        arrivals.push((file_key, message_id));
    }

    let forwarded = pipeline.run_until_idle().await?;
    tracing::info!(forwarded, "pipeline idle");

    for (file_key, message_id) in arrivals {
        let Some(message_id) = message_id else {
            continue;
        };
        let Some(entry) = pipeline.ledger().get(message_id).await? else {
            continue;
        };
        println!(
            "{file_key}: {} (rows {}, succeeded {}, failed {})",
            entry.status,
            entry.record_count.unwrap_or(0),
            entry.records_succeeded.unwrap_or(0),
            entry.records_failed.unwrap_or(0),
        );
        if let Some(ack) = pipeline.file_ack(&entry).await? {
            println!("{ack}");
        }
        if let Some(ack) = pipeline.business_ack(&entry).await? {
            println!("{ack}");
        }
    }

    let sync = ChangeFeedSync::new(
        pipeline.storage().clone(),
        Arc::new(ColumnFlattener),
        Arc::new(InMemoryDeadLetterSink::new()),
    )
    .with_config(&config);
    pipeline.store().publish_pending().await?;
    let pending = pipeline.store().pending_change_count().await?;
    if pending > 0 {
        tracing::warn!(pending, "change notifications still undelivered");
    }
    let notifications = pipeline.changes().drain()?;
    let outcomes = sync.handle_all(&notifications).await?;
    let written = outcomes
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Written { .. }))
        .count();
    println!("delta entries written: {written} of {}", outcomes.len());

    Ok(())
}
