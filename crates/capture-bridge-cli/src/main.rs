mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use capture_bridge_core::{Engine, EnginePaths};
use capture_bridge_email::{ensure_fresh_token, EmailPoller, HttpGmailProvider, PollerConfig, TokenBucket};
use capture_bridge_ledger::LedgerStore;
use chrono::Utc;
use clap::Parser;

use config::CoreConfig;

#[derive(Parser, Debug)]
#[command(name = "capture-bridge", version)]
#[command(about = "Durable capture-to-vault delivery for voice memos and email")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = config::CONFIG_FILE)]
    config: PathBuf,

    /// Run a single poll/export/backup cycle and exit instead of looping.
    #[arg(long)]
    once: bool,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();
}

/// Build an `EmailPoller` if email ingestion is configured and a usable
/// token can be obtained (refreshing it against `credentials_path` first
/// if it's within 300s of expiry); otherwise returns `None` (voice-only
/// mode, not an error).
async fn build_email_poller(
    cfg: &config::EmailConfig,
    ledger: LedgerStore,
) -> Option<EmailPoller> {
    if !cfg.enabled {
        return None;
    }
    let token_path = cfg.token_path.as_ref()?;
    let credentials_path = cfg.credentials_path.as_ref()?;

    let http_client = reqwest::Client::new();
    let token = ensure_fresh_token(&http_client, &ledger, credentials_path, token_path, Utc::now())
        .await
        .inspect_err(|e| tracing::warn!(error = %e.message, "gmail token unavailable; email polling disabled"))
        .ok()?;

    let provider = Arc::new(HttpGmailProvider::new(token.access_token));
    let poller_config = PollerConfig {
        max_results: cfg.max_results,
        ..PollerConfig::default()
    };
    Some(
        EmailPoller::new(provider, ledger, poller_config)
            .with_rate_limiter(TokenBucket::new(cfg.rate_limit_capacity, cfg.rate_limit_refill_per_sec)),
    )
}

async fn build_engine(cfg: &CoreConfig) -> Result<Engine> {
    if let Some(parent) = cfg.ledger.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ledger directory {}", parent.display()))?;
    }
    let ledger = LedgerStore::open(&cfg.ledger.path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to open ledger at {}: {}", cfg.ledger.path.display(), e.message))?;

    let paths = EnginePaths::under_vault(cfg.vault.root.clone(), cfg.ledger.path.clone());
    let mut engine = Engine::new(ledger.clone(), paths);

    if let Some(poller) = build_email_poller(&cfg.email, ledger).await {
        engine = engine.with_poller(poller);
    }

    Ok(engine)
}

/// One full pass: poll email if configured, export everything eligible,
/// and run the backup cycle.
async fn run_cycle(engine: &Engine) -> Result<()> {
    let now = Utc::now();

    if let Some(poll_result) = engine.poll_email(now).await {
        match poll_result {
            Ok(outcome) => tracing::info!(?outcome, "email poll complete"),
            Err(err) => tracing::warn!(error = %err.message, recoverable = err.recoverable, "email poll failed"),
        }
    }

    let export_report = engine.run_export_cycle(now).await?;
    tracing::info!(
        exported = export_report.exported.len(),
        recoverable_failures = export_report.recoverable_failures.len(),
        halted = export_report.halted_by.is_some(),
        "export cycle complete"
    );

    let backup_report = engine.run_backup_cycle(now).await?;
    tracing::info!(
        path = %backup_report.backed_up.display(),
        verified = backup_report.verification_passed,
        promoted = backup_report.promoted.is_some(),
        pruned = backup_report.pruned.len(),
        "backup cycle complete"
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let cfg = config::load(&cli.config).context("failed to load configuration")?;
    let engine = build_engine(&cfg).await?;

    if cli.once {
        return run_cycle(&engine).await;
    }

    tracing::info!("starting capture-bridge daemon loop");
    loop {
        if let Err(err) = run_cycle(&engine).await {
            tracing::error!(error = %err, "cycle failed");
        }
        tokio::time::sleep(cfg.email.poll_interval).await;
    }
}
