mod bundle;
mod config;
mod credentials;
mod engine;
mod error;
mod forge;
mod git;
mod http;
mod metrics;
mod mirror;
mod storage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::credentials::{KeyMaterial, PushCredential};
use crate::engine::{EngineSettings, SyncEngine};
use crate::error::{Classify, ErrorClass};
use crate::forge::{ForgeBackend, GitLabBackend};
use crate::http::{AppState, PassStatus};
use crate::metrics::MetricsRegistry;
use crate::mirror::GitMirror;
use crate::storage::{ArtifactStore, S3ArtifactStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "partition-sync",
    version,
    about = "Applies encrypted git snapshots from object storage to GitLab mirrors"
)]
struct Cli {
    /// Compute and report every change without touching the mirrors.
    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    dry_run: bool,

    /// Run a single pass and exit.  `--run-once=false` reconciles every
    /// RECONCILE_SLEEP_TIME until stopped.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    run_once: bool,
}

/// Accept the single-dash spellings (`-dry-run`, `-run-once=false`) that
/// existing deployments pass.
fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| {
            let single_dash = ["-dry-run", "-run-once"].iter().any(|flag| {
                arg == *flag || arg.strip_prefix(flag).is_some_and(|rest| rest.starts_with('='))
            });
            if single_dash {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

struct RunLoop {
    engine: SyncEngine,
    metrics: MetricsRegistry,
    status: Arc<PassStatus>,
    run_once: bool,
    interval: Duration,
}

impl RunLoop {
    async fn run(&self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            let started = Instant::now();
            let outcome = self.engine.run_pass(shutdown).await;
            self.metrics.metrics.record_pass(&outcome, started.elapsed());
            self.status.record(&outcome);

            if let Err(err) = outcome {
                if shutdown.is_cancelled() {
                    tracing::info!("shutdown requested during pass");
                    return Ok(());
                }
                let class = err.class();
                if self.run_once || class == ErrorClass::Fatal {
                    return Err(err).context("reconciliation pass failed");
                }
                tracing::warn!(
                    error = %err,
                    class = %class,
                    "pass failed; retrying after the reconcile interval"
                );
            }

            if self.run_once {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse_from(normalize_args(std::env::args()));

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    // Nothing touches the network before the environment is known to be complete.
    let config = Config::from_env().context("invalid configuration")?;
    let keys = KeyMaterial::parse(&config.private_key).context("invalid PRIVATE_KEY")?;

    tracing::info!(
        shard = %config.shard,
        bucket = %config.storage.bucket,
        gitlab = %config.gitlab.base_url,
        recipients = ?keys.recipients(),
        dry_run = cli.dry_run,
        run_once = cli.run_once,
        update_policy = config.sync.update_policy.as_str(),
        "starting partition-sync"
    );

    // ---- Scratch space ----
    tokio::fs::create_dir_all(&config.workdir)
        .await
        .with_context(|| format!("failed to create workdir: {}", config.workdir.display()))?;
    let swept = bundle::sweep_workdir(&config.workdir)
        .await
        .with_context(|| format!("failed to clean workdir: {}", config.workdir.display()))?;
    if swept > 0 {
        tracing::info!(swept, "removed scratch directories from a previous run");
    }

    // ---- Clients ----
    let s3 = storage::s3::build_client(&config.storage, config.sync.request_timeout).await;
    let store: Arc<dyn ArtifactStore> =
        Arc::new(S3ArtifactStore::new(s3, config.storage.bucket.clone()));

    let forge: Arc<dyn ForgeBackend> =
        Arc::new(GitLabBackend::new(&config.gitlab, config.sync.request_timeout)?);
    let credential = PushCredential::new(
        config.gitlab.username.clone(),
        SecretString::from(config.gitlab.token.expose_secret().to_string()),
    );
    let mirror = Arc::new(GitMirror::new(
        forge,
        credential,
        config.sync.update_policy,
        config.sync.git_timeout,
    ));

    let engine = SyncEngine::new(
        store,
        mirror,
        Arc::new(keys),
        EngineSettings {
            shard_prefix: config.storage.shard_prefix(&config.shard),
            default_namespace: config.gitlab.namespace.clone(),
            workdir: config.workdir.clone(),
            concurrency: config.sync.concurrency,
            dry_run: cli.dry_run,
        },
    );

    // ---- Metrics server ----
    let metrics = MetricsRegistry::new();
    let status = Arc::new(PassStatus::default());
    let shutdown = CancellationToken::new();

    let http_handle = tokio::spawn({
        let state = AppState {
            metrics: metrics.clone(),
            status: status.clone(),
        };
        let port = config.metrics_port;
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = http::run_http_server(state, port, shutdown).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        }
    });

    let signal_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // ---- Reconcile ----
    let run_loop = RunLoop {
        engine,
        metrics,
        status,
        run_once: cli.run_once,
        interval: config.reconcile_sleep,
    };
    let result = run_loop.run(&shutdown).await;

    shutdown.cancel();
    signal_handle.abort();
    let _ = http_handle.await;

    match &result {
        Ok(()) => tracing::info!("partition-sync shut down cleanly"),
        Err(e) => tracing::error!(error = format!("{e:#}"), "partition-sync stopping"),
    }
    result
}
