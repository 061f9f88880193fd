mod acme;
mod challenges;
mod cli;
mod domains;
mod error;
mod http;
mod lb;
mod marathon;
mod reconciler;
mod scheduler;
mod sse;
mod store;
#[cfg(test)]
mod testutil;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::acme::{AcmeClient, CertIssuer};
use crate::challenges::ChallengeMap;
use crate::cli::{Cli, Config};
use crate::error::Error;
use crate::lb::LbClient;
use crate::marathon::MarathonClient;
use crate::reconciler::Reconciler;
use crate::store::CertStore;

/// Maximum time to wait for orderly shutdown before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

fn main() -> ExitCode {
    // clap exits 2 on bad usage by default; 2 is reserved for storage
    // errors here, so map usage errors to 1 ourselves.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let directive = match cli::env_filter_directive(&cli.log_level) {
        Ok(directive) => directive,
        Err(e) => {
            eprintln!("marathon-acme: {e}");
            return ExitCode::from(1);
        }
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_storage() => {
            tracing::error!(error = %e, "Unrecoverable storage error");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "Fatal startup error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<(), Error> {
    startup_diagnostics(&config);

    // Storage first; everything else depends on it. This also takes the
    // single-writer lock and writes the fallback certificate.
    let store = Arc::new(CertStore::open(&config.storage_dir)?);
    store.ensure_default()?;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // The challenge listener comes up before account registration so the CA
    // can validate the moment issuance starts.
    let challenges = ChallengeMap::new();
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .map_err(|e| Error::ConfigInvalid(format!("cannot listen on {}: {e}", config.listen)))?;
    {
        let challenges = challenges.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::serve(listener, challenges, token).await {
                tracing::error!(error = %e, "HTTP adapter failed");
            }
        }));
    }

    let acme = Arc::new(AcmeClient::new(
        config.acme_directory.clone(),
        config.email.clone(),
        store.clone(),
        challenges.clone(),
    ));
    acme.register().await?;

    let marathon = Arc::new(MarathonClient::new(config.marathon_endpoints.clone())?);
    let issuer: Arc<dyn CertIssuer> = acme;
    let reconciler = Arc::new(Reconciler::new(
        marathon.clone(),
        store.clone(),
        issuer,
        LbClient::new(config.lb_endpoints.clone())?,
        config.group.clone(),
        config.allow_multiple_certs,
        cancel.clone(),
    ));

    let (trigger, trigger_rx) = reconciler::trigger_channel();
    tasks.push(tokio::spawn(reconciler::run_trigger_loop(
        reconciler.clone(),
        trigger_rx,
        cancel.clone(),
    )));

    tasks.push(tokio::spawn(marathon::run_event_loop(
        marathon,
        trigger.clone(),
        cancel.clone(),
    )));

    // Initial reconciliation. Coalesces with the subscription's synthetic
    // trigger if that connects first.
    trigger.fire();

    tasks.push(tokio::spawn(scheduler::run_renewal_loop(
        reconciler,
        config.renewal.clone(),
        cancel.clone(),
    )));

    tracing::info!("Ready.");

    shutdown_signal().await;
    tracing::info!("Shutting down...");

    // An in-flight pass finishes its current domain, then every loop winds
    // down; past the grace timeout outstanding work is abandoned.
    cancel.cancel();
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            "Shutdown timed out after {:?} — forcing exit",
            SHUTDOWN_TIMEOUT
        );
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM-equivalent.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
}

fn startup_diagnostics(config: &Config) {
    tracing::info!("marathon-acme v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage: {}", config.storage_dir.display());
    tracing::info!("ACME directory: {}", config.acme_directory);
    tracing::info!("Marathon: {}", config.marathon_endpoints.join(", "));
    tracing::info!("marathon-lb: {}", config.lb_endpoints.join(", "));
    tracing::info!(
        "Group: {} ({})",
        config.group,
        if config.allow_multiple_certs {
            "multi-cert"
        } else {
            "single-cert"
        }
    );
    tracing::info!("Listening on {}", config.listen);
}
