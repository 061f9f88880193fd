//! Desired-versus-installed reconciliation.
//!
//! One pass computes the set of domains the Marathon state wants
//! certificates for, diffs it against the store, and drives issuance for
//! the difference. Passes are strictly serialised: a mutex admits one pass
//! at a time, and a capacity-one trigger channel collapses any burst of
//! triggers that arrives mid-pass into exactly one follow-up pass.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::acme::CertIssuer;
use crate::domains;
use crate::error::Error;
use crate::lb::LbClient;
use crate::marathon::MarathonClient;
use crate::store::CertStore;

/// Handle for nudging the reconciler. Firing never blocks: while a pass is
/// running the first trigger queues and the rest coalesce into it.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// The trigger channel used by the daemon. Capacity one gives the
/// coalescing guarantee.
pub fn trigger_channel() -> (Trigger, mpsc::Receiver<()>) {
    Trigger::channel(1)
}

/// What one reconciliation pass did.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub issued: Vec<String>,
    pub failed: Vec<(String, Error)>,
    pub reloaded: bool,
}

pub struct Reconciler {
    marathon: Arc<MarathonClient>,
    store: Arc<CertStore>,
    issuer: Arc<dyn CertIssuer>,
    lb: LbClient,
    group: String,
    allow_multiple: bool,
    pass_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        marathon: Arc<MarathonClient>,
        store: Arc<CertStore>,
        issuer: Arc<dyn CertIssuer>,
        lb: LbClient,
        group: String,
        allow_multiple: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            marathon,
            store,
            issuer,
            lb,
            group,
            allow_multiple,
            pass_lock: Mutex::new(()),
            cancel,
        }
    }

    /// One event-driven pass: snapshot, extract, diff, issue, reload.
    ///
    /// Per-domain failures are collected, never propagated; a failed domain
    /// is retried whenever the next trigger arrives.
    pub async fn reconcile(&self) -> PassOutcome {
        let _pass = self.pass_lock.lock().await;

        let apps = match self.marathon.snapshot().await {
            Ok(apps) => apps,
            Err(e) => {
                tracing::error!(error = %e, "Reconciliation skipped: Marathon snapshot failed");
                return PassOutcome::default();
            }
        };
        let desired = domains::extract(&apps, &self.group, self.allow_multiple);

        let installed = match self.store.list() {
            Ok(installed) => installed,
            Err(e) => {
                tracing::error!(error = %e, "Reconciliation skipped: store unreadable");
                return PassOutcome::default();
            }
        };

        let to_issue: Vec<String> = desired.difference(&installed).cloned().collect();
        tracing::debug!(
            desired = desired.len(),
            installed = installed.len(),
            missing = to_issue.len(),
            "Reconciliation pass"
        );

        self.issue_and_reload(to_issue).await
    }

    /// Renewal pass: reissue every stored certificate that expires within
    /// `threshold`. Does not consult Marathon.
    pub async fn reconcile_renewal(&self, threshold: chrono::Duration) -> PassOutcome {
        let _pass = self.pass_lock.lock().await;

        let installed = match self.store.list() {
            Ok(installed) => installed,
            Err(e) => {
                tracing::error!(error = %e, "Renewal skipped: store unreadable");
                return PassOutcome::default();
            }
        };

        let now = Utc::now();
        let mut due = Vec::new();
        for domain in installed {
            match self.store.expires_at(&domain) {
                Ok(Some(not_after)) if not_after - now < threshold => {
                    tracing::info!(
                        domain = %domain,
                        expires = %not_after,
                        "Certificate due for renewal"
                    );
                    due.push(domain);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    // Listed but unreadable or unparsable. Reissuing is the
                    // only way back to a good state.
                    tracing::warn!(domain = %domain, "Certificate unreadable; renewing");
                    due.push(domain);
                }
            }
        }

        self.issue_and_reload(due).await
    }

    async fn issue_and_reload(&self, to_issue: Vec<String>) -> PassOutcome {
        let mut outcome = PassOutcome::default();

        for domain in to_issue {
            if self.cancel.is_cancelled() {
                tracing::info!("Reconciliation interrupted by shutdown");
                break;
            }

            tracing::info!(domain = %domain, "Requesting certificate");
            match self.issuer.issue(&domain).await {
                Ok(pem) => match self.store.put(&domain, &pem) {
                    Ok(()) => {
                        tracing::info!(domain = %domain, "Certificate installed");
                        outcome.issued.push(domain);
                    }
                    Err(e) => {
                        tracing::error!(domain = %domain, error = %e, "Certificate write failed");
                        outcome.failed.push((domain, e));
                    }
                },
                Err(e) => {
                    tracing::error!(domain = %domain, error = %e, "Certificate issuance failed");
                    outcome.failed.push((domain, e));
                }
            }
        }

        if !outcome.issued.is_empty() {
            // Reload failures don't change the pass outcome; the new
            // certificates are on disk and the next reload picks them up.
            self.lb.reload().await;
            outcome.reloaded = true;
        }

        outcome
    }
}

/// Drive reconciliation passes from the trigger channel until cancelled.
pub async fn run_trigger_loop(
    reconciler: Arc<Reconciler>,
    mut rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = rx.recv() => match msg {
                Some(()) => {
                    let outcome = reconciler.reconcile().await;
                    if !outcome.issued.is_empty() || !outcome.failed.is_empty() {
                        tracing::info!(
                            issued = outcome.issued.len(),
                            failed = outcome.failed.len(),
                            reloaded = outcome.reloaded,
                            "Reconciliation pass finished"
                        );
                    }
                }
                None => return,
            },
        }
    }
}
