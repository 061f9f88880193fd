//! ACME account management and certificate issuance over HTTP-01.
//!
//! The wire protocol (JWS, directory discovery, nonce handling including
//! `badNonce` retry) is instant-acme's job; this module drives the order
//! state machine: authorize, publish the challenge, poll to a terminal
//! state, finalize with a fresh key, fetch the chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tokio::time::Instant;

use crate::challenges::ChallengeMap;
use crate::error::{Error, Result};
use crate::store::CertStore;

pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Polling for challenge validation and certificate issuance: exponential
/// from one second, capped, bounded by a total deadline.
const POLL_INITIAL: Duration = Duration::from_secs(1);
const POLL_CAP: Duration = Duration::from_secs(30);
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// CA 5xx and network errors are retried this many times per issuance
/// before the domain is given up for the pass.
const TRANSPORT_ATTEMPTS: u32 = 3;
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(2);

/// Issues one certificate per call. The reconciler guarantees calls for the
/// same domain never overlap; implementations may be shared across domains.
#[async_trait]
pub trait CertIssuer: Send + Sync {
    /// Obtain a certificate for `domain`, returning private key + chain as
    /// one PEM bundle.
    async fn issue(&self, domain: &str) -> Result<Vec<u8>>;
}

pub struct AcmeClient {
    directory: String,
    contact_email: Option<String>,
    store: Arc<CertStore>,
    challenges: ChallengeMap,
    account: tokio::sync::RwLock<Option<Arc<Account>>>,
}

impl AcmeClient {
    pub fn new(
        directory: String,
        contact_email: Option<String>,
        store: Arc<CertStore>,
        challenges: ChallengeMap,
    ) -> Self {
        Self {
            directory,
            contact_email,
            store,
            challenges,
            account: tokio::sync::RwLock::new(None),
        }
    }

    /// Register the ACME account, or restore it from stored credentials.
    /// Idempotent; later calls are no-ops.
    pub async fn register(&self) -> Result<()> {
        if self.account.read().await.is_some() {
            return Ok(());
        }

        let account = match self.store.load_account_credentials()? {
            Some(json) => {
                let credentials: AccountCredentials = serde_json::from_str(&json).map_err(|e| {
                    Error::store_io(
                        self.store.account_path(),
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    )
                })?;
                let account = Account::from_credentials(credentials)
                    .await
                    .map_err(|e| classify("account", e))?;
                tracing::info!("Restored ACME account from stored credentials");
                account
            }
            None => {
                let contact: Vec<String> = self
                    .contact_email
                    .iter()
                    .map(|email| format!("mailto:{email}"))
                    .collect();
                let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
                let new_account = NewAccount {
                    contact: &contact_refs,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                };

                let (account, credentials) =
                    Account::create(&new_account, &self.directory, None)
                        .await
                        .map_err(|e| classify("account", e))?;

                let json = serde_json::to_string_pretty(&credentials).map_err(|e| {
                    Error::store_io(
                        self.store.account_path(),
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    )
                })?;
                self.store.save_account_credentials(&json)?;
                tracing::info!(directory = %self.directory, "Registered new ACME account");
                account
            }
        };

        *self.account.write().await = Some(Arc::new(account));
        Ok(())
    }

    async fn issue_once(&self, domain: &str) -> Result<Vec<u8>> {
        let account = self
            .account
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("ACME account not registered".to_string()))?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| classify(domain, e))?;

        let mut published = Vec::new();
        let result = self.run_order(domain, &mut order, &mut published).await;

        // Tokens live only for the span of this order, success or not.
        for token in &published {
            self.challenges.withdraw(token);
        }

        result
    }

    async fn run_order(
        &self,
        domain: &str,
        order: &mut Order,
        published: &mut Vec<String>,
    ) -> Result<Vec<u8>> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| classify(domain, e))?;

        for authorization in &authorizations {
            if matches!(authorization.status, AuthorizationStatus::Valid) {
                continue;
            }

            let challenge = authorization
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| Error::AcmeRejected {
                    domain: domain.to_string(),
                    detail: "CA offered no http-01 challenge".to_string(),
                })?;

            // The response must be servable before the CA is told to look.
            let key_authorization = order.key_authorization(challenge);
            self.challenges
                .publish(&challenge.token, key_authorization.as_str());
            published.push(challenge.token.clone());

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| classify(domain, e))?;
        }

        let deadline = Instant::now() + VALIDATION_TIMEOUT;
        self.poll_until_ready(domain, order, deadline).await?;

        let key = rcgen::KeyPair::generate().map_err(|e| Error::Certificate(e.to_string()))?;
        let params = rcgen::CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| Error::Certificate(e.to_string()))?;
        let csr = params
            .serialize_request(&key)
            .map_err(|e| Error::Certificate(e.to_string()))?;

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| classify(domain, e))?;
        }

        let chain = self.poll_certificate(domain, order, deadline).await?;

        let mut pem = key.serialize_pem().into_bytes();
        pem.extend_from_slice(chain.as_bytes());
        Ok(pem)
    }

    /// Poll the order until it is ready to finalize (or already valid).
    async fn poll_until_ready(
        &self,
        domain: &str,
        order: &mut Order,
        deadline: Instant,
    ) -> Result<()> {
        let mut delay = POLL_INITIAL;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    let detail = order
                        .state()
                        .error
                        .as_ref()
                        .map(problem_detail)
                        .unwrap_or_else(|| "order became invalid".to_string());
                    return Err(Error::AcmeRejected {
                        domain: domain.to_string(),
                        detail,
                    });
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if Instant::now() + delay > deadline {
                        return Err(Error::ChallengeTimeout {
                            domain: domain.to_string(),
                            timeout: VALIDATION_TIMEOUT,
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(POLL_CAP);
                    order.refresh().await.map_err(|e| classify(domain, e))?;
                }
            }
        }
    }

    /// Poll for the issued certificate chain after finalization.
    async fn poll_certificate(
        &self,
        domain: &str,
        order: &mut Order,
        deadline: Instant,
    ) -> Result<String> {
        let mut delay = POLL_INITIAL;
        loop {
            match order.certificate().await {
                Ok(Some(chain)) => return Ok(chain),
                Ok(None) => {
                    if Instant::now() + delay > deadline {
                        return Err(Error::ChallengeTimeout {
                            domain: domain.to_string(),
                            timeout: VALIDATION_TIMEOUT,
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(POLL_CAP);
                }
                Err(e) => return Err(classify(domain, e)),
            }
        }
    }
}

#[async_trait]
impl CertIssuer for AcmeClient {
    async fn issue(&self, domain: &str) -> Result<Vec<u8>> {
        let mut attempt = 1;
        loop {
            match self.issue_once(domain).await {
                Err(Error::AcmeUnavailable(detail)) if attempt < TRANSPORT_ATTEMPTS => {
                    tracing::warn!(
                        domain,
                        attempt,
                        error = %detail,
                        "ACME transport error; retrying"
                    );
                    tokio::time::sleep(TRANSPORT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Sort an instant-acme error into the retry classes the reconciler
/// understands. CA problem documents are final (4xx) unless the server
/// itself failed; everything else is transport.
fn classify(domain: &str, err: instant_acme::Error) -> Error {
    match err {
        instant_acme::Error::Api(problem) => classify_problem(
            domain,
            Some(problem.r#type.as_str()),
            Some(problem.status),
            Some(problem.detail.as_str()),
        ),
        other => Error::AcmeUnavailable(other.to_string()),
    }
}

fn classify_problem(
    domain: &str,
    kind: Option<&str>,
    status: Option<u16>,
    detail: Option<&str>,
) -> Error {
    let detail = detail
        .map(str::to_string)
        .or_else(|| kind.map(str::to_string))
        .unwrap_or_else(|| "unknown ACME problem".to_string());

    if kind.is_some_and(|k| k.ends_with(":rateLimited")) {
        return Error::AcmeRateLimited(detail);
    }
    if status.is_some_and(|s| s >= 500) {
        return Error::AcmeUnavailable(detail);
    }
    Error::AcmeRejected {
        domain: domain.to_string(),
        detail,
    }
}

fn problem_detail(problem: &instant_acme::Problem) -> String {
    if !problem.detail.is_empty() {
        problem.detail.clone()
    } else if !problem.r#type.is_empty() {
        problem.r#type.clone()
    } else {
        "unknown ACME problem".to_string()
    }
}
