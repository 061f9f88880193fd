//! marathon-lb client.
//!
//! marathon-lb watches the certificate directory and re-execs HAProxy when
//! told to. The trigger is a plain POST; any 2xx means the signal was
//! delivered. A reload that fails on one instance must not stop the others
//! from being signalled, and must not fail the reconciliation pass.

use std::time::Duration;

use crate::error::Error;

const RELOAD_PATH: &str = "/_mlb_signal/hup";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LbClient {
    endpoints: Vec<String>,
    http: reqwest::Client,
}

impl LbClient {
    pub fn new(endpoints: Vec<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("HTTP client: {e}")))?;
        Ok(Self { endpoints, http })
    }

    /// Signal every configured marathon-lb instance to reload.
    ///
    /// Returns the per-endpoint failures; an empty vec means all instances
    /// acknowledged. The reload counts as triggered either way.
    pub async fn reload(&self) -> Vec<Error> {
        let mut failures = Vec::new();

        for endpoint in &self.endpoints {
            let url = format!("{endpoint}{RELOAD_PATH}");
            let result = match self.http.post(&url).send().await {
                Ok(resp) if resp.status().is_success() => Ok(()),
                Ok(resp) => Err(format!("HTTP {}", resp.status())),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(()) => {
                    tracing::info!(endpoint = %endpoint, "Signalled marathon-lb to reload");
                }
                Err(detail) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %detail,
                        "marathon-lb reload signal failed"
                    );
                    failures.push(Error::LbReloadFailed {
                        endpoint: endpoint.clone(),
                        detail,
                    });
                }
            }
        }

        failures
    }
}
