//! Marathon API client: application snapshots and the event stream.
//!
//! Marathon may run as a multi-node cluster; only the leader serves the
//! event stream. The client walks the configured endpoints, remembers the
//! leader advertised through the `X-Marathon-Leader` response header, and
//! forgets it again when it stops answering.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::reconciler::Trigger;
use crate::sse::SseParser;

/// Event kinds that change which certificates are wanted. The payloads are
/// not parsed; any of these triggers a full resync.
pub const RELEVANT_EVENTS: &[&str] = &[
    "api_post_event",
    "status_update_event",
    "deployment_success",
    "health_status_changed_event",
];

const LEADER_HEADER: &str = "X-Marathon-Leader";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// The slice of a Marathon application this service cares about. Everything
/// else in the (large) app JSON is ignored for forward compatibility.
#[derive(Debug, Clone, Deserialize)]
pub struct App {
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default, rename = "portDefinitions")]
    port_definitions: Vec<PortDefinition>,
    #[serde(default)]
    container: Option<Container>,
}

impl App {
    /// Number of ports the app exposes. Host-networked apps list
    /// `portDefinitions`; bridged apps list `container.portMappings`.
    pub fn port_count(&self) -> usize {
        if !self.port_definitions.is_empty() {
            return self.port_definitions.len();
        }
        self.container
            .as_ref()
            .map(|c| c.port_mappings.len())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PortDefinition {}

#[derive(Debug, Clone, Deserialize)]
struct Container {
    #[serde(default, rename = "portMappings")]
    port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Clone, Deserialize)]
struct PortMapping {}

#[derive(Debug, Deserialize)]
struct AppsResponse {
    apps: Vec<App>,
}

pub struct MarathonClient {
    endpoints: Vec<String>,
    leader: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl MarathonClient {
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        // No overall timeout on the client: the event stream request stays
        // open indefinitely. Snapshot requests set their own deadline.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("HTTP client: {e}")))?;
        Ok(Self {
            endpoints,
            leader: RwLock::new(None),
            http,
        })
    }

    /// Current full application list via `GET /v2/apps`.
    pub async fn snapshot(&self) -> Result<Vec<App>> {
        let resp = self.get("/v2/apps", None, Some(SNAPSHOT_TIMEOUT)).await?;
        let resp = resp
            .error_for_status()
            .map_err(|e| Error::OrchestratorUnavailable(e.to_string()))?;
        let body: AppsResponse = resp
            .json()
            .await
            .map_err(|e| Error::OrchestratorUnavailable(format!("invalid /v2/apps response: {e}")))?;
        Ok(body.apps)
    }

    /// Open the long-lived `GET /v2/events` stream.
    pub async fn open_event_stream(&self) -> Result<reqwest::Response> {
        let resp = self.get("/v2/events", Some("text/event-stream"), None).await?;
        resp.error_for_status()
            .map_err(|e| Error::OrchestratorUnavailable(e.to_string()))
    }

    /// Walk the candidate endpoints until one answers.
    async fn get(
        &self,
        path: &str,
        accept: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut errors = Vec::new();

        for base in self.candidates() {
            let mut req = self.http.get(format!("{base}{path}"));
            if let Some(accept) = accept {
                req = req.header(reqwest::header::ACCEPT, accept);
            }
            if let Some(timeout) = timeout {
                req = req.timeout(timeout);
            }

            match req.send().await {
                Ok(resp) => {
                    self.note_leader(&resp);
                    return Ok(resp);
                }
                Err(e) => {
                    self.forget_leader(&base);
                    tracing::debug!(endpoint = %base, error = %e, "Marathon endpoint failed");
                    errors.push(format!("{base}: {e}"));
                }
            }
        }

        Err(Error::OrchestratorUnavailable(errors.join("; ")))
    }

    /// Known leader first, then the configured endpoints.
    fn candidates(&self) -> Vec<String> {
        let leader = self.leader.read().expect("leader lock poisoned").clone();
        let mut out = Vec::with_capacity(self.endpoints.len() + 1);
        if let Some(leader) = leader {
            out.push(leader);
        }
        for endpoint in &self.endpoints {
            if !out.contains(endpoint) {
                out.push(endpoint.clone());
            }
        }
        out
    }

    fn note_leader(&self, resp: &reqwest::Response) {
        let Some(value) = resp
            .headers()
            .get(LEADER_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let url = if value.starts_with("http://") || value.starts_with("https://") {
            value.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", value.trim_end_matches('/'))
        };

        let mut leader = self.leader.write().expect("leader lock poisoned");
        if leader.as_deref() != Some(url.as_str()) {
            tracing::info!(leader = %url, "Marathon leader advertised");
            *leader = Some(url);
        }
    }

    fn forget_leader(&self, base: &str) {
        let mut leader = self.leader.write().expect("leader lock poisoned");
        if leader.as_deref() == Some(base) {
            tracing::info!(leader = %base, "Marathon leader lost; reselecting");
            *leader = None;
        }
    }
}

/// Consume the event stream forever, reconnecting with exponential backoff.
///
/// Every (re)connect fires one synthetic trigger so the reconciler resyncs
/// state that changed while the stream was down.
pub async fn run_event_loop(
    client: Arc<MarathonClient>,
    trigger: Trigger,
    cancel: CancellationToken,
) {
    let mut backoff = RECONNECT_MIN;

    loop {
        let connect = tokio::select! {
            _ = cancel.cancelled() => return,
            resp = client.open_event_stream() => resp,
        };

        match connect {
            Ok(resp) => {
                tracing::info!("Subscribed to Marathon event stream");
                backoff = RECONNECT_MIN;
                trigger.fire();
                read_stream(resp, &trigger, &cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
                tracing::warn!("Marathon event stream closed; reconnecting");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Marathon event stream connect failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

async fn read_stream(resp: reqwest::Response, trigger: &Trigger, cancel: &CancellationToken) {
    let mut parser = SseParser::new();
    let mut stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => match parser.feed(&bytes) {
                Ok(events) => {
                    for event in events {
                        if RELEVANT_EVENTS.contains(&event.event.as_str()) {
                            tracing::debug!(event = %event.event, "Marathon event");
                            trigger.fire();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping Marathon event stream");
                    return;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Marathon event stream read error");
                return;
            }
            None => return,
        }
    }
}
