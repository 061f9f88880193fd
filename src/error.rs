//! Domain error types.
//!
//! The reconciler pattern-matches on these variants to decide retry policy,
//! so every failure class gets its own variant instead of a stringly error.

use std::path::Path;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad CLI value or unusable configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Filesystem failure in the certificate store. Fatal at startup,
    /// per-domain afterwards.
    #[error("certificate store I/O at {path}: {source}")]
    StoreIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Every configured Marathon endpoint failed.
    #[error("no Marathon endpoint reachable: {0}")]
    OrchestratorUnavailable(String),

    /// The CA kept failing with network or 5xx errors after retries.
    #[error("ACME service unavailable: {0}")]
    AcmeUnavailable(String),

    /// The CA reported a rate limit. Backs off until the next pass.
    #[error("ACME rate limited: {0}")]
    AcmeRateLimited(String),

    /// The CA refused the request (bad domain, unauthorized, malformed).
    #[error("ACME rejected {domain}: {detail}")]
    AcmeRejected { domain: String, detail: String },

    /// Challenge validation never reached a terminal state.
    #[error("challenge validation for {domain} timed out after {timeout:?}")]
    ChallengeTimeout { domain: String, timeout: Duration },

    /// Local key or CSR generation failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// A marathon-lb endpoint did not accept the reload signal.
    #[error("marathon-lb reload failed for {endpoint}: {detail}")]
    LbReloadFailed { endpoint: String, detail: String },
}

impl Error {
    pub fn store_io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::StoreIo {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Storage errors get a distinct exit code when they abort startup.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StoreIo { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_io_carries_path_in_message() {
        let err = Error::store_io(
            "/srv/certs/client.key",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/srv/certs/client.key"));
        assert!(err.is_storage());
    }

    #[test]
    fn only_store_io_is_storage() {
        assert!(!Error::ConfigInvalid("x".into()).is_storage());
        assert!(!Error::AcmeRateLimited("x".into()).is_storage());
    }
}
