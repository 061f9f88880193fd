//! Shared map of outstanding HTTP-01 challenge responses.
//!
//! The ACME client publishes `(token, key-authorization)` pairs here before
//! asking the CA to validate; the HTTP adapter serves them under
//! `/.well-known/acme-challenge/`. Tokens only live for the span of one
//! order, so the map is empty whenever no issuance is in progress.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub struct ChallengeMap {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, token: &str, key_authorization: &str) {
        self.inner
            .write()
            .expect("challenge map lock poisoned")
            .insert(token.to_string(), key_authorization.to_string());
        tracing::debug!(token, "Published challenge response");
    }

    pub fn withdraw(&self, token: &str) {
        self.inner
            .write()
            .expect("challenge map lock poisoned")
            .remove(token);
        tracing::debug!(token, "Withdrew challenge response");
    }

    /// Response body for a token, if a challenge is outstanding.
    pub fn respond(&self, token: &str) -> Option<String> {
        self.inner
            .read()
            .expect("challenge map lock poisoned")
            .get(token)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .expect("challenge map lock poisoned")
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_respond() {
        let map = ChallengeMap::new();
        map.publish("tok", "tok.thumbprint");
        assert_eq!(map.respond("tok").as_deref(), Some("tok.thumbprint"));
    }

    #[test]
    fn unknown_token_is_none() {
        let map = ChallengeMap::new();
        assert!(map.respond("nope").is_none());
    }

    #[test]
    fn withdraw_removes_token() {
        let map = ChallengeMap::new();
        map.publish("tok", "auth");
        map.withdraw("tok");
        assert!(map.respond("tok").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn withdrawing_missing_token_is_harmless() {
        let map = ChallengeMap::new();
        map.withdraw("never-published");
        assert!(map.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let map = ChallengeMap::new();
        let view = map.clone();
        map.publish("tok", "auth");
        assert_eq!(view.respond("tok").as_deref(), Some("auth"));
    }
}
