//! Single-use download tokens for the agent binary endpoint.
//!
//! Tokens are 32 random bytes, hex-encoded (64 chars). Lookup is
//! constant-time over the stored set; a token is deleted on successful
//! validation or by the expiry sweep, never handed out twice.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Default token lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// In-memory store of outstanding single-use tokens.
pub struct TokenStore {
    ttl: Duration,
    inner: Mutex<HashMap<String, Instant>>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a new token and register it with the configured TTL.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let mut inner = self.inner.lock().expect("token store lock poisoned");
        inner.insert(token.clone(), Instant::now() + self.ttl);
        token
    }

    /// Validate and consume. Returns true exactly once per issued token.
    ///
    /// The candidate is compared against every live entry in constant time
    /// so the lookup leaks nothing about stored tokens.
    pub fn validate(&self, candidate: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("token store lock poisoned");
        inner.retain(|_, expires| *expires > now);

        let candidate_bytes = candidate.as_bytes();
        let mut matched: Option<String> = None;
        for stored in inner.keys() {
            let eq: bool = stored.as_bytes().ct_eq(candidate_bytes).into();
            if eq && matched.is_none() {
                matched = Some(stored.clone());
            }
        }
        match matched {
            Some(token) => {
                inner.remove(&token);
                debug!("download token validated and consumed");
                true
            }
            None => false,
        }
    }

    /// Drop expired entries; called by the periodic sweep task.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("token store lock poisoned");
        let before = inner.len();
        inner.retain(|_, expires| *expires > now);
        before - inner.len()
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().expect("token store lock poisoned").len()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_token_is_hex64() {
        let store = TokenStore::default();
        let token = store.issue();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_token_validates_exactly_once() {
        let store = TokenStore::default();
        let token = store.issue();
        assert!(store.validate(&token));
        assert!(!store.validate(&token));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let store = TokenStore::default();
        store.issue();
        assert!(!store.validate(&"0".repeat(64)));
    }

    #[test]
    fn test_expired_token_rejected_and_swept() {
        let store = TokenStore::new(Duration::from_millis(0));
        let token = store.issue();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!store.validate(&token));
        assert_eq!(store.outstanding(), 0);
    }

    #[test]
    fn test_sweep_reports_removed_count() {
        let store = TokenStore::new(Duration::from_millis(0));
        store.issue();
        store.issue();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.sweep(), 2);
    }
}
