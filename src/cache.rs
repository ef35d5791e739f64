//! Single slot token cache.
//!
//! Holds the last successful token response of the process together with the
//! instant it stops being valid. Staleness is checked on lookup; there is no
//! background eviction.

use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub body: String,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached response body, if it has not expired.
    pub async fn get(&self) -> Option<String> {
        self.get_at(Instant::now()).await
    }

    /// A hit requires `now` to be strictly before the stored expiry.
    pub async fn get_at(&self, now: Instant) -> Option<String> {
        let slot = self.slot.lock().await;
        match &*slot {
            Some(cached) if now < cached.expires_at => Some(cached.body.clone()),
            Some(_) => {
                debug!("Cached token has expired");
                None
            }
            None => None,
        }
    }

    /// Replace the cached entry with a response valid for `expires_in`.
    ///
    /// Returns false, leaving the slot untouched, when the expiry is not
    /// representable as an instant.
    pub async fn store(&self, body: String, expires_in: Duration) -> bool {
        match Instant::now().checked_add(expires_in) {
            Some(expires_at) => {
                self.store_at(body, expires_at).await;
                true
            }
            None => {
                warn!("Token lifetime of {:?} is out of range, not caching", expires_in);
                false
            }
        }
    }

    pub async fn store_at(&self, body: String, expires_at: Instant) {
        *self.slot.lock().await = Some(CachedToken { body, expires_at });
    }

    pub async fn clear(&self) {
        *self.slot.lock().await = None;
    }
}
