//! Account token cache
//!
//! A single token is issued lazily and shared by every component holding
//! the manager. Issuance is serialized, so concurrent first callers wait for
//! the one in-flight request instead of issuing their own.

use crate::api::ContentApi;
use crate::error::FetchError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Opaque auth credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(Arc::from(token.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Issues and caches the account token
pub struct TokenManager {
    api: ContentApi,
    cached: Mutex<Option<Credential>>,
    issued: AtomicU64,
}

impl TokenManager {
    pub fn new(api: ContentApi) -> Self {
        Self {
            api,
            cached: Mutex::new(None),
            issued: AtomicU64::new(0),
        }
    }

    /// Start with a pre-issued token; issuance only happens after it is invalidated
    pub fn with_static(api: ContentApi, token: impl AsRef<str>) -> Self {
        Self {
            api,
            cached: Mutex::new(Some(Credential::new(token))),
            issued: AtomicU64::new(0),
        }
    }

    /// Return the cached credential, issuing one if none is cached
    pub async fn acquire(&self) -> Result<Credential, FetchError> {
        // Held across the issuance call so concurrent callers share its result
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            return Ok(credential.clone());
        }

        let token = self.api.issue_token().await?;
        let credential = Credential::new(token);
        self.issued.fetch_add(1, Ordering::AcqRel);
        info!("Issued new account token");
        *cached = Some(credential.clone());
        Ok(credential)
    }

    /// Drop `stale` from the cache if it is still the current credential
    pub async fn invalidate(&self, stale: &Credential) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref() == Some(stale) {
            warn!("Account token rejected, invalidating");
            *cached = None;
        }
    }

    /// Number of issuance requests made so far
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }
}
