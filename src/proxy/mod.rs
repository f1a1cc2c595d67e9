//! Reverse proxying
//!
//! Two proxy paths share the plumbing in [`headers`]: the backend proxy
//! (authenticated, prefix-stripped, HTML-composing) and the IdP proxy
//! (unauthenticated, URL/cookie/body-rewriting).

pub mod backend;
pub mod headers;
pub mod idp;

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::timeouts;
use crate::{Error, Result};

/// Idle connections kept per upstream origin.
const POOL_MAX_IDLE_PER_ORIGIN: usize = 64;

/// In-flight requests allowed per upstream origin.
const MAX_IN_FLIGHT_PER_ORIGIN: usize = 256;

/// Shared upstream HTTP client with a per-origin in-flight bound.
///
/// The reqwest pool bounds idle connections; the semaphore map bounds
/// concurrency so one slow backend cannot absorb every task. Permits are
/// held for the life of the response body, including streamed ones.
#[derive(Clone)]
pub struct ProxyClient {
    http: Client,
    inflight: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl ProxyClient {
    /// Build the shared client.
    ///
    /// Redirects are never followed: they belong to the browser.
    ///
    /// # Errors
    ///
    /// Returns an error when the TLS backend cannot be initialized.
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(timeouts::CONNECT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_ORIGIN)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            inflight: Arc::new(DashMap::new()),
        })
    }

    /// The underlying reqwest client.
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Acquire an in-flight permit for `origin`.
    pub async fn acquire(&self, origin: &str) -> OwnedSemaphorePermit {
        let semaphore = self
            .inflight
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(MAX_IN_FLIGHT_PER_ORIGIN)))
            .clone();
        // Only fails if the semaphore is closed, which never happens here.
        semaphore
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("inflight semaphore closed"))
    }
}
