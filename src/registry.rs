//! Service registry
//!
//! Maps service names to backend origins. The registry is loaded from a JSON
//! document (`services.json`), published as an immutable snapshot, and
//! re-published atomically when the document changes on disk. Readers clone
//! the current `Arc` and never observe a partially-parsed document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::{Error, Result};

/// Ordered permission levels: `admin ⊇ billing ⊇ user`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Regular user (the auth service historically calls this `client`)
    #[serde(alias = "client")]
    User,
    /// Billing staff
    Billing,
    /// Administrator
    Admin,
}

/// One registered backend service.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Registry key; also the routing path prefix
    pub name: String,
    /// Backend origin requests are forwarded to
    pub origin: Url,
    /// Whether the service appears in the navigation panel
    pub visible: bool,
    /// Minimum permission level required to reach the service
    pub min_role: PermissionLevel,
}

/// Raw per-service document shape (`services.json` values).
#[derive(Debug, Deserialize)]
struct RawEntry {
    url: String,
    #[serde(default)]
    visible: bool,
    #[serde(default)]
    admin_only: bool,
    #[serde(default)]
    billing_or_admin_only: bool,
}

/// An immutable, validated registry snapshot.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    entries: HashMap<String, ServiceEntry>,
    /// Names in document order, for a stable navigation panel
    order: Vec<String>,
}

impl RegistrySnapshot {
    /// Parse and validate a `services.json` document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] on malformed JSON, an invalid service
    /// name, or a non-absolute origin URL.
    pub fn parse(json: &str) -> Result<Self> {
        // serde_json::Map preserves insertion order via the preserve_order
        // feature, which keeps the navigation panel stable across reloads.
        let raw: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json).map_err(|e| Error::Registry(e.to_string()))?;

        let mut entries = HashMap::with_capacity(raw.len());
        let mut order = Vec::with_capacity(raw.len());

        for (name, value) in raw {
            if !is_valid_name(&name) {
                return Err(Error::Registry(format!(
                    "invalid service name '{name}': must match [a-z0-9_-]+"
                )));
            }

            let raw_entry: RawEntry = serde_json::from_value(value)
                .map_err(|e| Error::Registry(format!("service '{name}': {e}")))?;

            let origin = Url::parse(&raw_entry.url)
                .map_err(|e| Error::Registry(format!("service '{name}': bad url: {e}")))?;
            if !matches!(origin.scheme(), "http" | "https") || origin.host_str().is_none() {
                return Err(Error::Registry(format!(
                    "service '{name}': origin must be an absolute http(s) URL"
                )));
            }

            let min_role = if raw_entry.admin_only {
                PermissionLevel::Admin
            } else if raw_entry.billing_or_admin_only {
                PermissionLevel::Billing
            } else {
                PermissionLevel::User
            };

            order.push(name.clone());
            entries.insert(
                name.clone(),
                ServiceEntry {
                    name,
                    origin,
                    visible: raw_entry.visible,
                    min_role,
                },
            );
        }

        Ok(Self { entries, order })
    }

    /// Look up a service by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ServiceEntry> {
        self.entries.get(name)
    }

    /// Visible services the given permission level may reach, in document
    /// order. Admin sees all visible entries; billing sees everything not
    /// admin-only; user sees unrestricted entries.
    #[must_use]
    pub fn visible_for(&self, level: PermissionLevel) -> Vec<&ServiceEntry> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .filter(|e| e.visible && level >= e.min_role)
            .collect()
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Live, atomically-swappable registry snapshot shared across the gateway.
///
/// Readers take a read-lock and clone the inner `Arc`; reload swaps the whole
/// `Arc` under a write-lock, so readers are never blocked for more than a
/// pointer-width swap.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Arc<RegistrySnapshot>>>,
}

impl Registry {
    /// Load the initial snapshot from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] when the file cannot be read or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let snapshot = read_snapshot(path)?;
        info!(services = snapshot.len(), path = %path.display(), "Loaded service registry");
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        })
    }

    /// Build a registry directly from a snapshot (tests, embedded use).
    #[must_use]
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// Clone the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.inner.read())
    }

    /// Atomically replace the current snapshot.
    pub fn publish(&self, snapshot: RegistrySnapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }
}

fn read_snapshot(path: &Path) -> Result<RegistrySnapshot> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| Error::Registry(format!("cannot read {}: {e}", path.display())))?;
    RegistrySnapshot::parse(&json)
}

/// File watcher that re-publishes the registry when `services.json` changes.
///
/// Holds the underlying `notify` watcher alive for the lifetime of the
/// struct. A document that fails validation is logged and skipped; the
/// previous snapshot stays published.
pub struct RegistryWatcher {
    /// Kept alive to prevent the OS watcher from being dropped.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl RegistryWatcher {
    /// Start watching `path` for changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        path: PathBuf,
        registry: Registry,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(32);

        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let path_for_closure = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant = result
                    .as_ref()
                    .is_ok_and(|e| e.paths.iter().any(|p| p.ends_with(&path_for_closure) || *p == path_for_closure));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create registry watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("Failed to watch {}: {e}", watch_dir.display())))?;

        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            let mut last_event: Option<Instant> = None;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        last_event = Some(Instant::now());
                    }
                    _ = ticker.tick() => {
                        let due = last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE);
                        if due {
                            last_event = None;
                            match read_snapshot(&path) {
                                Ok(snapshot) => {
                                    info!(services = snapshot.len(), "Registry reloaded");
                                    registry.publish(snapshot);
                                }
                                Err(e) => {
                                    warn!(error = %e, "Registry reload failed; keeping previous snapshot");
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }
}
