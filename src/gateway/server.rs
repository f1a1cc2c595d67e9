//! Gateway server
//!
//! Owns the listener lifecycle: bind (the process assumes any capability
//! needed for a privileged port was granted externally; otherwise the bind
//! fails and the process exits with the bind error code), optional TLS from
//! PEM materials, graceful shutdown on SIGINT/SIGTERM, and the registry
//! file watcher.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::signal;
use tracing::info;

use crate::auth::{JwksCache, TokenValidator};
use crate::compose::theme::ServiceTokenProvider;
use crate::compose::{Composer, ThemeClient};
use crate::config::Config;
use crate::oauth::OAuthBroker;
use crate::proxy::ProxyClient;
use crate::registry::{Registry, RegistryWatcher};
use crate::session::SessionStore;
use crate::{Error, Result};

use super::router::{create_router, AppState};

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The assembled gateway.
pub struct Gateway {
    config: Arc<Config>,
    registry: Registry,
    state: Arc<AppState>,
}

impl Gateway {
    /// Wire up every component from the loaded configuration.
    ///
    /// # Errors
    ///
    /// Fails when the registry document is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let registry = Registry::load(&config.services_file)?;

        let proxy = ProxyClient::new()?;
        let http = proxy.http().clone();

        let jwks = Arc::new(JwksCache::new(http.clone(), &config.auth_service_url));
        let validator = TokenValidator::new(
            http.clone(),
            jwks,
            &config.auth_service_url,
            &config.auth_issuer,
        );

        let tokens =
            ServiceTokenProvider::new(http.clone(), &config.auth_service_url, &config.theme_service);
        let composer = Composer::new(ThemeClient::new(http.clone(), tokens, &config.theme_service));

        let sessions = SessionStore::new(config.cookie_key(), config.tls_enabled());
        let broker = OAuthBroker::new(http, Arc::clone(&config));

        let state = Arc::new(AppState {
            config: Arc::clone(&config),
            registry: registry.clone(),
            sessions,
            validator,
            proxy,
            composer,
            broker,
        });

        Ok(Self {
            config,
            registry,
            state,
        })
    }

    /// Run the gateway until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// [`Error::Bind`] when the socket cannot be bound, [`Error::Tls`] when
    /// the certificate or key cannot be loaded.
    pub async fn run(self) -> Result<()> {
        let listener = std::net::TcpListener::bind(self.config.listen_addr)
            .map_err(|e| Error::Bind(format!("{}: {e}", self.config.listen_addr)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Bind(e.to_string()))?;

        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        let _watcher = RegistryWatcher::start(
            self.config.services_file.clone(),
            self.registry.clone(),
            shutdown_tx.subscribe(),
        )?;

        let app = create_router(Arc::clone(&self.state))
            .into_make_service_with_connect_info::<SocketAddr>();

        let handle = Handle::new();
        tokio::spawn(shutdown_on_signal(handle.clone(), shutdown_tx));

        info!(
            addr = %self.config.listen_addr,
            tls = self.config.tls_enabled(),
            services = self.registry.snapshot().len(),
            "Gateway listening"
        );

        if let (Some(cert), Some(key)) = (&self.config.tls_cert, &self.config.tls_key) {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::Tls(format!("{}: {e}", cert.display())))?;
            axum_server::from_tcp_rustls(listener, tls)
                .handle(handle)
                .serve(app)
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        } else {
            axum_server::from_tcp(listener)
                .handle(handle)
                .serve(app)
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM, then drain gracefully.
async fn shutdown_on_signal(handle: Handle, shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
