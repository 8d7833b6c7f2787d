//! Server setup and lifecycle management

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::{DaemonConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::sweeper::EscalationSweeper;
use approval_engine::{ApprovalEngine, BroadcastNotifier};
use approval_storage::{ApprovalStorage, InMemoryApprovalStorage};
use rbac_identity::InMemoryIdentityStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

/// Approval daemon server
pub struct Server {
    config: DaemonConfig,
    engine: Arc<ApprovalEngine>,
    identity: Arc<InMemoryIdentityStore>,
    notifier: Arc<BroadcastNotifier>,
}

impl Server {
    /// Create a new server with the given configuration
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let identity = Arc::new(load_identity(config.identity.seed_path.as_deref()).await?);
        let storage = open_storage(&config.storage).await?;
        let notifier = Arc::new(BroadcastNotifier::default());

        let engine = Arc::new(ApprovalEngine::new(
            storage,
            identity.clone(),
            notifier.clone(),
            config.engine.clone(),
        ));

        Ok(Self {
            config,
            engine,
            identity,
            notifier,
        })
    }

    pub fn engine(&self) -> &Arc<ApprovalEngine> {
        &self.engine
    }

    /// Run the server
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        let state = AppState::new(self.engine.clone(), self.identity.clone());
        let app = create_router(state, &self.config.server);

        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Approval daemon listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Event log
        let mut events = self.notifier.subscribe();
        let mut event_shutdown = shutdown_rx.clone();
        let event_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => tracing::info!(
                            event_type = event.event_type(),
                            instance_id = %event.instance_id(),
                            "Approval event"
                        ),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Approval event log lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = event_shutdown.changed() => break,
                }
            }
        });

        let sweeper_handle = if self.config.escalation.enabled {
            let sweeper = EscalationSweeper::new(
                self.engine.clone(),
                Duration::from_secs(self.config.escalation.interval_secs.max(1)),
            );
            Some(tokio::spawn(sweeper.run(shutdown_rx.clone())))
        } else {
            tracing::info!("Escalation sweeper disabled");
            None
        };

        // Run server with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("Approval daemon shutting down");

        // Receivers may already be gone
        let _ = shutdown_tx.send(true);
        if let Some(handle) = sweeper_handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Escalation sweeper task ended abnormally");
            }
        }
        if let Err(e) = event_handle.await {
            tracing::warn!(error = %e, "Event log task ended abnormally");
        }

        Ok(())
    }
}

async fn load_identity(seed_path: Option<&str>) -> DaemonResult<InMemoryIdentityStore> {
    match seed_path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path).await?;
            let store = InMemoryIdentityStore::from_seed_json(&raw)?;
            tracing::info!(path, "Identity seed loaded");
            Ok(store)
        }
        None => {
            tracing::warn!("No identity seed configured, starting with an empty identity store");
            Ok(InMemoryIdentityStore::new())
        }
    }
}

async fn open_storage(config: &StorageConfig) -> DaemonResult<Arc<dyn ApprovalStorage>> {
    match config {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory approval storage");
            Ok(Arc::new(InMemoryApprovalStorage::new()))
        }
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => open_postgres(url, *max_connections, *connect_timeout_secs).await,
    }
}

#[cfg(feature = "postgres")]
async fn open_postgres(
    url: &str,
    max_connections: u32,
    connect_timeout_secs: u64,
) -> DaemonResult<Arc<dyn ApprovalStorage>> {
    let storage = approval_storage::PostgresApprovalStorage::connect_with_options(
        url,
        max_connections,
        connect_timeout_secs,
    )
    .await
    .map_err(|e| DaemonError::Storage(e.to_string()))?;
    tracing::info!(max_connections, "Using PostgreSQL approval storage");
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(
    _url: &str,
    _max_connections: u32,
    _connect_timeout_secs: u64,
) -> DaemonResult<Arc<dyn ApprovalStorage>> {
    Err(DaemonError::Storage(
        "postgres storage requested but the daemon was built without the `postgres` feature"
            .to_string(),
    ))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
