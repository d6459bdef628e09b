//! HTTP server for the tagwriter backend.
//!
//! Serves the API router and the `/ws` realtime channel, and runs the
//! pending-command expiry sweeper next to it. On a backend with the reader
//! attached, an in-process [`Agent`] also works through the command queue
//! when [`ServerConfig::local_agent`] is set. Everything stops when the
//! shutdown token fires; in-flight requests are allowed to finish.
//!
//! # Example Usage
//!
//! ```no_run
//! use tagwriter_network::{AppState, ServerConfig, serve};
//! use tagwriter_storage::Database;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::in_memory().await?;
//! let state = AppState::new(db, None, None);
//!
//! let shutdown = CancellationToken::new();
//! serve(ServerConfig::default(), state, shutdown).await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tagwriter_core::constants::{DEFAULT_EXPIRY_SWEEP_SECS, DEFAULT_PENDING_TTL_SECS};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{Agent, AgentConfig, LocalCommandSource};
use crate::api::{AppState, router};
use crate::sweeper::spawn_expiry_sweeper;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Age after which an unclaimed command is failed
    pub pending_ttl: Duration,

    /// Interval of the expiry sweep
    pub sweep_interval: Duration,

    /// Agent for queued commands, run in-process when the backend has a
    /// reader attached
    pub local_agent: Option<AgentConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            pending_ttl: Duration::from_secs(DEFAULT_PENDING_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_EXPIRY_SWEEP_SECS),
            local_agent: None,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(Duration::from_secs(1));
        self
    }

    pub fn with_local_agent(mut self, config: AgentConfig) -> Self {
        self.local_agent = Some(config);
        self
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind `config.bind_addr` and serve until `shutdown` fires.
pub async fn serve(
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|source| ServerError::BindFailed {
            addr: config.bind_addr,
            source,
        })?;

    serve_on(listener, config, state, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    state.fanout.start();
    let sweeper = spawn_expiry_sweeper(
        state.queue.clone(),
        state.fanout.clone(),
        config.pending_ttl,
        config.sweep_interval,
        shutdown.child_token(),
    );

    let local_agent = match (config.local_agent, state.coordinator.clone()) {
        (Some(agent_config), Some(coordinator)) => {
            let source = LocalCommandSource::new(state.queue.clone(), state.fanout.clone());
            Some(Agent::new(source, coordinator, agent_config))
        }
        (Some(_), None) => {
            warn!("No reader attached, queued commands wait for a remote agent");
            None
        }
        (None, _) => None,
    };

    let fanout = state.fanout.clone();
    let app = router(state);

    info!(addr = %listener.local_addr()?, "HTTP server listening");
    let signal = shutdown.clone();
    let http = async {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.cancelled().await;
                // Open WebSockets would otherwise hold the graceful shutdown.
                fanout.shutdown();
            })
            .await;
        // Stop the agent and the sweeper also when serving failed.
        shutdown.cancel();
        served
    };
    let agent = async {
        if let Some(agent) = &local_agent {
            agent.run(shutdown.child_token()).await;
        }
    };

    let (served, ()) = tokio::join!(http, agent);
    let _ = sweeper.await;

    info!("HTTP server stopped");
    Ok(served?)
}
