//! tagwriter - NFC tag write orchestration.
//!
//! ```text
//! tagwriter serve --mode local    # backend with the reader attached
//! tagwriter serve --mode cloud    # backend without hardware, queue only
//! tagwriter agent                 # polls a cloud backend and writes locally
//! ```
//!
//! Every flag can also be set through the environment (see `--help`); a
//! `.env` file in the working directory is loaded first.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tagwriter_core::SharedSecret;
use tagwriter_core::constants::{
    DEFAULT_AGENT_POLL_INTERVAL_MS, DEFAULT_BIND_ADDR, DEFAULT_EXPIRY_SWEEP_SECS,
    DEFAULT_PENDING_TTL_SECS, DEFAULT_SERVER_URL, DEFAULT_WRITE_TIMEOUT_MS, MAX_WRITE_TIMEOUT_MS,
    MIN_WRITE_TIMEOUT_MS,
};
use tagwriter_hardware::mock::MockReaderDriver;
use tagwriter_hardware::{AnyReaderDriver, HardwareHub, HubConfig};
use tagwriter_network::{Agent, AgentConfig, AppState, HttpCommandSource, ServerConfig};
use tagwriter_session::{CoordinatorConfig, WriteCoordinator};
use tagwriter_storage::{Database, DatabaseConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tagwriter", version)]
#[command(about = "NFC tag write orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket backend
    Serve {
        /// local: reader attached to this host; cloud: queue only
        #[arg(long, value_enum, env = "TAGWRITER_MODE", default_value_t = Mode::Local)]
        mode: Mode,

        #[arg(long, env = "TAGWRITER_BIND", default_value = DEFAULT_BIND_ADDR)]
        bind: SocketAddr,

        /// SQLite database file of the command queue
        #[arg(long, env = "TAGWRITER_DATABASE", default_value = "tagwriter.db")]
        database: String,

        /// Pre-shared agent secret; agent endpoints are disabled without it
        #[arg(long, env = "TAGWRITER_AGENT_SECRET", hide_env_values = true)]
        agent_secret: Option<String>,

        /// Age after which an unclaimed command is failed (seconds)
        #[arg(long, env = "TAGWRITER_PENDING_TTL_SECS", default_value_t = DEFAULT_PENDING_TTL_SECS)]
        pending_ttl_secs: u64,

        /// Interval of the expiry sweep (seconds)
        #[arg(long, env = "TAGWRITER_SWEEP_SECS", default_value_t = DEFAULT_EXPIRY_SWEEP_SECS)]
        sweep_secs: u64,

        #[command(flatten)]
        hardware: HardwareArgs,
    },

    /// Poll a backend for queued commands and write them locally
    Agent {
        /// Backend base URL
        #[arg(long, env = "TAGWRITER_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
        server_url: String,

        #[arg(long, env = "TAGWRITER_AGENT_SECRET", hide_env_values = true)]
        agent_secret: String,

        /// Delay between two claim attempts (milliseconds)
        #[arg(long, env = "TAGWRITER_POLL_INTERVAL_MS", default_value_t = DEFAULT_AGENT_POLL_INTERVAL_MS)]
        poll_interval_ms: u64,

        #[command(flatten)]
        hardware: HardwareArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Local,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    /// Simulated reader, for development
    Mock,
    /// PC/SC readers (build with `--features hardware-pcsc`)
    Pcsc,
}

impl Default for DriverKind {
    fn default() -> Self {
        if cfg!(feature = "hardware-pcsc") {
            Self::Pcsc
        } else {
            Self::Mock
        }
    }
}

#[derive(clap::Args)]
struct HardwareArgs {
    #[arg(long, value_enum, env = "TAGWRITER_DRIVER", default_value_t = DriverKind::default())]
    driver: DriverKind,

    /// Tag wait of a write session (milliseconds)
    #[arg(long, env = "TAGWRITER_WRITE_TIMEOUT_MS", default_value_t = DEFAULT_WRITE_TIMEOUT_MS)]
    write_timeout_ms: u64,
}

impl HardwareArgs {
    fn write_timeout(&self) -> Duration {
        Duration::from_millis(
            self.write_timeout_ms
                .clamp(MIN_WRITE_TIMEOUT_MS, MAX_WRITE_TIMEOUT_MS),
        )
    }

    fn driver(&self) -> Result<AnyReaderDriver> {
        match self.driver {
            DriverKind::Mock => {
                warn!("Using the simulated reader driver; no tag will ever be presented");
                let (driver, _handle) = MockReaderDriver::new();
                Ok(AnyReaderDriver::from(driver))
            }
            #[cfg(feature = "hardware-pcsc")]
            DriverKind::Pcsc => {
                let driver = tagwriter_hardware::pcsc::PcscReaderDriver::new()
                    .context("Failed to open the PC/SC context")?;
                Ok(AnyReaderDriver::from(driver))
            }
            #[cfg(not(feature = "hardware-pcsc"))]
            DriverKind::Pcsc => anyhow::bail!("tagwriter was built without PC/SC support"),
        }
    }

    /// Hub and coordinator around the selected driver.
    async fn coordinator(&self) -> Result<WriteCoordinator> {
        let hub = HardwareHub::new(self.driver()?, HubConfig::default());
        hub.initialize()
            .await
            .context("Reader driver failed to start")?;

        let config = CoordinatorConfig::default().with_default_timeout(self.write_timeout());
        Ok(WriteCoordinator::new(hub, config))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tagwriter_session=debug,tagwriter_network=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        }
    });

    match cli.command {
        Commands::Serve {
            mode,
            bind,
            database,
            agent_secret,
            pending_ttl_secs,
            sweep_secs,
            hardware,
        } => {
            let agent_secret = agent_secret
                .map(SharedSecret::new)
                .transpose()
                .context("Invalid agent secret")?;
            if agent_secret.is_none() {
                warn!("No agent secret configured; agent endpoints are disabled");
            }

            let db = Database::new(DatabaseConfig::new(database))
                .await
                .context("Failed to open the command database")?;

            let mut config = ServerConfig::default()
                .with_bind_addr(bind)
                .with_pending_ttl(Duration::from_secs(pending_ttl_secs))
                .with_sweep_interval(Duration::from_secs(sweep_secs));

            let coordinator = match mode {
                Mode::Local => {
                    // Queued commands are written by the reader attached here.
                    config = config.with_local_agent(
                        AgentConfig::default().with_write_timeout(hardware.write_timeout()),
                    );
                    Some(hardware.coordinator().await?)
                }
                Mode::Cloud => None,
            };
            let hub = coordinator.as_ref().map(|c| c.hub().clone());

            info!(?mode, %bind, "Starting tagwriter backend");
            let state = AppState::new(db.clone(), coordinator, agent_secret);

            let served = tagwriter_network::serve(config, state, shutdown).await;

            if let Some(hub) = hub {
                hub.shutdown();
            }
            db.close().await;
            served?;
            Ok(())
        }

        Commands::Agent {
            server_url,
            agent_secret,
            poll_interval_ms,
            hardware,
        } => {
            let secret = SharedSecret::new(agent_secret).context("Invalid agent secret")?;
            let source = HttpCommandSource::new(&server_url, secret)?;
            let coordinator = hardware.coordinator().await?;

            let config = AgentConfig::default()
                .with_poll_interval(Duration::from_millis(poll_interval_ms.max(100)))
                .with_write_timeout(hardware.write_timeout());

            info!(server_url = %source.base_url(), "Starting tagwriter agent");
            let hub = coordinator.hub().clone();
            Agent::new(source, coordinator, config).run(shutdown).await;
            hub.shutdown();
            Ok(())
        }
    }
}
