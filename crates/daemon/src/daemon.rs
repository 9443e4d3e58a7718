//! Daemon startup and main loop for relaycast
//!
//! Wires the store, channel supervisor and delivery gateway together, runs
//! the channel monitor and serves HTTP until Ctrl-C.

use crate::channel::{ChannelSupervisor, SupervisorSettings};
use crate::config::{Config, ConfigError};
use crate::encode::{EncoderLauncher, FfmpegLauncher};
use crate::gateway::{AccessPolicy, DeliveryGateway};
use crate::server::{serve, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{SqliteStore, StoreError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Store could not be opened
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Anything else that prevents wiring the daemon
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Channels, shares and catalog
    pub store: Arc<SqliteStore>,
    pub supervisor: Arc<ChannelSupervisor>,
    pub gateway: Arc<DeliveryGateway>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// Loads the config, applies environment overrides, runs the startup
    /// checks and opens the store.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when the encoder is not installed.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let launcher = Arc::new(FfmpegLauncher::new(config.encoder.program.clone()));
        Self::with_launcher(config, launcher)
    }

    /// Initialize with a custom encoder launcher.
    pub fn with_launcher(
        config: Config,
        launcher: Arc<dyn EncoderLauncher>,
    ) -> Result<Self, DaemonError> {
        let store = Arc::new(SqliteStore::open(&config.storage.database_path)?);
        let policy = AccessPolicy::from_config(&config)
            .map_err(|e| DaemonError::Init(format!("interface access list: {}", e)))?;

        let supervisor = Arc::new(ChannelSupervisor::new(
            store.clone(),
            store.clone(),
            launcher,
            SupervisorSettings::from_config(&config),
        ));
        let gateway = Arc::new(DeliveryGateway::new(store.clone(), store.clone(), policy));

        info!(
            database = %config.storage.database_path.display(),
            share = config.features.share,
            channel = config.features.channel,
            access_control = config.features.access_control,
            "daemon initialized"
        );

        Ok(Self {
            config,
            store,
            supervisor,
            gateway,
        })
    }

    /// Handler state for the HTTP server
    pub fn app_state(&self) -> AppState {
        AppState {
            supervisor: self.supervisor.clone(),
            gateway: self.gateway.clone(),
            shares: self.store.clone(),
            web_path: self.config.server.web_path.trim_end_matches('/').to_string(),
            admin_token: self.config.server.admin_token.clone(),
            channels_enabled: self.config.features.channel,
        }
    }

    /// Start the channel monitor
    ///
    /// Periodically clears channels whose encoder has died so they report
    /// "Stopped" and restart on the next request.
    pub fn start_channel_monitor(&self) -> tokio::task::JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let period = Duration::from_millis(self.config.channel.monitor_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match supervisor.reconcile().await {
                    Ok(0) => {}
                    Ok(healed) => info!(healed, "channel monitor cleared lost encoders"),
                    Err(e) => warn!(error = %e, "channel monitor tick failed"),
                }
            }
        })
    }

    /// Run the daemon until Ctrl-C
    ///
    /// Every running channel is stopped once shutdown is requested; listener
    /// bodies end with their feed, so the server can drain.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let listener =
            TcpListener::bind((self.config.server.bind.as_str(), self.config.server.port))
                .await
                .map_err(ServerError::from)?;
        let local = listener.local_addr().map_err(ServerError::from)?;
        info!(addr = %local, web_path = %self.config.server.web_path, "listening");

        let monitor = if self.config.features.channel {
            Some(self.start_channel_monitor())
        } else {
            None
        };

        let supervisor = self.supervisor.clone();
        let shutdown = async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
            supervisor.shutdown_all().await;
        };
        let result = serve(listener, self.app_state(), shutdown).await;

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        result.map_err(DaemonError::from)
    }
}
