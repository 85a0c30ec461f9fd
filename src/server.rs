//! Monitor server setup and lifecycle management.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::{Config, ServersConfig};
use crate::connection::ConnectionSettings;
use crate::error::MonitorError;
use crate::reload::Reloader;
use crate::resolver::{HickoryResolver, NameResolver};

/// Monitor hub: aggregator, configuration reloads and the status API.
pub struct MonitorServer {
    config: Config,
    config_path: Option<PathBuf>,
    resolver: Arc<dyn NameResolver>,
}

impl MonitorServer {
    /// Create a server using the system DNS resolver.
    pub fn new(config: Config) -> Result<Self, MonitorError> {
        let resolver = HickoryResolver::from_system_conf()?;
        Ok(Self::with_resolver(config, Arc::new(resolver)))
    }

    /// Create a server with a custom resolver.
    pub fn with_resolver(config: Config, resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            config,
            config_path: None,
            resolver,
        }
    }

    /// Re-read the `[servers]` section from `path` before every reload pass.
    ///
    /// Without a path the servers of the initial configuration are reused.
    pub fn reload_from(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), MonitorError> {
        let listener = TcpListener::bind(self.config.http.listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Run on an already bound status API listener until `shutdown` is
    /// cancelled.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), MonitorError> {
        info!(
            listen_addr = ?listener.local_addr().ok(),
            agent_port = self.config.monitor.agent_port,
            reload_interval_secs = self.config.monitor.reload_interval_secs,
            "Starting dns-monitor"
        );

        let hub = Aggregator::start(ConnectionSettings::from(&self.config.monitor));

        let reloader = Reloader::new(hub.clone(), self.resolver.clone());
        let initial = self.config.servers.clone();
        let path = self.config_path.clone();
        let load = move || -> Result<ServersConfig, MonitorError> {
            match &path {
                Some(path) => Config::load(path).map(|config| config.servers),
                None => Ok(initial.clone()),
            }
        };
        let reload_handle = tokio::spawn(reloader.run(
            load,
            self.config.monitor.reload_interval(),
            shutdown.clone(),
        ));

        let mut http_handle =
            tokio::spawn(crate::http::serve(listener, hub.clone(), shutdown.clone()));

        // The status API only finishes early if it fails; take everything
        // else down with it.
        let finished = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("dns-monitor shutdown requested");
                None
            }
            joined = &mut http_handle => Some(joined),
        };
        shutdown.cancel();

        let joined = match finished {
            Some(joined) => joined,
            None => http_handle.await,
        };
        let http_result = joined.unwrap_or_else(|e| {
            Err(MonitorError::Http(format!("status API task panicked: {e}")))
        });
        if let Err(e) = &http_result {
            error!(error = %e, "status API failed");
        }

        if let Err(e) = reload_handle.await {
            error!("reload task panicked: {}", e);
        }

        match hub.shutdown().await {
            Ok(()) | Err(MonitorError::HubClosed) => {}
            Err(e) => warn!(error = %e, "aggregator shutdown failed"),
        }

        info!("dns-monitor stopped");
        http_result
    }
}
