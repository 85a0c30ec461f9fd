//! Configuration reload passes.
//!
//! A pass expands the configured names into addresses and reaffirms each one
//! with the aggregator between `begin_config_reload` and
//! `end_config_reload`, so agents that dropped out of the configuration are
//! disconnected when the pass ends.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::ServersConfig;
use crate::error::MonitorError;
use crate::metrics;
use crate::resolver::{resolve_name, NameResolver};

/// Outcome of one reload pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Addresses handed to the aggregator.
    pub addresses: usize,
    /// Names that could not be resolved.
    pub failures: usize,
    /// Connections stopped because the pass did not reaffirm them.
    pub evicted: usize,
}

/// Split a TXT discovery entry `"<txt name>, <base domain>"`.
pub fn parse_txt_entry(entry: &str) -> Result<(&str, &str), MonitorError> {
    let (name, base) = entry
        .split_once(',')
        .ok_or_else(|| MonitorError::InvalidTxtSpec(entry.to_string()))?;
    let (name, base) = (name.trim(), base.trim());
    if name.is_empty() || base.is_empty() {
        return Err(MonitorError::InvalidTxtSpec(entry.to_string()));
    }
    Ok((name, base))
}

/// Host names listed by TXT strings, each label qualified with `base`.
pub fn expand_txt_hosts(txts: &[String], base: &str) -> Vec<String> {
    txts.iter()
        .flat_map(|txt| txt.split_whitespace())
        .map(|label| format!("{label}.{base}"))
        .collect()
}

/// Expands configuration into addresses and feeds them to the aggregator.
pub struct Reloader {
    hub: Aggregator,
    resolver: Arc<dyn NameResolver>,
}

impl Reloader {
    /// Create a reloader for `hub`.
    pub fn new(hub: Aggregator, resolver: Arc<dyn NameResolver>) -> Self {
        Self { hub, resolver }
    }

    /// Run one full reload pass for `servers`.
    ///
    /// Names that fail to resolve are logged and counted; only a closed
    /// aggregator aborts the pass.
    pub async fn apply(&self, servers: &ServersConfig) -> Result<ReloadReport, MonitorError> {
        let epoch = self.hub.begin_config_reload().await?;
        debug!(epoch, "running configuration");

        let mut report = ReloadReport::default();
        let names = self.expand_names(servers, &mut report).await;

        for name in &names {
            match resolve_name(self.resolver.as_ref(), name).await {
                Ok(addrs) => {
                    for ip in addrs {
                        self.add(ip).await?;
                        report.addresses += 1;
                    }
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "Could not add server");
                    report.failures += 1;
                }
            }
        }

        report.evicted = self.hub.end_config_reload().await?;
        metrics::record_reload(report.addresses, report.failures);
        info!(
            epoch,
            addresses = report.addresses,
            failures = report.failures,
            evicted = report.evicted,
            "configuration applied"
        );
        Ok(report)
    }

    async fn add(&self, ip: IpAddr) -> Result<(), MonitorError> {
        let id = self.hub.add_address(ip).await?;
        debug!(%ip, connection_id = %id, "monitoring address");
        Ok(())
    }

    /// Every host name named by the configuration, in configuration order.
    async fn expand_names(&self, servers: &ServersConfig, report: &mut ReloadReport) -> Vec<String> {
        let mut names = servers.a.clone();

        for domain in &servers.domain {
            match self.resolver.lookup_ns(domain).await {
                Ok(hosts) => {
                    debug!(domain = %domain, nameservers = ?hosts, "adding NSes");
                    names.extend(hosts);
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Could not look up NS records");
                    report.failures += 1;
                }
            }
        }

        for entry in &servers.txt {
            let (txt_name, base) = match parse_txt_entry(entry) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Skipping TXT entry");
                    report.failures += 1;
                    continue;
                }
            };

            match self.resolver.lookup_txt(txt_name).await {
                Ok(txts) => {
                    debug!(txt_name, base, txts = ?txts, "adding TXT hosts");
                    names.extend(expand_txt_hosts(&txts, base));
                }
                Err(e) => {
                    warn!(txt_name, error = %e, "Could not look up TXT records");
                    report.failures += 1;
                }
            }
        }

        names
    }

    /// Apply the configuration now and then every `interval` until `shutdown`
    /// is cancelled.
    ///
    /// `load` runs on the blocking pool before every pass; when it fails the
    /// pass is skipped and every agent stays connected. Cancelling `shutdown`
    /// abandons a pass in progress.
    pub async fn run<F>(self, load: F, interval: Duration, shutdown: CancellationToken)
    where
        F: Fn() -> Result<ServersConfig, MonitorError> + Send + Sync + 'static,
    {
        let load = Arc::new(load);

        loop {
            let pass = async {
                let loader = load.clone();
                let servers = tokio::task::spawn_blocking(move || loader())
                    .await
                    .unwrap_or_else(|e| {
                        Err(MonitorError::Config(format!("config loader panicked: {e}")))
                    });
                match servers {
                    Ok(servers) => self.apply(&servers).await.map(|_| ()),
                    Err(e) => {
                        error!(error = %e, "Could not read config file");
                        Ok(())
                    }
                }
            };

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("reload loop shutting down");
                    return;
                }
                result = pass => result,
            };

            match result {
                Ok(()) => {}
                Err(MonitorError::HubClosed) => {
                    info!("aggregator closed, stopping configuration reloads");
                    return;
                }
                Err(e) => error!(error = %e, "configuration pass failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("reload loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
