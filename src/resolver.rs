//! Name resolution for configured agents.
//!
//! Configured names may be literal addresses, hostnames, domains whose NS
//! hosts should be monitored, or TXT records listing host labels. Lookups go
//! through the [`NameResolver`] trait so reload passes can be tested without
//! a network.

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use std::net::IpAddr;
use tracing::debug;

use crate::error::MonitorError;

/// Directory lookups used when expanding the configuration.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Addresses of `host`.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, MonitorError>;

    /// Nameserver hostnames delegated for `domain`.
    async fn lookup_ns(&self, domain: &str) -> Result<Vec<String>, MonitorError>;

    /// Character strings of every TXT record at `name`.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, MonitorError>;
}

/// Resolve a configured name to the addresses to monitor.
///
/// A literal address is returned as is without any lookup. Lookup failures
/// and empty answers are both reported as [`MonitorError::Resolve`].
pub async fn resolve_name(
    resolver: &dyn NameResolver,
    name: &str,
) -> Result<Vec<IpAddr>, MonitorError> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let addrs = resolver.lookup_ip(name).await?;
    debug!(name, addrs = ?addrs, "resolved name");

    if addrs.is_empty() {
        return Err(MonitorError::Resolve {
            name: name.to_string(),
            reason: "no addresses found".to_string(),
        });
    }
    Ok(addrs)
}

/// [`NameResolver`] backed by hickory using the system resolver configuration.
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    /// Build a resolver from `/etc/resolv.conf` (or the platform equivalent).
    pub fn from_system_conf() -> Result<Self, MonitorError> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| MonitorError::Config(format!("could not read resolver config: {e}")))?
            .build();
        Ok(Self { resolver })
    }
}

fn resolve_error(name: &str, err: impl std::fmt::Display) -> MonitorError {
    MonitorError::Resolve {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl NameResolver for HickoryResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, MonitorError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| resolve_error(host, e))?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_ns(&self, domain: &str) -> Result<Vec<String>, MonitorError> {
        let lookup = self
            .resolver
            .ns_lookup(domain)
            .await
            .map_err(|e| resolve_error(domain, e))?;
        Ok(lookup
            .iter()
            .map(|ns| ns.to_string().trim_end_matches('.').to_string())
            .collect())
    }

    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, MonitorError> {
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| resolve_error(name, e))?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data))
                    .collect::<String>()
            })
            .collect())
    }
}
