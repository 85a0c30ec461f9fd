//! Agent status records and the frames agents stream to the monitor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Identifier of one connection to one agent address.
///
/// Allocated from 1 upwards by the aggregator and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One status frame as sent by an agent.
///
/// Every field is optional on the wire. Empty strings, empty lists and zero
/// numbers mean "not reported".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    /// Connection the frame arrived on; filled in by the connection worker.
    #[serde(skip)]
    pub connection_id: Option<ConnectionId>,

    /// Hostname of the agent.
    #[serde(rename = "h")]
    pub hostname: String,

    /// Stable identifier, shown as the record name.
    pub id: String,

    /// Software version.
    #[serde(rename = "v")]
    pub version: String,

    /// Groups the agent serves.
    pub groups: Vec<String>,

    /// Address the agent believes it is reachable on.
    pub ip: String,

    /// Uptime in seconds.
    #[serde(rename = "up")]
    pub uptime: i64,

    /// Cumulative query count.
    #[serde(rename = "qs")]
    pub queries: i64,

    /// Current queries per second.
    pub qps: f64,

    /// One minute average queries per second.
    #[serde(rename = "qps1m")]
    pub qps1m: f64,

    /// Start time marker.
    pub started: i64,

    /// Stable UUID of the agent process, if it reports one.
    pub uuid: String,
}

impl StatusUpdate {
    /// Attach the connection id the frame was received on.
    pub fn on_connection(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }
}

/// The merged view of one monitored agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    /// Connection currently owning this record.
    pub connection_id: ConnectionId,
    /// Stable identifier reported by the agent.
    pub name: String,
    /// Hostnames the agent has reported, oldest first.
    pub names: Vec<String>,
    /// Groups the agent serves.
    pub groups: Vec<String>,
    /// Address the connection was made to.
    pub ip: String,
    /// Stable UUID reported by the agent.
    pub uuid: String,
    /// Software version.
    pub version: String,
    /// Cumulative query count.
    pub queries: i64,
    /// Current queries per second.
    pub qps: f64,
    /// One minute average queries per second.
    pub qps1m: f64,
    /// Uptime in seconds.
    pub uptime: i64,
    /// Lifecycle or error text of the connection.
    pub status: String,
    /// When a status frame was last merged; `None` until the first one.
    #[serde(skip)]
    pub last_update: Option<SystemTime>,
}

impl AgentRecord {
    /// A fresh record for a connection that has not reported yet.
    pub fn new(connection_id: ConnectionId, ip: impl Into<String>) -> Self {
        Self {
            connection_id,
            name: String::new(),
            names: Vec::new(),
            groups: Vec::new(),
            ip: ip.into(),
            uuid: String::new(),
            version: String::new(),
            queries: 0,
            qps: 0.0,
            qps1m: 0.0,
            uptime: 0,
            status: String::new(),
            last_update: None,
        }
    }

    /// True once the agent has reported, or the connection has a status.
    pub fn is_observed(&self) -> bool {
        self.last_update.is_some() || !self.status.is_empty()
    }

    /// Merge a status frame into the record.
    ///
    /// Only fields the frame actually reports are copied; unreported fields
    /// keep their previous value.
    pub fn merge(&mut self, update: &StatusUpdate, now: SystemTime) {
        self.last_update = Some(now);

        if !update.version.is_empty() {
            self.version.clone_from(&update.version);
        }
        if !update.id.is_empty() {
            self.name.clone_from(&update.id);
        }
        if !update.uuid.is_empty() {
            self.uuid.clone_from(&update.uuid);
        }
        if update.uptime > 0 {
            self.uptime = update.uptime;
        }
        if update.queries > 0 {
            self.queries = update.queries;
        }
        if update.qps > 0.0 {
            self.qps = update.qps;
        }
        if update.qps1m > 0.0 {
            self.qps1m = update.qps1m;
        }
        if !update.hostname.is_empty() && !self.names.contains(&update.hostname) {
            self.names.push(update.hostname.clone());
        }
        if !update.groups.is_empty() {
            self.groups.clone_from(&update.groups);
        }
    }
}
