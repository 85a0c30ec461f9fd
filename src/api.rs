//! Read-only status view served to external readers.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use crate::duration::day_string;
use crate::status::AgentRecord;

/// One agent as shown by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    /// The merged record.
    #[serde(flatten)]
    pub record: AgentRecord,

    /// Time since the agent last reported; empty if it never has.
    pub last_update: String,

    /// Reported uptime; empty if the agent has not reported one.
    pub uptime_p: String,
}

impl AgentView {
    /// Derive the human readable durations for `record` as of `now`.
    pub fn new(record: AgentRecord, now: SystemTime) -> Self {
        let last_update = record
            .last_update
            .map(|at| day_string(now.duration_since(at).unwrap_or_default()))
            .unwrap_or_default();

        let uptime_p = match u64::try_from(record.uptime) {
            Ok(secs) if secs > 0 => day_string(Duration::from_secs(secs)),
            _ => String::new(),
        };

        Self {
            record,
            last_update,
            uptime_p,
        }
    }
}

/// Status of every observed agent, keyed by address.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    /// Agents by IP address.
    pub servers: BTreeMap<String, AgentView>,
}

impl StatusReport {
    /// Build the report from an aggregator snapshot.
    ///
    /// Records that have neither reported nor carry a status are left out.
    pub fn from_snapshot(records: Vec<AgentRecord>, now: SystemTime) -> Self {
        let servers = records
            .into_iter()
            .filter(AgentRecord::is_observed)
            .map(|record| (record.ip.clone(), AgentView::new(record, now)))
            .collect();
        Self { servers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::NOW;
    use crate::status::ConnectionId;

    fn record(id: u64, ip: &str) -> AgentRecord {
        AgentRecord::new(ConnectionId(id), ip)
    }

    #[test]
    fn test_unobserved_records_are_hidden() {
        let mut starting = record(1, "192.0.2.1");
        starting.status = "Starting".to_string();
        let silent = record(2, "192.0.2.2");

        let report = StatusReport::from_snapshot(vec![starting, silent], SystemTime::now());

        assert_eq!(report.servers.len(), 1);
        assert!(report.servers.contains_key("192.0.2.1"));
    }

    #[test]
    fn test_durations_are_rendered() {
        let now = SystemTime::now();
        let mut agent = record(1, "192.0.2.1");
        agent.last_update = Some(now - Duration::from_secs(5));
        agent.uptime = 3670;

        let view = AgentView::new(agent, now);

        assert_eq!(view.last_update, "5s");
        assert_eq!(view.uptime_p, "1h 1m");
    }

    #[test]
    fn test_fresh_update_renders_now() {
        let now = SystemTime::now();
        let mut agent = record(1, "192.0.2.1");
        agent.last_update = Some(now);

        let view = AgentView::new(agent, now);

        assert_eq!(view.last_update, NOW);
        assert_eq!(view.uptime_p, "");
    }

    #[test]
    fn test_report_json_shape() {
        let now = SystemTime::now();
        let mut agent = record(7, "192.0.2.1");
        agent.status = "Ok".to_string();
        agent.version = "2.4.1".to_string();

        let report = StatusReport::from_snapshot(vec![agent], now);
        let json = serde_json::to_value(&report).unwrap();

        let server = &json["servers"]["192.0.2.1"];
        assert_eq!(server["connection_id"], 7);
        assert_eq!(server["status"], "Ok");
        assert_eq!(server["version"], "2.4.1");
        assert_eq!(server["last_update"], "");
        assert_eq!(server["uptime_p"], "");
    }
}
