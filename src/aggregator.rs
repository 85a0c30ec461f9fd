//! The status aggregator.
//!
//! One control-loop task owns every [`AgentRecord`] and the stop handle of
//! every [`Connection`]. All other tasks talk to it through the cloneable
//! [`Aggregator`] handle, which queues commands on an mpsc channel and waits
//! for replies on oneshot channels. Commands are applied one at a time in
//! arrival order, so the record collection needs no lock.
//!
//! Responsibilities of the loop:
//! - allocate connection ids (from 1, never reused)
//! - keep at most one record per address
//! - merge status frames and resolve duplicate agents by UUID
//! - track configuration epochs and evict connections a reload did not
//!   reaffirm

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::connection::{Connection, ConnectionSettings};
use crate::error::MonitorError;
use crate::metrics::{self, StopReason};
use crate::status::{AgentRecord, ConnectionId, StatusUpdate};

/// Depth of the command queue shared by all producers.
const COMMAND_BUFFER: usize = 256;

/// Status text of a connection that has not reported anything yet.
pub const STATUS_STARTING: &str = "Starting";

enum Command {
    AddAddress {
        ip: IpAddr,
        reply: oneshot::Sender<ConnectionId>,
    },
    MergeUpdate(StatusUpdate),
    SetStatus {
        id: ConnectionId,
        text: String,
    },
    BeginReload {
        reply: oneshot::Sender<u64>,
    },
    EndReload {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<AgentRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the aggregator control loop.
#[derive(Debug, Clone)]
pub struct Aggregator {
    commands: mpsc::Sender<Command>,
}

impl Aggregator {
    /// Spawn the control loop on the current tokio runtime.
    ///
    /// Connections it creates use `settings`.
    pub fn start(settings: ConnectionSettings) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = Self { commands: tx };

        let control = ControlLoop {
            agents: BTreeMap::new(),
            next_id: 1,
            epoch: 0,
            settings,
            handle: handle.clone(),
            commands: rx,
        };
        tokio::spawn(control.run().instrument(info_span!("aggregator")));

        handle
    }

    /// Start monitoring `ip`, or reaffirm it for the current config epoch if
    /// it is already monitored. Returns the id of the connection serving it.
    pub async fn add_address(&self, ip: IpAddr) -> Result<ConnectionId, MonitorError> {
        self.request(|reply| Command::AddAddress { ip, reply }).await
    }

    /// Merge a status frame into the record of the connection it came from.
    pub async fn merge_update(&self, update: StatusUpdate) -> Result<(), MonitorError> {
        self.send(Command::MergeUpdate(update)).await
    }

    /// Replace the status text of a connection's record.
    pub async fn set_status_text(
        &self,
        id: ConnectionId,
        text: impl Into<String>,
    ) -> Result<(), MonitorError> {
        self.send(Command::SetStatus {
            id,
            text: text.into(),
        })
        .await
    }

    /// Start a configuration reload. Returns the new epoch.
    pub async fn begin_config_reload(&self) -> Result<u64, MonitorError> {
        self.request(|reply| Command::BeginReload { reply }).await
    }

    /// Finish a configuration reload, stopping every connection that was not
    /// reaffirmed since the matching [`Aggregator::begin_config_reload`].
    /// Returns the number of connections evicted.
    pub async fn end_config_reload(&self) -> Result<usize, MonitorError> {
        self.request(|reply| Command::EndReload { reply }).await
    }

    /// Copy of every tracked record, ordered by connection id.
    pub async fn snapshot(&self) -> Result<Vec<AgentRecord>, MonitorError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop all connections and terminate the control loop.
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn send(&self, command: Command) -> Result<(), MonitorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MonitorError::HubClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MonitorError> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response.await.map_err(|_| MonitorError::HubClosed)
    }
}

/// The aggregator's side of a live connection.
struct ConnectionHandle {
    ip: IpAddr,
    config_epoch: u64,
    stop: CancellationToken,
}

struct TrackedAgent {
    record: AgentRecord,
    connection: ConnectionHandle,
}

struct ControlLoop {
    agents: BTreeMap<ConnectionId, TrackedAgent>,
    next_id: u64,
    epoch: u64,
    settings: ConnectionSettings,
    handle: Aggregator,
    commands: mpsc::Receiver<Command>,
}

impl ControlLoop {
    async fn run(mut self) {
        info!("running aggregator");

        while let Some(command) = self.commands.recv().await {
            let keep_running = self.apply(command);
            metrics::record_state(self.agents.len(), self.epoch);
            if !keep_running {
                break;
            }
        }

        info!("aggregator done");
    }

    /// Apply one command. Returns `false` once the loop should exit.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::AddAddress { ip, reply } => {
                let id = self.add_address(ip);
                let _ = reply.send(id);
            }
            Command::MergeUpdate(update) => self.merge_update(update),
            Command::SetStatus { id, text } => {
                if let Some(agent) = self.agents.get_mut(&id) {
                    agent.record.status = text;
                }
            }
            Command::BeginReload { reply } => {
                self.epoch += 1;
                debug!(epoch = self.epoch, "configuration reload started");
                let _ = reply.send(self.epoch);
            }
            Command::EndReload { reply } => {
                let evicted = self.evict_stale();
                let _ = reply.send(evicted);
            }
            Command::Snapshot { reply } => {
                let records = self.agents.values().map(|a| a.record.clone()).collect();
                let _ = reply.send(records);
            }
            Command::Shutdown { reply } => {
                info!(agents = self.agents.len(), "aggregator got shutdown");
                let ids: Vec<ConnectionId> = self.agents.keys().copied().collect();
                for id in ids {
                    self.remove(id, StopReason::Shutdown);
                }
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn add_address(&mut self, ip: IpAddr) -> ConnectionId {
        if let Some((id, agent)) = self
            .agents
            .iter_mut()
            .find(|(_, agent)| agent.connection.ip == ip)
        {
            debug!(%ip, connection_id = %id, epoch = self.epoch, "Already monitoring");
            agent.connection.config_epoch = self.epoch;
            return *id;
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        info!(%ip, connection_id = %id, epoch = self.epoch, "Creating new connection");

        let stop = CancellationToken::new();
        let mut record = AgentRecord::new(id, ip.to_string());
        record.status = STATUS_STARTING.to_string();

        self.agents.insert(
            id,
            TrackedAgent {
                record,
                connection: ConnectionHandle {
                    ip,
                    config_epoch: self.epoch,
                    stop: stop.clone(),
                },
            },
        );

        let connection = Connection::new(id, ip, self.settings.clone(), self.handle.clone(), stop);
        tokio::spawn(
            connection
                .run()
                .instrument(info_span!("connection", connection_id = %id, %ip)),
        );

        id
    }

    fn merge_update(&mut self, update: StatusUpdate) {
        let Some(id) = update.connection_id else {
            warn!(ip = %update.ip, "status update without a connection id");
            return;
        };

        if !self.agents.contains_key(&id) {
            debug!(connection_id = %id, ip = %update.ip, "got status update for unknown connection");
            return;
        }

        if !update.uuid.is_empty() {
            if let Some(other) = self.find_uuid(&update.uuid, id) {
                let dropped = self.duplicate_to_drop(id, other, &update.ip);
                warn!(
                    uuid = %update.uuid,
                    ip = %update.ip,
                    connection_id = %id,
                    duplicate_id = %other,
                    dropping = %dropped,
                    "Duplicate connection to agent"
                );
                self.remove(dropped, StopReason::Duplicate);
                return;
            }
        }

        if let Some(agent) = self.agents.get_mut(&id) {
            agent.record.merge(&update, SystemTime::now());
            metrics::record_update_merged();
        }
    }

    /// Another live connection whose record already claims `uuid`.
    fn find_uuid(&self, uuid: &str, except: ConnectionId) -> Option<ConnectionId> {
        self.agents
            .iter()
            .find(|(id, agent)| **id != except && agent.record.uuid == uuid)
            .map(|(id, _)| *id)
    }

    /// Pick which of two connections to the same agent to stop.
    ///
    /// The one whose address matches the address the agent reports is kept.
    /// When that does not single one out, the newer connection is kept.
    fn duplicate_to_drop(
        &self,
        current: ConnectionId,
        other: ConnectionId,
        reported_ip: &str,
    ) -> ConnectionId {
        let reported: Option<IpAddr> = reported_ip.parse().ok();
        let matches = |id: ConnectionId| {
            self.agents
                .get(&id)
                .is_some_and(|agent| Some(agent.connection.ip) == reported)
        };

        match (matches(current), matches(other)) {
            (true, false) => other,
            (false, true) => current,
            _ => current.min(other),
        }
    }

    fn evict_stale(&mut self) -> usize {
        let stale: Vec<ConnectionId> = self
            .agents
            .iter()
            .filter(|(_, agent)| agent.connection.config_epoch < self.epoch)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.remove(*id, StopReason::Evicted);
        }

        debug!(epoch = self.epoch, evicted = stale.len(), "configuration reload finished");
        stale.len()
    }

    fn remove(&mut self, id: ConnectionId, reason: StopReason) {
        if let Some(agent) = self.agents.remove(&id) {
            info!(
                connection_id = %id,
                ip = %agent.connection.ip,
                reason = ?reason,
                "Disconnecting agent"
            );
            agent.connection.stop.cancel();
            metrics::record_connection_stopped(reason);
        }
    }
}
