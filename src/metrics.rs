//! Metrics instrumentation for dns-monitor.
//!
//! All metrics are prefixed with `dns_monitor.`

use metrics::{counter, gauge};

/// Stage of a connection attempt that failed.
#[derive(Debug, Clone, Copy)]
pub enum FailureStage {
    /// TCP connect failed or timed out.
    Connect,
    /// WebSocket upgrade failed.
    Handshake,
    /// Stream broke while reading frames.
    Read,
}

impl FailureStage {
    fn as_str(self) -> &'static str {
        match self {
            FailureStage::Connect => "connect",
            FailureStage::Handshake => "handshake",
            FailureStage::Read => "read",
        }
    }
}

/// Why a connection was stopped by the aggregator.
#[derive(Debug, Clone, Copy)]
pub enum StopReason {
    /// Another connection claims the same agent UUID.
    Duplicate,
    /// The address was not part of the latest configuration.
    Evicted,
    /// The aggregator is shutting down.
    Shutdown,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            StopReason::Duplicate => "duplicate",
            StopReason::Evicted => "evicted",
            StopReason::Shutdown => "shutdown",
        }
    }
}

/// Record a connection attempt to an agent.
pub fn record_connect_attempt() {
    counter!("dns_monitor.connection.attempt.count").increment(1);
}

/// Record a failed connection stage.
pub fn record_connection_failure(stage: FailureStage) {
    counter!("dns_monitor.connection.failure.count", "stage" => stage.as_str()).increment(1);
}

/// Record a status frame that failed to parse.
pub fn record_malformed_frame() {
    counter!("dns_monitor.frame.malformed.count").increment(1);
}

/// Record a status frame merged into a record.
pub fn record_update_merged() {
    counter!("dns_monitor.update.merged.count").increment(1);
}

/// Record a connection stopped by the aggregator.
pub fn record_connection_stopped(reason: StopReason) {
    counter!("dns_monitor.connection.stopped.count", "reason" => reason.as_str()).increment(1);
}

/// Record the number of tracked agents and the current config epoch.
pub fn record_state(agents: usize, epoch: u64) {
    gauge!("dns_monitor.state.agents.count").set(agents as f64);
    gauge!("dns_monitor.state.epoch").set(epoch as f64);
}

/// Record a completed configuration reload pass.
pub fn record_reload(added: usize, failed: usize) {
    counter!("dns_monitor.reload.count").increment(1);
    counter!("dns_monitor.reload.resolve_failure.count").increment(failed as u64);
    gauge!("dns_monitor.reload.addresses").set(added as f64);
}
