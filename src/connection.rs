//! Per-agent connection worker.
//!
//! Each monitored address gets one [`Connection`], a small state machine that
//! connects to the agent, upgrades to a WebSocket, streams status frames into
//! the [`Aggregator`], and backs off between attempts:
//!
//! ```text
//! Connecting ──ok──▶ Streaming ──read error / timeout──▶ Backoff
//!     │                                                    │
//!     └──────────────connect / handshake error────────────▶│
//!     ▲                                                    │
//!     └────────────────────────────────────────────────────┘
//!
//! any state ──stop──▶ Stopped
//! ```

use futures::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::aggregator::Aggregator;
use crate::config::{BackoffConfig, MonitorConfig};
use crate::error::MonitorError;
use crate::metrics::{self, FailureStage};
use crate::status::{ConnectionId, StatusUpdate};

/// Request path of the agent monitoring WebSocket.
pub const MONITOR_PATH: &str = "/monitor";

/// Origin announced in the upgrade request.
pub const MONITOR_ORIGIN: &str = "http://monitor.pgeodns";

/// Status reported when the handshake succeeds and on every frame read.
pub const STATUS_OK: &str = "Ok";

/// Final status reported by a stopped worker.
pub const STATUS_STOPPED: &str = "stopped";

/// Tuning shared by all connection workers.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Agent monitoring port.
    pub port: u16,
    /// Timeout for the TCP connect and for the WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Frame read timeout.
    pub read_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl From<&MonitorConfig> for ConnectionSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            port: config.agent_port,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            backoff: config.backoff,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// Delay before reconnect attempt number `retries`.
///
/// `retries² / 2` seconds; a delay above the cap threshold is replaced by the
/// cap value rather than clamped to the threshold.
pub fn backoff_delay(retries: u32, policy: &BackoffConfig) -> Duration {
    let squared = u64::from(retries).saturating_mul(u64::from(retries));
    let delay = Duration::from_millis(squared.saturating_mul(500));
    if delay > Duration::from_secs(policy.cap_threshold_secs) {
        Duration::from_secs(policy.cap_secs)
    } else {
        delay
    }
}

/// Client side of an agent's monitoring WebSocket.
pub type AgentStream = WebSocketStream<TcpStream>;

/// Where a connection worker currently is.
pub enum ConnectionState {
    /// Opening TCP and upgrading to a WebSocket.
    Connecting,
    /// Reading status frames.
    Streaming(Box<AgentStream>),
    /// Waiting before the next attempt.
    Backoff,
    /// Terminal.
    Stopped,
}

/// Build the WebSocket upgrade request for an agent.
pub fn upgrade_request(addr: SocketAddr) -> Result<Request, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{addr}{MONITOR_PATH}").into_client_request()?;
    request
        .headers_mut()
        .insert(ORIGIN, HeaderValue::from_static(MONITOR_ORIGIN));
    Ok(request)
}

/// Upgrade an open TCP stream to the agent's monitoring WebSocket.
pub async fn handshake(addr: SocketAddr, tcp: TcpStream) -> Result<AgentStream, MonitorError> {
    let request = upgrade_request(addr)?;
    let (ws, response) = tokio_tungstenite::client_async(request, tcp).await?;
    trace!(%addr, status = %response.status(), "upgrade response");
    Ok(ws)
}

/// Decode one text frame sent by an agent.
pub fn parse_frame(text: &str) -> Result<StatusUpdate, MonitorError> {
    Ok(serde_json::from_str(text)?)
}

/// Worker streaming status from one agent address.
pub struct Connection {
    id: ConnectionId,
    ip: IpAddr,
    settings: ConnectionSettings,
    hub: Aggregator,
    stop: CancellationToken,
    retries: u32,
}

impl Connection {
    /// Create a worker; nothing happens until [`Connection::run`] is polled.
    pub fn new(
        id: ConnectionId,
        ip: IpAddr,
        settings: ConnectionSettings,
        hub: Aggregator,
        stop: CancellationToken,
    ) -> Self {
        Self {
            id,
            ip,
            settings,
            hub,
            stop,
            retries: 0,
        }
    }

    /// Drive the state machine until the stop token is cancelled.
    pub async fn run(mut self) {
        info!(connection_id = %self.id, ip = %self.ip, "Starting agent connection");

        let stop = self.stop.clone();
        let mut state = ConnectionState::Connecting;

        loop {
            state = match state {
                ConnectionState::Connecting => tokio::select! {
                    biased;
                    _ = stop.cancelled() => ConnectionState::Stopped,
                    next = self.connect() => next,
                },
                ConnectionState::Streaming(ws) => tokio::select! {
                    biased;
                    _ = stop.cancelled() => ConnectionState::Stopped,
                    next = self.stream(ws) => next,
                },
                ConnectionState::Backoff => {
                    let delay = backoff_delay(self.retries, &self.settings.backoff);
                    debug!(
                        connection_id = %self.id,
                        retries = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before reconnect"
                    );
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => ConnectionState::Stopped,
                        _ = sleep(delay) => ConnectionState::Connecting,
                    }
                }
                ConnectionState::Stopped => {
                    self.report(STATUS_STOPPED).await;
                    info!(connection_id = %self.id, ip = %self.ip, "Agent connection stopped");
                    return;
                }
            };
        }
    }

    async fn connect(&mut self) -> ConnectionState {
        metrics::record_connect_attempt();
        let addr = SocketAddr::new(self.ip, self.settings.port);

        let tcp = match timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                let status = format!("Could not connect to '{}': {}", self.ip, e);
                return self.attempt_failed(FailureStage::Connect, status).await;
            }
            Err(_) => {
                let status = format!(
                    "Could not connect to '{}': timed out after {}s",
                    self.ip,
                    self.settings.connect_timeout.as_secs()
                );
                return self.attempt_failed(FailureStage::Connect, status).await;
            }
        };

        match timeout(self.settings.connect_timeout, handshake(addr, tcp)).await {
            Ok(Ok(ws)) => {
                self.retries = 0;
                debug!(connection_id = %self.id, ip = %self.ip, "WebSocket upgrade complete");
                ConnectionState::Streaming(Box::new(ws))
            }
            Ok(Err(e)) => {
                let status = format!("Could not upgrade WS on '{}': {}", self.ip, e);
                self.attempt_failed(FailureStage::Handshake, status).await
            }
            Err(_) => {
                let status = format!(
                    "Could not upgrade WS on '{}': timed out after {}s",
                    self.ip,
                    self.settings.connect_timeout.as_secs()
                );
                self.attempt_failed(FailureStage::Handshake, status).await
            }
        }
    }

    async fn attempt_failed(&mut self, stage: FailureStage, status: String) -> ConnectionState {
        metrics::record_connection_failure(stage);
        warn!(connection_id = %self.id, retries = self.retries, "{}", status);
        self.retries = self.retries.saturating_add(1);
        self.report(status).await;
        ConnectionState::Backoff
    }

    async fn stream(&mut self, mut ws: Box<AgentStream>) -> ConnectionState {
        loop {
            self.report(STATUS_OK).await;

            let message = match timeout(self.settings.read_timeout, ws.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => Err(match frame {
                    Some(frame) => format!("closed by agent: {}", frame.reason),
                    None => "closed by agent".to_string(),
                }),
                Ok(Some(Ok(message))) => Ok(message),
                Ok(Some(Err(e))) => Err(e.to_string()),
                Ok(None) => Err("connection closed".to_string()),
                Err(_) => Err(format!(
                    "read timed out after {}s",
                    self.settings.read_timeout.as_secs()
                )),
            };

            match message {
                Ok(Message::Text(text)) => self.handle_frame(&text).await,
                Ok(other) => {
                    trace!(connection_id = %self.id, frame = ?other, "Ignoring non-text frame");
                }
                Err(reason) => {
                    let status = format!("Error reading from server: {}", reason);
                    metrics::record_connection_failure(FailureStage::Read);
                    warn!(connection_id = %self.id, ip = %self.ip, "{}", status);
                    self.report(status).await;
                    return ConnectionState::Backoff;
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        match parse_frame(text) {
            Ok(update) => {
                trace!(connection_id = %self.id, ?update, "Got status frame");
                if self.hub.merge_update(update.on_connection(self.id)).await.is_err() {
                    debug!(connection_id = %self.id, "Aggregator gone, dropping status frame");
                }
            }
            Err(e) => {
                metrics::record_malformed_frame();
                warn!(
                    connection_id = %self.id,
                    ip = %self.ip,
                    error = %e,
                    data = %text,
                    "Could not parse status frame"
                );
            }
        }
    }

    async fn report(&self, status: impl Into<String>) {
        if self.hub.set_status_text(self.id, status).await.is_err() {
            trace!(connection_id = %self.id, "Aggregator gone, dropping status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_quadratically() {
        let policy = BackoffConfig::default();
        assert_eq!(backoff_delay(0, &policy), Duration::ZERO);
        assert_eq!(backoff_delay(1, &policy), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, &policy), Duration::from_secs(2));
        assert_eq!(backoff_delay(4, &policy), Duration::from_secs(8));
        assert_eq!(backoff_delay(10, &policy), Duration::from_secs(50));
    }

    #[test]
    fn test_backoff_cap_replaces_large_delays() {
        let policy = BackoffConfig::default();
        // 11² / 2 = 60.5s is over the 60s threshold
        assert_eq!(backoff_delay(11, &policy), Duration::from_secs(30));
        assert_eq!(backoff_delay(1_000, &policy), Duration::from_secs(30));
        assert_eq!(backoff_delay(u32::MAX, &policy), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_cap_is_configurable() {
        let policy = BackoffConfig {
            cap_threshold_secs: 8,
            cap_secs: 8,
        };
        assert_eq!(backoff_delay(4, &policy), Duration::from_secs(8));
        assert_eq!(backoff_delay(5, &policy), Duration::from_secs(8));
    }

    #[test]
    fn test_upgrade_request_headers() {
        let request = upgrade_request("192.0.2.7:8053".parse().unwrap()).unwrap();
        assert_eq!(request.uri().path(), MONITOR_PATH);
        assert_eq!(request.uri().host(), Some("192.0.2.7"));
        assert_eq!(request.headers().get(ORIGIN).unwrap(), MONITOR_ORIGIN);
    }

    #[test]
    fn test_upgrade_request_ipv6() {
        let request = upgrade_request("[2001:db8::1]:8053".parse().unwrap()).unwrap();
        assert_eq!(request.uri().port_u16(), Some(8053));
    }

    #[test]
    fn test_malformed_frame_is_json_error() {
        assert!(matches!(parse_frame("{not json"), Err(MonitorError::Json(_))));

        let update = parse_frame(r#"{"v":"3.0","extra":true}"#).unwrap();
        assert_eq!(update.version, "3.0");
        assert!(update.uuid.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_upgrade_is_websocket_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let err = handshake(addr, tcp).await.unwrap_err();
        assert!(matches!(err, MonitorError::WebSocket(_)), "unexpected error: {err}");
    }

    #[test]
    fn test_settings_from_config() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.port, 8053);
        assert_eq!(settings.read_timeout, Duration::from_secs(3));
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
    }
}
