//! Shared test infrastructure for hub integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use dns_monitor::config::BackoffConfig;
use dns_monitor::{Aggregator, AgentRecord, ConnectionSettings, MonitorError, NameResolver};

// --- Constants ---

pub const FRAME_INTERVAL: Duration = Duration::from_millis(50);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// --- Fake agent ---

/// A WebSocket endpoint that streams the same status frame to every client.
pub struct FakeAgent {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    handshakes: Arc<Mutex<Vec<(String, String)>>>,
    task: JoinHandle<()>,
}

impl FakeAgent {
    /// Listen on `ip` with an OS-assigned port.
    pub async fn start(ip: &str, frame: Value) -> Self {
        Self::start_on(ip, 0, frame, None).await
    }

    /// Listen on `ip:port`. With `frames_per_connection` set, each client is
    /// disconnected after that many frames.
    pub async fn start_on(
        ip: &str,
        port: u16,
        frame: Value,
        frames_per_connection: Option<usize>,
    ) -> Self {
        let listener = TcpListener::bind((ip, port))
            .await
            .expect("failed to bind fake agent");
        let addr = listener.local_addr().expect("failed to get local addr");

        let accepted = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let text = frame.to_string();

        let task = tokio::spawn({
            let accepted = accepted.clone();
            let active = active.clone();
            let handshakes = handshakes.clone();
            async move {
                let mut clients = JoinSet::new();
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let seen = handshakes.clone();
                    let callback = move |req: &Request, resp: Response| {
                        let origin = req
                            .headers()
                            .get("origin")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        seen.lock()
                            .unwrap()
                            .push((req.uri().path().to_string(), origin));
                        Ok::<_, ErrorResponse>(resp)
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        continue;
                    };

                    let active = active.clone();
                    let text = text.clone();
                    clients.spawn(async move {
                        active.fetch_add(1, Ordering::SeqCst);
                        let mut sent = 0;
                        loop {
                            if frames_per_connection.is_some_and(|limit| sent >= limit) {
                                let _ = ws.close(None).await;
                                break;
                            }
                            if ws.send(Message::text(text.clone())).await.is_err() {
                                break;
                            }
                            sent += 1;
                            tokio::time::sleep(FRAME_INTERVAL).await;
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        });

        Self {
            addr,
            accepted,
            active,
            handshakes,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections currently streaming.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Request path and Origin header of every handshake.
    pub fn handshakes(&self) -> Vec<(String, String)> {
        self.handshakes.lock().unwrap().clone()
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An agent that plays a fixed list of frames to its first client and then
/// goes silent with the stream open.
///
/// Later clients get a TCP connection that never completes the WebSocket
/// upgrade, so the monitor's status stays on whatever ended the first stream
/// until the handshake times out.
pub struct ScriptedAgent {
    pub addr: SocketAddr,
    played: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl ScriptedAgent {
    pub async fn start(ip: &str, script: Vec<Message>) -> Self {
        let listener = TcpListener::bind((ip, 0))
            .await
            .expect("failed to bind scripted agent");
        let addr = listener.local_addr().expect("failed to get local addr");
        let played = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let played = played.clone();
            async move {
                let mut clients = JoinSet::new();
                let mut script = Some(script);
                while let Ok((stream, _)) = listener.accept().await {
                    let Some(frames) = script.take() else {
                        clients.spawn(async move {
                            let _held = stream;
                            std::future::pending::<()>().await;
                        });
                        continue;
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        continue;
                    };
                    let played = played.clone();
                    clients.spawn(async move {
                        for frame in frames {
                            if ws.send(frame).await.is_err() {
                                return;
                            }
                            played.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(FRAME_INTERVAL).await;
                        }
                        // Silent from here on; drain until the client leaves.
                        while let Some(Ok(_)) = ws.next().await {}
                    });
                }
            }
        });

        Self { addr, played, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Frames of the script sent so far.
    pub fn played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A status frame as an agent at `ip` would send it.
pub fn status_frame(ip: &str, uuid: &str) -> Value {
    serde_json::json!({
        "h": format!("agent-{ip}.example.net"),
        "id": "agent1",
        "v": "2.0.0",
        "groups": ["edge"],
        "ip": ip,
        "up": 3670,
        "qs": 1200,
        "qps": 4.5,
        "qps1m": 3.25,
        "started": 1_700_000_000,
        "uuid": uuid,
    })
}

// --- Resolver ---

/// Resolver answering from fixed tables; unknown names fail.
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    ns: HashMap<String, Vec<String>>,
    txt: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn with_host(mut self, host: &str, addrs: &[&str]) -> Self {
        let addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
        self.hosts.insert(host.to_string(), addrs);
        self
    }

    pub fn with_ns(mut self, domain: &str, hosts: &[&str]) -> Self {
        self.ns
            .insert(domain.to_string(), hosts.iter().map(|h| h.to_string()).collect());
        self
    }

    pub fn with_txt(mut self, name: &str, txts: &[&str]) -> Self {
        self.txt
            .insert(name.to_string(), txts.iter().map(|t| t.to_string()).collect());
        self
    }
}

fn nxdomain(name: &str) -> MonitorError {
    MonitorError::Resolve {
        name: name.to_string(),
        reason: "NXDOMAIN".to_string(),
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, MonitorError> {
        self.hosts.get(host).cloned().ok_or_else(|| nxdomain(host))
    }

    async fn lookup_ns(&self, domain: &str) -> Result<Vec<String>, MonitorError> {
        self.ns.get(domain).cloned().ok_or_else(|| nxdomain(domain))
    }

    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, MonitorError> {
        self.txt.get(name).cloned().ok_or_else(|| nxdomain(name))
    }
}

// --- Settings ---

/// Connection settings for agents listening on `port`, with short timeouts.
pub fn test_settings(port: u16) -> ConnectionSettings {
    ConnectionSettings {
        port,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(1),
        backoff: BackoffConfig::default(),
    }
}

/// A loopback port with nothing listening on it.
pub fn unused_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

// --- Polling ---

/// Poll until `check` holds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll the hub until the record for `ip` satisfies `check`.
pub async fn wait_for_record<F>(hub: &Aggregator, ip: &str, mut check: F) -> AgentRecord
where
    F: FnMut(&AgentRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let records = hub.snapshot().await.expect("hub closed");
        if let Some(record) = records.into_iter().find(|r| r.ip == ip && check(r)) {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for record of {ip}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
