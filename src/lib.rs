//! DNS Monitor - A monitoring hub for a fleet of DNS server agents.
//!
//! Each configured agent exposes a WebSocket stream of JSON status frames.
//! The hub keeps one connection per agent address, merges every frame into a
//! per-agent record and serves the combined view over HTTP.
//!
//! ## Features
//!
//! - Agents discovered from literal names, domain NS records and TXT lists
//! - Per-agent reconnects with quadratic backoff
//! - Duplicate agents (same UUID on two addresses) collapsed to one record
//! - Periodic configuration reloads that disconnect removed agents
//! - Graceful shutdown support
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          dns-monitor                            │
//! │                                                                 │
//! │  ┌──────────────────┐  add_address   ┌──────────────────┐       │
//! │  │ Reloader         │───────────────▶│   Aggregator     │       │
//! │  │ (A / NS / TXT)   │  begin/end     │  (control loop)  │       │
//! │  └──────────────────┘                └──┬───────────▲───┘       │
//! │                                spawns   │           │ updates   │
//! │                                         ▼           │ status    │
//! │                              ┌──────────────────────┴─┐         │
//! │  agents :8053  ◀── ws ────── │ Connection (per agent) │         │
//! │                              └────────────────────────┘         │
//! │                                                                 │
//! │  ┌──────────────────┐  snapshot                                 │
//! │  │ Status API       │◀──────────── Aggregator        ◀── HTTP   │
//! │  └──────────────────┘                                    :2090  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use dns_monitor::{Config, MonitorServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = Config::default();
//!     config.servers.a = vec!["ns1.example.com".to_string()];
//!     config.servers.txt = vec!["_agents.example.com, example.com".to_string()];
//!
//!     let shutdown = CancellationToken::new();
//!     let server = MonitorServer::new(config).unwrap();
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod aggregator;
pub mod api;
pub mod config;
pub mod connection;
pub mod duration;
pub mod error;
pub mod http;
pub mod metrics;
pub mod reload;
pub mod resolver;
pub mod server;
pub mod status;
pub mod telemetry;

// Re-export main types
pub use aggregator::Aggregator;
pub use api::{AgentView, StatusReport};
pub use config::{Config, MonitorConfig, ServersConfig, TelemetryConfig};
pub use connection::ConnectionSettings;
pub use error::MonitorError;
pub use reload::{ReloadReport, Reloader};
pub use resolver::{HickoryResolver, NameResolver};
pub use server::MonitorServer;
pub use status::{AgentRecord, ConnectionId, StatusUpdate};
