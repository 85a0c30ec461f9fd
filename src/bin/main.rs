//! dnsmonitor binary entry point.

use clap::Parser;
use dns_monitor::{telemetry, Config, MonitorServer};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Monitoring hub for a fleet of DNS server agents.
#[derive(Parser, Debug)]
#[command(name = "dnsmonitor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "dnsmonitor.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.http.listen_addr,
        names = config.servers.a.len(),
        domains = config.servers.domain.len(),
        txt = config.servers.txt.len(),
        "Loaded configuration"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let result = match MonitorServer::new(config) {
        Ok(server) => server.reload_from(args.config).run(shutdown).await,
        Err(e) => Err(e),
    };

    telemetry::shutdown();

    if let Err(e) = result {
        error!("dns-monitor error: {}", e);
        return Err(e.into());
    }

    info!("dns-monitor shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C, or SIGTERM on unix.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
    shutdown.cancel();
}
