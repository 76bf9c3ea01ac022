use clap::Parser;
use devgate::config::{Config, ProxyConfig};
use devgate::proxy::{Gate, ProxyServer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Config file picked up from the working directory when `--config` is absent
const DEFAULT_CONFIG_FILE: &str = "devgate.toml";

#[derive(Parser)]
#[command(name = "devgate")]
#[command(about = "Reverse proxy that rebuilds and restarts its backend before forwarding", long_about = None, version)]
struct Cli {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend URL to poll and proxy to
    #[arg(short, long)]
    url: Option<String>,

    /// Command that exits 0 when the backend is up to date
    #[arg(long)]
    check: Option<String>,

    /// Command that builds the backend
    #[arg(long)]
    build: Option<String>,

    /// Command that runs the backend
    #[arg(long)]
    run: Option<String>,

    /// Seconds to wait after SIGTERM before killing the backend
    #[arg(short = 't', long)]
    timeout: Option<u64>,
}

impl Cli {
    /// Flags win over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref url) = self.url {
            config.backend.url = Some(url.clone());
        }
        if let Some(ref check) = self.check {
            config.backend.check = Some(check.clone());
        }
        if let Some(ref build) = self.build {
            config.backend.build = Some(build.clone());
        }
        if let Some(ref run) = self.run {
            config.backend.run = Some(run.clone());
        }
        if let Some(secs) = self.timeout {
            config.shutdown.grace_period_ms = secs.saturating_mul(1000);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    cli.apply(&mut config);

    let proxy_config = config.proxy_config().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    print_startup_banner(&proxy_config, bind_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gate = Arc::new(Gate::new(&proxy_config));
    let server = ProxyServer::new(bind_addr, Arc::clone(&gate), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Stop the backend so it does not outlive the gate. An in-flight request
    // holds the lock, so this is bounded.
    info!("Stopping backend...");
    if tokio::time::timeout(Duration::from_secs(5), gate.shutdown())
        .await
        .is_err()
    {
        warn!("Timed out stopping backend");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                return Ok(Config::default());
            }
            default
        }
    };

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn print_startup_banner(config: &ProxyConfig, bind_addr: SocketAddr) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting dev gate"
    );
    info!(
        listen = %bind_addr,
        target = %config.target,
        lock_scope = ?config.lock_scope,
        "Server configuration"
    );
    info!(
        check = config.check.as_ref().map(|c| c.script()),
        build = config.build.as_ref().map(|c| c.script()),
        run = config.run.script(),
        "Backend commands"
    );
    info!(
        interval_ms = config.health.interval.as_millis(),
        attempts = config.health.attempts,
        probe_timeout_ms = config.health.probe_timeout.as_millis(),
        max_wait_ms = config.health.upper_bound().as_millis(),
        "Health poll settings"
    );
    info!(
        signal = ?config.stop.signal,
        grace_period_ms = config.stop.grace_period.as_millis(),
        "Shutdown settings"
    );
}
