//! Session Manager binary: boots the Reconciler, then serves the HTTP +
//! WebSocket API.

use clap::Parser;

/// Wraps a `TcpListener` so Nagle's algorithm is disabled on every accepted
/// connection, since every terminal-carrying socket should minimize
/// keystroke latency. The raw WS endpoint lives on this listener alongside
/// the REST API, so the simplest correct place to do this is once, at
/// accept time, rather than per-socket inside the WS upgrade handler.
struct NodelayListener(tokio::net::TcpListener);

impl axum::serve::Listener for NodelayListener {
    type Io = tokio::net::TcpStream;
    type Addr = std::net::SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.0.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!(error = %e, "failed to disable Nagle's algorithm on accepted socket");
                    }
                    return (stream, addr);
                }
                Err(e) => tracing::warn!(error = %e, "accept failed, retrying"),
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.0.local_addr()
    }
}

/// Terminal session fabric's Session Manager.
#[derive(Parser, Debug)]
#[command(name = "session-manager", version, about)]
struct Cli {
    /// Listen host, overrides SM_HOST / settings.json.
    #[arg(long)]
    host: Option<String>,
    /// Listen port, overrides SM_PORT / settings.json.
    #[arg(long)]
    port: Option<u16>,
    /// Registry file path, overrides REGISTRY_PATH / settings.json.
    #[arg(long)]
    registry_path: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // CLI flags take precedence over settings.json by being layered in as
    // environment overrides before the config singleton is first touched.
    if let Some(host) = &cli.host {
        std::env::set_var("SM_HOST", host);
    }
    if let Some(port) = cli.port {
        std::env::set_var("SM_PORT", port.to_string());
    }
    if let Some(path) = &cli.registry_path {
        std::env::set_var("REGISTRY_PATH", path);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = common::config::ensure_loaded();
    let state = session_manager::bootstrap(config).await?;
    let registry = state.registry.clone();

    let addr = format!("{}:{}", config.sm_host, config.sm_port);
    let listener = NodelayListener(tokio::net::TcpListener::bind(&addr).await?);
    tracing::info!(%addr, "session manager listening");

    let app = session_manager::router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, checkpointing registry");
    registry.checkpoint()?;
    Ok(())
}

/// Waits for SIGINT/SIGTERM so the WAL gets checkpointed before exit.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
