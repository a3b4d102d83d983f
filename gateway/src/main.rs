//! Gateway binary: serves the multiplexed browser WebSocket that fronts one
//! or more Session Managers.

use clap::Parser;

/// Wraps a `TcpListener` so Nagle's algorithm is disabled on every accepted
/// browser connection. The Upstream Pool's own outbound socket to SM gets
/// the same treatment in `sm_link::connect`.
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

/// Terminal session fabric's multi-user Gateway.
#[derive(Parser, Debug)]
#[command(name = "gateway", version, about)]
struct Cli {
    /// Listen host, overrides GW_HOST / settings.json.
    #[arg(long)]
    host: Option<String>,
    /// Listen port, overrides GW_PORT / settings.json.
    #[arg(long)]
    port: Option<u16>,
    /// Upstream Session Manager base URL, overrides SM_UPSTREAM_URL / settings.json.
    #[arg(long)]
    sm_url: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(host) = &cli.host {
        std::env::set_var("GW_HOST", host);
    }
    if let Some(port) = cli.port {
        std::env::set_var("GW_PORT", port.to_string());
    }
    if let Some(url) = &cli.sm_url {
        std::env::set_var("SM_UPSTREAM_URL", url);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = common::config::ensure_loaded();
    let state = gateway::GatewayState::new(config);

    let addr = format!("{}:{}", config.gw_host, config.gw_port);
    let listener = NodelayListener(tokio::net::TcpListener::bind(&addr).await?);
    tracing::info!(%addr, sm_upstream = %config.sm_upstream_url, "gateway listening");

    let app = gateway::router(state);
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
