use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};

use ping_relay::agent::{AgentServer, Relay};
use ping_relay::cli::AgentArgs;
use ping_relay::config::AgentConfig;
use ping_relay::transport::RawSocketTransport;

#[tokio::main]
async fn main() -> ExitCode {
    let args = AgentArgs::parse();
    let config = AgentConfig::from(&args);

    tracing_subscriber::fmt()
        .with_max_level(if config.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .try_init()
        .ok();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    // before binding, so a missing privilege is reported before any client connects
    let transport = RawSocketTransport::open().context("cannot open raw ICMP socket")?;
    let relay = Relay::new(Arc::new(transport));

    let server = AgentServer::bind(&config, relay)
        .await
        .with_context(|| format!("cannot listen on {}", config.listen))?;

    tokio::select! {
        res = server.run() => res.context("control listener failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
