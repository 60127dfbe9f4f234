use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use ping_relay::cli::ClientArgs;
use ping_relay::client::{self, ConsoleRenderer};
use ping_relay::config::ClientConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let args = ClientArgs::parse();
    let config = ClientConfig::from(&args);

    // stdout carries the ping output
    tracing_subscriber::fmt()
        .with_max_level(if config.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .ok();

    let mut renderer = ConsoleRenderer::stdout(&config);
    match client::run(&config, &mut renderer, tokio::signal::ctrl_c()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ping-relay: {err}");
            ExitCode::FAILURE
        }
    }
}
