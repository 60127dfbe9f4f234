use std::net::IpAddr;

use clap::Parser;

/// Relay agent: performs ICMP echo tests on behalf of remote ping-relay clients
#[derive(Parser, Debug, Clone)]
#[command(name = "ping-relay-agent")]
#[command(author, version, about, long_about = None)]
pub struct AgentArgs {
    /// Listen port for client connections
    #[arg(short = 'p', long = "port", default_value = "2000", value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Local address to listen on
    #[arg(long = "bind", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Log per-packet detail
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Ping a host through a relay agent on its trusted network segment
#[derive(Parser, Debug, Clone)]
#[command(name = "ping-relay")]
#[command(author, version, about, long_about = None)]
pub struct ClientArgs {
    /// Host to ping, as seen from the relay agent
    #[arg(required = true)]
    pub target: String,

    /// Number of pings to send (0 = until interrupted)
    #[arg(short = 'c', long = "count", default_value = "0")]
    pub count: u32,

    /// Interval between pings in seconds
    #[arg(short = 'i', long = "interval", default_value = "1.0")]
    pub interval: f64,

    /// Reply timeout in milliseconds
    #[arg(short = 't', long = "timeout", default_value = "4000")]
    pub timeout: u64,

    /// Echo payload length in bytes
    #[arg(short = 'l', long = "length", default_value = "56")]
    pub length: u16,

    /// Relay agent host
    #[arg(short = 'r', long = "relay", default_value = "127.0.0.1")]
    pub relay: String,

    /// Relay agent port
    #[arg(short = 'p', long = "port", default_value = "2000", value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Quiet output: only banner and statistics
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Log protocol detail to stderr
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
