use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::cli::{AgentArgs, ClientArgs};
use crate::protocol::PingRequest;
use crate::{
    PING_DEFAULT_INTERVAL, PING_DEFAULT_PAYLOAD_LEN, PING_DEFAULT_TIMEOUT, RELAY_DEFAULT_PORT,
};

/// Runtime configuration of the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Address the control channel listens on
    pub listen: SocketAddr,
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), RELAY_DEFAULT_PORT),
            verbose: false,
        }
    }
}

impl From<&AgentArgs> for AgentConfig {
    fn from(args: &AgentArgs) -> Self {
        Self {
            listen: SocketAddr::new(args.bind, args.port),
            verbose: args.verbose,
        }
    }
}

/// Runtime configuration of the client, derived from CLI args
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Relay agent host name or address
    pub relay: String,
    pub port: u16,
    /// Host to ping, resolved by the agent
    pub target: String,
    /// Number of pings (None = until interrupted)
    pub count: Option<u32>,
    pub interval: Duration,
    pub timeout: Duration,
    pub payload_len: u16,
    /// Only print the banner and the statistics
    pub quiet: bool,
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: "127.0.0.1".to_string(),
            port: RELAY_DEFAULT_PORT,
            target: String::new(),
            count: None,
            interval: PING_DEFAULT_INTERVAL,
            timeout: PING_DEFAULT_TIMEOUT,
            payload_len: PING_DEFAULT_PAYLOAD_LEN,
            quiet: false,
            verbose: false,
        }
    }
}

impl ClientConfig {
    /// The request sent to the agent. Durations are carried in whole
    /// milliseconds; the agent validates the values.
    pub fn request(&self) -> PingRequest {
        PingRequest {
            target: self.target.clone(),
            count: self.count,
            interval_ms: clamp_millis(self.interval),
            timeout_ms: clamp_millis(self.timeout),
            payload_len: self.payload_len,
        }
    }

    /// `host:port` of the relay agent.
    pub fn relay_addr(&self) -> String {
        match self.relay.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.relay, self.port),
        }
    }
}

fn clamp_millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            relay: args.relay.clone(),
            port: args.port,
            target: args.target.clone(),
            count: (args.count != 0).then_some(args.count),
            // out-of-range values become zero and are refused by the agent
            interval: Duration::try_from_secs_f64(args.interval).unwrap_or(Duration::ZERO),
            timeout: Duration::from_millis(args.timeout),
            payload_len: args.length,
            quiet: args.quiet,
            verbose: args.verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn client_defaults_follow_cli_defaults() {
        let args = ClientArgs::parse_from(["ping-relay", "10.0.0.50"]);
        let config = ClientConfig::from(&args);

        assert_eq!(
            config,
            ClientConfig {
                target: "10.0.0.50".into(),
                ..ClientConfig::default()
            }
        );
        assert_eq!(config.relay_addr(), "127.0.0.1:2000");
    }

    #[test]
    fn client_args_map_to_request() {
        let args = ClientArgs::parse_from([
            "ping-relay", "-c", "4", "-i", "0.25", "-t", "500", "-l", "32", "-r", "relay.lan",
            "-p", "2100", "-q", "10.0.0.50",
        ]);
        let config = ClientConfig::from(&args);

        assert_eq!(config.relay_addr(), "relay.lan:2100");
        assert!(config.quiet);
        assert_eq!(
            config.request(),
            PingRequest {
                target: "10.0.0.50".into(),
                count: Some(4),
                interval_ms: 250,
                timeout_ms: 500,
                payload_len: 32,
            }
        );
    }

    #[test]
    fn zero_count_means_unbounded() {
        let args = ClientArgs::parse_from(["ping-relay", "-c", "0", "example.org"]);
        assert_eq!(ClientConfig::from(&args).count, None);
    }

    #[test]
    fn ipv6_relay_is_bracketed() {
        let config = ClientConfig {
            relay: "::1".into(),
            ..ClientConfig::default()
        };
        assert_eq!(config.relay_addr(), "[::1]:2000");
    }

    #[test]
    fn agent_args() {
        let args = AgentArgs::parse_from(["ping-relay-agent", "-p", "2222", "--bind", "127.0.0.1"]);
        assert_eq!(
            AgentConfig::from(&args).listen,
            "127.0.0.1:2222".parse::<SocketAddr>().unwrap()
        );

        let args = AgentArgs::parse_from(["ping-relay-agent"]);
        assert_eq!(AgentConfig::from(&args), AgentConfig::default());
    }
}
