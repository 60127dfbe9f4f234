//! Ping Relay
//!
//! Runs ICMP echo tests against hosts that only accept traffic from a trusted
//! source, by relaying the ping through an agent that sits on the permitted
//! network segment.
//!
//! The client sends a [`PingRequest`] over a TCP control channel. The agent
//! performs the raw ICMP exchange on one socket shared by all of its sessions,
//! matches replies to requests in a [`Correlator`], and streams one
//! [`PingResult`] per resolved packet back, followed by a summary.
//!
//! ## Agent
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ping_relay::agent::{AgentServer, Relay};
//! use ping_relay::config::AgentConfig;
//! use ping_relay::transport::RawSocketTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ping_relay::RelayError> {
//!     // needs CAP_NET_RAW; fails with RelayError::Permission otherwise
//!     let transport = RawSocketTransport::open()?;
//!     let relay = Relay::new(Arc::new(transport));
//!
//!     let server = AgentServer::bind(&AgentConfig::default(), relay).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Client
//!
//! ```rust,no_run
//! use ping_relay::client::{self, ClientOutcome, ConsoleRenderer};
//! use ping_relay::config::ClientConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ping_relay::RelayError> {
//!     let config = ClientConfig {
//!         target: "10.0.0.50".into(),
//!         count: Some(4),
//!         ..ClientConfig::default()
//!     };
//!     let mut renderer = ConsoleRenderer::stdout(&config);
//!
//!     match client::run(&config, &mut renderer, tokio::signal::ctrl_c()).await? {
//!         ClientOutcome::Completed(summary) => println!("done: {} rx", summary.rx),
//!         ClientOutcome::Interrupted(_) => println!("interrupted"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cli;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod icmp;
pub mod ident;
pub mod protocol;
pub mod stats;
pub mod test_util;
pub mod transport;

use std::time::Duration;

pub use correlator::{Correlator, PendingKey};
pub use error::{RelayError, TransmitError};
pub use ident::SessionId;
pub use protocol::{PingRequest, PingResult, RelayMessage};
pub use stats::{PacketOutcome, SessionSummary};

/// TCP port the agent listens on unless told otherwise.
pub const RELAY_DEFAULT_PORT: u16 = 2000;

/// Time between two echo requests of a session.
pub const PING_DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// How long a request waits for its reply before it counts as lost.
pub const PING_DEFAULT_TIMEOUT: Duration = Duration::from_millis(4000);

/// Echo payload size; with the ICMP header this makes the classic 64-byte ping.
pub const PING_DEFAULT_PAYLOAD_LEN: u16 = 56;

/// Largest payload that still fits a 1500-byte MTU without fragmenting.
pub const PING_MAX_PAYLOAD_LEN: u16 = 1472;

/// Bounds on the pacing interval the agent accepts.
pub const PING_MIN_INTERVAL: Duration = Duration::from_millis(10);
pub const PING_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on the per-reply timeout the agent accepts.
pub const PING_MAX_TIMEOUT: Duration = Duration::from_secs(60);
