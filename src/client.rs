//! Client side of the relay: sends one [`PingRequest`], renders the results as
//! they stream in and recomputes the statistics from them.

use std::future::Future;
use std::io::{self, Write};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::RelayError;
use crate::protocol::{PingRequest, PingResult, RelayCodec, RelayMessage};
use crate::stats::{OutcomeLog, PacketOutcome, SessionSummary};

/// How a client session ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientOutcome {
    /// The agent sent its summary. Carries the statistics recomputed from the
    /// received results.
    Completed(SessionSummary),
    /// The user interrupted the session; statistics cover what arrived so far.
    Interrupted(SessionSummary),
}

impl ClientOutcome {
    pub fn summary(&self) -> &SessionSummary {
        match self {
            Self::Completed(summary) | Self::Interrupted(summary) => summary,
        }
    }
}

/// Output side of a client session.
pub trait Render {
    fn banner(&mut self, request: &PingRequest, relay: &str) -> io::Result<()>;

    fn result(&mut self, result: &PingResult) -> io::Result<()>;

    fn summary(&mut self, summary: &SessionSummary, interrupted: bool) -> io::Result<()>;
}

/// Renders a session the way `ping` does, to any writer.
pub struct ConsoleRenderer<W> {
    out: W,
    host: String,
    payload_len: u16,
    quiet: bool,
}

impl ConsoleRenderer<io::Stdout> {
    pub fn stdout(config: &ClientConfig) -> Self {
        Self::new(io::stdout(), config)
    }
}

impl<W: Write> ConsoleRenderer<W> {
    pub fn new(out: W, config: &ClientConfig) -> Self {
        Self {
            out,
            host: config.target.clone(),
            payload_len: config.payload_len,
            quiet: config.quiet,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Render for ConsoleRenderer<W> {
    fn banner(&mut self, request: &PingRequest, relay: &str) -> io::Result<()> {
        writeln!(
            self.out,
            "ping {} {} bytes of data via {}",
            request.target, request.payload_len, relay
        )?;
        self.out.flush()
    }

    fn result(&mut self, result: &PingResult) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        match result.outcome {
            PacketOutcome::Replied { ttl, rtt } => writeln!(
                self.out,
                "{} bytes from {}: seq {} ttl {} time {:.3} ms",
                self.payload_len,
                self.host,
                result.sequence,
                ttl,
                rtt.as_secs_f64() * 1000.0
            )?,
            PacketOutcome::Lost => writeln!(self.out, "seq {} timeout", result.sequence)?,
        }
        self.out.flush()
    }

    fn summary(&mut self, summary: &SessionSummary, interrupted: bool) -> io::Result<()> {
        if interrupted {
            writeln!(self.out, "--- {} ping statistics (interrupted) ---", self.host)?;
        } else {
            writeln!(self.out, "--- {} ping statistics ---", self.host)?;
        }
        writeln!(self.out, "{summary}")?;
        self.out.flush()
    }
}

/// Connects to the relay named in `config` and runs one session over it.
/// `interrupt` completing ends the session early (typically Ctrl-C).
pub async fn run<R, I>(
    config: &ClientConfig,
    renderer: &mut R,
    interrupt: I,
) -> Result<ClientOutcome, RelayError>
where
    R: Render,
    I: Future,
{
    let relay = config.relay_addr();
    let stream = TcpStream::connect(&relay).await?;
    stream.set_nodelay(true)?;
    debug!(%relay, "connected to relay agent");

    run_session(stream, &config.request(), &relay, renderer, interrupt).await
}

/// Runs one session over an already established control channel.
///
/// # Errors
///
/// [`RelayError::Remote`] if the agent reported an error,
/// [`RelayError::IncompleteSession`] if the channel closed before a summary
/// arrived, [`RelayError::Protocol`] for undecodable or unexpected messages.
pub async fn run_session<S, R, I>(
    stream: S,
    request: &PingRequest,
    relay: &str,
    renderer: &mut R,
    interrupt: I,
) -> Result<ClientOutcome, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Render,
    I: Future,
{
    let mut framed = Framed::new(stream, RelayCodec);
    framed.send(RelayMessage::Request(request.clone())).await?;
    renderer.banner(request, relay)?;

    // results may arrive out of order; lines are printed by sequence number
    let mut log = OutcomeLog::new();
    tokio::pin!(interrupt);

    loop {
        let next = tokio::select! {
            _ = &mut interrupt => {
                info!(received = log.resolved(), "interrupted, closing the session");
                render_all(renderer, log.drain_parked())?;
                let summary = log.summary();
                renderer.summary(&summary, true)?;
                return Ok(ClientOutcome::Interrupted(summary));
            }
            next = framed.next() => next,
        };

        match next {
            Some(Ok(RelayMessage::Result(result))) => {
                match log.record(result.sequence, result.outcome) {
                    Some(in_order) => {
                        log.record_sent();
                        render_all(renderer, in_order)?;
                    }
                    None => warn!(sequence = result.sequence, "duplicate result ignored"),
                }
            }
            Some(Ok(RelayMessage::Summary(remote))) => {
                render_all(renderer, log.drain_parked())?;
                let summary = log.summary();
                if summary != remote {
                    warn!(?remote, local = ?summary, "relay summary disagrees with received results");
                }
                renderer.summary(&summary, false)?;
                return Ok(ClientOutcome::Completed(summary));
            }
            Some(Ok(RelayMessage::Error { kind, message })) => {
                return Err(RelayError::Remote { kind, message });
            }
            Some(Ok(RelayMessage::Request(_))) => {
                return Err(RelayError::Protocol("relay sent a ping request".into()));
            }
            Some(Err(err)) => return Err(err),
            None => {
                render_all(renderer, log.drain_parked())?;
                return Err(RelayError::IncompleteSession {
                    received: log.resolved(),
                });
            }
        }
    }
}

fn render_all<R: Render>(
    renderer: &mut R,
    outcomes: Vec<(u32, PacketOutcome)>,
) -> io::Result<()> {
    for (sequence, outcome) in outcomes {
        renderer.result(&PingResult { sequence, outcome })?;
    }
    Ok(())
}
