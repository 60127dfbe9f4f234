// agent/server.rs - control channel listener

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{AgentSession, PingIntent, Relay, SessionEnd};
use crate::config::AgentConfig;
use crate::error::RelayError;
use crate::protocol::{RelayCodec, RelayMessage};

/// Messages buffered between a session and its connection writer.
const OUTBOX_CAPACITY: usize = 64;

/// Accepts client connections and runs one session per connection.
pub struct AgentServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl AgentServer {
    pub async fn bind(config: &AgentConfig, relay: Arc<Relay>) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Only returns on a listener error.
    pub async fn run(self) -> Result<(), RelayError> {
        info!("listening on {} ...", self.local_addr()?);

        loop {
            let (stream, peer) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "cannot disable Nagle: {e}");
            }

            let relay = Arc::clone(&self.relay);
            tokio::spawn(
                async move {
                    let end = serve_connection(relay, stream).await;
                    debug!(?end, "connection closed");
                }
                .instrument(info_span!("client", %peer)),
            );
        }
    }
}

/// Serves one control connection: reads the `PingRequest`, runs the session,
/// streams its messages back. The session is cancelled as soon as the peer
/// closes its side or the connection breaks.
///
/// Returns `None` if the peer never sent a usable request.
pub async fn serve_connection<S>(relay: Arc<Relay>, stream: S) -> Option<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let framed = Framed::new(stream, RelayCodec);
    let (mut sink, mut inbound) = framed.split();

    let request = match inbound.next().await {
        Some(Ok(RelayMessage::Request(request))) => request,
        Some(Ok(other)) => {
            let err = RelayError::Protocol(format!("expected a ping request, got {other:?}"));
            warn!("{err}");
            let _ = sink.send(RelayMessage::error(&err)).await;
            return None;
        }
        Some(Err(err)) => {
            warn!("bad request frame: {err}");
            let _ = sink.send(RelayMessage::error(&err)).await;
            return None;
        }
        None => return None,
    };
    debug!(?request, "ping request");

    let session = match PingIntent::from_request(&request).await {
        Ok(intent) => AgentSession::start(relay, intent),
        Err(err) => Err(err),
    };
    let session = match session {
        Ok(session) => session,
        Err(err) => {
            info!("rejecting request for {}: {err}", request.target);
            let _ = sink.send(RelayMessage::error(&err)).await;
            return Some(SessionEnd::Failed(err));
        }
    };

    let (outbox, mut outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let cancel = CancellationToken::new();

    let forward = async {
        while let Some(message) = outbox_rx.recv().await {
            if let Err(err) = sink.send(message).await {
                debug!("writing to client failed: {err}");
                cancel.cancel();
                break;
            }
        }
    };

    let watch = async {
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(message) => warn!(?message, "ignoring unexpected message from client"),
                Err(err) => {
                    debug!("reading from client failed: {err}");
                    break;
                }
            }
        }
    };

    let work = async { tokio::join!(session.run(outbox, cancel.clone()), forward).0 };
    tokio::pin!(work);

    let end = tokio::select! {
        end = &mut work => end,
        _ = watch => {
            debug!("client closed the control channel");
            cancel.cancel();
            work.await
        }
    };

    Some(end)
}
