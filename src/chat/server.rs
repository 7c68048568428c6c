/// Chat server: listener, per-connection tasks, connection loop.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::audit;
use super::broker::Broker;
use super::codec::{CodecError, LineCodec};
use super::config::Config;
use super::dispatch::{self, Flow};
use super::message::Reply;
use super::session::Session;

/// Bind the configured address and serve until the listener fails.
pub async fn run(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Bind first, so we fail fast on port conflicts.
    let listener = TcpListener::bind(&config.bind).await?;
    let addr = listener.local_addr()?;
    info!("branchchat listening on {addr}");
    audit::server_start(&addr.to_string());

    serve(listener, Arc::new(Broker::new())).await
}

/// Serve until `shutdown` resolves or the listener fails. The stop event
/// is recorded either way.
pub async fn run_until(
    config: &Config,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let result = tokio::select! {
        result = run(config) => result,
        () = shutdown => Ok(()),
    };
    if let Err(e) = &result {
        error!("server failed: {e}");
    }
    audit::server_stop();
    result
}

/// Accept loop. One task per connection, all sharing `broker`.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (socket, addr) = listener.accept().await?;
        debug!(%addr, "new connection");
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, addr, broker).await {
                warn!(%addr, "client error: {e}");
            }
            debug!(%addr, "connection closed");
        });
    }
}

/// Handle a single client connection.
///
/// The first line must be a valid `HELLO`; otherwise the error is written
/// and the connection closed. After that, lines are dispatched until QUIT,
/// EOF or a transport error, and the session is always cleaned up.
async fn handle_client(socket: TcpStream, addr: SocketAddr, broker: Arc<Broker>) -> Result<(), CodecError> {
    let mut framed = Framed::new(socket, LineCodec);
    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();

    let line = match framed.next().await {
        Some(Ok(line)) => line,
        Some(Err(e)) => return Err(e),
        None => return Ok(()),
    };
    let session = match dispatch::handshake(&broker, &line, tx) {
        Ok(session) => session,
        Err(e) => {
            info!(%addr, "handshake rejected: {e}");
            framed.send(Reply::from(e)).await?;
            return Ok(());
        }
    };
    info!(%addr, username = %session.username, "session established");

    let result = session_loop(&mut framed, &mut rx, &broker, &session).await;
    broker.disconnect(&session);

    // Flush what was queued before teardown (BYE, last notices).
    rx.close();
    while let Some(reply) = rx.recv().await {
        if framed.send(reply).await.is_err() {
            break;
        }
    }

    result
}

async fn session_loop(
    framed: &mut Framed<TcpStream, LineCodec>,
    rx: &mut mpsc::UnboundedReceiver<Reply>,
    broker: &Broker,
    session: &Arc<Session>,
) -> Result<(), CodecError> {
    loop {
        tokio::select! {
            // Incoming line from the client.
            frame = framed.next() => {
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                };
                if dispatch::dispatch(broker, session, &line) == Flow::Quit {
                    return Ok(());
                }
            }

            // Outgoing line queued by this or any other session.
            Some(reply) = rx.recv() => {
                framed.send(reply).await?;
            }
        }
    }
}
