use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::FrameError,
    host::{Event, Host},
    models::ClientId,
    protocol::{RespCodec, Reply},
    timer::TokioTimers,
};

/// Accepts connections until `shutdown` resolves, then stops the host.
pub async fn serve<F>(listener: TcpListener, config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let (events, receiver) = mpsc::unbounded_channel();
    let host = Host::new(TokioTimers::new(events.clone()));
    let host_task = tokio::spawn(host.run(receiver, config.stats_interval()));

    let next_client = Arc::new(AtomicU64::new(0));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let client = ClientId(next_client.fetch_add(1, Ordering::Relaxed) + 1);
                debug!("Accepted {} from {}", client, peer);
                let events = events.clone();
                let max_bulk_len = config.max_bulk_len;
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, client, events.clone(), max_bulk_len).await {
                        debug!("{} closed with error: {}", client, e);
                    }
                    let _ = events.send(Event::Disconnected { client });
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
        }
    }

    let _ = events.send(Event::Shutdown);
    host_task.await?;
    Ok(())
}

/// Frames a blocked client may pipeline before the socket stops being read.
const MAX_PIPELINED: usize = 128;

enum Waited {
    Reply(Reply),
    Closed,
}

/// Waits for the host's reply while watching the socket. A hang-up or a bad
/// frame ends the wait; good frames that arrive meanwhile are queued in
/// `pipelined`.
async fn await_reply(
    client: ClientId,
    framed: &mut Framed<TcpStream, RespCodec>,
    pipelined: &mut VecDeque<Vec<String>>,
    reply: oneshot::Receiver<Reply>,
) -> Waited {
    tokio::pin!(reply);
    loop {
        let watching = pipelined.len() < MAX_PIPELINED;
        tokio::select! {
            response = &mut reply => {
                return match response {
                    Ok(response) => Waited::Reply(response),
                    Err(_) => Waited::Closed,
                };
            }
            frame = framed.next(), if watching => {
                match frame {
                    None => {
                        debug!("{} hung up while waiting", client);
                        return Waited::Closed;
                    }
                    Some(Err(e)) => {
                        debug!("{} sent a bad frame while waiting: {}", client, e);
                        return Waited::Closed;
                    }
                    Some(Ok(args)) => pipelined.push_back(args),
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    client: ClientId,
    events: mpsc::UnboundedSender<Event>,
    max_bulk_len: usize,
) -> Result<(), FrameError> {
    let mut framed = Framed::new(stream, RespCodec::new(max_bulk_len));
    let mut pipelined = VecDeque::new();

    loop {
        let frame = match pipelined.pop_front() {
            Some(args) => Some(Ok(args)),
            None => framed.next().await,
        };
        let args = match frame {
            None => return Ok(()),
            Some(Ok(args)) if args.is_empty() => continue,
            Some(Ok(args)) => args,
            Some(Err(FrameError::Io(e))) => return Err(FrameError::Io(e)),
            Some(Err(e)) => {
                framed.send(Reply::Error(format!("ERR {e}"))).await?;
                return Err(e);
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if events
            .send(Event::Command {
                client,
                args,
                reply: reply_tx,
            })
            .is_err()
        {
            return Ok(());
        }

        match await_reply(client, &mut framed, &mut pipelined, reply_rx).await {
            Waited::Reply(reply) => framed.send(reply).await?,
            Waited::Closed => return Ok(()),
        }
    }
}
