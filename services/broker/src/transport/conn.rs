// TCP accept loop and per-connection reader/writer tasks.
use anyhow::{Context, Result, anyhow};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use trellis_broker::{Broker, Client, Transport, TransportError};
use trellis_wire::{Decoded, Envelope};

use super::codec::{read_envelope, write_envelope};
use crate::config::BrokerConfig;

// A connection that has not said hello by then is dropped.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound half of a connection: envelopes are handed to a writer task
/// through a bounded queue.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelTransport {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn is_writable(&self) -> bool {
        !self.tx.is_closed() && self.tx.capacity() > 0
    }
}

pub async fn serve(listener: TcpListener, broker: Arc<Broker>, config: BrokerConfig) -> Result<()> {
    // Main accept loop: spawn a task per incoming TCP connection.
    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %err, "set_nodelay failed");
        }
        let broker = Arc::clone(&broker);
        let config = config.clone();
        tokio::spawn(async move {
            let (read, write) = stream.into_split();
            if let Err(err) = handle_connection(broker, read, write, config).await {
                tracing::warn!(%peer, error = %err, "connection handler failed");
            }
        });
    }
}

pub(crate) async fn handle_connection<R, W>(
    broker: Arc<Broker>,
    mut read: R,
    write: W,
    config: BrokerConfig,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let max_frame_bytes = config.limits.max_frame_bytes;
    let mut frame_scratch = BytesMut::with_capacity(4096);

    let first = tokio::time::timeout(
        HELLO_TIMEOUT,
        read_envelope(&mut read, max_frame_bytes, &mut frame_scratch),
    )
    .await
    .map_err(|_| anyhow!("no hello within {HELLO_TIMEOUT:?}"))??;
    let Some(Decoded {
        mut envelope,
        rejected,
    }) = first
    else {
        return Ok(());
    };
    let hello = envelope
        .hello
        .take()
        .ok_or_else(|| anyhow!("first envelope carried no hello"))?;

    let (transport, outbound) = ChannelTransport::new(config.outbound_queue_depth);
    let client = broker
        .connect(hello, Arc::new(transport))
        .context("register connection")?;
    metrics::gauge!("trellis_connections_open").increment(1.0);

    let writer = tokio::spawn(run_writer(Arc::clone(&client), write, outbound));
    // The hello envelope may already carry acks and requests.
    broker.handle(&client, Decoded { envelope, rejected });

    let result = read_loop(&broker, &client, &mut read, max_frame_bytes, &mut frame_scratch).await;
    broker.disconnect(&client);
    metrics::gauge!("trellis_connections_open").decrement(1.0);
    let _ = writer.await;
    result
}

async fn read_loop<R>(
    broker: &Broker,
    client: &Arc<Client>,
    read: &mut R,
    max_frame_bytes: usize,
    frame_scratch: &mut BytesMut,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut cancel_rx = client.closed_signal();
    loop {
        let decoded = tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    tracing::debug!(link = %client.link(), "connection cancelled");
                    return Ok(());
                }
                continue;
            }
            decoded = read_envelope(read, max_frame_bytes, frame_scratch) => decoded?,
        };
        match decoded {
            Some(decoded) => broker.handle(client, decoded),
            None => {
                tracing::debug!(link = %client.link(), "connection closed by peer");
                return Ok(());
            }
        }
    }
}

// Single writer per connection: drains the outbound queue until the client
// is shut down or the socket fails.
async fn run_writer<W>(client: Arc<Client>, mut write: W, mut outbound: mpsc::Receiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    let mut cancel_rx: watch::Receiver<bool> = client.closed_signal();
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                match write_envelope(&mut write, &envelope).await {
                    Ok(bytes) => {
                        metrics::counter!("trellis_bytes_out_total").increment(bytes as u64);
                    }
                    Err(err) => {
                        tracing::info!(link = %client.link(), error = %err, "write failed; closing connection");
                        client.shutdown();
                        break;
                    }
                }
            }
        }
    }
}
