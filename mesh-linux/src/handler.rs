//! Per-connection task: read frames, hand them to the core, perform the returned actions.

use std::net::SocketAddr;
use std::time::Duration;

use mesh_core::ConnectionId;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::node::{Node, Outgoing};
use crate::transport::{read_frame, read_frame_within, write_frame, TransportError};

/// Serve one inbound signaling connection until it ends.
pub async fn handle_connection(node: Node, stream: TcpStream, remote: SocketAddr) {
    let mut conn = node.core().lock().await.open_inbound(remote);
    let id = conn.id();
    let (tx, rx) = mpsc::unbounded_channel();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    node.register(id, tx).await;
    debug!(connection = %id, remote = %remote, "connection opened");

    let (mut reader, writer) = stream.into_split();
    let writer_task = tokio::spawn(write_loop(writer, rx, stop_tx, node.timeouts().write, id));

    loop {
        // Handed-off connections carry a call and may stay quiet indefinitely.
        let limit = (!conn.is_handed_off()).then(|| node.timeouts().read);
        let frame = tokio::select! {
            _ = stop_rx.changed() => break,
            r = read_next(&mut reader, limit) => r,
        };
        let frame = match frame {
            Ok(Some(f)) => f,
            Ok(None) => {
                debug!(connection = %id, "peer closed connection");
                break;
            }
            Err(TransportError::Timeout) => {
                debug!(connection = %id, "idle connection timed out");
                break;
            }
            Err(e) => {
                debug!(connection = %id, error = %e, "read failed");
                break;
            }
        };

        let result = node.core().lock().await.on_inbound_frame(&mut conn, &frame);
        match result {
            Ok(actions) => node.perform(Some(id), actions).await,
            Err(e) if e.is_terminal() => {
                warn!(connection = %id, remote = %remote, error = %e, "closing connection");
                break;
            }
            Err(e) => warn!(connection = %id, error = %e, "message discarded"),
        }
        if conn.is_closed() {
            break;
        }
    }

    let actions = node.core().lock().await.on_inbound_closed(&mut conn);
    node.perform(Some(id), actions).await;
    node.unregister(id).await;
    let _ = writer_task.await;
    debug!(connection = %id, "connection closed");
}

async fn read_next(
    reader: &mut OwnedReadHalf,
    limit: Option<Duration>,
) -> Result<Option<Vec<u8>>, TransportError> {
    match limit {
        Some(limit) => read_frame_within(reader, limit).await,
        None => read_frame(reader).await,
    }
}

/// Drain queued frames in order. Ends on `Close`, on a write error, or when every sender is gone;
/// then shuts the write half and wakes the reader.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    stop: watch::Sender<bool>,
    limit: Duration,
    id: ConnectionId,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Frame(bytes) => {
                if let Err(e) = write_frame(&mut writer, &bytes, limit).await {
                    debug!(connection = %id, error = %e, "write failed");
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    let _ = stop.send(true);
}
