//! Signaling listener: accept loop, bounded handler set, and the shutdown protocol.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::handler::handle_connection;
use crate::node::Node;
use crate::presence::announce_offline;

pub struct Listener {
    inner: TcpListener,
    max_connections: usize,
}

impl Listener {
    /// Bind the signaling port. Failure here is fatal for the daemon.
    pub async fn bind(addr: &str, max_connections: usize) -> Result<Self, StartupError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            inner,
            max_connections: max_connections.max(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept connections until `stop` fires, then announce offline, release the port and abort
    /// the remaining handlers. Returns the number of offline notices delivered.
    pub async fn run(self, node: Node, mut stop: watch::Receiver<bool>) -> usize {
        let Listener {
            inner,
            max_connections,
        } = self;
        let permits = Arc::new(Semaphore::new(max_connections));
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                accepted = inner.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let Ok(permit) = permits.clone().try_acquire_owned() else {
                            warn!(remote = %remote, "connection limit reached, dropping");
                            continue;
                        };
                        let node = node.clone();
                        handlers.spawn(async move {
                            handle_connection(node, stream, remote).await;
                            drop(permit);
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        }

        let open = node.connection_count().await;
        info!(open, "shutting down listener");
        let delivered = announce_offline(&node).await;
        drop(inner);
        node.close_all().await;
        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
        debug!("listener stopped");
        delivered
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}
