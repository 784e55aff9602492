//! Shared daemon handle: the core behind a mutex, the per-connection writer registry, and the
//! notification channel. Every `OutboundAction` the core returns is performed here.

use std::collections::HashMap;
use std::sync::Arc;

use mesh_core::{
    CallEvent, ConnectionId, Contact, CoreError, EventKind, MediaError, MediaNegotiator,
    MeshCore, Notification, OutboundAction,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::Timeouts;

/// Commands for a connection's writer task.
#[derive(Debug)]
pub enum Outgoing {
    Frame(Vec<u8>),
    /// Flush what is queued, shut the write half, and stop the reader.
    Close,
}

pub type ConnectionSenders = Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Outgoing>>>>;

#[derive(Clone)]
pub struct Node {
    core: Arc<Mutex<MeshCore>>,
    connections: ConnectionSenders,
    notifications: broadcast::Sender<Notification>,
    media: Arc<dyn MediaNegotiator>,
    timeouts: Timeouts,
}

impl Node {
    pub fn new(core: MeshCore, media: Arc<dyn MediaNegotiator>, timeouts: Timeouts) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            core: Arc::new(Mutex::new(core)),
            connections: Arc::new(Mutex::new(HashMap::new())),
            notifications,
            media,
            timeouts,
        }
    }

    pub fn core(&self) -> &Arc<Mutex<MeshCore>> {
        &self.core
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn notify(&self, notification: Notification) {
        // No receivers is fine.
        let _ = self.notifications.send(notification);
    }

    pub async fn register(&self, id: ConnectionId, tx: mpsc::UnboundedSender<Outgoing>) {
        self.connections.lock().await.insert(id, tx);
    }

    pub async fn unregister(&self, id: ConnectionId) {
        self.connections.lock().await.remove(&id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Perform actions returned by the core. `from` is the connection the actions answer, if any.
    /// Must be called without the core lock held.
    pub async fn perform(&self, from: Option<ConnectionId>, actions: Vec<OutboundAction>) {
        let senders = self.connections.lock().await;
        for action in actions {
            match action {
                OutboundAction::Reply(bytes) => match from.and_then(|id| senders.get(&id)) {
                    Some(tx) => {
                        let _ = tx.send(Outgoing::Frame(bytes));
                    }
                    None => debug!("reply dropped, connection gone"),
                },
                OutboundAction::SendTo(id, bytes) => match senders.get(&id) {
                    Some(tx) => {
                        let _ = tx.send(Outgoing::Frame(bytes));
                    }
                    None => debug!(connection = %id, "frame dropped, connection gone"),
                },
                OutboundAction::Close(id) => {
                    if let Some(tx) = senders.get(&id) {
                        let _ = tx.send(Outgoing::Close);
                    }
                }
                OutboundAction::HandOff => {}
                OutboundAction::Notify(n) => self.notify(n),
            }
        }
    }

    /// Ask every open connection to close.
    pub async fn close_all(&self) {
        for tx in self.connections.lock().await.values() {
            let _ = tx.send(Outgoing::Close);
        }
    }

    /// Accept the ringing call `call`: the media layer answers the offer, then the answer goes
    /// back to the caller. If the media layer aborts, an `Error` event is recorded and the call
    /// is declined instead.
    pub async fn accept_call(&self, call: Uuid) -> Result<(), NodeError> {
        let session = self.core.lock().await.current_call();
        let session = match session {
            Some(s) if s.id == call => s,
            _ => return Err(CoreError::Call(mesh_core::CallError::Stale).into()),
        };
        match self.media.answer(&session.contact, &session.offer) {
            Ok(answer) => {
                let actions = self.core.lock().await.accept_call(call, answer)?;
                self.perform(None, actions).await;
                Ok(())
            }
            Err(e) => {
                warn!(call = %call, error = %e, "media negotiation failed, declining");
                let actions = self
                    .core
                    .lock()
                    .await
                    .record_event(&session.contact, EventKind::Error);
                self.perform(None, actions).await;
                self.decline_call().await;
                Err(e.into())
            }
        }
    }

    pub async fn decline_call(&self) {
        let actions = self.core.lock().await.decline_call();
        self.perform(None, actions).await;
    }

    pub async fn hangup_call(&self) {
        let actions = self.core.lock().await.hangup_call();
        self.perform(None, actions).await;
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.core.lock().await.contacts()
    }

    pub async fn events(&self) -> Vec<CallEvent> {
        self.core.lock().await.events()
    }

    pub async fn clear_events(&self) {
        let actions = self.core.lock().await.clear_events();
        self.perform(None, actions).await;
    }

    /// Drop any call and release the identity. Nothing can be sealed afterwards.
    pub async fn teardown(&self) {
        let mut core = self.core.lock().await;
        core.teardown();
        info!("core torn down");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Media layer for a node without audio: every call is refused.
pub struct NoMedia;

impl MediaNegotiator for NoMedia {
    fn answer(&self, _contact: &Contact, _offer: &str) -> Result<String, MediaError> {
        Err(MediaError::Unavailable)
    }
}
