//! Outbound presence traffic: ping sweeps over the contact list, and the offline announcement
//! sent on shutdown.

use std::time::Duration;

use mesh_core::envelope::{self, EnvelopeError};
use mesh_core::protocol::ProtocolError;
use mesh_core::{Contact, CoreError, Keypair, Message, Notification, Presence};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::node::Node;
use crate::transport::{connect_contact, read_frame_within, write_frame, Timeouts, TransportError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub online: usize,
    pub offline: usize,
}

/// Ping one contact and wait for its pong. The connection is dropped on return.
pub async fn probe_contact(
    keypair: &Keypair,
    contact: &Contact,
    signaling_port: u16,
    timeouts: Timeouts,
) -> Result<(), ProbeError> {
    let ping = envelope::seal(&Message::Ping.to_json()?, contact.public_key(), keypair)?;
    let mut stream = connect_contact(contact, signaling_port, timeouts.connect).await?;
    write_frame(&mut stream, &ping, timeouts.write).await?;
    let reply = read_frame_within(&mut stream, timeouts.read)
        .await?
        .ok_or(ProbeError::NoReply)?;
    let (sender, text) = envelope::open(&reply, keypair)?;
    if &sender != contact.public_key() {
        return Err(ProbeError::WrongSender);
    }
    match Message::parse(&text)? {
        Message::Pong => Ok(()),
        other => Err(ProbeError::UnexpectedReply(other.action())),
    }
}

/// Probe every contact in turn and record the outcome as presence. One failure never stops the
/// sweep; observers get a single `ContactListChanged` at the end.
pub async fn probe_contacts(node: &Node) -> Result<SweepReport, CoreError> {
    let (keypair, contacts, port) = {
        let core = node.core().lock().await;
        (core.keypair()?, core.contacts(), core.signaling_port())
    };
    let timeouts = node.timeouts();
    let mut report = SweepReport::default();
    for contact in contacts {
        let presence = match probe_contact(&keypair, &contact, port, timeouts).await {
            Ok(()) => {
                report.online += 1;
                Presence::Online
            }
            Err(e) => {
                debug!(peer = %contact.public_key(), name = %contact.name, error = %e, "probe failed");
                report.offline += 1;
                Presence::Offline
            }
        };
        node.core()
            .lock()
            .await
            .set_presence(contact.public_key(), presence);
    }
    node.notify(Notification::ContactListChanged);
    info!(online = report.online, offline = report.offline, "presence sweep done");
    Ok(report)
}

/// Sweep now, then every `interval` (none: only once), until `stop` fires.
pub async fn run_prober(node: Node, interval: Option<Duration>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            r = probe_contacts(&node) => {
                if let Err(e) = r {
                    warn!(error = %e, "prober stopped");
                    return;
                }
            }
        }
        let Some(every) = interval else { return };
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(every) => {}
        }
    }
}

/// Tell every contact not known to be offline that we are leaving. Best effort and concurrent;
/// returns how many notices were delivered.
pub async fn announce_offline(node: &Node) -> usize {
    let (notices, port) = {
        let core = node.core().lock().await;
        (core.offline_notices(), core.signaling_port())
    };
    let timeouts = node.timeouts();
    let mut sends = JoinSet::new();
    for (contact, bytes) in notices {
        sends.spawn(async move {
            let result = send_once(&contact, &bytes, port, timeouts).await;
            if let Err(e) = &result {
                debug!(peer = %contact.public_key(), error = %e, "offline notice not delivered");
            }
            result.is_ok()
        });
    }
    let mut delivered = 0;
    while let Some(joined) = sends.join_next().await {
        if matches!(joined, Ok(true)) {
            delivered += 1;
        }
    }
    info!(delivered, "offline announced");
    delivered
}

async fn send_once(
    contact: &Contact,
    bytes: &[u8],
    port: u16,
    timeouts: Timeouts,
) -> Result<(), TransportError> {
    let mut stream = connect_contact(contact, port, timeouts.connect).await?;
    write_frame(&mut stream, bytes, timeouts.write).await?;
    stream.shutdown().await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection closed without reply")]
    NoReply,
    #[error("reply signed by another key")]
    WrongSender,
    #[error("unexpected reply: {0}")]
    UnexpectedReply(&'static str),
}
