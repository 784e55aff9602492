//! Per-connection state for inbound signaling connections.

use std::fmt;
use std::net::SocketAddr;

use crate::contact::Contact;

/// Process-unique id for an inbound connection, assigned by `MeshCore::open_inbound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        ConnectionId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingFirstMessage,
    /// Bound to a contact; one-shot actions (ping, status change) are dispatched.
    Identified,
    /// Carries the call session; frames are call signaling.
    HandedOff,
    Closed,
}

/// State the handler keeps for one inbound connection. The bound contact never changes.
#[derive(Debug)]
pub struct Inbound {
    pub(crate) id: ConnectionId,
    pub(crate) remote: SocketAddr,
    pub(crate) contact: Option<Contact>,
    pub(crate) phase: Phase,
}

impl Inbound {
    pub(crate) fn new(id: ConnectionId, remote: SocketAddr) -> Self {
        Self {
            id,
            remote,
            contact: None,
            phase: Phase::AwaitingFirstMessage,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn contact(&self) -> Option<&Contact> {
        self.contact.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_handed_off(&self) -> bool {
        self.phase == Phase::HandedOff
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }
}
