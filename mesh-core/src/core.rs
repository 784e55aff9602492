//! Host-driven API: MeshCore owns the signaling state (identity, contacts, call slot, event
//! log), receives frames and requests from the host, and returns actions for the host to perform.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::{CallArbiter, CallError, CallSession, CallState};
use crate::connection::{ConnectionId, Inbound, Phase};
use crate::contact::{Contact, ContactDirectory, Presence};
use crate::envelope::{self, EnvelopeError};
use crate::event::{CallEvent, EventKind, EventLog};
use crate::identity::{Keypair, PublicKey};
use crate::protocol::{Message, ProtocolError, SIGNALING_PORT, STATUS_OFFLINE};
use crate::store::{Database, Settings};

/// Main state container. One per process; the host shares it behind a mutex.
pub struct MeshCore {
    keypair: Option<Arc<Keypair>>,
    settings: Settings,
    contacts: ContactDirectory,
    calls: CallArbiter,
    events: EventLog,
    signaling_port: u16,
    next_connection: u64,
}

impl MeshCore {
    pub fn new(keypair: Keypair, settings: Settings, contacts: Vec<Contact>) -> Self {
        Self {
            keypair: Some(Arc::new(keypair)),
            settings,
            contacts: ContactDirectory::from_contacts(contacts),
            calls: CallArbiter::new(),
            events: EventLog::new(),
            signaling_port: SIGNALING_PORT,
            next_connection: 0,
        }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.keypair(), db.settings.clone(), db.contacts.clone())
    }

    /// Snapshot for the persistence collaborator. Fails after teardown.
    pub fn to_database(&self) -> Result<Database, CoreError> {
        let keypair = self.keypair()?;
        Ok(Database::new(
            &keypair,
            self.settings.clone(),
            self.contacts.snapshot(),
        ))
    }

    pub fn signaling_port(&self) -> u16 {
        self.signaling_port
    }

    /// Port substituted into last-working addresses and into contact addresses without one.
    pub fn set_signaling_port(&mut self, port: u16) {
        self.signaling_port = port;
    }

    pub fn keypair(&self) -> Result<Arc<Keypair>, CoreError> {
        self.keypair.clone().ok_or(CoreError::TornDown)
    }

    pub fn public_key(&self) -> Result<PublicKey, CoreError> {
        Ok(*self.keypair()?.public_key())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_block_unknown(&mut self, block: bool) {
        self.settings.block_unknown = block;
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.settings.name = name.into();
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.snapshot()
    }

    pub fn contact(&self, key: &PublicKey) -> Option<Contact> {
        self.contacts.get(key).cloned()
    }

    pub fn contact_by_name(&self, name: &str) -> Option<Contact> {
        self.contacts.find_by_name(name).cloned()
    }

    /// Add or replace a contact. Returns true if one with the same key existed.
    pub fn add_contact(&mut self, contact: Contact) -> bool {
        self.contacts.upsert(contact)
    }

    pub fn remove_contact(&mut self, key: &PublicKey) -> Option<Contact> {
        self.contacts.remove(key)
    }

    pub fn set_blocked(&mut self, key: &PublicKey, blocked: bool) -> bool {
        self.contacts.set_blocked(key, blocked)
    }

    /// Returns true if the presence changed. No notification; the caller decides.
    pub fn set_presence(&mut self, key: &PublicKey, presence: Presence) -> bool {
        self.contacts.set_presence(key, presence)
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.events.snapshot()
    }

    pub fn record_event(&mut self, contact: &Contact, kind: EventKind) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        self.record(contact, kind, &mut actions);
        actions
    }

    pub fn clear_events(&mut self) -> Vec<OutboundAction> {
        self.events.clear();
        vec![OutboundAction::Notify(Notification::EventListChanged)]
    }

    pub fn current_call(&self) -> Option<CallSession> {
        self.calls.current().cloned()
    }

    /// Register a new inbound connection from `remote`.
    pub fn open_inbound(&mut self, remote: SocketAddr) -> Inbound {
        self.next_connection = self.next_connection.wrapping_add(1);
        Inbound::new(ConnectionId::new(self.next_connection), remote)
    }

    /// Encode `message` and seal it from our identity to `recipient`.
    pub fn seal_for(&self, recipient: &PublicKey, message: &Message) -> Result<Vec<u8>, CoreError> {
        let keypair = self.keypair()?;
        let json = message.to_json()?;
        Ok(envelope::seal(&json, recipient, &keypair)?)
    }

    /// Process one frame read from an inbound connection.
    ///
    /// Errors where `is_terminal()` holds mean the host must close the connection; other errors
    /// discard the frame and the host keeps reading.
    pub fn on_inbound_frame(
        &mut self,
        conn: &mut Inbound,
        frame: &[u8],
    ) -> Result<Vec<OutboundAction>, ConnectionError> {
        if conn.phase == Phase::Closed {
            return Err(ConnectionError::Closed);
        }
        let keypair = self.keypair().map_err(|_| ConnectionError::TornDown)?;
        let (sender, text) =
            envelope::open(frame, &keypair).map_err(ConnectionError::Authentication)?;
        let mut actions = Vec::new();

        let peer = match &conn.contact {
            Some(bound) if bound.public_key() != &sender => {
                warn!(
                    connection = %conn.id,
                    expected = %bound.public_key(),
                    got = %sender,
                    "suspicious change of key, message discarded"
                );
                return Err(ConnectionError::KeyChanged {
                    expected: *bound.public_key(),
                    got: sender,
                });
            }
            Some(_) => sender,
            None => match self.identify(sender) {
                Some(contact) => {
                    debug!(connection = %conn.id, peer = %sender, name = %contact.name, "connection identified");
                    conn.contact = Some(contact);
                    conn.phase = Phase::Identified;
                    sender
                }
                None => {
                    actions.extend(self.decline_call());
                    actions.push(OutboundAction::Close(conn.id));
                    conn.phase = Phase::Closed;
                    return Ok(actions);
                }
            },
        };

        if let Some(contact) = conn.contact.as_mut() {
            contact.set_last_working(conn.remote, self.signaling_port);
            if let Some(addr) = contact.last_working {
                self.contacts.set_last_working(&peer, addr);
            }
        }

        let message = Message::parse(&text)?;
        debug!(connection = %conn.id, peer = %peer, action = message.action(), "message received");

        if conn.phase == Phase::HandedOff {
            self.on_call_signal(conn, message, &mut actions);
            return Ok(actions);
        }

        match message {
            Message::Call { offer } => self.on_call_offer(conn, offer, &mut actions)?,
            Message::Ping => {
                if self.contacts.set_presence(&peer, Presence::Online) {
                    actions.push(OutboundAction::Notify(Notification::ContactListChanged));
                }
                let pong = self
                    .seal_for(&peer, &Message::Pong)
                    .map_err(ConnectionError::Reply)?;
                actions.push(OutboundAction::Reply(pong));
            }
            Message::StatusChange { status } if status == STATUS_OFFLINE => {
                if self.contacts.set_presence(&peer, Presence::Offline) {
                    actions.push(OutboundAction::Notify(Notification::ContactListChanged));
                }
            }
            Message::StatusChange { status } => {
                info!(peer = %peer, status = %status, "unknown status change ignored");
            }
            other => {
                debug!(peer = %peer, action = other.action(), "action ignored");
            }
        }
        Ok(actions)
    }

    /// The connection ended (orderly close, read error, or terminal decrypt failure).
    ///
    /// A connection carrying the call ends it with one `CallDeclined`. Any other connection
    /// that was still open yields `RemoteDisconnected`.
    pub fn on_inbound_closed(&mut self, conn: &mut Inbound) -> Vec<OutboundAction> {
        let already_closed = conn.phase == Phase::Closed;
        conn.phase = Phase::Closed;
        let mut actions = Vec::new();
        if let Some(session) = self.calls.release_connection(conn.id) {
            info!(call = %session.id, connection = %conn.id, "call connection lost");
            self.end_session(session, &mut actions);
        } else if !already_closed {
            debug!(connection = %conn.id, remote = %conn.remote, "remote disconnected");
            actions.push(OutboundAction::Notify(Notification::RemoteDisconnected(conn.id)));
        }
        actions
    }

    /// Accept the ringing call `call` with the media layer's `answer`.
    pub fn accept_call(&mut self, call: Uuid, answer: String) -> Result<Vec<OutboundAction>, CoreError> {
        let (peer, connection) = match self.calls.current() {
            None => return Err(CallError::NoCall.into()),
            Some(s) if s.id != call => return Err(CallError::Stale.into()),
            Some(s) if s.state != CallState::Ringing => return Err(CallError::NotRinging.into()),
            Some(s) => (*s.contact.public_key(), s.connection),
        };
        let connected = self.seal_for(
            &peer,
            &Message::Connected {
                answer: answer.clone(),
            },
        )?;
        let contact = self.calls.accept(call, answer)?.contact.clone();
        info!(call = %call, peer = %peer, "call accepted");
        let mut actions = vec![OutboundAction::SendTo(connection, connected)];
        self.record(&contact, EventKind::Incoming, &mut actions);
        Ok(actions)
    }

    /// Refuse the ringing call, if there is one: tell the caller and close its connection.
    pub fn decline_call(&mut self) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let Some(session) = self.calls.decline() else {
            return actions;
        };
        info!(call = %session.id, peer = %session.contact.public_key(), "call declined");
        self.dismiss(&session, &mut actions);
        self.record(&session.contact, EventKind::Declined, &mut actions);
        actions.push(OutboundAction::Notify(Notification::CallDeclined));
        actions
    }

    /// End the current call in any state.
    pub fn hangup_call(&mut self) -> Vec<OutboundAction> {
        if self.calls.pending().is_some() {
            return self.decline_call();
        }
        let mut actions = Vec::new();
        if let Some(session) = self.calls.hangup() {
            info!(call = %session.id, "call hung up");
            self.dismiss(&session, &mut actions);
        }
        actions
    }

    /// Sealed `status_change: offline` for every contact not already known to be offline.
    pub fn offline_notices(&self) -> Vec<(Contact, Vec<u8>)> {
        self.contacts
            .iter()
            .filter(|c| c.presence != Presence::Offline)
            .filter_map(|c| match self.seal_for(c.public_key(), &Message::offline()) {
                Ok(bytes) => Some((c.clone(), bytes)),
                Err(e) => {
                    warn!(peer = %c.public_key(), error = %e, "cannot seal offline notice");
                    None
                }
            })
            .collect()
    }

    /// Drop the call slot and our reference to the identity. The secret is zeroized once the
    /// last `Arc` handed out by `keypair()` is gone.
    pub fn teardown(&mut self) {
        if let Some(session) = self.calls.hangup() {
            debug!(call = %session.id, "call dropped at teardown");
        }
        if self.keypair.take().is_some() {
            info!("identity released");
        }
    }

    /// Security policy for a sender seen for the first time on a connection. Unknown senders are
    /// checked before the blocked flag, and both before a transient contact is created.
    fn identify(&self, sender: PublicKey) -> Option<Contact> {
        match self.contacts.get(&sender) {
            None if self.settings.block_unknown => {
                info!(peer = %sender, "unknown sender blocked");
                None
            }
            Some(c) if c.blocked => {
                info!(peer = %sender, name = %c.name, "blocked contact refused");
                None
            }
            Some(c) => Some(c.clone()),
            None => Some(Contact::new("", sender, Vec::new())),
        }
    }

    fn on_call_offer(
        &mut self,
        conn: &mut Inbound,
        offer: String,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), ConnectionError> {
        let Some(contact) = conn.contact.clone() else {
            return Ok(());
        };
        let peer = *contact.public_key();
        let ringing = self
            .seal_for(&peer, &Message::Ringing)
            .map_err(ConnectionError::Reply)?;
        let started = self
            .calls
            .start_incoming(contact.clone(), conn.id, offer)
            .map(|s| s.id);
        match started {
            Ok(call) => {
                info!(call = %call, connection = %conn.id, peer = %peer, "incoming call");
                actions.push(OutboundAction::Reply(ringing));
                actions.push(OutboundAction::HandOff);
                actions.push(OutboundAction::Notify(Notification::IncomingCall(contact)));
                conn.phase = Phase::HandedOff;
            }
            Err(err) => {
                info!(connection = %conn.id, peer = %peer, reason = %err, "second caller declined");
                match self.seal_for(&peer, &Message::Dismissed) {
                    Ok(bytes) => actions.push(OutboundAction::Reply(bytes)),
                    Err(e) => warn!(peer = %peer, error = %e, "cannot seal dismissal"),
                }
                actions.push(OutboundAction::Close(conn.id));
                conn.phase = Phase::Closed;
                self.record(&contact, EventKind::Missed, actions);
            }
        }
        Ok(())
    }

    /// Frames on a handed-off connection are call signaling from the caller.
    fn on_call_signal(
        &mut self,
        conn: &mut Inbound,
        message: Message,
        actions: &mut Vec<OutboundAction>,
    ) {
        match message {
            Message::Dismissed => {
                if let Some(session) = self.calls.release_connection(conn.id) {
                    info!(call = %session.id, "caller hung up");
                    self.end_session(session, actions);
                }
                actions.push(OutboundAction::Close(conn.id));
                conn.phase = Phase::Closed;
            }
            other => {
                debug!(connection = %conn.id, action = other.action(), "ignored on call connection");
            }
        }
    }

    fn end_session(&mut self, session: CallSession, actions: &mut Vec<OutboundAction>) {
        if session.state == CallState::Ringing {
            self.record(&session.contact, EventKind::Missed, actions);
        }
        actions.push(OutboundAction::Notify(Notification::CallDeclined));
    }

    fn dismiss(&self, session: &CallSession, actions: &mut Vec<OutboundAction>) {
        match self.seal_for(session.contact.public_key(), &Message::Dismissed) {
            Ok(bytes) => actions.push(OutboundAction::SendTo(session.connection, bytes)),
            Err(e) => warn!(call = %session.id, error = %e, "cannot seal dismissal"),
        }
        actions.push(OutboundAction::Close(session.connection));
    }

    fn record(&mut self, contact: &Contact, kind: EventKind, actions: &mut Vec<OutboundAction>) {
        self.events.record(contact, kind);
        actions.push(OutboundAction::Notify(Notification::EventListChanged));
    }
}

/// Events for observers (presentation layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ContactListChanged,
    EventListChanged,
    /// The call is over from the remote side (declined, hung up, or connection lost).
    CallDeclined,
    IncomingCall(Contact),
    /// A connection without a call ended from the remote side.
    RemoteDisconnected(ConnectionId),
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Write a sealed frame on the connection being handled.
    Reply(Vec<u8>),
    /// Write a sealed frame on another connection (the call connection).
    SendTo(ConnectionId, Vec<u8>),
    /// Flush pending frames, then close the connection.
    Close(ConnectionId),
    /// The handled connection now carries the call; stop idle timeouts on it.
    HandOff,
    Notify(Notification),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("node has been torn down")]
    TornDown,
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("authentication failed: {0}")]
    Authentication(#[source] EnvelopeError),
    #[error("sender key changed from {expected} to {got}")]
    KeyChanged { expected: PublicKey, got: PublicKey },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("cannot seal reply: {0}")]
    Reply(#[source] CoreError),
    #[error("connection already closed")]
    Closed,
    #[error("node has been torn down")]
    TornDown,
}

impl ConnectionError {
    /// Terminal errors end the connection; the rest only discard the offending frame.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionError::Authentication(_) | ConnectionError::Closed | ConnectionError::TornDown
        )
    }
}
