//! Call history: append-only in-memory log, cleared only on request.

use std::net::IpAddr;
use std::time::SystemTime;

use crate::contact::Contact;
use crate::identity::PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Outgoing,
    /// Incoming call that was accepted.
    Incoming,
    /// Incoming call that ended before anyone answered it.
    Missed,
    /// Incoming call refused locally.
    Declined,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    pub public_key: PublicKey,
    pub address: Option<IpAddr>,
    pub kind: EventKind,
    pub at: SystemTime,
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<CallEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, contact: &Contact, kind: EventKind) {
        self.events.push(CallEvent {
            public_key: *contact.public_key(),
            address: contact.last_working.map(|a| a.ip()),
            kind,
            at: SystemTime::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn snapshot(&self) -> Vec<CallEvent> {
        self.events.clone()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn record_keeps_ip_only() {
        let mut c = Contact::new("a", *Keypair::generate().public_key(), vec![]);
        let mut log = EventLog::new();
        log.record(&c, EventKind::Missed);
        c.set_last_working("10.1.1.1:40000".parse().unwrap(), 10001);
        log.record(&c, EventKind::Incoming);
        let events = log.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].address, None);
        assert_eq!(events[1].address, Some("10.1.1.1".parse().unwrap()));
        assert_eq!(events[1].kind, EventKind::Incoming);
        log.clear();
        assert!(log.is_empty());
        assert_eq!(events.len(), 2);
    }
}
