//! Contacts and the contact directory (keyed by public identity).

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;

/// Presence as last observed. `Pending` until the first probe or inbound signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Presence {
    Online,
    Offline,
    #[default]
    Pending,
}

/// A known remote identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    public_key: PublicKey,
    pub name: String,
    /// Addresses exchanged out of band: `host`, `ip`, or `ip:port`.
    pub addresses: Vec<String>,
    /// Address of the last successful inbound connection, with the signaling port.
    pub last_working: Option<SocketAddr>,
    #[serde(skip)]
    pub presence: Presence,
    pub blocked: bool,
}

impl Contact {
    pub fn new(name: impl Into<String>, public_key: PublicKey, addresses: Vec<String>) -> Self {
        Self {
            public_key,
            name: name.into(),
            addresses,
            last_working: None,
            presence: Presence::default(),
            blocked: false,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Remember where this contact reached us from. The source port is ephemeral, so the
    /// stored address always carries `signaling_port` instead.
    pub fn set_last_working(&mut self, remote: SocketAddr, signaling_port: u16) {
        self.last_working = Some(SocketAddr::new(remote.ip(), signaling_port));
    }

    /// Connect targets in order of preference: last working address, then the known addresses.
    /// Entries without a port get `signaling_port`.
    pub fn connect_candidates(&self, signaling_port: u16) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |candidate: String| {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        };
        if let Some(addr) = self.last_working {
            push(addr.to_string());
        }
        for raw in &self.addresses {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if let Ok(addr) = raw.parse::<SocketAddr>() {
                push(addr.to_string());
            } else if let Ok(ip) = raw.parse::<IpAddr>() {
                push(SocketAddr::new(ip, signaling_port).to_string());
            } else {
                push(format!("{}:{}", raw, signaling_port));
            }
        }
        out
    }
}

/// All contacts, in insertion order. Lookups are by public key.
#[derive(Debug, Clone, Default)]
pub struct ContactDirectory {
    contacts: Vec<Contact>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a stored list; a repeated key keeps the first entry.
    pub fn from_contacts(contacts: Vec<Contact>) -> Self {
        let mut dir = Self::new();
        for contact in contacts {
            if !dir.contains(contact.public_key()) {
                dir.contacts.push(contact);
            }
        }
        dir
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &PublicKey) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.public_key() == key)
    }

    fn get_mut(&mut self, key: &PublicKey) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.public_key() == key)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.name == name)
    }

    /// Insert or replace the contact with the same key. Returns true if it replaced one.
    pub fn upsert(&mut self, contact: Contact) -> bool {
        match self.get_mut(contact.public_key()) {
            Some(existing) => {
                *existing = contact;
                true
            }
            None => {
                self.contacts.push(contact);
                false
            }
        }
    }

    pub fn remove(&mut self, key: &PublicKey) -> Option<Contact> {
        let idx = self.contacts.iter().position(|c| c.public_key() == key)?;
        Some(self.contacts.remove(idx))
    }

    /// Returns true if the stored presence changed.
    pub fn set_presence(&mut self, key: &PublicKey, presence: Presence) -> bool {
        match self.get_mut(key) {
            Some(c) if c.presence != presence => {
                c.presence = presence;
                true
            }
            _ => false,
        }
    }

    /// Replace the last working address as a whole value. Returns false for unknown keys.
    pub fn set_last_working(&mut self, key: &PublicKey, addr: SocketAddr) -> bool {
        match self.get_mut(key) {
            Some(c) => {
                c.last_working = Some(addr);
                true
            }
            None => false,
        }
    }

    pub fn set_blocked(&mut self, key: &PublicKey, blocked: bool) -> bool {
        match self.get_mut(key) {
            Some(c) if c.blocked != blocked => {
                c.blocked = blocked;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// Owned copy for observers; later mutation never affects it.
    pub fn snapshot(&self) -> Vec<Contact> {
        self.contacts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn contact(name: &str) -> Contact {
        Contact::new(name, *Keypair::generate().public_key(), vec![])
    }

    #[test]
    fn last_working_uses_signaling_port() {
        let mut c = contact("alice");
        c.set_last_working("192.168.1.20:53122".parse().unwrap(), 10001);
        assert_eq!(c.last_working, Some("192.168.1.20:10001".parse().unwrap()));
    }

    #[test]
    fn candidates_in_preference_order() {
        let mut c = Contact::new(
            "bob",
            *Keypair::generate().public_key(),
            vec![
                "10.0.0.5".into(),
                "10.0.0.6:4000".into(),
                "fe80::1".into(),
                "bob.local".into(),
                "10.0.0.5".into(),
            ],
        );
        c.last_working = Some("10.0.0.9:10001".parse().unwrap());
        assert_eq!(
            c.connect_candidates(10001),
            vec![
                "10.0.0.9:10001",
                "10.0.0.5:10001",
                "10.0.0.6:4000",
                "[fe80::1]:10001",
                "bob.local:10001",
            ]
        );
    }

    #[test]
    fn presence_change_reported_once() {
        let c = contact("carol");
        let key = *c.public_key();
        let mut dir = ContactDirectory::new();
        dir.upsert(c);
        assert!(dir.set_presence(&key, Presence::Online));
        assert!(!dir.set_presence(&key, Presence::Online));
        assert!(dir.set_presence(&key, Presence::Offline));
        let unknown = *Keypair::generate().public_key();
        assert!(!dir.set_presence(&unknown, Presence::Online));
    }

    #[test]
    fn upsert_replaces_same_key() {
        let c = contact("dave");
        let key = *c.public_key();
        let mut dir = ContactDirectory::new();
        assert!(!dir.upsert(c.clone()));
        let mut renamed = c;
        renamed.name = "david".into();
        assert!(dir.upsert(renamed));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get(&key).unwrap().name, "david");
        assert!(dir.find_by_name("david").is_some());
    }

    #[test]
    fn snapshot_is_detached() {
        let c = contact("erin");
        let key = *c.public_key();
        let mut dir = ContactDirectory::from_contacts(vec![c.clone(), c]);
        assert_eq!(dir.len(), 1);
        let snap = dir.snapshot();
        dir.remove(&key);
        assert!(dir.is_empty());
        assert_eq!(snap.len(), 1);
    }
}
