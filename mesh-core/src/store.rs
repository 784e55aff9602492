//! Persistence boundary: what is stored (identity, settings, contacts) and the store trait.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::contact::Contact;
use crate::identity::{bytes_32, Keypair};

/// Local preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Name shown to peers when they add us.
    pub name: String,
    /// Refuse connections from keys not in the contact directory.
    pub block_unknown: bool,
}

/// Everything the node persists. The secret key is zeroized on drop.
#[derive(Serialize, Deserialize)]
pub struct Database {
    #[serde(with = "bytes_32")]
    secret_key: [u8; 32],
    pub settings: Settings,
    pub contacts: Vec<Contact>,
}

impl Database {
    /// Fresh database with a newly generated identity (first start).
    pub fn generate() -> Self {
        Self::new(&Keypair::generate(), Settings::default(), Vec::new())
    }

    pub fn new(keypair: &Keypair, settings: Settings, contacts: Vec<Contact>) -> Self {
        Self {
            secret_key: keypair.secret_bytes(),
            settings,
            contacts,
        }
    }

    pub fn keypair(&self) -> Keypair {
        Keypair::from_secret_bytes(&self.secret_key)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("settings", &self.settings)
            .field("contacts", &self.contacts.len())
            .finish_non_exhaustive()
    }
}

/// Storage collaborator. The passphrase protects the database at rest; an empty one means
/// the store may keep it unencrypted.
pub trait Persistence {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self, passphrase: &str) -> Result<Option<Database>, StoreError>;
    fn store(&self, db: &Database, passphrase: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Codec(String),
    #[error("wrong passphrase or corrupted database")]
    Passphrase,
    #[error("not a meshcall database")]
    Corrupt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_survives_database() {
        let kp = Keypair::generate();
        let db = Database::new(&kp, Settings::default(), vec![]);
        assert_eq!(db.keypair().public_key(), kp.public_key());
    }

    #[test]
    fn serde_roundtrip_keeps_contacts() {
        let peer = Keypair::generate();
        let mut contact = Contact::new("peer", *peer.public_key(), vec!["10.0.0.2".into()]);
        contact.blocked = true;
        let db = Database::new(
            &Keypair::generate(),
            Settings {
                name: "me".into(),
                block_unknown: true,
            },
            vec![contact.clone()],
        );
        let json = serde_json::to_string(&db).unwrap();
        let back: Database = serde_json::from_str(&json).unwrap();
        assert_eq!(back.contacts, vec![contact]);
        assert!(back.settings.block_unknown);
        assert_eq!(back.keypair().public_key(), db.keypair().public_key());
    }
}
