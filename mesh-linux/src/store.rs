//! On-disk database: bincode, sealed with a passphrase-derived key when a passphrase is set.
//!
//! Layout: `MAGIC || version || mode || body`. Mode 0 stores the bincode bytes as is; mode 1
//! stores `salt(16) || nonce(12) || ChaCha20-Poly1305(bincode)` with the key derived by Argon2id.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use mesh_core::{Database, Persistence, StoreError};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroizing;

const MAGIC: &[u8; 8] = b"MESHCALL";
const FORMAT_VERSION: u8 = 1;
const MODE_PLAIN: u8 = 0;
const MODE_SEALED: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for FileStore {
    fn load(&self, passphrase: &str) -> Result<Option<Database>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let db = decode(&bytes, passphrase)?;
        debug!(path = %self.path.display(), contacts = db.contacts.len(), "database loaded");
        Ok(Some(db))
    }

    /// Write to a sibling temp file, then rename over the old database.
    fn store(&self, db: &Database, passphrase: &str) -> Result<(), StoreError> {
        let bytes = encode(db, passphrase)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        write_private(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), sealed = !passphrase.is_empty(), "database stored");
        Ok(())
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn encode(db: &Database, passphrase: &str) -> Result<Vec<u8>, StoreError> {
    // Holds the secret seed; wiped on drop.
    let plain = Zeroizing::new(
        bincode::serialize(db).map_err(|e| StoreError::Codec(e.to_string()))?,
    );
    let mut out = Vec::with_capacity(MAGIC.len() + 2 + SALT_LEN + NONCE_LEN + plain.len() + 16);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    if passphrase.is_empty() {
        out.push(MODE_PLAIN);
        out.extend_from_slice(&plain);
        return Ok(out);
    }
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher_for(passphrase, &salt)?
        .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
        .map_err(|_| StoreError::Codec("encryption failed".into()))?;
    out.push(MODE_SEALED);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn decode(bytes: &[u8], passphrase: &str) -> Result<Database, StoreError> {
    let rest = bytes.strip_prefix(MAGIC.as_slice()).ok_or(StoreError::Corrupt)?;
    let (&version, rest) = rest.split_first().ok_or(StoreError::Corrupt)?;
    if version != FORMAT_VERSION {
        return Err(StoreError::Corrupt);
    }
    let (&mode, body) = rest.split_first().ok_or(StoreError::Corrupt)?;
    let plain = match mode {
        MODE_PLAIN => {
            if !passphrase.is_empty() {
                warn!("database is not encrypted; it will be sealed on next store");
            }
            Zeroizing::new(body.to_vec())
        }
        MODE_SEALED => {
            if passphrase.is_empty() {
                return Err(StoreError::Passphrase);
            }
            if body.len() < SALT_LEN + NONCE_LEN {
                return Err(StoreError::Corrupt);
            }
            let (salt, rest) = body.split_at(SALT_LEN);
            let (nonce, sealed) = rest.split_at(NONCE_LEN);
            Zeroizing::new(
                cipher_for(passphrase, salt)?
                    .decrypt(Nonce::from_slice(nonce), sealed)
                    .map_err(|_| StoreError::Passphrase)?,
            )
        }
        _ => return Err(StoreError::Corrupt),
    };
    bincode::deserialize(&plain).map_err(|e| StoreError::Codec(e.to_string()))
}

fn cipher_for(passphrase: &str, salt: &[u8]) -> Result<ChaCha20Poly1305, StoreError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&*key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{Contact, Keypair, Settings};
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("meshcall-test-{}", Uuid::new_v4()))
            .join("db")
    }

    fn sample() -> Database {
        let peer = Keypair::generate();
        Database::new(
            &Keypair::generate(),
            Settings {
                name: "me".into(),
                block_unknown: true,
            },
            vec![Contact::new("peer", *peer.public_key(), vec!["10.0.0.9".into()])],
        )
    }

    #[test]
    fn missing_file_is_first_start() {
        let store = FileStore::new(temp_path());
        assert!(store.load("").unwrap().is_none());
    }

    #[test]
    fn plain_store_and_load() {
        let path = temp_path();
        let store = FileStore::new(&path);
        let db = sample();
        store.store(&db, "").unwrap();
        let back = store.load("").unwrap().unwrap();
        assert_eq!(back.keypair().public_key(), db.keypair().public_key());
        assert_eq!(back.contacts, db.contacts);
        assert_eq!(back.settings, db.settings);
        assert!(!path.with_extension("tmp").exists());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn sealed_requires_passphrase() {
        let path = temp_path();
        let store = FileStore::new(&path);
        let db = sample();
        store.store(&db, "correct horse").unwrap();
        let raw = fs::read(&path).unwrap();
        assert_eq!(raw[MAGIC.len() + 1], MODE_SEALED);

        assert!(matches!(store.load("wrong"), Err(StoreError::Passphrase)));
        assert!(matches!(store.load(""), Err(StoreError::Passphrase)));
        let back = store.load("correct horse").unwrap().unwrap();
        assert_eq!(back.keypair().public_key(), db.keypair().public_key());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn sealed_file_hides_secret_seed() {
        let db = sample();
        let seed = db.keypair().secret_bytes();
        let sealed = encode(&db, "pw").unwrap();
        assert!(!sealed.windows(seed.len()).any(|w| w == seed));
        let plain = encode(&db, "").unwrap();
        assert!(plain.windows(seed.len()).any(|w| w == seed));
        let back = decode(&sealed, "pw").unwrap();
        assert_eq!(back.keypair().secret_bytes(), seed);
    }

    #[test]
    fn foreign_file_rejected() {
        assert!(matches!(decode(b"not a db", ""), Err(StoreError::Corrupt)));
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[FORMAT_VERSION, 9]);
        assert!(matches!(decode(&bytes, ""), Err(StoreError::Corrupt)));
        let mut truncated = MAGIC.to_vec();
        truncated.extend_from_slice(&[FORMAT_VERSION, MODE_SEALED, 1, 2, 3]);
        assert!(matches!(decode(&truncated, "pw"), Err(StoreError::Corrupt)));
    }
}
