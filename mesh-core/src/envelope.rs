//! Authenticated envelopes. A message is signed with the sender's identity and sealed to the
//! recipient's identity with an ephemeral X25519 key; opening one recovers the sender's public key
//! before any application-level identity check.
//!
//! Layout: `ephemeral_public (32) || ChaCha20-Poly1305(sender_public (32) || signature (64) || message)`.
//! The signature covers `DOMAIN || recipient_public || message`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroize;

use crate::identity::{Keypair, PublicKey, PUBLIC_KEY_LEN, SIGNATURE_LEN};

const DOMAIN: &[u8] = b"meshcall-envelope-v1";
const EPHEMERAL_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Smallest possible envelope (empty message).
pub const ENVELOPE_OVERHEAD: usize = EPHEMERAL_LEN + PUBLIC_KEY_LEN + SIGNATURE_LEN + TAG_LEN;

/// Sign `message` as `sender` and seal it to `recipient`.
pub fn seal(message: &str, recipient: &PublicKey, sender: &Keypair) -> Result<Vec<u8>, EnvelopeError> {
    let recipient_x = recipient.agreement_key().map_err(|_| EnvelopeError::Key)?;
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x);
    if !shared.was_contributory() {
        return Err(EnvelopeError::Key);
    }
    let mut key = envelope_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient_x.as_bytes());

    let signature = sender.sign(&signed_bytes(recipient, message.as_bytes()));
    let mut inner = Vec::with_capacity(PUBLIC_KEY_LEN + SIGNATURE_LEN + message.len());
    inner.extend_from_slice(sender.public_key().as_bytes());
    inner.extend_from_slice(&signature);
    inner.extend_from_slice(message.as_bytes());

    let result = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| EnvelopeError::Key)
        .and_then(|cipher| {
            cipher
                .encrypt(&zero_nonce(), inner.as_slice())
                .map_err(|_| EnvelopeError::Encrypt)
        });
    key.zeroize();
    inner.zeroize();
    let ciphertext = result?;

    let mut out = Vec::with_capacity(EPHEMERAL_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope addressed to `recipient`. Returns the authenticated sender and the message.
pub fn open(envelope: &[u8], recipient: &Keypair) -> Result<(PublicKey, String), EnvelopeError> {
    if envelope.len() < ENVELOPE_OVERHEAD {
        return Err(EnvelopeError::Malformed);
    }
    let (ephemeral, ciphertext) = envelope.split_at(EPHEMERAL_LEN);
    let ephemeral: [u8; EPHEMERAL_LEN] = ephemeral.try_into().map_err(|_| EnvelopeError::Malformed)?;
    let ephemeral_public = X25519PublicKey::from(ephemeral);

    let secret = recipient.agreement_secret();
    let recipient_x = X25519PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(EnvelopeError::Malformed);
    }
    let mut key = envelope_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient_x.as_bytes());
    let result = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| EnvelopeError::Key)
        .and_then(|cipher| {
            cipher
                .decrypt(&zero_nonce(), ciphertext)
                .map_err(|_| EnvelopeError::Decrypt)
        });
    key.zeroize();
    let mut inner = result?;

    let opened = split_inner(&inner, recipient.public_key());
    inner.zeroize();
    opened
}

fn split_inner(inner: &[u8], recipient: &PublicKey) -> Result<(PublicKey, String), EnvelopeError> {
    if inner.len() < PUBLIC_KEY_LEN + SIGNATURE_LEN {
        return Err(EnvelopeError::Malformed);
    }
    let (sender, rest) = inner.split_at(PUBLIC_KEY_LEN);
    let (signature, message) = rest.split_at(SIGNATURE_LEN);
    let sender: [u8; PUBLIC_KEY_LEN] = sender.try_into().map_err(|_| EnvelopeError::Malformed)?;
    let signature: [u8; SIGNATURE_LEN] = signature.try_into().map_err(|_| EnvelopeError::Malformed)?;
    let sender = PublicKey::from_bytes(sender);
    sender
        .verify(&signed_bytes(recipient, message), &signature)
        .map_err(|_| EnvelopeError::Signature)?;
    let text = std::str::from_utf8(message).map_err(|_| EnvelopeError::Utf8)?;
    Ok((sender, text.to_owned()))
}

fn signed_bytes(recipient: &PublicKey, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DOMAIN.len() + PUBLIC_KEY_LEN + message.len());
    out.extend_from_slice(DOMAIN);
    out.extend_from_slice(recipient.as_bytes());
    out.extend_from_slice(message);
    out
}

/// Per-envelope key. The ephemeral key makes it unique, so a fixed nonce is never reused.
fn envelope_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}

fn zero_nonce() -> chacha20poly1305::Nonce {
    chacha20poly1305::Nonce::default()
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid key material")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed envelope")]
    Malformed,
    #[error("sender signature invalid")]
    Signature,
    #[error("message is not valid utf-8")]
    Utf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let sealed = seal(r#"{"action":"ping"}"#, bob.public_key(), &alice).unwrap();
        let (sender, text) = open(&sealed, &bob).unwrap();
        assert_eq!(&sender, alice.public_key());
        assert_eq!(text, r#"{"action":"ping"}"#);
    }

    #[test]
    fn empty_and_unicode_messages() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        for msg in ["", "grüße 📞"] {
            let sealed = seal(msg, bob.public_key(), &alice).unwrap();
            assert_eq!(open(&sealed, &bob).unwrap().1, msg);
        }
    }

    #[test]
    fn tampered_envelope_fails() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let sealed = seal("hello", bob.public_key(), &alice).unwrap();
        for i in [0, EPHEMERAL_LEN, sealed.len() - 1] {
            let mut bad = sealed.clone();
            bad[i] ^= 0x01;
            assert!(open(&bad, &bob).is_err(), "flipped byte {i}");
        }
    }

    #[test]
    fn truncated_envelope_fails() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let sealed = seal("hello", bob.public_key(), &alice).unwrap();
        assert!(matches!(
            open(&sealed[..ENVELOPE_OVERHEAD - 1], &bob),
            Err(EnvelopeError::Malformed)
        ));
        assert!(matches!(
            open(&sealed[..sealed.len() - 1], &bob),
            Err(EnvelopeError::Decrypt)
        ));
    }

    #[test]
    fn wrong_recipient_fails() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let eve = Keypair::generate();
        let sealed = seal("for bob", bob.public_key(), &alice).unwrap();
        assert!(matches!(open(&sealed, &eve), Err(EnvelopeError::Decrypt)));
    }

    #[test]
    fn low_order_ephemeral_rejected() {
        let bob = Keypair::generate();
        let bogus = vec![0u8; ENVELOPE_OVERHEAD + 8];
        assert!(matches!(open(&bogus, &bob), Err(EnvelopeError::Malformed)));
    }

    #[test]
    fn fresh_ephemeral_per_message() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let a = seal("same", bob.public_key(), &alice).unwrap();
        let b = seal("same", bob.public_key(), &alice).unwrap();
        assert_ne!(a, b);
    }
}
