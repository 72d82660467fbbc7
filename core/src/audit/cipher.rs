//! Record sealing for the audit log.
//!
//! Each record is encrypted with ChaCha20-Poly1305 under a fresh random
//! nonce. The run id and sequence number are bound as associated data, so a
//! record copied into another run or another position fails to open.
//! Sealed layout: `nonce (12) || ciphertext || tag (16)`.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use fortress_common::audit::{AuditError, RunId};
use sha2::{Digest, Sha256};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Symmetric key for the audit log. Never serialized.
#[derive(Clone)]
pub struct AuditKey([u8; KEY_LEN]);

impl AuditKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Accepts either 64 hex characters (a raw key) or a passphrase, which
    /// is stretched with SHA-256.
    pub fn parse(secret: &str) -> Result<Self, AuditError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(AuditError::KeyUnavailable("no encryption key configured".into()));
        }

        if secret.len() == KEY_LEN * 2 && secret.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut bytes = [0u8; KEY_LEN];
            hex::decode_to_slice(secret, &mut bytes)
                .map_err(|e| AuditError::KeyUnavailable(format!("malformed hex key: {e}")))?;
            return Ok(Self(bytes));
        }

        Ok(Self(Sha256::digest(secret.as_bytes()).into()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for AuditKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuditKey(..)")
    }
}

#[derive(Clone)]
pub struct RecordCipher {
    aead: ChaCha20Poly1305,
}

impl RecordCipher {
    pub fn new(key: &AuditKey) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
        }
    }

    pub fn seal(&self, run_id: RunId, seq: u64, plaintext: &[u8]) -> Result<Vec<u8>, AuditError> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let aad = associated_data(run_id, seq);
        let ciphertext = self
            .aead
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| AuditError::Crypto)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, run_id: RunId, seq: u64, sealed: &[u8]) -> Result<Vec<u8>, AuditError> {
        if sealed.len() < NONCE_LEN + 16 {
            return Err(AuditError::Corrupt {
                run_id,
                seq,
                reason: "record shorter than nonce and tag".into(),
            });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let aad = associated_data(run_id, seq);
        self.aead
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| AuditError::Corrupt {
                run_id,
                seq,
                reason: "authentication failed (wrong key or tampered record)".into(),
            })
    }
}

fn associated_data(run_id: RunId, seq: u64) -> [u8; 24] {
    let mut aad = [0u8; 24];
    aad[..16].copy_from_slice(run_id.as_bytes());
    aad[16..].copy_from_slice(&seq.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parsing() {
        let raw = "11".repeat(32);
        assert_eq!(AuditKey::parse(&raw).unwrap().to_hex(), raw);

        let a = AuditKey::parse("correct horse battery staple").unwrap();
        let b = AuditKey::parse("correct horse battery staple").unwrap();
        assert_eq!(a.to_hex(), b.to_hex());

        assert!(matches!(AuditKey::parse("  "), Err(AuditError::KeyUnavailable(_))));
        assert_eq!(format!("{a:?}"), "AuditKey(..)");
    }

    #[test]
    fn sealed_records_are_bound_to_run_and_position() {
        let cipher = RecordCipher::new(&AuditKey::generate());
        let run = RunId::new();
        let sealed = cipher.seal(run, 3, b"stage Capture Running -> Failed").unwrap();

        assert_eq!(cipher.open(run, 3, &sealed).unwrap(), b"stage Capture Running -> Failed");
        assert!(cipher.open(run, 4, &sealed).is_err());
        assert!(cipher.open(RunId::new(), 3, &sealed).is_err());
    }

    #[test]
    fn nonces_differ_between_records() {
        let cipher = RecordCipher::new(&AuditKey::generate());
        let run = RunId::new();
        let a = cipher.seal(run, 1, b"same").unwrap();
        let b = cipher.seal(run, 1, b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn wrong_key_or_tampering_is_detected() {
        let run = RunId::new();
        let sealed = RecordCipher::new(&AuditKey::generate()).seal(run, 1, b"secret").unwrap();

        let other = RecordCipher::new(&AuditKey::generate());
        assert!(matches!(other.open(run, 1, &sealed), Err(AuditError::Corrupt { .. })));

        let cipher = RecordCipher::new(&AuditKey::from_bytes([7; KEY_LEN]));
        let mut sealed = cipher.seal(run, 1, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(run, 1, &sealed).is_err());
        assert!(cipher.open(run, 1, &sealed[..10]).is_err());
    }
}
