//! Password-derived session encryption for all TCP frames.
//!
//! Key = PBKDF2-HMAC-SHA256(password, SHA-256(room_name), 480k rounds).
//! Token = issue time (u64 BE) | 24-byte nonce | XChaCha20-Poly1305 ciphertext,
//! with the timestamp bound as AAD. Tokens older than the TTL are rejected,
//! which bounds the replay window to 5 minutes of wall-clock skew.
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

const PACKET_TTL_SECS: u64 = 300;
const MAX_FUTURE_SKEW_SECS: u64 = 60;
const KDF_ITERATIONS: u32 = 480_000;
/// Salt used when the room name is empty.
const DEFAULT_SALT: &[u8] = b"lan_chat_default_salt";

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 8 + NONCE_LEN;

/// Deliberately opaque: callers cannot distinguish a wrong password from
/// an expired or tampered token.
#[derive(Debug, Error)]
#[error("decrypt failed: wrong password or expired/corrupted packet")]
pub struct CryptoError;

/// Symmetric session cipher. An empty password disables encryption and
/// turns `encrypt`/`decrypt` into passthroughs.
pub struct SessionCrypto {
    cipher: Option<XChaCha20Poly1305>,
}

impl SessionCrypto {
    pub fn new(password: &str, room_name: &str) -> Self {
        if password.is_empty() {
            return Self { cipher: None };
        }
        // Room-derived salt: the same password in a different room yields a
        // different key, so cross-room ciphertexts never decrypt.
        let salt: Vec<u8> = if room_name.is_empty() {
            DEFAULT_SALT.to_vec()
        } else {
            Sha256::digest(room_name.as_bytes()).to_vec()
        };
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, KDF_ITERATIONS, &mut key);
        Self {
            cipher: Some(XChaCha20Poly1305::new(&key.into())),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_at(data, unix_now())
    }

    fn encrypt_at(&self, data: &[u8], issued_at: u64) -> Result<Vec<u8>, CryptoError> {
        let Some(cipher) = &self.cipher else {
            return Ok(data.to_vec());
        };
        let ts = issued_at.to_be_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);
        let ct = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: data, aad: &ts })
            .map_err(|_| CryptoError)?;
        let mut out = Vec::with_capacity(HEADER_LEN + ct.len());
        out.extend_from_slice(&ts);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(cipher) = &self.cipher else {
            return Ok(data.to_vec());
        };
        if data.len() < HEADER_LEN + TAG_LEN {
            return Err(CryptoError);
        }
        let (ts_bytes, rest) = data.split_at(8);
        let (nonce, ct) = rest.split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ct, aad: ts_bytes })
            .map_err(|_| CryptoError)?;
        // TTL check only after authentication, so the timestamp is trusted.
        let issued_at = u64::from_be_bytes(ts_bytes.try_into().map_err(|_| CryptoError)?);
        let now = unix_now();
        if issued_at + PACKET_TTL_SECS < now || issued_at > now + MAX_FUTURE_SKEW_SECS {
            return Err(CryptoError);
        }
        Ok(plain)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_is_passthrough() {
        let crypto = SessionCrypto::new("", "Room");
        assert!(!crypto.is_encrypted());
        let data = b"plain json".to_vec();
        assert_eq!(crypto.encrypt(&data).unwrap(), data);
        assert_eq!(crypto.decrypt(&data).unwrap(), data);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let crypto = SessionCrypto::new("hunter2", "Room");
        assert!(crypto.is_encrypted());
        let token = crypto.encrypt(b"hello").unwrap();
        assert_ne!(token, b"hello");
        assert_eq!(crypto.decrypt(&token).unwrap(), b"hello");
    }

    #[test]
    fn wrong_password_rejected() {
        let a = SessionCrypto::new("hunter2", "Room");
        let b = SessionCrypto::new("hunter3", "Room");
        let token = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&token).is_err());
    }

    #[test]
    fn cross_room_token_rejected() {
        let a = SessionCrypto::new("hunter2", "RoomA");
        let b = SessionCrypto::new("hunter2", "RoomB");
        let token = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&token).is_err());
    }

    #[test]
    fn tampered_token_rejected() {
        let crypto = SessionCrypto::new("hunter2", "Room");
        let mut token = crypto.encrypt(b"secret").unwrap();
        let last = token.len() - 1;
        token[last] ^= 0x01;
        assert!(crypto.decrypt(&token).is_err());
        // Flipping the embedded timestamp breaks the AAD binding too.
        let mut token = crypto.encrypt(b"secret").unwrap();
        token[0] ^= 0x01;
        assert!(crypto.decrypt(&token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let crypto = SessionCrypto::new("hunter2", "Room");
        let stale = crypto
            .encrypt_at(b"secret", unix_now() - PACKET_TTL_SECS - 1)
            .unwrap();
        assert!(crypto.decrypt(&stale).is_err());
        let future = crypto
            .encrypt_at(b"secret", unix_now() + MAX_FUTURE_SKEW_SECS + 10)
            .unwrap();
        assert!(crypto.decrypt(&future).is_err());
    }

    #[test]
    fn truncated_token_rejected() {
        let crypto = SessionCrypto::new("hunter2", "Room");
        let token = crypto.encrypt(b"secret").unwrap();
        assert!(crypto.decrypt(&token[..HEADER_LEN + TAG_LEN - 1]).is_err());
        assert!(crypto.decrypt(&[]).is_err());
    }
}
