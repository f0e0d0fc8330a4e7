use std::num::NonZeroU32;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use crate::errors::{TransferError, TransferResult};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const ITERATIONS: NonZeroU32 = match NonZeroU32::new(PBKDF2_ITERATIONS) {
    Some(n) => n,
    None => panic!("pbkdf2 iteration count must be non-zero"),
};

/// Output of [`CryptoContext::encrypt_chunk`]. `nonce` is `None` when
/// encryption is disabled, which puts a zero-length iv on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    pub ciphertext: Vec<u8>,
    pub nonce: Option<[u8; NONCE_LEN]>,
}

impl SealedChunk {
    pub fn iv(&self) -> &[u8] {
        match &self.nonce {
            Some(n) => n.as_slice(),
            None => &[],
        }
    }
}

/// Key material for one or more transfer sessions.
///
/// Created when a passphrase is set and handed to every session that should
/// use it. An empty passphrase yields a disabled context that passes chunks
/// through untouched.
#[derive(Clone, Default)]
pub struct CryptoContext {
    cipher: Option<Aes256Gcm>,
    salt: Option<Vec<u8>>,
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("enabled", &self.cipher.is_some())
            .field("salt_len", &self.salt.as_ref().map(Vec::len))
            .finish()
    }
}

impl CryptoContext {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Derive a context from `pass`. A fresh random salt is generated when
    /// none is supplied.
    pub fn from_passphrase(pass: &str, salt: Option<&[u8]>) -> TransferResult<Self> {
        let mut ctx = Self::disabled();
        ctx.set_passphrase(pass, salt)?;
        Ok(ctx)
    }

    /// Replace the key. The current salt is reused when `salt` is `None`, so
    /// re-entering a passphrase keeps peers that already hold the salt in step.
    pub fn set_passphrase(&mut self, pass: &str, salt: Option<&[u8]>) -> TransferResult<()> {
        if pass.is_empty() {
            self.cipher = None;
            return Ok(());
        }
        let salt = match (salt, self.salt.take()) {
            (Some(s), _) => s.to_vec(),
            (None, Some(existing)) => existing,
            (None, None) => random_salt()?.to_vec(),
        };
        let key = derive_key(pass, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| TransferError::Other(anyhow::anyhow!("cipher init: {e}")))?;
        self.cipher = Some(cipher);
        self.salt = Some(salt);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Salt to advertise during negotiation; only meaningful while a key is set.
    pub fn salt(&self) -> Option<&[u8]> {
        if self.cipher.is_some() {
            self.salt.as_deref()
        } else {
            None
        }
    }

    pub fn encrypt_chunk(&self, plaintext: Vec<u8>) -> TransferResult<SealedChunk> {
        let Some(cipher) = &self.cipher else {
            return Ok(SealedChunk {
                ciphertext: plaintext,
                nonce: None,
            });
        };
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| TransferError::Other(anyhow::anyhow!("encrypt chunk: {e}")))?;
        let mut out = [0u8; NONCE_LEN];
        out.copy_from_slice(nonce.as_slice());
        Ok(SealedChunk {
            ciphertext,
            nonce: Some(out),
        })
    }

    /// Reverse [`encrypt_chunk`](Self::encrypt_chunk). An empty `nonce` means
    /// the sender did not encrypt.
    pub fn decrypt_chunk(&self, ciphertext: Vec<u8>, nonce: &[u8]) -> TransferResult<Vec<u8>> {
        match (&self.cipher, nonce.is_empty()) {
            (None, true) => Ok(ciphertext),
            (None, false) => Err(TransferError::Decryption(
                "chunk is encrypted but no passphrase is set".into(),
            )),
            (Some(_), true) => Err(TransferError::Decryption(
                "chunk carries no nonce but a key is set".into(),
            )),
            (Some(cipher), false) => {
                if nonce.len() != NONCE_LEN {
                    return Err(TransferError::Decryption(format!(
                        "nonce must be {NONCE_LEN} bytes, got {}",
                        nonce.len()
                    )));
                }
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext.as_slice())
                    .map_err(|_| TransferError::Decryption("authentication tag mismatch".into()))
            }
        }
    }
}

fn derive_key(pass: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        ITERATIONS,
        salt,
        pass.as_bytes(),
        &mut key,
    );
    key
}

pub fn random_salt() -> TransferResult<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| TransferError::Other(anyhow::anyhow!("system rng unavailable")))?;
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_context_passes_chunks_through() {
        let ctx = CryptoContext::from_passphrase("", None).unwrap();
        assert!(!ctx.is_enabled());
        assert!(ctx.salt().is_none());
        let sealed = ctx.encrypt_chunk(b"plain bytes".to_vec()).unwrap();
        assert_eq!(sealed.ciphertext, b"plain bytes");
        assert!(sealed.iv().is_empty());
        let back = ctx.decrypt_chunk(sealed.ciphertext.clone(), sealed.iv()).unwrap();
        assert_eq!(back, b"plain bytes");
    }

    #[test]
    fn round_trip_with_key_for_assorted_lengths() {
        let ctx = CryptoContext::from_passphrase("hunter2", None).unwrap();
        assert_eq!(ctx.salt().unwrap().len(), SALT_LEN);
        for len in [0usize, 1, 15, 16, 4096, 128 * 1024] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = ctx.encrypt_chunk(plain.clone()).unwrap();
            assert_eq!(sealed.iv().len(), NONCE_LEN);
            assert_eq!(sealed.ciphertext.len(), len + 16);
            let back = ctx.decrypt_chunk(sealed.ciphertext.clone(), sealed.iv()).unwrap();
            assert_eq!(back, plain);
        }
    }

    #[test]
    fn nonces_are_fresh_per_chunk() {
        let ctx = CryptoContext::from_passphrase("hunter2", None).unwrap();
        let a = ctx.encrypt_chunk(vec![7; 32]).unwrap();
        let b = ctx.encrypt_chunk(vec![7; 32]).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn same_passphrase_and_salt_derive_the_same_key() {
        let sender = CryptoContext::from_passphrase("hunter2", None).unwrap();
        let salt = sender.salt().unwrap().to_vec();
        let receiver = CryptoContext::from_passphrase("hunter2", Some(&salt)).unwrap();
        let sealed = sender.encrypt_chunk(b"secret".to_vec()).unwrap();
        assert_eq!(
            receiver.decrypt_chunk(sealed.ciphertext.clone(), sealed.iv()).unwrap(),
            b"secret"
        );
    }

    #[test]
    fn wrong_passphrase_fails_with_decryption_error() {
        let sender = CryptoContext::from_passphrase("hunter2", None).unwrap();
        let salt = sender.salt().unwrap().to_vec();
        let receiver = CryptoContext::from_passphrase("hunter3", Some(&salt)).unwrap();
        let sealed = sender.encrypt_chunk(b"secret".to_vec()).unwrap();
        let err = receiver
            .decrypt_chunk(sealed.ciphertext.clone(), sealed.iv())
            .unwrap_err();
        assert!(matches!(err, TransferError::Decryption(_)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let ctx = CryptoContext::from_passphrase("hunter2", None).unwrap();
        let mut sealed = ctx.encrypt_chunk(b"secret".to_vec()).unwrap();
        sealed.ciphertext[0] ^= 0x01;
        let err = ctx
            .decrypt_chunk(sealed.ciphertext.clone(), sealed.iv())
            .unwrap_err();
        assert!(matches!(err, TransferError::Decryption(_)));
    }

    #[test]
    fn missing_nonce_or_missing_key_is_a_decryption_error() {
        let keyed = CryptoContext::from_passphrase("hunter2", None).unwrap();
        assert!(matches!(
            keyed.decrypt_chunk(vec![1, 2, 3], &[]),
            Err(TransferError::Decryption(_))
        ));
        let plain = CryptoContext::disabled();
        assert!(matches!(
            plain.decrypt_chunk(vec![1, 2, 3], &[0u8; NONCE_LEN]),
            Err(TransferError::Decryption(_))
        ));
    }

    #[test]
    fn resetting_passphrase_reuses_salt_and_clearing_disables() {
        let mut ctx = CryptoContext::from_passphrase("one", None).unwrap();
        let salt = ctx.salt().unwrap().to_vec();
        ctx.set_passphrase("two", None).unwrap();
        assert_eq!(ctx.salt().unwrap(), salt.as_slice());
        ctx.set_passphrase("", None).unwrap();
        assert!(!ctx.is_enabled());
    }
}
