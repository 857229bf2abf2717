//! Secret-at-rest cipher.
//!
//! Shop signing secrets are stored AES-256-GCM encrypted as
//! `enc:v1:<base64(nonce || ciphertext)>`. Without a configured key the
//! store holds plaintext secrets (local development) and values pass
//! through untouched.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

const ENC_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretCipher {
    cipher: Option<Aes256Gcm>,
}

impl SecretCipher {
    pub fn new(key: Option<[u8; 32]>) -> Self {
        Self {
            cipher: key.map(|key| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))),
        }
    }

    pub fn plaintext() -> Self {
        Self { cipher: None }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let Some(cipher) = &self.cipher else {
            // No key configured: secrets are stored as-is.
            return Ok(plaintext.to_string());
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("secret encryption failed"))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{ENC_PREFIX}{}", BASE64.encode(payload)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(ENC_PREFIX) else {
            return Ok(stored.to_string());
        };

        let Some(cipher) = &self.cipher else {
            bail!("encrypted secret present but SECRET_ENCRYPTION_KEY is not configured");
        };

        let payload = BASE64.decode(encoded).context("decode stored secret")?;
        if payload.len() <= NONCE_LEN {
            bail!("stored secret too short");
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow!("secret decryption failed"))?;
        String::from_utf8(plaintext).context("decrypted secret is not utf-8")
    }
}
