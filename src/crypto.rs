//! Storage Encryption
//! Mission: Encrypt ledger lines and image blobs at rest with AES-GCM

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{aes::Aes192, Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde_json::{json, Value};

const NONCE_SIZE: usize = 12;

type Aes192Gcm = AesGcm<Aes192, U12>;

enum CipherKind {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl CipherKind {
    fn encrypt(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let out = match self {
            CipherKind::Aes128(c) => c.encrypt(nonce, plaintext),
            CipherKind::Aes192(c) => c.encrypt(nonce, plaintext),
            CipherKind::Aes256(c) => c.encrypt(nonce, plaintext),
        };
        out.map_err(|_| anyhow!("AES-GCM encryption failed"))
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let out = match self {
            CipherKind::Aes128(c) => c.decrypt(nonce, ciphertext),
            CipherKind::Aes192(c) => c.decrypt(nonce, ciphertext),
            CipherKind::Aes256(c) => c.decrypt(nonce, ciphertext),
        };
        out.map_err(|_| anyhow!("AES-GCM decryption failed"))
    }
}

/// Encryption handle shared by all stores. When disabled, every encode is a
/// pass-through; decode still recognizes and rejects encrypted lines so a
/// misconfigured reader fails loudly instead of yielding garbage entries.
pub struct Crypto {
    cipher: Option<CipherKind>,
}

impl Crypto {
    /// Build from configuration. `enabled` without a usable key is a startup
    /// error; a key with encryption off still allows decrypting old data.
    pub fn new(enabled: bool, key_b64: &str) -> Result<Self> {
        if !enabled && key_b64.trim().is_empty() {
            return Ok(Self { cipher: None });
        }

        let key = URL_SAFE_NO_PAD
            .decode(key_b64.trim().trim_end_matches('='))
            .context("DATA_ENCRYPTION_KEY is not valid urlsafe base64")?;

        let cipher = match key.len() {
            16 => CipherKind::Aes128(
                Aes128Gcm::new_from_slice(&key).map_err(|_| anyhow!("bad AES-128 key"))?,
            ),
            24 => CipherKind::Aes192(
                Aes192Gcm::new_from_slice(&key).map_err(|_| anyhow!("bad AES-192 key"))?,
            ),
            32 => CipherKind::Aes256(
                Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("bad AES-256 key"))?,
            ),
            n => bail!("DATA_ENCRYPTION_KEY must decode to 16, 24, or 32 bytes, got {n}"),
        };

        Ok(Self {
            cipher: if enabled { Some(cipher) } else { None },
        })
    }

    /// No encryption; plaintext pass-through. Used by tests and dev setups.
    pub fn disabled() -> Self {
        Self { cipher: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// File extension for stored images: `.bin` when encrypted, `.jpg` otherwise.
    pub fn image_extension(&self) -> &'static str {
        if self.is_enabled() {
            "bin"
        } else {
            "jpg"
        }
    }

    /// Encrypt a raw payload as `nonce || ciphertext`.
    pub fn encrypt_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| anyhow!("encryption is disabled"))?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher.encrypt(&nonce, data)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext` payload.
    pub fn decrypt_bytes(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| anyhow!("no decryption key configured"))?;

        if payload.len() < NONCE_SIZE {
            bail!("encrypted payload is too short");
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        cipher.decrypt(nonce, ciphertext)
    }

    /// Serialize a ledger entry to one line, encrypting when enabled.
    /// Encrypted form: `{"enc": "<urlsafe-b64>", "v": 1}`.
    pub fn encode_entry(&self, entry: &Value) -> Result<String> {
        if !self.is_enabled() {
            return serde_json::to_string(entry).context("serialize ledger entry");
        }
        let plaintext = serde_json::to_vec(entry).context("serialize ledger entry")?;
        let payload = self.encrypt_bytes(&plaintext)?;
        let wrapper = json!({ "enc": URL_SAFE_NO_PAD.encode(payload), "v": 1 });
        serde_json::to_string(&wrapper).context("serialize encrypted wrapper")
    }

    /// Parse one ledger line. Returns `None` for lines that fail to parse or
    /// decrypt; readers skip them (a torn tail must not poison a whole read).
    pub fn decode_entry(&self, line: &str) -> Option<Value> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let value: Value = serde_json::from_str(trimmed).ok()?;
        let Some(enc) = value.get("enc").and_then(Value::as_str) else {
            // Plaintext lines pass through whether or not encryption is on.
            return value.is_object().then_some(value);
        };

        let payload = URL_SAFE_NO_PAD.decode(enc.trim_end_matches('=')).ok()?;
        let plaintext = self.decrypt_bytes(&payload).ok()?;
        let inner: Value = serde_json::from_slice(&plaintext).ok()?;
        inner.is_object().then_some(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_crypto() -> Crypto {
        // 32 zero bytes, urlsafe-b64.
        let key = URL_SAFE_NO_PAD.encode([0u8; 32]);
        Crypto::new(true, &key).unwrap()
    }

    #[test]
    fn test_entry_round_trip() {
        let crypto = test_crypto();
        let entry = json!({"case_id": "10000", "status": "pending", "predictions": []});

        let line = crypto.encode_entry(&entry).unwrap();
        assert!(line.contains("\"enc\""));
        assert!(!line.contains("case_id"));

        let decoded = crypto.decode_entry(&line).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_plaintext_passes_through() {
        let crypto = test_crypto();
        let decoded = crypto.decode_entry(r#"{"case_id": "10001"}"#).unwrap();
        assert_eq!(decoded["case_id"], "10001");

        let disabled = Crypto::disabled();
        let decoded = disabled.decode_entry(r#"{"case_id": "10001"}"#).unwrap();
        assert_eq!(decoded["case_id"], "10001");
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let crypto = test_crypto();
        assert!(crypto.decode_entry("").is_none());
        assert!(crypto.decode_entry("not json").is_none());
        assert!(crypto.decode_entry(r#"{"enc": "zzzz!!"}"#).is_none());
        // Valid JSON but not an object.
        assert!(crypto.decode_entry("[1, 2]").is_none());
    }

    #[test]
    fn test_image_bytes_round_trip() {
        let crypto = test_crypto();
        let blob = vec![7u8; 1024];
        let payload = crypto.encrypt_bytes(&blob).unwrap();
        assert_ne!(payload, blob);
        assert_eq!(crypto.decrypt_bytes(&payload).unwrap(), blob);
    }

    #[test]
    fn test_key_length_validation() {
        let short = URL_SAFE_NO_PAD.encode([0u8; 15]);
        assert!(Crypto::new(true, &short).is_err());
        assert_eq!(test_crypto().image_extension(), "bin");
        assert_eq!(Crypto::disabled().image_extension(), "jpg");
    }

    #[test]
    fn test_nonces_are_fresh() {
        let crypto = test_crypto();
        let a = crypto.encrypt_bytes(b"same plaintext").unwrap();
        let b = crypto.encrypt_bytes(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }
}
