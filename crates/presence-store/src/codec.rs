//! Face template blob encoding, optionally sealed with AES-256-GCM.
//!
//! Blob layout: one format byte, then either the little-endian f32 components
//! (plain) or a 12-byte nonce followed by the ciphertext (sealed). Sealed blobs
//! bind the owning identity and version as associated data, so a template
//! copied onto another row fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use presence_core::FeatureVector;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

const FORMAT_PLAIN: u8 = 1;
const FORMAT_SEALED: u8 = 2;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("template blob is truncated")]
    Truncated,
    #[error("unknown template format byte {0:#04x}")]
    UnknownFormat(u8),
    #[error("template is encrypted but no template key is configured")]
    MissingKey,
    #[error("template authentication failed (wrong key or tampered row)")]
    Authentication,
    #[error("template key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },
    #[error("template key file is empty")]
    EmptyKey,
}

/// 256-bit key for sealing templates at rest.
pub struct TemplateKey([u8; KEY_LEN]);

impl TemplateKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a key from a passphrase with SHA-256.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self(Sha256::digest(passphrase.as_bytes()).into())
    }

    /// Load a key file: exactly 32 bytes are used raw, anything else is
    /// treated as a passphrase (surrounding whitespace ignored).
    pub fn load(path: &Path) -> Result<Self, CodecError> {
        let bytes = std::fs::read(path).map_err(|source| CodecError::KeyFile {
            path: path.display().to_string(),
            source,
        })?;
        if let Ok(raw) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
            return Ok(Self(raw));
        }
        let passphrase = String::from_utf8_lossy(&bytes);
        let passphrase = passphrase.trim();
        if passphrase.is_empty() {
            return Err(CodecError::EmptyKey);
        }
        Ok(Self::from_passphrase(passphrase))
    }
}

/// Encodes feature vectors to and from database blobs.
pub struct TemplateCodec {
    cipher: Option<Aes256Gcm>,
}

impl TemplateCodec {
    pub fn plain() -> Self {
        Self { cipher: None }
    }

    pub fn sealed(key: &TemplateKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key.0);
        Self {
            cipher: Some(Aes256Gcm::new(key)),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encode `vector`; `context` identifies the owning row.
    pub fn encode(&self, vector: &FeatureVector, context: &[u8]) -> Result<Vec<u8>, CodecError> {
        let raw: Vec<u8> = vector
            .values()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        let Some(cipher) = &self.cipher else {
            let mut blob = Vec::with_capacity(1 + raw.len());
            blob.push(FORMAT_PLAIN);
            blob.extend_from_slice(&raw);
            return Ok(blob);
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &raw,
                    aad: context,
                },
            )
            .map_err(|_| CodecError::Authentication)?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        blob.push(FORMAT_SEALED);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    pub fn decode(&self, blob: &[u8], context: &[u8]) -> Result<FeatureVector, CodecError> {
        let (&format, body) = blob.split_first().ok_or(CodecError::Truncated)?;
        let raw = match format {
            FORMAT_PLAIN => body.to_vec(),
            FORMAT_SEALED => {
                let cipher = self.cipher.as_ref().ok_or(CodecError::MissingKey)?;
                if body.len() < NONCE_LEN {
                    return Err(CodecError::Truncated);
                }
                let (nonce, sealed) = body.split_at(NONCE_LEN);
                cipher
                    .decrypt(
                        Nonce::from_slice(nonce),
                        Payload {
                            msg: sealed,
                            aad: context,
                        },
                    )
                    .map_err(|_| CodecError::Authentication)?
            }
            other => return Err(CodecError::UnknownFormat(other)),
        };

        if raw.len() % 4 != 0 {
            return Err(CodecError::Truncated);
        }
        let values = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(FeatureVector::new(values))
    }
}
