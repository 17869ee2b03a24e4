//! Batch codec: an ordered list of named byte-transform stages.
//!
//! Encoding runs the stages front to back, decoding back to front. The usual
//! layout is `deflate → encrypt → authenticate`, so the authentication tag
//! covers the ciphertext and is checked before anything is decrypted.

use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracevault_core::trace::TraceRecord;

use crate::config::PipelineConfig;
use crate::error::{CodecError, ConfigError};

/// Size of the XChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of an HMAC-SHA256 tag in bytes.
pub const TAG_SIZE: usize = 32;

/// Size of encryption and authentication keys (256-bit).
pub const KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

pub trait CodecStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError>;

    fn fail(&self, reason: impl ToString) -> CodecError
    where
        Self: Sized,
    {
        CodecError::Stage {
            stage: self.name(),
            reason: reason.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stages
// ─────────────────────────────────────────────────────────────────────────────

/// zlib compression.
pub struct DeflateStage {
    level: u32,
}

impl DeflateStage {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl CodecStage for DeflateStage {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(&data).map_err(|e| self.fail(e))?;
        encoder.finish().map_err(|e| self.fail(e))
    }

    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        let mut decoder = ZlibDecoder::new(&data[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|e| self.fail(e))?;
        Ok(out)
    }
}

/// XChaCha20-Poly1305 with a fresh random nonce per batch.
///
/// Layout: `nonce (24 B) || ciphertext+tag`.
pub struct EncryptStage {
    cipher: XChaCha20Poly1305,
}

impl EncryptStage {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl CodecStage for EncryptStage {
    fn name(&self) -> &'static str {
        "encrypt"
    }

    fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        let nonce: [u8; NONCE_SIZE] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), data.as_slice())
            .map_err(|_| self.fail("encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        if data.len() < NONCE_SIZE {
            return Err(self.fail("ciphertext shorter than nonce"));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| self.fail("decryption failed (wrong key or tampered data)"))
    }
}

/// HMAC-SHA256 over the payload. Layout: `tag (32 B) || payload`.
pub struct AuthenticateStage {
    key: [u8; KEY_SIZE],
}

impl AuthenticateStage {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    fn mac(&self) -> Result<HmacSha256, CodecError> {
        <HmacSha256 as Mac>::new_from_slice(&self.key).map_err(|e| self.fail(e))
    }
}

impl CodecStage for AuthenticateStage {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        let mut mac = self.mac()?;
        mac.update(&data);
        let tag = mac.finalize().into_bytes();
        let mut out = Vec::with_capacity(TAG_SIZE + data.len());
        out.extend_from_slice(&tag);
        out.extend_from_slice(&data);
        Ok(out)
    }

    fn decode(&self, mut data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        if data.len() < TAG_SIZE {
            return Err(self.fail("payload shorter than tag"));
        }
        let mut mac = self.mac()?;
        mac.update(&data[TAG_SIZE..]);
        mac.verify_slice(&data[..TAG_SIZE])
            .map_err(|_| self.fail("integrity tag mismatch"))?;
        Ok(data.split_off(TAG_SIZE))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

pub struct BatchCodec {
    stages: Vec<Box<dyn CodecStage>>,
}

impl BatchCodec {
    /// A codec with no stages; bytes pass through unchanged.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn with_stage(mut self, stage: impl CodecStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let mut codec = Self::new().with_stage(DeflateStage::new(config.deflate_level));
        if let Some(key) = &config.encryption_key {
            codec = codec.with_stage(EncryptStage::new(&parse_key("encryption_key", key)?));
        }
        if let Some(key) = &config.hmac_key {
            codec = codec.with_stage(AuthenticateStage::new(parse_key("hmac_key", key)?));
        }
        Ok(codec)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        self.stages.iter().try_fold(data, |acc, stage| stage.encode(acc))
    }

    pub fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        self.stages
            .iter()
            .rev()
            .try_fold(data, |acc, stage| stage.decode(acc))
    }

    pub fn encode_records(&self, records: &[TraceRecord]) -> Result<Vec<u8>, CodecError> {
        let packed =
            serde_json::to_vec(records).map_err(|e| CodecError::Serialization(e.to_string()))?;
        self.encode(packed)
    }

    pub fn decode_records(&self, data: &[u8]) -> Result<Vec<TraceRecord>, CodecError> {
        let packed = self.decode(data.to_vec())?;
        serde_json::from_slice(&packed).map_err(|e| CodecError::Serialization(e.to_string()))
    }
}

impl Default for BatchCodec {
    fn default() -> Self {
        Self::new().with_stage(DeflateStage::new(PipelineConfig::default().deflate_level))
    }
}

fn parse_key(field: &str, hex_key: &str) -> Result<[u8; KEY_SIZE], ConfigError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| ConfigError::Invalid(format!("pipeline.{field}: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ConfigError::Invalid(format!(
            "pipeline.{field} must be {KEY_SIZE} bytes, got {}",
            b.len()
        ))
    })
}
