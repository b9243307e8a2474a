/**
 * ENVELOPE - Chiffrement symétrique des payloads du bus
 *
 * RÔLE :
 * Every payload that travels on the bus is sealed with the single process-wide
 * key before publish and opened after receipt. Fernet tokens (AES-128-CBC +
 * HMAC-SHA256) keep the format readable by the older sensor scripts that share
 * the same key file.
 *
 * FONCTIONNEMENT :
 * - SymmetricKey::load_or_create : key file generated on first run, reloaded afterwards
 * - EnvelopeCodec::seal / open : encrypt / decrypt (or plaintext passthrough)
 *
 * Losing the key file makes every previously sealed message undecodable.
 */

use crate::error::{DecodeError, KeyError};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Sealed payload bytes as they travel on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { ciphertext: bytes.into() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.ciphertext
    }
}

/// Url-safe base64 Fernet key, exactly as stored in the key file
#[derive(Clone)]
pub struct SymmetricKey {
    encoded: String,
    cipher: Arc<fernet::Fernet>,
}

impl SymmetricKey {
    pub fn generate() -> Result<Self, KeyError> {
        Self::parse(&fernet::Fernet::generate_key()).ok_or(KeyError::Generate)
    }

    pub fn parse(encoded: &str) -> Option<Self> {
        let trimmed = encoded.trim();
        let cipher = fernet::Fernet::new(trimmed)?;
        Some(Self { encoded: trimmed.to_string(), cipher: Arc::new(cipher) })
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Loads the key at `path`, creating it (and its parent dirs) on first run
    pub fn load_or_create(path: &Path) -> Result<Self, KeyError> {
        let io_err = |source| KeyError::Io { path: path.to_path_buf(), source };

        if path.exists() {
            let raw = std::fs::read(path).map_err(io_err)?;
            let text = String::from_utf8(raw).map_err(|_| KeyError::Invalid(path.to_path_buf()))?;
            let key = Self::parse(&text).ok_or_else(|| KeyError::Invalid(path.to_path_buf()))?;
            info!(path = %path.display(), "loaded envelope key");
            return Ok(key);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let key = Self::generate()?;
        std::fs::write(path, key.as_str().as_bytes()).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }
        info!(path = %path.display(), "generated new envelope key");
        Ok(key)
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for SymmetricKey {}

// never print key material
impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Seals and opens payloads. One mode per deployment, never mixed.
pub enum EnvelopeCodec {
    Fernet(Arc<fernet::Fernet>),
    Plaintext,
}

impl EnvelopeCodec {
    pub fn encrypted(key: &SymmetricKey) -> Self {
        EnvelopeCodec::Fernet(key.cipher.clone())
    }

    pub fn plaintext() -> Self {
        EnvelopeCodec::Plaintext
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, EnvelopeCodec::Fernet(_))
    }

    pub fn seal(&self, plaintext: &str) -> Envelope {
        match self {
            EnvelopeCodec::Fernet(cipher) => Envelope::from_bytes(cipher.encrypt(plaintext.as_bytes())),
            EnvelopeCodec::Plaintext => Envelope::from_bytes(plaintext),
        }
    }

    pub fn open(&self, envelope: &Envelope) -> Result<String, DecodeError> {
        let bytes = match self {
            EnvelopeCodec::Fernet(cipher) => {
                let token = std::str::from_utf8(&envelope.ciphertext).map_err(|_| DecodeError::Cipher)?;
                cipher.decrypt(token.trim()).map_err(|_| DecodeError::Cipher)?
            }
            EnvelopeCodec::Plaintext => envelope.ciphertext.clone(),
        };
        String::from_utf8(bytes).map_err(|_| DecodeError::Utf8)
    }
}

impl fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeCodec::Fernet(_) => f.write_str("EnvelopeCodec::Fernet"),
            EnvelopeCodec::Plaintext => f.write_str("EnvelopeCodec::Plaintext"),
        }
    }
}
