//! Signify-compatible Ed25519 signing and verification.
//!
//! Keys and signatures use the wire formats of OpenBSD's `signify` tool:
//! a two-byte algorithm tag (`Ed`) and an eight-byte key number bind each
//! signature to the keypair that produced it, and everything travels as
//! base64. Secret keys carry the unencrypted KDF form only (algorithm 0,
//! zero rounds) plus an eight-byte SHA-512 checksum over the key material.
//!
//! Every comparison that involves key or signature material is
//! constant-time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

use crate::error::UpdateError;

/// Two-byte algorithm tag: `E`, `d`.
pub const ALGORITHM: [u8; 2] = [0x45, 0x64];

/// Decoded public key length: tag (2) + key number (8) + Ed25519 key (32).
pub const PUBLIC_KEY_LEN: usize = 42;

/// Decoded secret key length: tag (2) + KDF algorithm (2) + KDF rounds (4)
/// + salt (16) + checksum (8) + key number (8) + Ed25519 keypair (64).
pub const SECRET_KEY_LEN: usize = 104;

/// Decoded signature length: tag (2) + key number (8) + Ed25519 signature (64).
pub const SIGNATURE_LEN: usize = 74;

/// Length of the algorithm + key number prefix shared by keys and signatures.
const PREFIX_LEN: usize = 10;

/// Byte range of the checksum inside a decoded secret key.
const CHECKSUM_RANGE: std::ops::Range<usize> = 24..32;

/// Byte offset of the Ed25519 keypair inside a decoded secret key.
const KEYPAIR_OFFSET: usize = 40;

/// A parsed signify public key.
#[derive(Debug, Clone)]
pub struct PublicKey {
    raw: [u8; PUBLIC_KEY_LEN],
    key: VerifyingKey,
}

impl PublicKey {
    /// Parse a public key from its base64 encoding.
    pub fn from_base64(encoded: &str) -> Result<Self, UpdateError> {
        let bytes = BASE64.decode(encoded.trim())?;
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(UpdateError::BadLength {
                what: "public key",
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[..2] != ALGORITHM {
            return Err(UpdateError::UnknownAlgorithm);
        }
        let key_bytes: [u8; 32] = bytes[PREFIX_LEN..].try_into().expect("length checked above");
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| UpdateError::ConfigInvalid(format!("invalid Ed25519 public key: {e}")))?;
        let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().expect("length checked above");
        Ok(Self { raw, key })
    }

    /// Base64 encoding of the full wire form.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.raw)
    }

    /// The eight-byte key number.
    pub fn key_number(&self) -> &[u8] {
        &self.raw[2..PREFIX_LEN]
    }

    /// Algorithm + key number prefix used to match signatures to keys.
    fn prefix(&self) -> &[u8] {
        &self.raw[..PREFIX_LEN]
    }
}

/// A parsed signify secret key (unencrypted form only).
#[derive(Clone)]
pub struct SecretKey {
    raw: [u8; SECRET_KEY_LEN],
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.debug_struct("SecretKey").field("key_number", &self.key_number()).finish_non_exhaustive()
    }
}

impl SecretKey {
    /// Parse a secret key from its base64 encoding.
    ///
    /// Validates the algorithm tag, the unencrypted KDF parameters and the
    /// checksum over the embedded keypair before accepting the key.
    pub fn from_base64(encoded: &str) -> Result<Self, UpdateError> {
        let bytes = BASE64.decode(encoded.trim())?;
        if bytes.len() < SECRET_KEY_LEN {
            return Err(UpdateError::BadLength {
                what: "secret key",
                expected: SECRET_KEY_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[..2] != ALGORITHM {
            return Err(UpdateError::UnknownAlgorithm);
        }
        // KDF algorithm (2 bytes) and rounds (4 bytes) must all be zero:
        // encrypted secret keys are not accepted here.
        if bytes[2..8].iter().any(|&b| b != 0) {
            return Err(UpdateError::UnsupportedKdf);
        }
        let computed = keypair_checksum(&bytes[KEYPAIR_OFFSET..SECRET_KEY_LEN]);
        if computed[..].ct_eq(&bytes[CHECKSUM_RANGE]).unwrap_u8() != 1 {
            return Err(UpdateError::ChecksumMismatch);
        }
        let raw: [u8; SECRET_KEY_LEN] =
            bytes[..SECRET_KEY_LEN].try_into().expect("length checked above");
        Ok(Self { raw })
    }

    /// Base64 encoding of the full wire form.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.raw)
    }

    /// The eight-byte key number.
    pub fn key_number(&self) -> &[u8] {
        &self.raw[32..40]
    }

    fn signing_key(&self) -> Result<SigningKey, UpdateError> {
        let keypair: [u8; 64] =
            self.raw[KEYPAIR_OFFSET..].try_into().expect("fixed-size field");
        SigningKey::from_keypair_bytes(&keypair).map_err(|_| UpdateError::InvalidSignature)
    }
}

/// First eight bytes of SHA-512 over the embedded Ed25519 keypair.
fn keypair_checksum(keypair: &[u8]) -> [u8; 8] {
    let digest = Sha512::digest(keypair);
    digest[..8].try_into().expect("SHA-512 digest is 64 bytes")
}

/// Generate a fresh signify keypair with a random key number.
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    let mut key_number = [0u8; 8];
    OsRng.fill_bytes(&mut key_number);
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let signing = SigningKey::generate(&mut OsRng);
    let keypair = signing.to_keypair_bytes();

    let mut secret = [0u8; SECRET_KEY_LEN];
    secret[..2].copy_from_slice(&ALGORITHM);
    // Bytes 2..8 stay zero: unencrypted KDF algorithm and zero rounds.
    secret[8..24].copy_from_slice(&salt);
    secret[CHECKSUM_RANGE].copy_from_slice(&keypair_checksum(&keypair));
    secret[32..40].copy_from_slice(&key_number);
    secret[KEYPAIR_OFFSET..].copy_from_slice(&keypair);

    let mut public = [0u8; PUBLIC_KEY_LEN];
    public[..2].copy_from_slice(&ALGORITHM);
    public[2..PREFIX_LEN].copy_from_slice(&key_number);
    public[PREFIX_LEN..].copy_from_slice(signing.verifying_key().as_bytes());

    let public_key = PublicKey {
        raw: public,
        key: signing.verifying_key(),
    };
    (public_key, SecretKey { raw: secret })
}

/// Sign `text` with a secret key, producing a base64 signify signature.
pub fn sign(secret: &SecretKey, text: &str) -> Result<String, UpdateError> {
    let signing = secret.signing_key()?;
    let signature = signing.sign(text.as_bytes());

    let mut out = [0u8; SIGNATURE_LEN];
    out[..2].copy_from_slice(&ALGORITHM);
    out[2..PREFIX_LEN].copy_from_slice(secret.key_number());
    out[PREFIX_LEN..].copy_from_slice(&signature.to_bytes());
    Ok(BASE64.encode(out))
}

/// Verify a base64 signify signature over `text` against a set of keys.
///
/// The key whose algorithm + key number prefix matches the signature's is
/// selected with a constant-time comparison; the first match wins. Fails
/// with [`UpdateError::NoMatchingKey`] when no key matches and
/// [`UpdateError::InvalidSignature`] when the Ed25519 check fails.
pub fn verify(keys: &[PublicKey], signature_b64: &str, text: &str) -> Result<(), UpdateError> {
    let bytes = BASE64.decode(signature_b64.trim())?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(UpdateError::BadLength {
            what: "signature",
            expected: SIGNATURE_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[..2] != ALGORITHM {
        return Err(UpdateError::UnknownAlgorithm);
    }

    let prefix = &bytes[..PREFIX_LEN];
    let matched = keys
        .iter()
        .find(|key| key.prefix().ct_eq(prefix).unwrap_u8() == 1)
        .ok_or(UpdateError::NoMatchingKey)?;

    let sig_bytes: [u8; 64] = bytes[PREFIX_LEN..].try_into().expect("length checked above");
    let signature = DalekSignature::from_bytes(&sig_bytes);
    matched
        .key
        .verify(text.as_bytes(), &signature)
        .map_err(|_| {
            tracing::warn!(key_number = ?matched.key_number(), "signature verification failed");
            UpdateError::InvalidSignature
        })
}

/// Write a key to disk in the two-line signify file format.
///
/// Secret key files are created with mode 0600 on Unix.
pub fn write_key_file(
    path: &std::path::Path,
    comment: &str,
    key_b64: &str,
    secret: bool,
) -> Result<(), UpdateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("untrusted comment: {comment}\n{key_b64}\n"))?;

    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = secret;

    Ok(())
}

/// Read the base64 payload from a two-line signify key file.
pub fn read_key_file(path: &std::path::Path) -> Result<String, UpdateError> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();
    let _comment = lines.next();
    lines
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| {
            UpdateError::ConfigInvalid(format!("key file {} has no key line", path.display()))
        })
}
