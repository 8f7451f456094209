//! Workspace secret key and author signing identity.

use crate::error::{CoreError, CoreResult};
use crate::types::AuthorId;
use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Symmetric key shared by every member of a workspace.
///
/// Ciphertexts produced by [`seal`](Self::seal) are laid out as
/// `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// The key is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CoreError::invalid_key_size(bytes.len(), KEY_SIZE));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Derives a key from high-entropy input key material with HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn derive(ikm: &[u8], salt: &[u8]) -> CoreResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"sealdrive-workspace-key-v1", &mut bytes)
            .map_err(|_| CoreError::key_derivation_failed("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }

    /// Encrypts `plaintext`, binding it to `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EncryptionFailed`] if the cipher fails.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> CoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CoreError::encryption_failed("encryption error"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend(ciphertext);
        Ok(out)
    }

    /// Decrypts data produced by [`seal`](Self::seal) with the same `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DecryptionFailed`] on a wrong key, wrong AAD or
    /// tampered bytes.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> CoreResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CoreError::decryption_failed("ciphertext too short"));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher()
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[NONCE_SIZE..],
                    aad,
                },
            )
            .map_err(|_| CoreError::decryption_failed("decryption error"))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The local user's author ID and Ed25519 signing key.
#[derive(Clone)]
pub struct SigningIdentity {
    author: AuthorId,
    signing_key: SigningKey,
}

impl SigningIdentity {
    /// Generates a fresh identity for `author`.
    #[must_use]
    pub fn generate(author: AuthorId) -> Self {
        Self {
            author,
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Restores an identity from its 32-byte secret seed.
    #[must_use]
    pub fn from_seed(author: AuthorId, seed: &[u8; 32]) -> Self {
        Self {
            author,
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Returns the author ID.
    #[must_use]
    pub fn author(&self) -> &AuthorId {
        &self.author
    }

    /// Returns the public key other members verify against.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signs a message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("author", &self.author)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}
