//! Error types for SealDrive core.

use crate::types::{AuthorId, BlockId, EntryId, Version};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Result type for local cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur in SealDrive core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] sealdrive_storage::StorageError),

    /// CBOR encoding or decoding error.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Key has the wrong length.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {message}")]
    KeyDerivationFailed {
        /// Description of the failure.
        message: String,
    },

    /// An operation was called with arguments that can never succeed.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of what was wrong.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an encryption error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption error.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    #[must_use]
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Creates a key derivation error.
    pub fn key_derivation_failed(message: impl Into<String>) -> Self {
        Self::KeyDerivationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

/// Reasons a remote manifest is refused.
///
/// Every variant means the bytes never reach the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// The signature does not match the claimed author's key.
    #[error("bad signature from {author}")]
    BadSignature {
        /// Claimed author.
        author: AuthorId,
    },

    /// The manifest describes a different entry than requested.
    #[error("entry mismatch: requested {expected}, payload claims {actual}")]
    EntryMismatch {
        /// Entry that was fetched.
        expected: EntryId,
        /// Entry the payload claims to be.
        actual: EntryId,
    },

    /// The manifest carries a different version than requested.
    #[error("version mismatch on {entry_id}: requested {expected}, payload claims {actual}")]
    VersionMismatch {
        /// Entry that was fetched.
        entry_id: EntryId,
        /// Version that was fetched.
        expected: Version,
        /// Version the payload claims to be.
        actual: Version,
    },

    /// The signed author and the author named inside the manifest differ.
    #[error("author mismatch: expected {expected}, found {actual}")]
    AuthorMismatch {
        /// Author that signed (or was expected to sign).
        expected: AuthorId,
        /// Author found in the payload.
        actual: AuthorId,
    },

    /// The payload could not be parsed, decrypted or is structurally invalid.
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// What was wrong.
        reason: String,
    },

    /// No trusted key is known for the claimed author.
    #[error("unknown or revoked author: {author}")]
    UnknownAuthor {
        /// Claimed author.
        author: AuthorId,
    },
}

impl VerificationError {
    /// Creates a malformed payload error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    /// Returns true if the failure is evidence of tampering by a known party.
    ///
    /// An unknown author is merely untrusted and does not count.
    #[must_use]
    pub fn is_security_incident(&self) -> bool {
        !matches!(self, Self::UnknownAuthor { .. })
    }
}

/// Errors from the local versioned cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A local edit was based on a version that is no longer confirmed.
    #[error("stale base for {entry_id}: edit based on v{claimed}, confirmed is v{confirmed}")]
    StaleBase {
        /// Entry being edited.
        entry_id: EntryId,
        /// Base version claimed by the edit.
        claimed: Version,
        /// Version currently confirmed.
        confirmed: Version,
    },

    /// A manifest does not carry the next version in sequence.
    #[error("out of sequence for {entry_id}: expected v{expected}, got v{actual}")]
    NotNextVersion {
        /// Entry concerned.
        entry_id: EntryId,
        /// Version required.
        expected: Version,
        /// Version supplied.
        actual: Version,
    },

    /// A manifest was stored under the wrong entry.
    #[error("manifest for {actual} stored under {expected}")]
    EntryMismatch {
        /// Slot being written.
        expected: EntryId,
        /// Entry the manifest describes.
        actual: EntryId,
    },

    /// Remote state cannot be adopted over an unsynchronized local edit.
    #[error("entry {0} has a pending local edit")]
    PendingExists(EntryId),

    /// The pending edit changed while a merge was computed.
    #[error("pending edit of {0} changed concurrently")]
    PendingChanged(EntryId),

    /// Persisting the change failed; memory state is untouched.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<sealdrive_storage::StorageError> for CacheError {
    fn from(err: sealdrive_storage::StorageError) -> Self {
        Self::Core(CoreError::Storage(err))
    }
}

/// Errors opening a content block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// The ciphertext does not hash to the referenced block ID.
    #[error("block {id} does not match its content address")]
    AddressMismatch {
        /// Referenced block.
        id: BlockId,
    },

    /// Decryption failed or the plaintext digest does not match.
    #[error("block {id} is corrupted: {reason}")]
    Corrupted {
        /// Referenced block.
        id: BlockId,
        /// What was wrong.
        reason: String,
    },
}
