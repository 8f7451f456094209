//! Cryptographic operations for SealDrive.
//!
//! ## Security Model
//!
//! - Manifests and blocks are encrypted with the workspace key (AES-256-GCM)
//! - Manifests are signed by their author (Ed25519) over the ciphertext
//! - Verification never returns a partially checked manifest
//! - Keys are zeroized on drop and redacted in `Debug` output

mod envelope;
mod keys;

pub use envelope::{claimed_author, seal_manifest, verify_and_decrypt};
pub use keys::{SecretKey, SigningIdentity, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub use ed25519_dalek::VerifyingKey;
