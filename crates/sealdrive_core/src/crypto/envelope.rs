//! Sealing and verification of manifests.
//!
//! A sealed manifest is the CBOR encoding of an envelope:
//!
//! ```text
//! { author, sealed: nonce || AES-GCM(CBOR(manifest)), signature }
//! ```
//!
//! The signature covers the author and the sealed bytes, so it can be
//! checked before anything is decrypted.

use super::keys::SecretKey;
use super::SigningIdentity;
use crate::codec::{from_cbor, to_cbor};
use crate::error::{CoreError, CoreResult, VerificationError};
use crate::manifest::Manifest;
use crate::types::{AuthorId, EntryId, Version};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

const SIGNATURE_CONTEXT: &[u8] = b"sealdrive-manifest-v1";
const MANIFEST_AAD: &[u8] = b"sealdrive-manifest";

#[derive(Serialize, Deserialize)]
struct Envelope {
    author: AuthorId,
    sealed: Vec<u8>,
    signature: Vec<u8>,
}

fn signing_input(author: &AuthorId, sealed: &[u8]) -> Vec<u8> {
    let author = author.as_str().as_bytes();
    let mut input = Vec::with_capacity(SIGNATURE_CONTEXT.len() + 8 + author.len() + sealed.len());
    input.extend_from_slice(SIGNATURE_CONTEXT);
    input.extend_from_slice(&(author.len() as u64).to_le_bytes());
    input.extend_from_slice(author);
    input.extend_from_slice(sealed);
    input
}

/// Encrypts a manifest with the workspace key and signs it.
///
/// # Errors
///
/// Fails if the manifest was not authored by `identity`, or if encoding
/// or encryption fails.
pub fn seal_manifest(
    manifest: &Manifest,
    identity: &SigningIdentity,
    workspace_key: &SecretKey,
) -> CoreResult<Vec<u8>> {
    if manifest.author != *identity.author() {
        return Err(CoreError::invalid_operation(format!(
            "cannot sign a manifest authored by {} as {}",
            manifest.author,
            identity.author()
        )));
    }

    let payload = to_cbor(manifest)?;
    let sealed = workspace_key.seal(&payload, MANIFEST_AAD)?;
    let signature = identity.sign(&signing_input(identity.author(), &sealed));

    to_cbor(&Envelope {
        author: identity.author().clone(),
        sealed,
        signature: signature.to_bytes().to_vec(),
    })
}

/// Reads the claimed author of a sealed manifest without verifying it.
///
/// Used only to look up the key to verify with.
///
/// # Errors
///
/// Returns [`VerificationError::MalformedPayload`] if the bytes are not an
/// envelope.
pub fn claimed_author(raw: &[u8]) -> Result<AuthorId, VerificationError> {
    let envelope: Envelope =
        from_cbor(raw).map_err(|e| VerificationError::malformed(e.to_string()))?;
    Ok(envelope.author)
}

/// Verifies and decrypts a sealed manifest.
///
/// Checks, in order: the envelope parses, it names `author`, the signature
/// verifies under `author_key`, the payload decrypts and decodes, the
/// embedded author matches, the embedded entry is `expected_entry`, the
/// embedded version is `expected_version` (when given), and the content is
/// structurally valid. Nothing is returned unless every check passes.
///
/// # Errors
///
/// Returns the [`VerificationError`] of the first failing check.
pub fn verify_and_decrypt(
    raw: &[u8],
    author: &AuthorId,
    author_key: &VerifyingKey,
    workspace_key: &SecretKey,
    expected_entry: EntryId,
    expected_version: Option<Version>,
) -> Result<Manifest, VerificationError> {
    let envelope: Envelope =
        from_cbor(raw).map_err(|e| VerificationError::malformed(e.to_string()))?;

    if envelope.author != *author {
        return Err(VerificationError::AuthorMismatch {
            expected: author.clone(),
            actual: envelope.author,
        });
    }

    let signature_bytes: [u8; 64] = envelope
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| VerificationError::BadSignature {
            author: author.clone(),
        })?;
    let signature = Signature::from_bytes(&signature_bytes);
    author_key
        .verify_strict(&signing_input(author, &envelope.sealed), &signature)
        .map_err(|_| VerificationError::BadSignature {
            author: author.clone(),
        })?;

    let payload = workspace_key
        .open(&envelope.sealed, MANIFEST_AAD)
        .map_err(|e| VerificationError::malformed(e.to_string()))?;
    let manifest: Manifest =
        from_cbor(&payload).map_err(|e| VerificationError::malformed(e.to_string()))?;

    if manifest.author != *author {
        return Err(VerificationError::AuthorMismatch {
            expected: author.clone(),
            actual: manifest.author,
        });
    }
    if manifest.entry_id != expected_entry {
        return Err(VerificationError::EntryMismatch {
            expected: expected_entry,
            actual: manifest.entry_id,
        });
    }
    if let Some(expected) = expected_version {
        if manifest.version != expected {
            return Err(VerificationError::VersionMismatch {
                entry_id: expected_entry,
                expected,
                actual: manifest.version,
            });
        }
    }
    manifest
        .validate()
        .map_err(|e| VerificationError::malformed(e.to_string()))?;

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FolderManifest, ManifestContent};
    use crate::types::Timestamp;

    struct Fixture {
        alice: SigningIdentity,
        key: SecretKey,
        manifest: Manifest,
    }

    fn fixture() -> Fixture {
        let alice = SigningIdentity::generate(AuthorId::new("alice@laptop"));
        let manifest = Manifest::new(
            EntryId::new(),
            None,
            ManifestContent::Folder(FolderManifest::new()),
            alice.author().clone(),
            Timestamp::from_micros(42),
        );
        Fixture {
            alice,
            key: SecretKey::generate(),
            manifest,
        }
    }

    fn verify(f: &Fixture, raw: &[u8]) -> Result<Manifest, VerificationError> {
        verify_and_decrypt(
            raw,
            f.alice.author(),
            &f.alice.verifying_key(),
            &f.key,
            f.manifest.entry_id,
            Some(1),
        )
    }

    #[test]
    fn sealed_manifest_verifies() {
        let f = fixture();
        let raw = seal_manifest(&f.manifest, &f.alice, &f.key).unwrap();
        assert_eq!(claimed_author(&raw).unwrap(), *f.alice.author());
        assert_eq!(verify(&f, &raw).unwrap(), f.manifest);
    }

    #[test]
    fn cannot_seal_for_another_author() {
        let f = fixture();
        let bob = SigningIdentity::generate(AuthorId::new("bob@pc"));
        assert!(seal_manifest(&f.manifest, &bob, &f.key).is_err());
    }

    #[test]
    fn any_flipped_byte_is_rejected() {
        let f = fixture();
        let raw = seal_manifest(&f.manifest, &f.alice, &f.key).unwrap();
        for i in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            assert!(verify(&f, &tampered).is_err(), "byte {i} accepted");
        }
    }

    #[test]
    fn wrong_key_is_bad_signature() {
        let f = fixture();
        let raw = seal_manifest(&f.manifest, &f.alice, &f.key).unwrap();
        let mallory = SigningIdentity::generate(AuthorId::new("alice@laptop"));
        let result = verify_and_decrypt(
            &raw,
            f.alice.author(),
            &mallory.verifying_key(),
            &f.key,
            f.manifest.entry_id,
            None,
        );
        assert!(matches!(result, Err(VerificationError::BadSignature { .. })));
    }

    #[test]
    fn impersonation_is_author_mismatch() {
        let f = fixture();
        let bob = SigningIdentity::generate(AuthorId::new("bob@pc"));
        let mut forged = f.manifest.clone();
        forged.author = bob.author().clone();
        let raw = seal_manifest(&forged, &bob, &f.key).unwrap();

        let result = verify(&f, &raw);
        assert!(matches!(result, Err(VerificationError::AuthorMismatch { .. })));
    }

    #[test]
    fn replay_under_other_entry_is_entry_mismatch() {
        let f = fixture();
        let raw = seal_manifest(&f.manifest, &f.alice, &f.key).unwrap();
        let other = EntryId::new();
        let result = verify_and_decrypt(
            &raw,
            f.alice.author(),
            &f.alice.verifying_key(),
            &f.key,
            other,
            None,
        );
        assert!(matches!(
            result,
            Err(VerificationError::EntryMismatch { expected, .. }) if expected == other
        ));
    }

    #[test]
    fn replay_at_other_version_is_version_mismatch() {
        let f = fixture();
        let raw = seal_manifest(&f.manifest, &f.alice, &f.key).unwrap();
        let result = verify_and_decrypt(
            &raw,
            f.alice.author(),
            &f.alice.verifying_key(),
            &f.key,
            f.manifest.entry_id,
            Some(2),
        );
        assert!(matches!(
            result,
            Err(VerificationError::VersionMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn wrong_workspace_key_is_malformed() {
        let f = fixture();
        let raw = seal_manifest(&f.manifest, &f.alice, &SecretKey::generate()).unwrap();
        assert!(matches!(
            verify(&f, &raw),
            Err(VerificationError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let f = fixture();
        assert!(matches!(
            verify(&f, b"not an envelope"),
            Err(VerificationError::MalformedPayload { .. })
        ));
        assert!(claimed_author(b"").is_err());
    }
}
