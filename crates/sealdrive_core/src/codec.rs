//! CBOR serialization and hashing helpers.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serializes a value to CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

/// Deserializes a value from CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if the bytes are not a valid encoding of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

/// SHA-256 of some bytes.
#[must_use]
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Incremental hasher with unambiguous length-prefixed framing.
#[derive(Default)]
pub(crate) struct FieldHasher(Sha256);

impl FieldHasher {
    pub(crate) fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn u64(&mut self, value: u64) -> &mut Self {
        self.0.update(value.to_le_bytes());
        self
    }

    pub(crate) fn tag(&mut self, tag: u8) -> &mut Self {
        self.0.update([tag]);
        self
    }

    pub(crate) fn finish(&mut self) -> [u8; 32] {
        std::mem::take(&mut self.0).finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn cbor_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u64);
        map.insert("b".to_string(), 2u64);

        let bytes = to_cbor(&map).unwrap();
        let decoded: BTreeMap<String, u64> = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn cbor_rejects_garbage() {
        let result: CoreResult<BTreeMap<String, u64>> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CoreError::Codec { .. })));
    }

    #[test]
    fn field_hasher_is_length_prefixed() {
        let a = FieldHasher::default().bytes(b"ab").bytes(b"c").finish();
        let b = FieldHasher::default().bytes(b"a").bytes(b"bc").finish();
        assert_ne!(a, b);
    }
}
